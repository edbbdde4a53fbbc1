//! The search family: SCAN, WITHIN, INTERSECTS, NEARBY, SEARCH.
//!
//! Argument parsing produces [`ScanParams`]; [`run_scan`] drives the
//! collection iterator through a collector, tracking the cursor contract:
//! the cursor counts every item examined (matched or skipped) across all
//! attempts of one logical scan, and a scan that ends early reports the
//! cursor of the item that stopped it while a completed scan reports zero.

use std::sync::Arc;
use std::time::SystemTime;

use meridian_protocol::Value;
use meridian_store::{GeoObject, Item, Point};
use meridian_txn::TxnStatus;

use meridian_common::error::{CommandError, MeridianError, MeridianResult, StoreError};

use crate::commands::{arg_f64, arg_u64, glob_match};
use crate::message::Message;
use crate::server::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutput {
    Objects,
    Ids,
    Points,
    Count,
}

/// A WITHIN/INTERSECTS area: inline geometry, or a reference to a stored
/// object resolved at scan time.
#[derive(Debug, Clone)]
pub enum AreaSpec {
    Object(GeoObject),
    Ref { key: String, id: String },
}

impl AreaSpec {
    fn resolve(&self, server: &Arc<Server>) -> MeridianResult<GeoObject> {
        match self {
            AreaSpec::Object(obj) => Ok(obj.clone()),
            AreaSpec::Ref { key, id } => server
                .with_col(key, |col| col.get(id).map(|item| item.obj.clone()))
                .flatten()
                .ok_or_else(|| MeridianError::Store(StoreError::KeyNotFound)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScanTarget {
    /// Plain id-order scan.
    All,
    /// String values in value order.
    SearchValues,
    Within(AreaSpec),
    Intersects(AreaSpec),
    Nearby {
        origin: Point,
        radius_m: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct ScanParams {
    pub key: String,
    pub cursor: u64,
    /// 0 = unlimited.
    pub limit_matched: u64,
    /// 0 = unlimited.
    pub limit_scanned: u64,
    pub pattern: Option<String>,
    pub desc: bool,
    pub output: ScanOutput,
    pub target: ScanTarget,
    /// NEARBY DISTANCE: include meters in object rows.
    pub with_distance: bool,
}

/// Where one scan attempt ended, for cursor bookkeeping and retries. An
/// aborted attempt still reports its counts so a retry can resume from the
/// right cursor.
#[derive(Debug, Clone, Copy)]
pub struct ScanExecution {
    pub scan_start: u64,
    pub scan_end: u64,
    pub match_count: u64,
    /// True when the attempt ended early (limit reached or the collector
    /// asked to stop) rather than exhausting the candidates.
    pub ended_early: bool,
    /// Set when the transaction status aborted the attempt.
    pub aborted: Option<meridian_common::error::TxnError>,
}

impl ScanExecution {
    /// The cursor reported to clients: the stopping position for an early
    /// end, zero for a completed scan.
    pub fn client_cursor(&self) -> u64 {
        if self.ended_early {
            self.scan_end
        } else {
            0
        }
    }
}

/// Receives each matching item. Returning false stops the scan at this
/// item.
pub trait ScanCollector {
    fn emit(&mut self, id: &str, item: &Item, distance: f64, field_names: &[String]) -> bool;
}

pub fn parse_scan_args(cmd: &str, args: &[String]) -> MeridianResult<ScanParams> {
    if args.len() < 2 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let mut params = ScanParams {
        key: args[1].clone(),
        cursor: 0,
        limit_matched: 0,
        limit_scanned: 0,
        pattern: None,
        desc: false,
        output: ScanOutput::Objects,
        target: match cmd {
            "search" => ScanTarget::SearchValues,
            _ => ScanTarget::All,
        },
        with_distance: false,
    };

    let mut i = 2;
    while i < args.len() {
        let token = args[i].to_lowercase();
        match token.as_str() {
            "cursor" => {
                params.cursor = arg_u64(args, i + 1)?;
                i += 2;
            }
            "limit" => {
                params.limit_matched = arg_u64(args, i + 1)?;
                i += 2;
                // A second bare number bounds the scanned count too.
                if let Some(next) = args.get(i) {
                    if let Ok(scanned) = next.parse::<u64>() {
                        params.limit_scanned = scanned;
                        i += 1;
                    }
                }
            }
            "match" => {
                params.pattern = Some(
                    args.get(i + 1)
                        .ok_or(CommandError::InvalidArgCount)?
                        .clone(),
                );
                i += 2;
            }
            "asc" => {
                params.desc = false;
                i += 1;
            }
            "desc" => {
                params.desc = true;
                i += 1;
            }
            "ids" => {
                params.output = ScanOutput::Ids;
                i += 1;
            }
            "count" => {
                params.output = ScanOutput::Count;
                i += 1;
            }
            "objects" => {
                params.output = ScanOutput::Objects;
                i += 1;
            }
            "points" => {
                params.output = ScanOutput::Points;
                i += 1;
            }
            "nofields" => {
                i += 1;
            }
            "distance" => {
                if cmd != "nearby" {
                    return Err(CommandError::InvalidArg(token).into());
                }
                params.with_distance = true;
                i += 1;
            }
            "fence" => {
                return Err(CommandError::FenceNotSupported.into());
            }
            "get" | "object" | "bounds" => {
                if !matches!(cmd, "within" | "intersects") {
                    return Err(CommandError::InvalidArg(token).into());
                }
                let area = parse_area(&token, args, &mut i)?;
                params.target = match cmd {
                    "within" => ScanTarget::Within(area),
                    _ => ScanTarget::Intersects(area),
                };
            }
            "point" => {
                if cmd != "nearby" {
                    return Err(CommandError::InvalidArg(token).into());
                }
                let lat = arg_f64(args, i + 1)?;
                let lon = arg_f64(args, i + 2)?;
                i += 3;
                let radius_m = match args.get(i).and_then(|a| a.parse::<f64>().ok()) {
                    Some(meters) => {
                        i += 1;
                        Some(meters)
                    }
                    None => None,
                };
                params.target = ScanTarget::Nearby {
                    origin: Point { x: lon, y: lat },
                    radius_m,
                };
            }
            other => return Err(CommandError::InvalidArg(other.to_string()).into()),
        }
    }

    match (cmd, &params.target) {
        ("within" | "intersects", ScanTarget::All) => {
            Err(CommandError::InvalidArgCount.into())
        }
        ("nearby", ScanTarget::All) => Err(CommandError::InvalidArgCount.into()),
        _ => Ok(params),
    }
}

/// Parse an area specifier for WITHIN/INTERSECTS. `i` is positioned at the
/// area keyword and is advanced past the consumed tokens.
fn parse_area(token: &str, args: &[String], i: &mut usize) -> MeridianResult<AreaSpec> {
    match token {
        "object" => {
            let text = args.get(*i + 1).ok_or(CommandError::InvalidArgCount)?;
            *i += 2;
            Ok(AreaSpec::Object(GeoObject::parse_geojson(text)?))
        }
        "bounds" => {
            let minlat = arg_f64(args, *i + 1)?;
            let minlon = arg_f64(args, *i + 2)?;
            let maxlat = arg_f64(args, *i + 3)?;
            let maxlon = arg_f64(args, *i + 4)?;
            *i += 5;
            Ok(AreaSpec::Object(GeoObject::Polygon(
                meridian_store::Polygon {
                    exterior: vec![
                        Point { x: minlon, y: minlat },
                        Point { x: maxlon, y: minlat },
                        Point { x: maxlon, y: maxlat },
                        Point { x: minlon, y: maxlat },
                        Point { x: minlon, y: minlat },
                    ],
                    holes: vec![],
                },
            )))
        }
        "get" => {
            let key = args.get(*i + 1).ok_or(CommandError::InvalidArgCount)?;
            let id = args.get(*i + 2).ok_or(CommandError::InvalidArgCount)?;
            *i += 3;
            Ok(AreaSpec::Ref {
                key: key.clone(),
                id: id.clone(),
            })
        }
        _ => Err(CommandError::InvalidArg(token.to_string()).into()),
    }
}

/// Drive one scan attempt through `collector`.
pub fn run_scan(
    server: &Arc<Server>,
    params: &ScanParams,
    status: &TxnStatus,
    collector: &mut dyn ScanCollector,
) -> MeridianResult<ScanExecution> {
    use meridian_store::ScanOutcome;

    enum Resolved {
        All,
        SearchValues,
        Within(GeoObject),
        Intersects(GeoObject),
        Nearby {
            origin: Point,
            radius_m: Option<f64>,
        },
    }
    let target = match &params.target {
        ScanTarget::All => Resolved::All,
        ScanTarget::SearchValues => Resolved::SearchValues,
        ScanTarget::Within(area) => Resolved::Within(area.resolve(server)?),
        ScanTarget::Intersects(area) => Resolved::Intersects(area.resolve(server)?),
        ScanTarget::Nearby { origin, radius_m } => Resolved::Nearby {
            origin: *origin,
            radius_m: *radius_m,
        },
    };

    let now = SystemTime::now();
    let result = server.with_col(&params.key, |col| {
        let field_names = col.field_map().to_vec();
        let mut number_iters: u64 = 0;
        let mut matched: u64 = 0;
        let mut ended_early = false;
        let mut radius_exhausted = false;

        let mut process = |id: &str, item: &Item, dist: f64| -> bool {
            if item.expired(now) {
                return true;
            }
            number_iters += 1;
            if number_iters <= params.cursor {
                return true;
            }
            if let Some(pattern) = &params.pattern {
                if !glob_match(pattern, id) {
                    if params.limit_scanned > 0 && number_iters >= params.limit_scanned {
                        ended_early = true;
                        return false;
                    }
                    return true;
                }
            }
            matched += 1;
            if !collector.emit(id, item, dist, &field_names) {
                ended_early = true;
                return false;
            }
            if params.limit_matched > 0 && matched >= params.limit_matched {
                ended_early = true;
                return false;
            }
            if params.limit_scanned > 0 && number_iters >= params.limit_scanned {
                ended_early = true;
                return false;
            }
            true
        };

        let outcome = match &target {
            Resolved::All => col.scan(params.desc, status, |id, item| process(id, item, 0.0)),
            Resolved::SearchValues => {
                col.search_values(params.desc, status, |id, item| process(id, item, 0.0))
            }
            Resolved::Within(area) => {
                col.within(area, status, |id, item| process(id, item, 0.0))
            }
            Resolved::Intersects(area) => {
                col.intersects(area, status, |id, item| process(id, item, 0.0))
            }
            Resolved::Nearby { origin, radius_m } => {
                col.nearby(*origin, status, |id, item, dist| {
                    if radius_m.is_some_and(|r| dist > r) {
                        radius_exhausted = true;
                        return false;
                    }
                    process(id, item, dist)
                })
            }
        };
        if radius_exhausted {
            // Walking past the radius is a natural end, not an early stop.
            ended_early = false;
        }
        (outcome, number_iters, matched, ended_early)
    });

    let Some((outcome, number_iters, matched, ended_early)) = result else {
        // Missing collection: an empty, completed scan.
        return Ok(ScanExecution {
            scan_start: params.cursor,
            scan_end: params.cursor,
            match_count: 0,
            ended_early: false,
            aborted: None,
        });
    };

    let aborted = if outcome == ScanOutcome::Aborted {
        Some(
            status
                .error()
                .unwrap_or(meridian_common::error::TxnError::Closed),
        )
    } else {
        None
    };

    Ok(ScanExecution {
        scan_start: params.cursor,
        scan_end: number_iters.max(params.cursor),
        match_count: matched,
        ended_early,
        aborted,
    })
}

// ── RESP output collector ────────────────────────────────────────────────

struct RespCollector {
    output: ScanOutput,
    with_distance: bool,
    rows: Vec<Value>,
}

impl ScanCollector for RespCollector {
    fn emit(&mut self, id: &str, item: &Item, distance: f64, _fields: &[String]) -> bool {
        match self.output {
            ScanOutput::Count => {}
            ScanOutput::Ids => self.rows.push(Value::bulk(id)),
            ScanOutput::Objects => {
                let object = match &item.obj {
                    GeoObject::Str(s) => Value::bulk(s.clone()),
                    geo => Value::bulk(geo.to_geojson()),
                };
                let mut row = vec![Value::bulk(id), object];
                if self.with_distance {
                    row.push(Value::Float(distance));
                }
                self.rows.push(Value::Array(row));
            }
            ScanOutput::Points => {
                let point = match item.obj.center() {
                    Some(c) => Value::Array(vec![Value::Float(c.y), Value::Float(c.x)]),
                    None => Value::Null,
                };
                self.rows.push(Value::Array(vec![Value::bulk(id), point]));
            }
        }
        true
    }
}

/// Top-level handler for the scan-class commands. One attempt; the router
/// retries on interruption with a fresh collector, so partial output never
/// leaks.
pub fn cmd_scan_family(
    server: &Arc<Server>,
    msg: &Message,
    status: &TxnStatus,
) -> MeridianResult<Value> {
    let cmd = msg.command();
    let params = parse_scan_args(&cmd, &msg.args)?;
    let mut collector = RespCollector {
        output: params.output,
        with_distance: params.with_distance,
        rows: Vec::new(),
    };
    let exec = run_scan(server, &params, status, &mut collector)?;
    if let Some(err) = exec.aborted {
        return Err(MeridianError::Txn(err));
    }
    match params.output {
        ScanOutput::Count => Ok(Value::Integer(exec.match_count as i64)),
        _ => Ok(Value::Array(vec![
            Value::Integer(exec.client_cursor() as i64),
            Value::Array(collector.rows),
        ])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_defaults() {
        let args: Vec<String> = ["scan", "fleet"].iter().map(|s| s.to_string()).collect();
        let params = parse_scan_args("scan", &args).unwrap();
        assert_eq!(params.key, "fleet");
        assert_eq!(params.cursor, 0);
        assert_eq!(params.limit_matched, 0);
        assert_eq!(params.output, ScanOutput::Objects);
        assert!(!params.desc);
    }

    #[test]
    fn test_parse_within_get_area_and_modifiers() {
        let args: Vec<String> = ["within", "key2", "cursor", "5", "limit", "10", "ids", "get",
            "mykey", "poly8"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let params = parse_scan_args("within", &args).unwrap();
        assert_eq!(params.cursor, 5);
        assert_eq!(params.limit_matched, 10);
        assert_eq!(params.output, ScanOutput::Ids);
        assert!(matches!(params.target, ScanTarget::Within(_)));
    }

    #[test]
    fn test_parse_nearby_point_with_radius() {
        let args: Vec<String> = ["nearby", "fleet", "point", "37.73", "-122.44", "500"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let params = parse_scan_args("nearby", &args).unwrap();
        match params.target {
            ScanTarget::Nearby { origin, radius_m } => {
                assert_eq!(origin.y, 37.73);
                assert_eq!(origin.x, -122.44);
                assert_eq!(radius_m, Some(500.0));
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_fence_and_missing_area() {
        let args: Vec<String> = ["nearby", "fleet", "fence", "point", "1", "2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = parse_scan_args("nearby", &args).unwrap_err();
        assert_eq!(err.client_message(), "fence not supported");

        let args: Vec<String> = ["within", "key2", "ids"].iter().map(|s| s.to_string()).collect();
        assert!(parse_scan_args("within", &args).is_err());
    }
}
