//! Data command handlers. Each assumes its caller already holds the right
//! scheduler permit and has passed the policy gates; writes report whether
//! they dirtied the store so the router can journal them.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use meridian_protocol::Value;
use meridian_store::{GeoObject, Point};

use meridian_common::error::{CommandError, MeridianResult, StoreError};

use crate::message::Message;
use crate::router::Applied;
use crate::server::Server;

// ── Argument helpers ─────────────────────────────────────────────────────

pub(crate) fn arg_f64(args: &[String], idx: usize) -> MeridianResult<f64> {
    let raw = args
        .get(idx)
        .ok_or(CommandError::InvalidArgCount)?;
    raw.parse()
        .map_err(|_| CommandError::InvalidArg(raw.clone()).into())
}

pub(crate) fn arg_u64(args: &[String], idx: usize) -> MeridianResult<u64> {
    let raw = args
        .get(idx)
        .ok_or(CommandError::InvalidArgCount)?;
    raw.parse()
        .map_err(|_| CommandError::InvalidArg(raw.clone()).into())
}

/// Minimal glob: `*` any run, `?` any one character, everything else
/// literal.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&p[1..], t) || (!t.is_empty() && matches(p, &t[1..]))
            }
            (Some('?'), Some(_)) => matches(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => matches(&p[1..], &t[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    matches(&p, &t)
}

// ── SET and friends ──────────────────────────────────────────────────────

pub fn cmd_set(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() < 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let key = &args[1];
    let id = &args[2];

    let mut fields: Vec<(String, f64)> = Vec::new();
    let mut expires_at: Option<SystemTime> = None;
    let mut nx = false;
    let mut xx = false;
    let mut i = 3;
    let obj = loop {
        let token = args
            .get(i)
            .ok_or(CommandError::InvalidArgCount)?
            .to_lowercase();
        match token.as_str() {
            "field" => {
                let name = args
                    .get(i + 1)
                    .ok_or(CommandError::InvalidArgCount)?
                    .clone();
                let value = arg_f64(args, i + 2)?;
                fields.push((name, value));
                i += 3;
            }
            "ex" => {
                let seconds = arg_f64(args, i + 1)?;
                if seconds < 0.0 {
                    return Err(CommandError::InvalidArg(args[i + 1].clone()).into());
                }
                expires_at = Some(SystemTime::now() + Duration::from_secs_f64(seconds));
                i += 2;
            }
            "nx" => {
                nx = true;
                i += 1;
            }
            "xx" => {
                xx = true;
                i += 1;
            }
            "point" => {
                let lat = arg_f64(args, i + 1)?;
                let lon = arg_f64(args, i + 2)?;
                if args.len() > i + 3 {
                    return Err(CommandError::InvalidArgCount.into());
                }
                break GeoObject::Point(Point { x: lon, y: lat });
            }
            "object" => {
                let text = args.get(i + 1).ok_or(CommandError::InvalidArgCount)?;
                if args.len() > i + 2 {
                    return Err(CommandError::InvalidArgCount.into());
                }
                break GeoObject::parse_geojson(text)?;
            }
            "string" => {
                let text = args.get(i + 1).ok_or(CommandError::InvalidArgCount)?;
                if args.len() > i + 2 {
                    return Err(CommandError::InvalidArgCount.into());
                }
                break GeoObject::Str(text.clone());
            }
            other => return Err(CommandError::InvalidArg(other.to_string()).into()),
        }
    };
    if nx && xx {
        return Err(CommandError::InvalidArg("nx".into()).into());
    }

    let exists = server
        .with_col(key, |col| col.get(id).is_some())
        .unwrap_or(false);
    if (nx && exists) || (xx && !exists) {
        return Ok(Applied::clean(Value::Null));
    }

    server.with_col_mut(key, |col| col.set(id, obj, &fields, expires_at));
    Ok(Applied::dirty(Value::ok()))
}

pub fn cmd_fset(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() < 5 || (args.len() - 3) % 2 != 0 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let key = &args[1];
    let id = &args[2];

    let mut pairs = Vec::new();
    let mut i = 3;
    while i < args.len() {
        pairs.push((args[i].clone(), arg_f64(args, i + 1)?));
        i += 2;
    }

    if server.with_col(key, |_| ()).is_none() {
        return Err(StoreError::KeyNotFound.into());
    }
    let mut changed = 0;
    let result: MeridianResult<()> = server.with_col_mut(key, |col| {
        for (name, value) in &pairs {
            if col.set_field(id, name, *value)? {
                changed += 1;
            }
        }
        Ok(())
    });
    result?;
    Ok(Applied {
        value: Value::ok(),
        dirty: changed > 0,
    })
}

pub fn cmd_del(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() != 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let removed = server.with_col_mut(&args[1], |col| col.delete(&args[2]).is_some());
    Ok(Applied {
        value: Value::ok(),
        dirty: removed,
    })
}

pub fn cmd_pdel(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() != 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let key = &args[1];
    let pattern = &args[2];
    let matching: Vec<String> = server
        .with_col(key, |col| {
            let status = meridian_txn::TxnStatus::unbounded();
            let mut ids = Vec::new();
            col.scan(false, &status, |id, _| {
                if glob_match(pattern, id) {
                    ids.push(id.to_string());
                }
                true
            });
            ids
        })
        .unwrap_or_default();
    let mut removed = 0i64;
    if !matching.is_empty() {
        server.with_col_mut(key, |col| {
            for id in &matching {
                if col.delete(id).is_some() {
                    removed += 1;
                }
            }
        });
    }
    Ok(Applied {
        value: Value::Integer(removed),
        dirty: removed > 0,
    })
}

pub fn cmd_drop(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() != 2 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let existed = server.cols.write().remove(&args[1]).is_some();
    Ok(Applied {
        value: Value::ok(),
        dirty: existed,
    })
}

pub fn cmd_flushdb(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    if msg.args.len() != 1 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let mut cols = server.cols.write();
    let dirty = !cols.is_empty();
    cols.clear();
    Ok(Applied {
        value: Value::ok(),
        dirty,
    })
}

pub fn cmd_expire(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() != 4 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let seconds = arg_f64(args, 3)?;
    if seconds < 0.0 {
        return Err(CommandError::InvalidArg(args[3].clone()).into());
    }
    let at = SystemTime::now() + Duration::from_secs_f64(seconds);
    let set = server.with_col_mut(&args[1], |col| col.set_expires(&args[2], Some(at)));
    Ok(Applied {
        value: Value::Integer(set as i64),
        dirty: set,
    })
}

pub fn cmd_persist(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() != 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let had_ttl = server
        .with_col(&args[1], |col| {
            col.get(&args[2]).is_some_and(|item| item.expires_at.is_some())
        })
        .unwrap_or(false);
    if had_ttl {
        server.with_col_mut(&args[1], |col| col.set_expires(&args[2], None));
    }
    Ok(Applied {
        value: Value::Integer(had_ttl as i64),
        dirty: had_ttl,
    })
}

pub fn cmd_rename(server: &Arc<Server>, msg: &Message, nx: bool) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() != 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let mut cols = server.cols.write();
    if !cols.contains_key(&args[1]) {
        return Err(StoreError::KeyNotFound.into());
    }
    if nx && cols.contains_key(&args[2]) {
        return Ok(Applied::clean(Value::Integer(0)));
    }
    let col = cols.remove(&args[1]).expect("checked above");
    cols.insert(args[2].clone(), col);
    let value = if nx { Value::Integer(1) } else { Value::ok() };
    Ok(Applied::dirty(value))
}

// ── Reads ────────────────────────────────────────────────────────────────

pub fn cmd_get(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() < 3 || args.len() > 4 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let key = &args[1];
    let id = &args[2];
    let form = args
        .get(3)
        .map(|a| a.to_lowercase())
        .unwrap_or_else(|| "object".to_string());

    if server.has_expired(key, id) {
        return Ok(Value::Null);
    }
    let found = server.with_col(key, |col| {
        col.get(id).map(|item| {
            let fields: Vec<(String, f64)> = col
                .field_map()
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), item.field(i)))
                .filter(|(_, v)| *v != 0.0)
                .collect();
            (item.obj.clone(), fields)
        })
    });
    let Some(Some((obj, fields))) = found else {
        return Ok(Value::Null);
    };

    let object_value = match &obj {
        GeoObject::Str(s) => Value::bulk(s.clone()),
        geo => Value::bulk(geo.to_geojson()),
    };
    match form.as_str() {
        "object" => Ok(object_value),
        "point" => match obj.center() {
            Some(center) => Ok(Value::Array(vec![
                Value::Float(center.y),
                Value::Float(center.x),
            ])),
            None => Ok(Value::Null),
        },
        "withfields" => {
            let mut fv = Vec::new();
            for (name, value) in fields {
                fv.push(Value::bulk(name));
                fv.push(Value::Float(value));
            }
            Ok(Value::Array(vec![object_value, Value::Array(fv)]))
        }
        other => Err(CommandError::InvalidArg(other.to_string()).into()),
    }
}

pub fn cmd_keys(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() != 2 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let cols = server.cols.read_recursive();
    let keys: Vec<Value> = cols
        .keys()
        .filter(|k| glob_match(&args[1], k))
        .map(|k| Value::bulk(k.clone()))
        .collect();
    Ok(Value::Array(keys))
}

pub fn cmd_type(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() != 2 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let exists = server.with_col(&args[1], |_| ()).is_some();
    Ok(Value::SimpleString(
        if exists { "hash" } else { "none" }.into(),
    ))
}

pub fn cmd_bounds(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() != 2 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let rect = server.with_col(&args[1], |col| col.bounds()).flatten();
    match rect {
        Some(rect) => Ok(Value::Array(vec![
            Value::Array(vec![Value::Float(rect.min.x), Value::Float(rect.min.y)]),
            Value::Array(vec![Value::Float(rect.max.x), Value::Float(rect.max.y)]),
        ])),
        None => Ok(Value::Null),
    }
}

pub fn cmd_ttl(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() != 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let now = SystemTime::now();
    let ttl = server
        .with_col(&args[1], |col| {
            col.get(&args[2]).map(|item| match item.expires_at {
                Some(at) => at
                    .duration_since(now)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
                None => -1,
            })
        })
        .flatten();
    Ok(Value::Integer(ttl.unwrap_or(-2)))
}

pub fn cmd_stats(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() < 2 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let mut out = Vec::new();
    for key in &args[1..] {
        let entry = server.with_col(key, |col| {
            simple_map(&[
                ("in_memory_size", col.total_weight() as i64),
                ("num_objects", col.count() as i64),
                ("num_points", col.point_count() as i64),
                ("num_strings", col.string_count() as i64),
            ])
        });
        out.push(entry.unwrap_or(Value::Null));
    }
    Ok(Value::Array(out))
}

pub fn cmd_server(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    let ext = match args.len() {
        1 => false,
        2 if args[1].eq_ignore_ascii_case("ext") => true,
        _ => return Err(CommandError::InvalidArgCount.into()),
    };

    let (num_collections, points, objects, strings, memsize) = {
        let cols = server.cols.read_recursive();
        let mut p = 0;
        let mut o = 0;
        let mut s = 0;
        let mut w = 0;
        for col in cols.values() {
            p += col.point_count();
            o += col.count();
            s += col.string_count();
            w += col.total_weight();
        }
        (cols.len(), p, o, s, w)
    };

    let mut pairs: Vec<(String, String)> = vec![
        ("id".into(), server.server_id()),
        ("aof_size".into(), server.aof_size().to_string()),
        ("num_collections".into(), num_collections.to_string()),
        ("num_points".into(), points.to_string()),
        ("num_objects".into(), objects.to_string()),
        ("num_strings".into(), strings.to_string()),
        ("in_memory_size".into(), memsize.to_string()),
        ("read_only".into(), server.repl.read_only().to_string()),
        (
            "following".into(),
            if server.repl.is_follower() {
                format!("{}:{}", server.repl.follow_host(), server.repl.follow_port())
            } else {
                String::new()
            },
        ),
        (
            "caught_up".into(),
            server
                .fcup
                .load(std::sync::atomic::Ordering::SeqCst)
                .to_string(),
        ),
        (
            "caught_up_once".into(),
            server.caught_up_once().to_string(),
        ),
    ];
    if ext {
        let sched = server.scheduler.stats().snapshot();
        pairs.extend([
            (
                "uptime_in_seconds".into(),
                server.uptime().as_secs().to_string(),
            ),
            (
                "total_commands_processed".into(),
                server
                    .stats_total_commands
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .to_string(),
            ),
            (
                "total_connections_received".into(),
                server
                    .stats_total_conns
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .to_string(),
            ),
            (
                "expired_keys".into(),
                server
                    .stats_expired
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .to_string(),
            ),
            (
                "scheduler_scan_interruptions".into(),
                sched.scan_interruptions.to_string(),
            ),
            (
                "scheduler_current_write_delay".into(),
                format!("{:.6}", sched.current_write_delay_seconds()),
            ),
            (
                "scheduler_max_write_delay".into(),
                format!("{:.6}", sched.max_write_delay_seconds()),
            ),
        ]);
    }
    pairs.sort();
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for (k, v) in pairs {
        out.push(Value::bulk(k));
        out.push(Value::bulk(v));
    }
    Ok(Value::Array(out))
}

pub fn cmd_info(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    let sections: Vec<&str> = match args.len() {
        1 => vec!["server", "clients", "persistence", "stats", "replication"],
        2 => vec![args[1].as_str()],
        _ => return Err(CommandError::InvalidArgCount.into()),
    };
    let mut out = String::new();
    for (i, section) in sections.iter().enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        match section.to_lowercase().as_str() {
            "server" => {
                out.push_str("# Server\r\n");
                out.push_str(&format!("server_id:{}\r\n", server.server_id()));
                out.push_str(&format!(
                    "uptime_in_seconds:{}\r\n",
                    server.uptime().as_secs()
                ));
            }
            "clients" => {
                out.push_str("# Clients\r\n");
                out.push_str(&format!(
                    "total_connections_received:{}\r\n",
                    server
                        .stats_total_conns
                        .load(std::sync::atomic::Ordering::Relaxed)
                ));
            }
            "persistence" => {
                out.push_str("# Persistence\r\n");
                out.push_str(&format!(
                    "aof_enabled:{}\r\n",
                    u8::from(server.aof.is_some())
                ));
                out.push_str(&format!("aof_size:{}\r\n", server.aof_size()));
            }
            "stats" => {
                out.push_str("# Stats\r\n");
                out.push_str(&format!(
                    "total_commands_processed:{}\r\n",
                    server
                        .stats_total_commands
                        .load(std::sync::atomic::Ordering::Relaxed)
                ));
                out.push_str(&format!(
                    "expired_keys:{}\r\n",
                    server
                        .stats_expired
                        .load(std::sync::atomic::Ordering::Relaxed)
                ));
            }
            "replication" => {
                out.push_str("# Replication\r\n");
                if server.repl.is_follower() {
                    out.push_str("role:slave\r\n");
                    out.push_str(&format!("master_host:{}\r\n", server.repl.follow_host()));
                    out.push_str(&format!("master_port:{}\r\n", server.repl.follow_port()));
                } else {
                    out.push_str("role:master\r\n");
                }
            }
            _ => {}
        }
    }
    Ok(Value::bulk(out))
}

pub fn cmd_test(_server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    // TEST OBJECT json (WITHIN|INTERSECTS) OBJECT json
    if args.len() != 6
        || !args[1].eq_ignore_ascii_case("object")
        || !args[4].eq_ignore_ascii_case("object")
    {
        return Err(CommandError::InvalidArgCount.into());
    }
    let a = GeoObject::parse_geojson(&args[2])?;
    let b = GeoObject::parse_geojson(&args[5])?;
    let result = match args[3].to_lowercase().as_str() {
        "within" => a.within(&b),
        "intersects" => a.intersects(&b),
        other => return Err(CommandError::InvalidArg(other.to_string()).into()),
    };
    Ok(Value::Integer(result as i64))
}

// ── JSON document commands ───────────────────────────────────────────────

fn json_doc(server: &Arc<Server>, key: &str, id: &str) -> Option<serde_json::Value> {
    server
        .with_col(key, |col| {
            col.get(id).and_then(|item| match &item.obj {
                GeoObject::Str(s) => serde_json::from_str(s).ok(),
                _ => None,
            })
        })
        .flatten()
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(|s| s.to_string()).collect()
}

fn json_navigate<'a>(
    doc: &'a mut serde_json::Value,
    path: &[String],
) -> Option<&'a mut serde_json::Value> {
    let mut cur = doc;
    for seg in path {
        cur = match cur {
            serde_json::Value::Object(map) => map
                .entry(seg.clone())
                .or_insert(serde_json::Value::Null),
            serde_json::Value::Array(items) => {
                let idx: usize = seg.parse().ok()?;
                items.get_mut(idx)?
            }
            other => {
                *other = serde_json::json!({});
                match other {
                    serde_json::Value::Object(map) => {
                        map.entry(seg.clone()).or_insert(serde_json::Value::Null)
                    }
                    _ => return None,
                }
            }
        };
    }
    Some(cur)
}

pub fn cmd_jset(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() < 5 || args.len() > 6 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let (key, id, path, raw_value) = (&args[1], &args[2], &args[3], &args[4]);
    let force_str = args.get(5).is_some_and(|a| a.eq_ignore_ascii_case("str"));

    let mut doc = json_doc(server, key, id).unwrap_or_else(|| serde_json::json!({}));
    let new_value = if force_str {
        serde_json::Value::String(raw_value.clone())
    } else {
        serde_json::from_str(raw_value)
            .unwrap_or_else(|_| serde_json::Value::String(raw_value.clone()))
    };
    let segments = split_path(path);
    let slot = json_navigate(&mut doc, &segments)
        .ok_or_else(|| CommandError::InvalidArg(path.clone()))?;
    *slot = new_value;

    server.with_col_mut(key, |col| {
        col.set(id, GeoObject::Str(doc.to_string()), &[], None)
    });
    Ok(Applied::dirty(Value::ok()))
}

pub fn cmd_jget(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() < 3 || args.len() > 4 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let Some(doc) = json_doc(server, &args[1], &args[2]) else {
        return Ok(Value::Null);
    };
    let target = match args.get(3) {
        None => Some(&doc),
        Some(path) => {
            let segments = split_path(path);
            let mut cur = &doc;
            let mut found = true;
            for seg in &segments {
                cur = match cur {
                    serde_json::Value::Object(map) => match map.get(seg) {
                        Some(v) => v,
                        None => {
                            found = false;
                            break;
                        }
                    },
                    serde_json::Value::Array(items) => {
                        match seg.parse::<usize>().ok().and_then(|i| items.get(i)) {
                            Some(v) => v,
                            None => {
                                found = false;
                                break;
                            }
                        }
                    }
                    _ => {
                        found = false;
                        break;
                    }
                };
            }
            if found {
                Some(cur)
            } else {
                None
            }
        }
    };
    let reply = match target {
        None => Value::Null,
        Some(serde_json::Value::String(s)) => Value::bulk(s.clone()),
        Some(other) => Value::bulk(other.to_string()),
    };
    Ok(reply)
}

pub fn cmd_jdel(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    let args = &msg.args;
    if args.len() != 4 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let Some(mut doc) = json_doc(server, &args[1], &args[2]) else {
        return Ok(Applied::clean(Value::Integer(0)));
    };
    let mut segments = split_path(&args[3]);
    let last = segments.pop().ok_or(CommandError::InvalidArgCount)?;
    let removed = {
        let parent = if segments.is_empty() {
            Some(&mut doc)
        } else {
            json_navigate(&mut doc, &segments)
        };
        match parent {
            Some(serde_json::Value::Object(map)) => map.remove(&last).is_some(),
            Some(serde_json::Value::Array(items)) => match last.parse::<usize>() {
                Ok(idx) if idx < items.len() => {
                    items.remove(idx);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    };
    if removed {
        server.with_col_mut(&args[1], |col| {
            col.set(&args[2], GeoObject::Str(doc.to_string()), &[], None)
        });
    }
    Ok(Applied {
        value: Value::Integer(removed as i64),
        dirty: removed,
    })
}

// ── Shared formatting ────────────────────────────────────────────────────

fn simple_map(entries: &[(&str, i64)]) -> Value {
    let mut sorted: Vec<(&str, i64)> = entries.to_vec();
    sorted.sort();
    let mut out = Vec::with_capacity(sorted.len() * 2);
    for (k, v) in sorted {
        out.push(Value::bulk(k));
        out.push(Value::bulk(v.to_string()));
    }
    Value::Array(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("truck*", "truck42"));
        assert!(glob_match("truck?", "truck7"));
        assert!(!glob_match("truck?", "truck42"));
        assert!(!glob_match("car*", "truck"));
        assert!(glob_match("a*c*e", "abcde"));
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a.b.0"), vec!["a", "b", "0"]);
    }
}
