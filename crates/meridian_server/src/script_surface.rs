//! The capability surface scripts see: the `tile38.*` table, the `json`
//! helper module, and the opaque userdata handles (geo objects, collection
//! items, scan iterators, stats arrays).
//!
//! Scripts never touch live store state: every handle carries its own copy
//! of the data it exposes, taken while the calling command held its permit.
//! New globals are forbidden via a `__newindex` metamethod; the
//! per-invocation globals (`KEYS`, `ARGV`, `EVAL_CMD`, `DEADLINE`,
//! `TXN_STATUS`) are raw-set underneath it and raw-cleared on every exit
//! path.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use mlua::{
    AnyUserData, Lua, MetaMethod, UserData, UserDataMethods, Value as LuaValue, Variadic,
};

use meridian_store::{GeoObject, Point, Polygon};
use meridian_txn::TxnStatus;

use crate::scan_bridge;
use crate::script_values::{json_to_lua, lua_to_json, resp_to_lua};
use crate::scripts;
use crate::server::Server;
use crate::similarity::{self, SimilarityParams};
use crate::stats_array::{cdf_with_floor, StatsArray};

const SCRIPT_GLOBALS: [&str; 5] = ["KEYS", "ARGV", "EVAL_CMD", "DEADLINE", "TXN_STATUS"];

// ── Userdata handles ─────────────────────────────────────────────────────

/// Opaque transaction-status handle stored in the `TXN_STATUS` global.
pub struct LuaTxnStatus(pub Arc<TxnStatus>);

impl UserData for LuaTxnStatus {}

/// A geospatial object handle.
pub struct LuaGeoObject(pub GeoObject);

impl UserData for LuaGeoObject {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match &this.0 {
                GeoObject::Str(s) => s.clone(),
                geo => geo.to_geojson(),
            })
        });
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            geo_index(lua, &this.0, &key)
        });
    }
}

fn geo_index<'lua>(lua: &'lua Lua, obj: &GeoObject, key: &str) -> mlua::Result<LuaValue<'lua>> {
    match key {
        "empty" => Ok(LuaValue::Boolean(obj.empty())),
        "valid" => Ok(LuaValue::Boolean(obj.valid())),
        "json" => Ok(LuaValue::String(lua.create_string(obj.to_geojson())?)),
        "num_points" => Ok(LuaValue::Integer(obj.num_points() as i64)),
        "rect" => {
            let rect = obj
                .rect()
                .ok_or_else(|| mlua::Error::RuntimeError(format!("unknown property {}", key)))?;
            let poly = Polygon {
                exterior: vec![
                    rect.min,
                    Point {
                        x: rect.max.x,
                        y: rect.min.y,
                    },
                    rect.max,
                    Point {
                        x: rect.min.x,
                        y: rect.max.y,
                    },
                    rect.min,
                ],
                holes: vec![],
            };
            Ok(LuaValue::UserData(
                lua.create_userdata(LuaGeoObject(GeoObject::Polygon(poly)))?,
            ))
        }
        "center" => {
            let center = obj
                .center()
                .ok_or_else(|| mlua::Error::RuntimeError(format!("unknown property {}", key)))?;
            Ok(LuaValue::UserData(
                lua.create_userdata(LuaGeoObject(GeoObject::Point(center)))?,
            ))
        }
        "x" | "y" => match obj {
            GeoObject::Point(p) => Ok(LuaValue::Number(if key == "x" { p.x } else { p.y })),
            _ => Err(mlua::Error::RuntimeError(format!(
                "unknown property {}",
                key
            ))),
        },
        "contains" | "within" | "intersects" => {
            let op = key.to_string();
            Ok(LuaValue::Function(lua.create_function(
                move |_, (a, b): (AnyUserData, AnyUserData)| {
                    let a = a.borrow::<LuaGeoObject>()?;
                    let b = b.borrow::<LuaGeoObject>()?;
                    Ok(match op.as_str() {
                        "contains" => a.0.contains(&b.0),
                        "within" => a.0.within(&b.0),
                        _ => a.0.intersects(&b.0),
                    })
                },
            )?))
        }
        "distance" => Ok(LuaValue::Function(lua.create_function(
            |_, (a, b): (AnyUserData, AnyUserData)| {
                let a = a.borrow::<LuaGeoObject>()?;
                let b = b.borrow::<LuaGeoObject>()?;
                Ok(a.0.distance(&b.0))
            },
        )?)),
        other => Err(mlua::Error::RuntimeError(format!(
            "unknown property {}",
            other
        ))),
    }
}

/// Result handle of `tile38.get`: a copy of one stored item.
pub struct LuaCollectionItem {
    pub id: String,
    pub obj: GeoObject,
    pub fields: Vec<f64>,
    pub field_names: Vec<String>,
}

impl UserData for LuaCollectionItem {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.id.clone()));
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            match key.as_str() {
                "id" => Ok(LuaValue::String(lua.create_string(&this.id)?)),
                "object" => Ok(LuaValue::UserData(
                    lua.create_userdata(LuaGeoObject(this.obj.clone()))?,
                )),
                "read_fields" => Ok(LuaValue::Function(lua.create_function(
                    |_, (ud, names): (AnyUserData, Variadic<LuaValue>)| {
                        let item = ud.borrow::<LuaCollectionItem>()?;
                        read_field_values(&item.fields, &item.field_names, &names)
                    },
                )?)),
                other => Err(mlua::Error::RuntimeError(format!(
                    "unknown property {}",
                    other
                ))),
            }
        });
    }
}

/// The per-item view handed to `tile38.iterate` callbacks. One handle is
/// created per iterate call and repointed at each matching item.
#[derive(Default)]
pub struct LuaScanIterator {
    pub current: Option<IterItem>,
    pub field_names: Vec<String>,
}

pub struct IterItem {
    pub id: String,
    pub obj: GeoObject,
    pub fields: Vec<f64>,
    pub distance: f64,
}

impl UserData for LuaScanIterator {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, _, ()| {
            Ok("[scanIterator object]")
        });
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            let current = this
                .current
                .as_ref()
                .ok_or_else(|| mlua::Error::RuntimeError("iterator is not positioned".into()))?;
            match key.as_str() {
                "id" => Ok(LuaValue::String(lua.create_string(&current.id)?)),
                "object" => Ok(LuaValue::UserData(
                    lua.create_userdata(LuaGeoObject(current.obj.clone()))?,
                )),
                "distance" => Ok(LuaValue::Number(current.distance)),
                "read_fields" => Ok(LuaValue::Function(lua.create_function(
                    |_, (ud, names): (AnyUserData, Variadic<LuaValue>)| {
                        let iter = ud.borrow::<LuaScanIterator>()?;
                        let current = iter.current.as_ref().ok_or_else(|| {
                            mlua::Error::RuntimeError("iterator is not positioned".into())
                        })?;
                        read_field_values(&current.fields, &iter.field_names, &names)
                    },
                )?)),
                other => Err(mlua::Error::RuntimeError(format!(
                    "unknown property {}",
                    other
                ))),
            }
        });
    }
}

fn read_field_values(
    fields: &[f64],
    field_names: &[String],
    names: &Variadic<LuaValue>,
) -> mlua::Result<Variadic<f64>> {
    let mut out = Vec::with_capacity(names.len());
    for name in names.iter() {
        let index = match name {
            LuaValue::Integer(n) => (*n as usize).checked_sub(1),
            LuaValue::Number(n) => (*n as usize).checked_sub(1),
            LuaValue::String(s) => {
                let s = s.to_string_lossy();
                Some(
                    field_names
                        .iter()
                        .position(|f| f.as_str() == s.as_ref())
                        .ok_or_else(|| {
                            mlua::Error::RuntimeError(format!("invalid field {}", s))
                        })?,
                )
            }
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "invalid field {}",
                    other.type_name()
                )))
            }
        };
        out.push(
            index
                .and_then(|i| fields.get(i).copied())
                .unwrap_or(0.0),
        );
    }
    Ok(Variadic::from_iter(out))
}

/// A stats-array handle. Arithmetic metamethods mutate the left operand in
/// place and evaluate to it.
pub struct LuaStatsArray(pub StatsArray);

fn stats_binop<'lua>(
    a: AnyUserData<'lua>,
    b: LuaValue<'lua>,
    f: fn(f64, f64) -> f64,
) -> mlua::Result<AnyUserData<'lua>> {
    match b {
        LuaValue::UserData(other) => {
            let rhs = other.borrow::<LuaStatsArray>()?.0.clone();
            a.borrow_mut::<LuaStatsArray>()?.0.apply_array(&rhs, f);
        }
        LuaValue::Integer(n) => a.borrow_mut::<LuaStatsArray>()?.0.apply_scalar(n as f64, f),
        LuaValue::Number(n) => a.borrow_mut::<LuaStatsArray>()?.0.apply_scalar(n, f),
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "unsupported argument: {}",
                other.type_name()
            )))
        }
    }
    Ok(a)
}

impl UserData for LuaStatsArray {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method_mut("append", |_, this, n: f64| {
            this.0.append(n);
            Ok(())
        });
        methods.add_method_mut("mean", |_, this, ()| Ok(this.0.mean()));
        methods.add_method_mut("min", |_, this, ()| Ok(this.0.min()));
        methods.add_method_mut("max", |_, this, ()| Ok(this.0.max()));
        methods.add_function(
            "cdf",
            |_, (ud, args): (AnyUserData, Variadic<f64>)| match args.len() {
                0 => {
                    ud.borrow_mut::<LuaStatsArray>()?.0.cdf_in_place();
                    Ok(LuaValue::UserData(ud))
                }
                1 => {
                    let v = ud.borrow_mut::<LuaStatsArray>()?.0.cdf_of(args[0]);
                    Ok(LuaValue::Number(v))
                }
                _ => Err(mlua::Error::RuntimeError(
                    "unsupported number of arguments".into(),
                )),
            },
        );
        methods.add_method("min_indexes", |lua, this, n: usize| {
            indexes_table(lua, this.0.min_indexes(n))
        });
        methods.add_method("max_indexes", |lua, this, n: usize| {
            indexes_table(lua, this.0.max_indexes(n))
        });
        methods.add_function("clamp", |_, (ud, lo, hi): (AnyUserData, f64, f64)| {
            ud.borrow_mut::<LuaStatsArray>()?.0.clamp(lo, hi);
            Ok(ud)
        });
        methods.add_method("copy", |_, this, ()| Ok(LuaStatsArray(this.0.clone())));

        methods.add_meta_function(MetaMethod::Add, |_, (a, b): (AnyUserData, LuaValue)| {
            stats_binop(a, b, |x, y| x + y)
        });
        methods.add_meta_function(MetaMethod::Sub, |_, (a, b): (AnyUserData, LuaValue)| {
            stats_binop(a, b, |x, y| x - y)
        });
        methods.add_meta_function(MetaMethod::Mul, |_, (a, b): (AnyUserData, LuaValue)| {
            stats_binop(a, b, |x, y| x * y)
        });
        methods.add_meta_function(MetaMethod::Div, |_, (a, b): (AnyUserData, LuaValue)| {
            stats_binop(a, b, |x, y| x / y)
        });
        methods.add_meta_method(MetaMethod::Index, |_, this, key: LuaValue| {
            let index = match key {
                LuaValue::Integer(n) => n,
                LuaValue::Number(n) => n as i64,
                _ => return Ok(LuaValue::Nil),
            };
            if index >= 1 {
                if let Some(v) = this.0.get(index as usize - 1) {
                    return Ok(LuaValue::Number(v));
                }
            }
            Ok(LuaValue::Nil)
        });
    }
}

fn indexes_table(lua: &Lua, indexes: Vec<usize>) -> mlua::Result<mlua::Table> {
    let tbl = lua.create_table_with_capacity(indexes.len(), 0)?;
    for (i, idx) in indexes.into_iter().enumerate() {
        tbl.raw_set(i + 1, idx + 1)?;
    }
    Ok(tbl)
}

// ── State construction ───────────────────────────────────────────────────

fn upgrade(server: &Weak<Server>) -> mlua::Result<Arc<Server>> {
    server
        .upgrade()
        .ok_or_else(|| mlua::Error::RuntimeError("server is shutting down".into()))
}

fn table_numbers(table: &mlua::Table) -> mlua::Result<Vec<f64>> {
    table.clone().sequence_values::<f64>().collect()
}

/// Stringify a script argument the way a dynamic caller expects: numbers
/// and booleans coerce, everything else is rejected.
fn string_args(args: &Variadic<LuaValue>) -> mlua::Result<Vec<String>> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args.iter() {
        match arg {
            LuaValue::String(s) => out.push(s.to_string_lossy().into_owned()),
            LuaValue::Integer(n) => out.push(n.to_string()),
            LuaValue::Number(n) => out.push(meridian_protocol::value::format_float(*n)),
            LuaValue::Boolean(b) => out.push(b.to_string()),
            LuaValue::Nil => break,
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "invalid argument type {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok(out)
}

/// Read the invocation context installed by the eval command.
pub(crate) fn script_context(lua: &Lua) -> mlua::Result<(String, Arc<TxnStatus>)> {
    let globals = lua.globals();
    let eval_cmd: String = globals.raw_get("EVAL_CMD").unwrap_or_default();
    let ud: AnyUserData = globals.raw_get("TXN_STATUS")?;
    let status = ud.borrow::<LuaTxnStatus>()?.0.clone();
    Ok((eval_cmd, status))
}

pub(crate) fn set_eval_cmd(lua: &Lua, value: &str) {
    let _ = lua.globals().raw_set("EVAL_CMD", value);
}

/// Build a prewarmed interpreter with the full capability surface.
pub fn new_state(server: Weak<Server>) -> mlua::Result<Lua> {
    let lua = Lua::new();
    let tile38 = lua.create_table()?;

    {
        let server = server.clone();
        tile38.set(
            "call",
            lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let server = upgrade(&server)?;
                let (eval_cmd, status) = script_context(lua)?;
                let args = string_args(&args)?;
                if args.is_empty() {
                    return Err(mlua::Error::RuntimeError("missing command".into()));
                }
                scripts::call_result_to_lua(
                    lua,
                    scripts::script_call(&server, &eval_cmd, &status, args),
                )
            })?,
        )?;
    }
    {
        let server = server.clone();
        tile38.set(
            "pcall",
            lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let server = upgrade(&server)?;
                let (eval_cmd, status) = script_context(lua)?;
                let args = string_args(&args)?;
                if args.is_empty() {
                    return Err(mlua::Error::RuntimeError("missing command".into()));
                }
                match scripts::script_call(&server, &eval_cmd, &status, args) {
                    Ok(value) => resp_to_lua(lua, &value),
                    Err(err) => resp_to_lua(
                        lua,
                        &meridian_protocol::Value::Error(scripts::error_reply_text(&err)),
                    ),
                }
            })?,
        )?;
    }

    tile38.set(
        "error_reply",
        lua.create_function(|lua, msg: String| {
            let tbl = lua.create_table()?;
            tbl.raw_set("err", msg)?;
            Ok(tbl)
        })?,
    )?;
    tile38.set(
        "status_reply",
        lua.create_function(|lua, msg: String| {
            let tbl = lua.create_table()?;
            tbl.raw_set("ok", msg)?;
            Ok(tbl)
        })?,
    )?;
    tile38.set(
        "sha1hex",
        lua.create_function(|_, text: String| Ok(scripts::sha1_hex(&text)))?,
    )?;
    tile38.set(
        "distance_to",
        lua.create_function(|_, (lat1, lon1, lat2, lon2): (f64, f64, f64, f64)| {
            Ok(meridian_store::geo::haversine(lat1, lon1, lat2, lon2))
        })?,
    )?;
    tile38.set(
        "cdf",
        lua.create_function(|_, (x, xmin, mean, stddev): (f64, f64, f64, f64)| {
            Ok(cdf_with_floor(x, xmin, mean, stddev))
        })?,
    )?;
    tile38.set(
        "mean_std_min_max",
        lua.create_function(|_, data: mlua::Table| {
            let mut stats = StatsArray::new();
            for value in data.sequence_values::<f64>() {
                stats.append(value?);
            }
            Ok((stats.mean(), stats.stddev(), stats.min(), stats.max()))
        })?,
    )?;
    tile38.set(
        "adjusted_similarity_scores",
        lua.create_function(
            |lua,
             (algorithm_params, scores, distances, ages): (
                mlua::Table,
                mlua::Table,
                mlua::Table,
                mlua::Table,
            )| {
                let params = SimilarityParams {
                    algorithm: algorithm_params
                        .raw_get::<_, Option<String>>("algorithm")?
                        .unwrap_or_default(),
                    dist_max_penalty: algorithm_params
                        .raw_get::<_, Option<f64>>("distMaxPenalty")?
                        .unwrap_or(similarity::DEFAULT_DIST_MAX_PENALTY),
                    age_max_penalty: algorithm_params
                        .raw_get::<_, Option<f64>>("ageMaxPenalty")?
                        .unwrap_or(similarity::DEFAULT_AGE_MAX_PENALTY),
                };
                let scores = table_numbers(&scores)?;
                let distances = table_numbers(&distances)?;
                let ages = table_numbers(&ages)?;
                let adjusted =
                    similarity::adjusted_similarity_scores(&params, &scores, &distances, &ages)
                        .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;

                // Ordered [index, score] pairs, one per input score.
                let result = lua.create_table_with_capacity(adjusted.len(), 0)?;
                for (i, score) in adjusted.iter().enumerate() {
                    let pair = lua.create_table_with_capacity(2, 0)?;
                    pair.raw_set(1, (i + 1) as i64)?;
                    pair.raw_set(2, *score)?;
                    result.raw_set(i + 1, pair)?;
                }
                Ok(result)
            },
        )?,
    )?;
    tile38.set(
        "new_stats_array",
        lua.create_function(|_, ()| Ok(LuaStatsArray(StatsArray::new())))?,
    )?;

    {
        let server = server.clone();
        tile38.set(
            "get",
            lua.create_function(move |lua, (key, id): (String, String)| {
                let server = upgrade(&server)?;
                let (eval_cmd, _) = script_context(lua)?;
                match scripts::script_get(&server, &eval_cmd, &key, &id) {
                    Ok(Some((id, obj, fields, field_names))) => Ok(LuaValue::UserData(
                        lua.create_userdata(LuaCollectionItem {
                            id,
                            obj,
                            fields,
                            field_names,
                        })?,
                    )),
                    Ok(None) => Ok(LuaValue::Nil),
                    Err(err) => Err(mlua::Error::RuntimeError(scripts::error_reply_text(&err))),
                }
            })?,
        )?;
    }
    {
        let server = server.clone();
        tile38.set(
            "field_indexes",
            lua.create_function(move |_, args: Variadic<LuaValue>| {
                let server = upgrade(&server)?;
                let args = string_args(&args)?;
                let key = args
                    .first()
                    .ok_or_else(|| mlua::Error::RuntimeError("missing key".into()))?;
                let field_names = server
                    .with_col(key, |col| col.field_map().to_vec())
                    .ok_or_else(|| {
                        mlua::Error::RuntimeError(format!("unknown key {}", key))
                    })?;
                let mut out = Vec::new();
                for name in &args[1..] {
                    let idx = field_names
                        .iter()
                        .position(|f| f == name)
                        .ok_or_else(|| {
                            mlua::Error::RuntimeError(format!("unknown field {}", name))
                        })?;
                    out.push((idx + 1) as i64);
                }
                Ok(Variadic::from_iter(out))
            })?,
        )?;
    }
    tile38.set(
        "parse_geojson",
        lua.create_function(|lua, text: String| {
            match GeoObject::parse_geojson(&text) {
                Ok(obj) => Ok(LuaValue::UserData(lua.create_userdata(LuaGeoObject(obj))?)),
                Err(e) => Err(mlua::Error::RuntimeError(e.to_string())),
            }
        })?,
    )?;

    {
        let server = server.clone();
        tile38.set(
            "iterate",
            lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let server = upgrade(&server)?;
                let cursor = scan_bridge::lua_iterate(lua, &server, args)?;
                Ok(cursor)
            })?,
        )?;
    }
    {
        let server = server.clone();
        tile38.set(
            "piterate",
            lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let server = upgrade(&server)?;
                match scan_bridge::lua_iterate(lua, &server, args) {
                    Ok(cursor) => Ok((true, cursor)),
                    Err(err) => {
                        let text = match err {
                            mlua::Error::RuntimeError(s) => s,
                            other => other.to_string(),
                        };
                        Ok((false, text))
                    }
                }
            })?,
        )?;
    }

    lua.globals().set("tile38", tile38)?;

    // json helpers, mirroring the embedded json module scripts expect.
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|_, value: LuaValue| Ok(lua_to_json(&value)))?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| mlua::Error::RuntimeError(format!("invalid json: {}", e)))?;
            json_to_lua(lua, &parsed)
        })?,
    )?;
    lua.globals().set("json", json)?;

    // Forbid new globals: scripts must go through the provided surface.
    let mt = lua.create_table()?;
    mt.set(
        "__newindex",
        lua.create_function(|_, (_table, key, _value): (LuaValue, LuaValue, LuaValue)| {
            let name = match &key {
                LuaValue::String(s) => s.to_string_lossy().into_owned(),
                other => other.type_name().to_string(),
            };
            Err::<(), _>(mlua::Error::RuntimeError(format!(
                "attempt to create global variable '{}'",
                name
            )))
        })?,
    )?;
    lua.globals().set_metatable(Some(mt));

    Ok(lua)
}

/// Install the per-invocation globals. Raw access bypasses the new-global
/// lock.
pub fn install_globals(
    lua: &Lua,
    eval_cmd: &str,
    keys: &[String],
    argv: &[String],
    deadline: Option<SystemTime>,
    status: &Arc<TxnStatus>,
) -> mlua::Result<()> {
    let globals = lua.globals();
    let keys_tbl = lua.create_table_with_capacity(keys.len(), 0)?;
    for (i, key) in keys.iter().enumerate() {
        keys_tbl.raw_set(i + 1, key.as_str())?;
    }
    let argv_tbl = lua.create_table_with_capacity(argv.len(), 0)?;
    for (i, arg) in argv.iter().enumerate() {
        argv_tbl.raw_set(i + 1, arg.as_str())?;
    }
    globals.raw_set("KEYS", keys_tbl)?;
    globals.raw_set("ARGV", argv_tbl)?;
    globals.raw_set("EVAL_CMD", eval_cmd)?;
    match deadline.and_then(|d| d.duration_since(SystemTime::UNIX_EPOCH).ok()) {
        Some(since_epoch) => globals.raw_set("DEADLINE", since_epoch.as_secs_f64())?,
        None => globals.raw_set("DEADLINE", LuaValue::Nil)?,
    }
    globals.raw_set("TXN_STATUS", LuaTxnStatus(status.clone()))?;
    Ok(())
}

/// Scrub the per-invocation globals before the interpreter goes back to the
/// pool.
pub fn clear_globals(lua: &Lua) {
    let globals = lua.globals();
    for name in SCRIPT_GLOBALS {
        let _ = globals.raw_set(name, LuaValue::Nil);
    }
}
