//! Conversions between Lua values, RESP values, and JSON.
//!
//! The conversion to the wire is total: every Lua value a script can return
//! maps to a RESP value (unsupported types become error replies, matching
//! the wire contract that a reply is always produced).

use mlua::{Lua, Value as LuaValue};

use meridian_protocol::Value;

/// RESP → Lua. Null becomes `false` (scripts test results with `if`),
/// simple strings and errors become `{ok=…}` / `{err=…}` tables.
pub fn resp_to_lua<'lua>(lua: &'lua Lua, value: &Value) -> mlua::Result<LuaValue<'lua>> {
    match value {
        Value::Null => Ok(LuaValue::Boolean(false)),
        Value::Integer(n) => Ok(LuaValue::Integer(*n)),
        Value::Float(f) => Ok(LuaValue::Number(*f)),
        Value::BulkString(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Value::SimpleString(s) => {
            let tbl = lua.create_table()?;
            tbl.raw_set("ok", s.as_str())?;
            Ok(LuaValue::Table(tbl))
        }
        Value::Error(msg) => {
            let tbl = lua.create_table()?;
            tbl.raw_set("err", msg.as_str())?;
            Ok(LuaValue::Table(tbl))
        }
        Value::Array(items) => {
            let tbl = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                tbl.raw_set(i + 1, resp_to_lua(lua, item)?)?;
            }
            Ok(LuaValue::Table(tbl))
        }
    }
}

/// Lua → RESP, per the wire conversion rules:
/// nil → null; false → null; true → 1; numbers floor to integers except
/// NaN/±∞ which stay floats; strings → bulk; `{ok=…}`/`{err=…}` single-pair
/// tables collapse to simple-string/error; list tables → arrays; other
/// tables → arrays of `[key, value]` pairs.
pub fn lua_to_resp(value: &LuaValue) -> Value {
    match value {
        LuaValue::Nil => Value::Null,
        LuaValue::Boolean(true) => Value::Integer(1),
        LuaValue::Boolean(false) => Value::Null,
        LuaValue::Integer(n) => Value::Integer(*n),
        LuaValue::Number(f) => {
            if f.is_nan() || f.is_infinite() {
                Value::Float(*f)
            } else {
                Value::Integer(f.floor() as i64)
            }
        }
        LuaValue::String(s) => Value::BulkString(s.to_string_lossy().into_owned()),
        LuaValue::Table(tbl) => {
            if tbl.raw_len() > 0 {
                let mut items = Vec::new();
                for entry in tbl.clone().sequence_values::<LuaValue>() {
                    match entry {
                        Ok(v) => items.push(lua_to_resp(&v)),
                        Err(_) => break,
                    }
                }
                Value::Array(items)
            } else {
                let mut values = Vec::new();
                let mut specials = Vec::new();
                for pair in tbl.clone().pairs::<LuaValue, LuaValue>() {
                    let Ok((k, v)) = pair else { continue };
                    if let LuaValue::String(key) = &k {
                        match key.to_string_lossy().as_ref() {
                            "ok" => specials.push(Value::SimpleString(display_string(&v))),
                            "err" => specials.push(Value::Error(display_string(&v))),
                            _ => {}
                        }
                    }
                    values.push(Value::Array(vec![lua_to_resp(&k), lua_to_resp(&v)]));
                }
                if values.len() == 1 && specials.len() == 1 {
                    specials.remove(0)
                } else {
                    Value::Array(values)
                }
            }
        }
        other => Value::Error(format!("Unsupported lua type: {}", other.type_name())),
    }
}

/// Lua → JSON text, used by the JSON output mode of the eval commands.
pub fn lua_to_json(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "null".into(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(n) => n.to_string(),
        LuaValue::Number(f) => meridian_protocol::value::format_float(*f),
        LuaValue::String(s) => {
            serde_json::Value::String(s.to_string_lossy().into_owned()).to_string()
        }
        LuaValue::Table(tbl) => {
            if tbl.raw_len() > 0 {
                let mut parts = Vec::new();
                for entry in tbl.clone().sequence_values::<LuaValue>() {
                    match entry {
                        Ok(v) => parts.push(lua_to_json(&v)),
                        Err(_) => break,
                    }
                }
                format!("[{}]", parts.join(","))
            } else {
                let mut parts = Vec::new();
                for pair in tbl.clone().pairs::<LuaValue, LuaValue>() {
                    let Ok((k, v)) = pair else { continue };
                    let key = match &k {
                        LuaValue::String(s) => {
                            serde_json::Value::String(s.to_string_lossy().into_owned()).to_string()
                        }
                        other => serde_json::Value::String(display_string(other)).to_string(),
                    };
                    parts.push(format!("{}:{}", key, lua_to_json(&v)));
                }
                format!("{{{}}}", parts.join(","))
            }
        }
        other => format!("Unsupported lua type: {}", other.type_name()),
    }
}

/// JSON → Lua, for the scripts' `json.decode`.
pub fn json_to_lua<'lua>(lua: &'lua Lua, value: &serde_json::Value) -> mlua::Result<LuaValue<'lua>> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        serde_json::Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        serde_json::Value::Array(items) => {
            let tbl = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                tbl.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Ok(LuaValue::Table(tbl))
        }
        serde_json::Value::Object(map) => {
            let tbl = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                tbl.raw_set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(tbl))
        }
    }
}

fn display_string(value: &LuaValue) -> String {
    match value {
        LuaValue::String(s) => s.to_string_lossy().into_owned(),
        LuaValue::Integer(n) => n.to_string(),
        LuaValue::Number(f) => meridian_protocol::value::format_float(*f),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Nil => "nil".into(),
        other => format!("{:?}", other.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_roundtrip_to_resp() {
        let lua = Lua::new();
        assert_eq!(lua_to_resp(&LuaValue::Nil), Value::Null);
        assert_eq!(lua_to_resp(&LuaValue::Boolean(false)), Value::Null);
        assert_eq!(lua_to_resp(&LuaValue::Boolean(true)), Value::Integer(1));
        assert_eq!(lua_to_resp(&LuaValue::Number(4.9)), Value::Integer(4));
        assert!(matches!(
            lua_to_resp(&LuaValue::Number(f64::NAN)),
            Value::Float(_)
        ));
        let s = lua.create_string("hi").unwrap();
        assert_eq!(lua_to_resp(&LuaValue::String(s)), Value::bulk("hi"));
    }

    #[test]
    fn test_ok_err_tables_collapse() {
        let lua = Lua::new();
        let tbl = lua.create_table().unwrap();
        tbl.raw_set("ok", "OK").unwrap();
        assert_eq!(
            lua_to_resp(&LuaValue::Table(tbl)),
            Value::SimpleString("OK".into())
        );

        let tbl = lua.create_table().unwrap();
        tbl.raw_set("err", "read only").unwrap();
        assert_eq!(
            lua_to_resp(&LuaValue::Table(tbl)),
            Value::Error("read only".into())
        );
    }

    #[test]
    fn test_tagged_table_with_extra_pairs_stays_array() {
        let lua = Lua::new();
        let tbl = lua.create_table().unwrap();
        tbl.raw_set("ok", "OK").unwrap();
        tbl.raw_set("extra", 1).unwrap();
        match lua_to_resp(&LuaValue::Table(tbl)) {
            Value::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {:?}", other),
        };
    }

    #[test]
    fn test_list_table_becomes_array() {
        let lua = Lua::new();
        let tbl = lua.create_table().unwrap();
        tbl.raw_set(1, "a").unwrap();
        tbl.raw_set(2, 2).unwrap();
        assert_eq!(
            lua_to_resp(&LuaValue::Table(tbl)),
            Value::Array(vec![Value::bulk("a"), Value::Integer(2)])
        );
    }

    #[test]
    fn test_resp_to_lua_null_is_false() {
        let lua = Lua::new();
        let v = resp_to_lua(&lua, &Value::Null).unwrap();
        assert!(matches!(v, LuaValue::Boolean(false)));
    }

    #[test]
    fn test_resp_to_lua_simple_string_is_ok_table() {
        let lua = Lua::new();
        let v = resp_to_lua(&lua, &Value::ok()).unwrap();
        let LuaValue::Table(tbl) = v else {
            panic!("expected table")
        };
        assert_eq!(tbl.raw_get::<_, String>("ok").unwrap(), "OK");
    }

    #[test]
    fn test_lua_to_json_shapes() {
        let lua = Lua::new();
        assert_eq!(lua_to_json(&LuaValue::Nil), "null");
        assert_eq!(lua_to_json(&LuaValue::Integer(4)), "4");
        let tbl = lua.create_table().unwrap();
        tbl.raw_set(1, 1).unwrap();
        tbl.raw_set(2, "two").unwrap();
        assert_eq!(lua_to_json(&LuaValue::Table(tbl)), r#"[1,"two"]"#);
    }
}
