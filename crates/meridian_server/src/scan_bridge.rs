//! Couples a script's per-item callback to a store scan.
//!
//! `tile38.iterate(callback, cmd, args…)` runs one of the search-family
//! commands and feeds every match to the callback through a reusable
//! iterator handle. When the scheduler interrupts the scan, the bridge
//! unwinds out of the store iterator, retries through the transaction
//! status (which blocks until a fresh permit is granted), and re-enters
//! with the cursor and limits advanced past everything already delivered —
//! the script observes one continuous scan.
//!
//! While the callback runs, `EVAL_CMD` is pinned to `evalro` so nested
//! calls cannot mutate the store mid-iteration, even in atomic read-write
//! mode.

use std::sync::Arc;

use mlua::{AnyUserData, Lua, Value as LuaValue, Variadic};

use meridian_common::error::{CommandError, MeridianError, TxnError};
use meridian_txn::TxnStatus;

use crate::message::Message;
use crate::scan::{parse_scan_args, run_scan, ScanCollector};
use crate::script_surface::{self, IterItem, LuaScanIterator};
use crate::scripts;
use crate::server::Server;

/// Restores the pinned `EVAL_CMD` global on every exit path.
struct EvalCmdPin<'lua> {
    lua: &'lua Lua,
    original: String,
}

impl<'lua> EvalCmdPin<'lua> {
    fn new(lua: &'lua Lua, original: String) -> Self {
        script_surface::set_eval_cmd(lua, "evalro");
        Self { lua, original }
    }
}

impl Drop for EvalCmdPin<'_> {
    fn drop(&mut self) {
        script_surface::set_eval_cmd(self.lua, &self.original);
    }
}

struct LuaCollector<'a, 'lua> {
    callback: &'a mlua::Function<'lua>,
    iterator: &'a AnyUserData<'lua>,
    error: Option<mlua::Error>,
}

impl ScanCollector for LuaCollector<'_, '_> {
    fn emit(
        &mut self,
        id: &str,
        item: &meridian_store::Item,
        distance: f64,
        field_names: &[String],
    ) -> bool {
        {
            let mut iter = match self.iterator.borrow_mut::<LuaScanIterator>() {
                Ok(iter) => iter,
                Err(e) => {
                    self.error = Some(e);
                    return false;
                }
            };
            iter.field_names = field_names.to_vec();
            iter.current = Some(IterItem {
                id: id.to_string(),
                obj: item.obj.clone(),
                fields: item.fields.clone(),
                distance,
            });
        }
        match self.callback.call::<_, LuaValue>(self.iterator.clone()) {
            Ok(result) => !matches!(result, LuaValue::Nil | LuaValue::Boolean(false)),
            Err(e) => {
                self.error = Some(e);
                false
            }
        }
    }
}

/// Shared implementation of `tile38.iterate` and `tile38.piterate`.
/// Returns the final cursor as a string.
pub fn lua_iterate(
    lua: &Lua,
    server: &Arc<Server>,
    args: Variadic<LuaValue>,
) -> mlua::Result<String> {
    let (eval_cmd, outer_status) = script_surface::script_context(lua)?;

    let mut iter = args.into_iter();
    let callback: mlua::Function = match iter.next() {
        Some(LuaValue::Function(f)) => f,
        _ => {
            return Err(mlua::Error::RuntimeError(
                "expected a callback function".into(),
            ))
        }
    };
    let mut rest = Vec::new();
    for value in iter {
        match value {
            LuaValue::String(s) => rest.push(s.to_string_lossy().into_owned()),
            LuaValue::Integer(n) => rest.push(n.to_string()),
            LuaValue::Number(n) => rest.push(meridian_protocol::value::format_float(n)),
            LuaValue::Boolean(b) => rest.push(b.to_string()),
            LuaValue::Nil => break,
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "invalid argument type {}",
                    other.type_name()
                )))
            }
        }
    }
    if rest.is_empty() {
        return Err(mlua::Error::RuntimeError("expected a sub-command".into()));
    }

    // A `timeout N cmd args…` prefix tightens the deadline.
    let mut msg = Message::new(rest);
    msg.deadline = outer_status.deadline();
    msg.rewrite_timeout_prefix()
        .map_err(|e| mlua::Error::RuntimeError(scripts::error_reply_text(&e)))?;
    let cmd = msg.command();
    if !matches!(
        cmd.as_str(),
        "scan" | "nearby" | "within" | "intersects" | "search"
    ) {
        return Err(mlua::Error::RuntimeError(
            "expected command to be nearby, within, intersects, scan or search".into(),
        ));
    }

    // Non-atomic mode takes its own scan permit; the atomic modes ride on
    // the permit the outer eval already holds.
    let mut _permit = None;
    let status: TxnStatus = match eval_cmd.as_str() {
        "evalna" | "evalnasha" => {
            let (permit, scan_status) = server
                .scheduler
                .scan()
                .map_err(|e| runtime_err(MeridianError::Txn(e)))?;
            _permit = Some(permit);
            match msg.deadline {
                Some(deadline) => scan_status.with_deadline(deadline),
                None => scan_status,
            }
        }
        _ => match msg.deadline {
            Some(deadline) => outer_status.with_deadline(deadline),
            None => outer_status.as_ref().clone(),
        },
    };

    if server.repl.is_follower() && !server.caught_up_once() {
        return Err(runtime_err(CommandError::CatchingUp.into()));
    }

    let base_params = parse_scan_args(&cmd, &msg.args).map_err(runtime_err)?;
    let iterator = lua.create_userdata(LuaScanIterator::default())?;
    let _pin = EvalCmdPin::new(lua, eval_cmd);

    let mut skip_scan: u64 = 0;
    let mut skip_match: u64 = 0;
    loop {
        let mut params = base_params.clone();
        params.cursor += skip_scan;
        if params.limit_matched > 0 {
            params.limit_matched = params.limit_matched.saturating_sub(skip_match);
        }
        if params.limit_scanned > 0 {
            params.limit_scanned = params.limit_scanned.saturating_sub(skip_scan);
        }

        let mut collector = LuaCollector {
            callback: &callback,
            iterator: &iterator,
            error: None,
        };
        let exec = run_scan(server, &params, &status, &mut collector).map_err(runtime_err)?;

        skip_match += exec.match_count;
        skip_scan += exec.scan_end - exec.scan_start;

        if let Some(err) = collector.error {
            return Err(err);
        }
        match exec.aborted {
            Some(TxnError::Interrupted) => {
                status.retry();
                continue;
            }
            Some(err) => {
                return Err(runtime_err(match err {
                    TxnError::DeadlineExceeded => CommandError::Timeout.into(),
                    other => MeridianError::Txn(other),
                }))
            }
            None => {}
        }
        return Ok(exec.client_cursor().to_string());
    }
}

fn runtime_err(err: MeridianError) -> mlua::Error {
    mlua::Error::RuntimeError(scripts::error_reply_text(&err))
}
