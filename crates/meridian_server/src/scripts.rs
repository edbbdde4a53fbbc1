//! The scripting host: interpreter pool, script registry, the six eval
//! commands, and the nested-call dispatch for the three evaluation modes.
//!
//! - `EVAL`/`EVALSHA`: atomic read-write. The outer command holds the write
//!   permit; nested calls execute without re-acquiring, nested writes are
//!   still journaled.
//! - `EVALRO`/`EVALROSHA`: atomic read-only. Nested writes fail read-only.
//! - `EVALNA`/`EVALNASHA`: non-atomic. Every nested call acquires its own
//!   permit, so scripts interleave with other clients.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use mlua::{Lua, Value as LuaValue};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use meridian_protocol::Value;
use meridian_txn::TxnStatus;

use meridian_common::error::{
    CommandError, MeridianError, MeridianResult, ScriptError, TxnError,
};

use crate::message::{Message, OutputMode};
use crate::router::{self, Applied};
use crate::script_surface;
use crate::script_values::{lua_to_json, lua_to_resp, resp_to_lua};
use crate::server::Server;

pub(crate) const INITIAL_POOL_SIZE: usize = 5;
pub(crate) const MAX_POOL_SIZE: usize = 1000;

/// Instructions between deadline checks inside the interpreter.
const DEADLINE_HOOK_INTERVAL: u32 = 1000;

pub fn sha1_hex(text: &str) -> String {
    let digest = Sha1::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

// ── Script registry ──────────────────────────────────────────────────────

/// Compiled-script store keyed by the 40-char hex fingerprint of the
/// source. Sources are kept verbatim; each pooled interpreter compiles on
/// use, so the fingerprint → behavior mapping survives pool churn.
pub struct ScriptRegistry {
    scripts: Mutex<HashMap<String, String>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, sha: &str) -> Option<String> {
        self.scripts.lock().get(sha).cloned()
    }

    pub fn put(&self, sha: &str, source: &str) {
        self.scripts
            .lock()
            .insert(sha.to_string(), source.to_string());
    }

    pub fn contains(&self, sha: &str) -> bool {
        self.scripts.lock().contains_key(sha)
    }

    pub fn flush(&self) {
        self.scripts.lock().clear();
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Interpreter pool ─────────────────────────────────────────────────────

struct PoolInner {
    saved: Vec<Lua>,
    total: usize,
}

/// Bounded, refillable pool of prewarmed interpreters. Acquisition is
/// fast-fail: when the cap is reached the caller gets an error instead of
/// waiting, because a blocked caller would compete with the scheduler.
pub struct LuaPool {
    server: Weak<Server>,
    inner: Mutex<PoolInner>,
}

impl LuaPool {
    pub fn new(server: Weak<Server>) -> Self {
        Self {
            server,
            inner: Mutex::new(PoolInner {
                saved: Vec::new(),
                total: 0,
            }),
        }
    }

    /// Prewarm the pool. Called once the owning server is constructed.
    pub fn fill_initial(&self) {
        let mut inner = self.inner.lock();
        while inner.total < INITIAL_POOL_SIZE {
            match self.new_state() {
                Ok(state) => {
                    inner.saved.push(state);
                    inner.total += 1;
                }
                Err(e) => {
                    tracing::error!("interpreter prewarm failed: {}", e);
                    return;
                }
            }
        }
    }

    pub fn get(&self) -> MeridianResult<Lua> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.saved.pop() {
            return Ok(state);
        }
        if inner.total >= MAX_POOL_SIZE {
            return Err(ScriptError::NoInterpreters.into());
        }
        inner.total += 1;
        drop(inner);
        match self.new_state() {
            Ok(state) => Ok(state),
            Err(e) => {
                self.inner.lock().total -= 1;
                Err(MeridianError::Internal(format!(
                    "interpreter init failed: {}",
                    e
                )))
            }
        }
    }

    pub fn put(&self, state: Lua) {
        self.inner.lock().saved.push(state);
    }

    /// Drop half of the idle surplus above the initial size.
    pub fn prune(&self) {
        let mut inner = self.inner.lock();
        let idle = inner.saved.len();
        if idle > INITIAL_POOL_SIZE {
            let drop_count = ((idle - INITIAL_POOL_SIZE) / 2).max(1);
            inner.saved.drain(0..drop_count);
            inner.total -= drop_count;
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().saved.len()
    }

    pub fn total_count(&self) -> usize {
        self.inner.lock().total
    }

    fn new_state(&self) -> mlua::Result<Lua> {
        script_surface::new_state(self.server.clone())
    }
}

// ── Eval commands ────────────────────────────────────────────────────────

/// Router entry for the six eval commands.
pub fn script_command(server: &Arc<Server>, msg: &mut Message) -> MeridianResult<Value> {
    let cmd = msg.command();
    match cmd.as_str() {
        "eval" | "evalsha" => {
            let permit = server.scheduler.write().map_err(MeridianError::Txn)?;
            let result = cmd_eval_unified(server, msg, cmd.ends_with("sha"));
            permit.done();
            result
        }
        "evalro" | "evalrosha" => {
            let permit = server.scheduler.read().map_err(MeridianError::Txn)?;
            let result = cmd_eval_unified(server, msg, cmd.ends_with("sha"));
            permit.done();
            result
        }
        "evalna" | "evalnasha" => cmd_eval_unified(server, msg, cmd.ends_with("sha")),
        other => Err(CommandError::Unknown(other.to_string()).into()),
    }
}

fn cmd_eval_unified(
    server: &Arc<Server>,
    msg: &Message,
    script_is_sha: bool,
) -> MeridianResult<Value> {
    let start = Instant::now();
    let args = &msg.args;
    if args.len() < 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let script = &args[1];
    let numkeys: usize = args[2]
        .parse()
        .map_err(|_| CommandError::InvalidArg(args[2].clone()))?;
    if args.len() < 3 + numkeys {
        return Err(CommandError::InvalidArgCount.into());
    }
    let keys = &args[3..3 + numkeys];
    let argv = &args[3 + numkeys..];

    let sha = if script_is_sha {
        script.to_lowercase()
    } else {
        sha1_hex(script)
    };
    let source = match server.scripts.get(&sha) {
        Some(source) => source,
        None if script_is_sha => return Err(ScriptError::ShaNotFound.into()),
        None => script.clone(),
    };

    let status = Arc::new(match msg.deadline {
        Some(deadline) => TxnStatus::unbounded().with_deadline(deadline),
        None => TxnStatus::unbounded(),
    });

    let lua = server.lua_pool.get()?;
    let result = (|| {
        script_surface::install_globals(&lua, &msg.command(), keys, argv, msg.deadline, &status)
            .map_err(|e| MeridianError::Internal(e.to_string()))?;
        if let Some(deadline) = msg.deadline {
            install_deadline_hook(&lua, deadline);
        }
        let func = lua
            .load(source.as_str())
            .set_name(format!("f_{}", sha))
            .into_function()
            .map_err(|err| map_script_error(err, &status))?;
        // Register only once the script is known to compile.
        server.scripts.put(&sha, &source);
        func.call::<_, LuaValue>(())
            .map_err(|err| map_script_error(err, &status))
    })();

    // Every exit path scrubs the globals and returns the interpreter.
    lua.remove_hook();
    script_surface::clear_globals(&lua);
    let outcome = result.map(|ret| render(msg.output, &ret, start));
    server.lua_pool.put(lua);
    outcome
}

fn render(output: OutputMode, ret: &LuaValue, start: Instant) -> Value {
    match output {
        OutputMode::Resp => lua_to_resp(ret),
        OutputMode::Json => Value::bulk(format!(
            r#"{{"ok":true,"result":{},"elapsed":"{:?}"}}"#,
            lua_to_json(ret),
            start.elapsed()
        )),
    }
}

fn install_deadline_hook(lua: &Lua, deadline: SystemTime) {
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(DEADLINE_HOOK_INTERVAL),
        move |_lua, _debug| {
            if SystemTime::now() >= deadline {
                Err(mlua::Error::RuntimeError(
                    "context deadline exceeded".into(),
                ))
            } else {
                Ok(())
            }
        },
    );
}

/// Map an interpreter error to the wire. An abort caused by the deadline
/// hook surfaces as the sticky timeout error rather than a script failure.
fn map_script_error(err: mlua::Error, status: &TxnStatus) -> MeridianError {
    let text = err.to_string();
    if text.contains("context deadline exceeded") && status.error().is_some() {
        return CommandError::Timeout.into();
    }
    tracing::debug!("script error: {}", text);
    ScriptError::Runtime(text.replace('\n', "\\n")).into()
}

// ── SCRIPT subcommands ───────────────────────────────────────────────────

pub fn cmd_script_mgmt(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    let sub = args
        .get(1)
        .map(|a| a.to_lowercase())
        .ok_or(CommandError::InvalidArgCount)?;
    match sub.as_str() {
        "load" => {
            let source = args.get(2).ok_or(CommandError::InvalidArgCount)?;
            if args.len() != 3 {
                return Err(CommandError::InvalidArgCount.into());
            }
            // Compile once so syntax errors surface at load time.
            let lua = server.lua_pool.get()?;
            let compile_err = lua
                .load(source.as_str())
                .into_function()
                .err()
                .map(|e| e.to_string().replace('\n', "\\n"));
            server.lua_pool.put(lua);
            if let Some(e) = compile_err {
                return Err(ScriptError::Runtime(e).into());
            }
            let sha = sha1_hex(source);
            server.scripts.put(&sha, source);
            Ok(Value::bulk(sha))
        }
        "exists" => {
            if args.len() < 3 {
                return Err(CommandError::InvalidArgCount.into());
            }
            let results = args[2..]
                .iter()
                .map(|sha| Value::Integer(server.scripts.contains(&sha.to_lowercase()) as i64))
                .collect();
            Ok(Value::Array(results))
        }
        "flush" => {
            if args.len() != 2 {
                return Err(CommandError::InvalidArgCount.into());
            }
            server.scripts.flush();
            Ok(Value::ok())
        }
        other => Err(CommandError::InvalidArg(other.to_string()).into()),
    }
}

// ── Nested call dispatch ─────────────────────────────────────────────────

fn is_write_command(cmd: &str) -> bool {
    matches!(
        cmd,
        "set" | "del"
            | "drop"
            | "fset"
            | "flushdb"
            | "expire"
            | "persist"
            | "jset"
            | "jdel"
            | "pdel"
            | "rename"
            | "renamenx"
    )
}

fn is_read_command(cmd: &str) -> bool {
    matches!(
        cmd,
        "get" | "keys"
            | "scan"
            | "nearby"
            | "within"
            | "intersects"
            | "search"
            | "ttl"
            | "bounds"
            | "server"
            | "info"
            | "type"
            | "jget"
            | "stats"
            | "test"
    )
}

fn is_scan_command(cmd: &str) -> bool {
    matches!(cmd, "scan" | "nearby" | "within" | "intersects" | "search")
}

/// Commands that are never allowed from a script, in any mode.
fn forbidden_in_scripts(cmd: &str) -> bool {
    matches!(
        cmd,
        "ping" | "echo"
            | "auth"
            | "massinsert"
            | "shutdown"
            | "gc"
            | "sethook"
            | "pdelhook"
            | "delhook"
            | "follow"
            | "readonly"
            | "config"
            | "output"
            | "client"
            | "aofshrink"
            | "script"
            | "eval"
            | "evalsha"
            | "evalro"
            | "evalrosha"
            | "evalna"
            | "evalnasha"
    )
}

/// `tile38.call` / `tile38.pcall`: run a data-store command from inside a
/// script, honoring the evaluation mode's locking and policy rules.
pub fn script_call(
    server: &Arc<Server>,
    eval_cmd: &str,
    status: &Arc<TxnStatus>,
    args: Vec<String>,
) -> MeridianResult<Value> {
    let mut msg = Message::new(args);
    msg.output = OutputMode::Resp;
    if msg.command() == "timeout" {
        msg.rewrite_timeout_prefix()?;
    }

    let cmd = msg.command();
    if forbidden_in_scripts(&cmd) {
        return Err(ScriptError::CmdNotSupported.into());
    }

    match eval_cmd {
        "eval" | "evalsha" => call_atomic_rw(server, &mut msg, status),
        "evalro" | "evalrosha" => call_atomic_ro(server, &mut msg, status),
        "evalna" | "evalnasha" => call_non_atomic(server, &mut msg, status),
        _ => Err(ScriptError::CmdNotSupported.into()),
    }
}

/// Atomic read-write mode: the outer EVAL already holds the write slot, so
/// nothing re-acquires; writes are journaled as they execute.
fn call_atomic_rw(
    server: &Arc<Server>,
    msg: &mut Message,
    status: &Arc<TxnStatus>,
) -> MeridianResult<Value> {
    let cmd = msg.command();
    let write = if is_write_command(&cmd) {
        if server.repl.is_follower() {
            return Err(CommandError::NotLeader.into());
        }
        if server.repl.read_only() {
            return Err(CommandError::ReadOnly.into());
        }
        true
    } else if is_read_command(&cmd) {
        gate_script_read(server)?;
        false
    } else {
        return Err(ScriptError::CmdNotSupported.into());
    };

    if write && msg.deadline.is_some() {
        return Err(CommandError::TimeoutNotSupported(cmd).into());
    }

    let derived;
    let status_view: &TxnStatus = match msg.deadline {
        Some(deadline) => {
            derived = status.with_deadline(deadline);
            &derived
        }
        None => status.as_ref(),
    };
    let applied = execute_nested(server, msg, status_view)?;
    if write && applied.dirty {
        server.append_aof(&msg.args);
    }
    Ok(applied.value)
}

/// Atomic read-only mode: nested writes are rejected outright.
fn call_atomic_ro(
    server: &Arc<Server>,
    msg: &mut Message,
    status: &Arc<TxnStatus>,
) -> MeridianResult<Value> {
    let cmd = msg.command();
    if is_write_command(&cmd) {
        return Err(CommandError::ReadOnly.into());
    }
    if !is_read_command(&cmd) {
        return Err(ScriptError::CmdNotSupported.into());
    }
    gate_script_read(server)?;
    let derived;
    let status_view: &TxnStatus = match msg.deadline {
        Some(deadline) => {
            derived = status.with_deadline(deadline);
            &derived
        }
        None => status.as_ref(),
    };
    execute_nested(server, msg, status_view).map(|applied| applied.value)
}

/// Non-atomic mode: each nested call takes its own permit, so the command
/// classes follow the same locking as top-level clients.
fn call_non_atomic(
    server: &Arc<Server>,
    msg: &mut Message,
    status: &Arc<TxnStatus>,
) -> MeridianResult<Value> {
    let cmd = msg.command();
    let deadline = status.deadline();
    if is_write_command(&cmd) {
        if msg.deadline.is_some() {
            return Err(CommandError::TimeoutNotSupported(cmd).into());
        }
        let permit = server.scheduler.write().map_err(MeridianError::Txn)?;
        let result = (|| {
            if server.repl.is_follower() {
                return Err(CommandError::NotLeader.into());
            }
            if server.repl.read_only() {
                return Err(CommandError::ReadOnly.into());
            }
            let status_view = TxnStatus::unbounded();
            let applied = router::execute_in_script(server, msg, &status_view)?;
            if applied.dirty {
                server.append_aof(&msg.args);
            }
            Ok(applied.value)
        })();
        permit.done();
        result
    } else if is_scan_command(&cmd) {
        let (permit, scan_status) = server.scheduler.scan().map_err(MeridianError::Txn)?;
        let scan_status = tighten(tighten(scan_status, deadline), msg.deadline);
        let result = (|| {
            gate_script_read(server)?;
            execute_nested(server, msg, &scan_status)
        })();
        permit.done();
        result.map(|applied| applied.value)
    } else if is_read_command(&cmd) {
        let permit = server.scheduler.read().map_err(MeridianError::Txn)?;
        let result = (|| {
            gate_script_read(server)?;
            let status_view = tighten(tighten(TxnStatus::unbounded(), deadline), msg.deadline);
            execute_nested(server, msg, &status_view)
        })();
        permit.done();
        result.map(|applied| applied.value)
    } else {
        Err(ScriptError::CmdNotSupported.into())
    }
}

fn tighten(status: TxnStatus, deadline: Option<SystemTime>) -> TxnStatus {
    match deadline {
        Some(deadline) => status.with_deadline(deadline),
        None => status,
    }
}

fn execute_nested(
    server: &Arc<Server>,
    msg: &mut Message,
    status: &TxnStatus,
) -> MeridianResult<Applied> {
    let result = router::execute_in_script(server, msg, status);
    if status.error() == Some(TxnError::DeadlineExceeded) {
        return Err(CommandError::Timeout.into());
    }
    match result {
        Err(MeridianError::Txn(TxnError::DeadlineExceeded)) => Err(CommandError::Timeout.into()),
        other => other,
    }
}

fn gate_script_read(server: &Arc<Server>) -> MeridianResult<()> {
    if server.repl.is_follower() && !server.caught_up_once() {
        return Err(CommandError::CatchingUp.into());
    }
    Ok(())
}

/// `tile38.get`: direct item lookup. In non-atomic mode it takes a read
/// permit of its own; the atomic modes ride on the outer permit.
pub fn script_get(
    server: &Arc<Server>,
    eval_cmd: &str,
    key: &str,
    id: &str,
) -> MeridianResult<Option<(String, meridian_store::GeoObject, Vec<f64>, Vec<String>)>> {
    let permit = match eval_cmd {
        "evalna" | "evalnasha" => {
            Some(server.scheduler.read().map_err(MeridianError::Txn)?)
        }
        _ => None,
    };
    let result = (|| {
        gate_script_read(server)?;
        if server.has_expired(key, id) {
            return Ok(None);
        }
        Ok(server
            .with_col(key, |col| {
                col.get(id).map(|item| {
                    (
                        id.to_string(),
                        item.obj.clone(),
                        item.fields.clone(),
                        col.field_map().to_vec(),
                    )
                })
            })
            .flatten())
    })();
    if let Some(permit) = permit {
        permit.done();
    }
    result
}

/// Convert a nested-call result into the Lua view: successes via the RESP
/// conversion, failures raised as `ERR …` script errors.
pub fn call_result_to_lua<'lua>(
    lua: &'lua Lua,
    result: MeridianResult<Value>,
) -> mlua::Result<LuaValue<'lua>> {
    match result {
        Ok(value) => resp_to_lua(lua, &value),
        Err(err) => Err(mlua::Error::RuntimeError(error_reply_text(&err))),
    }
}

pub fn error_reply_text(err: &MeridianError) -> String {
    let msg = err.client_message();
    if msg.starts_with("ERR ") {
        msg
    } else {
        format!("ERR {}", msg)
    }
}
