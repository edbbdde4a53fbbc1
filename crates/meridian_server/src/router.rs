//! Command classification and routing.
//!
//! Every command falls into one of {read, write, scan, script, admin}.
//! Reads, writes, and scans acquire the matching scheduler permit; scripts
//! manage their own permits per evaluation mode; admin commands bypass the
//! scheduler entirely. Policy gates (read-only, not-leader, catching-up)
//! run before a permit is taken so rejected commands never touch the
//! scheduler.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use meridian_protocol::Value;
use meridian_txn::TxnStatus;

use meridian_common::error::{CommandError, MeridianError, MeridianResult, TxnError};

use crate::commands;
use crate::message::Message;
use crate::scan;
use crate::scripts;
use crate::server::Server;
use crate::snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Read,
    Write,
    Scan,
    Script,
    Admin,
}

pub fn classify(cmd: &str) -> Option<CommandClass> {
    let class = match cmd {
        "set" | "del" | "drop" | "fset" | "flushdb" | "expire" | "persist" | "jset" | "jdel"
        | "pdel" | "rename" | "renamenx" | "savesnapshot" | "loadsnapshot" => CommandClass::Write,
        "scan" | "nearby" | "within" | "intersects" | "search" => CommandClass::Scan,
        "get" | "keys" | "jget" | "type" | "bounds" | "ttl" | "server" | "info" | "stats"
        | "test" | "script" | "snapshot" => CommandClass::Read,
        "eval" | "evalsha" | "evalro" | "evalrosha" | "evalna" | "evalnasha" => {
            CommandClass::Script
        }
        "ping" | "echo" | "output" | "follow" | "readonly" | "replconf" | "gc" => {
            CommandClass::Admin
        }
        _ => return None,
    };
    Some(class)
}

/// Result of one data-command execution: the reply plus whether the store
/// changed (and the command therefore belongs in the AOF).
pub struct Applied {
    pub value: Value,
    pub dirty: bool,
}

impl Applied {
    pub fn clean(value: Value) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    pub fn dirty(value: Value) -> Self {
        Self { value, dirty: true }
    }
}

/// Entry point for a parsed client command. Always produces a reply value;
/// errors are already rendered into `Value::Error`.
pub fn handle_command(server: &Arc<Server>, msg: &mut Message) -> Value {
    server
        .stats_total_commands
        .fetch_add(1, Ordering::Relaxed);
    match route(server, msg) {
        Ok(value) => value,
        Err(err) => error_value(&err),
    }
}

pub fn error_value(err: &MeridianError) -> Value {
    let msg = err.client_message();
    if msg.starts_with("ERR ") {
        Value::Error(msg)
    } else {
        Value::Error(format!("ERR {}", msg))
    }
}

fn route(server: &Arc<Server>, msg: &mut Message) -> MeridianResult<Value> {
    msg.rewrite_timeout_prefix()?;
    let cmd = msg.command();
    let class = classify(&cmd).ok_or(CommandError::Unknown(cmd.clone()))?;

    match class {
        CommandClass::Admin => admin_command(server, msg),
        CommandClass::Script => scripts::script_command(server, msg),
        CommandClass::Read => {
            gate_catching_up(server)?;
            let permit = server.scheduler.read().map_err(MeridianError::Txn)?;
            let status = base_status(msg);
            let result = execute_with_deadline(server, msg, &status);
            permit.done();
            result.map(|applied| applied.value)
        }
        CommandClass::Write => {
            gate_write(server)?;
            if msg.deadline.is_some() {
                return Err(CommandError::TimeoutNotSupported(cmd).into());
            }
            let permit = server.scheduler.write().map_err(MeridianError::Txn)?;
            let status = TxnStatus::unbounded();
            let result = execute_in_script(server, msg, &status);
            if let Ok(applied) = &result {
                if applied.dirty {
                    server.append_aof(&msg.args);
                }
            }
            permit.done();
            result.map(|applied| applied.value)
        }
        CommandClass::Scan => {
            gate_catching_up(server)?;
            let (permit, status) = server.scheduler.scan().map_err(MeridianError::Txn)?;
            let status = match msg.deadline {
                Some(deadline) => status.with_deadline(deadline),
                None => status,
            };
            let result = execute_with_deadline(server, msg, &status);
            permit.done();
            result.map(|applied| applied.value)
        }
    }
}

/// Execute a read or scan, mapping a sticky deadline on the status to the
/// client-visible timeout error.
fn execute_with_deadline(
    server: &Arc<Server>,
    msg: &mut Message,
    status: &TxnStatus,
) -> MeridianResult<Applied> {
    let result = execute_in_script(server, msg, status);
    if status.error() == Some(TxnError::DeadlineExceeded) {
        return Err(CommandError::Timeout.into());
    }
    match result {
        Err(MeridianError::Txn(TxnError::DeadlineExceeded)) => Err(CommandError::Timeout.into()),
        other => other,
    }
}

/// The data-command table: commands permitted both at the top level and
/// from inside a script. Callers hold (or deliberately skip) permits;
/// scan-class commands are retried transparently when the scheduler
/// interrupts them.
pub fn execute_in_script(
    server: &Arc<Server>,
    msg: &mut Message,
    status: &TxnStatus,
) -> MeridianResult<Applied> {
    let cmd = msg.command();
    match cmd.as_str() {
        "set" => commands::cmd_set(server, msg),
        "fset" => commands::cmd_fset(server, msg),
        "del" => commands::cmd_del(server, msg),
        "pdel" => commands::cmd_pdel(server, msg),
        "drop" => commands::cmd_drop(server, msg),
        "flushdb" => commands::cmd_flushdb(server, msg),
        "expire" => commands::cmd_expire(server, msg),
        "persist" => commands::cmd_persist(server, msg),
        "rename" => commands::cmd_rename(server, msg, false),
        "renamenx" => commands::cmd_rename(server, msg, true),
        "jset" => commands::cmd_jset(server, msg),
        "jdel" => commands::cmd_jdel(server, msg),
        "savesnapshot" => snapshot::cmd_save_snapshot(server, msg),
        "loadsnapshot" => snapshot::cmd_load_snapshot(server, msg),

        "get" => commands::cmd_get(server, msg).map(Applied::clean),
        "jget" => commands::cmd_jget(server, msg).map(Applied::clean),
        "keys" => commands::cmd_keys(server, msg).map(Applied::clean),
        "type" => commands::cmd_type(server, msg).map(Applied::clean),
        "bounds" => commands::cmd_bounds(server, msg).map(Applied::clean),
        "ttl" => commands::cmd_ttl(server, msg).map(Applied::clean),
        "stats" => commands::cmd_stats(server, msg).map(Applied::clean),
        "server" => commands::cmd_server(server, msg).map(Applied::clean),
        "info" => commands::cmd_info(server, msg).map(Applied::clean),
        "test" => commands::cmd_test(server, msg).map(Applied::clean),
        "snapshot" => snapshot::cmd_snapshot(server, msg).map(Applied::clean),
        "script" => scripts::cmd_script_mgmt(server, msg).map(Applied::clean),

        "scan" | "nearby" | "within" | "intersects" | "search" => {
            run_scan_with_retry(server, msg, status).map(Applied::clean)
        }

        other => Err(CommandError::Unknown(other.to_string()).into()),
    }
}

/// Run a scan-class command, transparently retrying when the scheduler
/// interrupts it. The retry reports the elapsed runtime and blocks until a
/// fresh permit is granted, so to the caller the scan appears continuous.
fn run_scan_with_retry(
    server: &Arc<Server>,
    msg: &Message,
    status: &TxnStatus,
) -> MeridianResult<Value> {
    loop {
        match scan::cmd_scan_family(server, msg, status) {
            Err(MeridianError::Txn(TxnError::Interrupted)) => {
                status.retry();
                continue;
            }
            other => return other,
        }
    }
}

// ── Policy gates ─────────────────────────────────────────────────────────

fn gate_write(server: &Arc<Server>) -> MeridianResult<()> {
    if server.repl.is_follower() {
        return Err(CommandError::NotLeader.into());
    }
    if server.repl.read_only() {
        return Err(CommandError::ReadOnly.into());
    }
    Ok(())
}

fn gate_catching_up(server: &Arc<Server>) -> MeridianResult<()> {
    if server.repl.is_follower() && !server.caught_up_once() {
        return Err(CommandError::CatchingUp.into());
    }
    Ok(())
}

pub(crate) fn base_status(msg: &Message) -> TxnStatus {
    match msg.deadline {
        Some(deadline) => TxnStatus::unbounded().with_deadline(deadline),
        None => TxnStatus::unbounded(),
    }
}

// ── Admin commands ───────────────────────────────────────────────────────

fn admin_command(server: &Arc<Server>, msg: &mut Message) -> MeridianResult<Value> {
    match msg.command().as_str() {
        "ping" => Ok(Value::SimpleString("PONG".into())),
        "echo" => {
            if msg.args.len() != 2 {
                return Err(CommandError::InvalidArgCount.into());
            }
            Ok(Value::bulk(msg.args[1].clone()))
        }
        "output" => {
            // Handled at the connection layer; replying OK keeps scripted
            // clients happy when they send it blindly.
            Ok(Value::ok())
        }
        "readonly" => {
            if msg.args.len() != 2 {
                return Err(CommandError::InvalidArgCount.into());
            }
            match msg.args[1].to_lowercase().as_str() {
                "yes" => server.repl.set_read_only(true),
                "no" => server.repl.set_read_only(false),
                other => return Err(CommandError::InvalidArg(other.to_string()).into()),
            }
            server
                .repl
                .save()
                .map_err(meridian_common::error::MeridianError::Io)?;
            Ok(Value::ok())
        }
        "follow" => crate::follow::cmd_follow(server, msg),
        "replconf" => crate::follow::cmd_replconf(server, msg),
        "gc" => Ok(Value::ok()),
        other => Err(CommandError::Unknown(other.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_tables() {
        for cmd in ["set", "del", "fset", "pdel", "savesnapshot", "loadsnapshot"] {
            assert_eq!(classify(cmd), Some(CommandClass::Write), "{}", cmd);
        }
        for cmd in ["scan", "nearby", "within", "intersects", "search"] {
            assert_eq!(classify(cmd), Some(CommandClass::Scan), "{}", cmd);
        }
        for cmd in ["get", "keys", "ttl", "stats", "server", "script"] {
            assert_eq!(classify(cmd), Some(CommandClass::Read), "{}", cmd);
        }
        for cmd in ["eval", "evalrosha", "evalna"] {
            assert_eq!(classify(cmd), Some(CommandClass::Script), "{}", cmd);
        }
        assert_eq!(classify("bogus"), None);
    }

    #[test]
    fn test_unknown_command_error_string() {
        let server = Server::ephemeral();
        let mut msg = Message::from_args(&["NOSUCH", "x"]);
        let reply = handle_command(&server, &mut msg);
        assert_eq!(reply.flat(), "ERR unknown command 'nosuch'");
    }

    #[test]
    fn test_read_only_gate() {
        let server = Server::ephemeral();
        server.repl.set_read_only(true);
        let mut msg = Message::from_args(&["SET", "fleet", "truck1", "POINT", "33", "-115"]);
        let reply = handle_command(&server, &mut msg);
        assert_eq!(reply.flat(), "ERR read only");

        server.repl.set_read_only(false);
        let mut msg = Message::from_args(&["SET", "fleet", "truck1", "POINT", "33", "-115"]);
        let reply = handle_command(&server, &mut msg);
        assert_eq!(reply.flat(), "OK");
    }

    #[test]
    fn test_follower_rejects_writes_and_stale_reads() {
        let server = Server::ephemeral();
        server.repl.set_follow("leader", 9851);

        let mut msg = Message::from_args(&["SET", "fleet", "truck1", "POINT", "33", "-115"]);
        assert_eq!(handle_command(&server, &mut msg).flat(), "ERR not the leader");

        let mut msg = Message::from_args(&["GET", "fleet", "truck1"]);
        assert_eq!(
            handle_command(&server, &mut msg).flat(),
            "ERR catching up to leader"
        );

        // Once caught up at least once, reads work again.
        server.fcuponce.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut msg = Message::from_args(&["GET", "fleet", "truck1"]);
        assert_eq!(handle_command(&server, &mut msg).flat(), "nil");
    }

    #[test]
    fn test_write_with_deadline_rejected() {
        let server = Server::ephemeral();
        let mut msg = Message::from_args(&[
            "TIMEOUT", "5", "SET", "fleet", "truck1", "POINT", "33", "-115",
        ]);
        let reply = handle_command(&server, &mut msg);
        assert_eq!(reply.flat(), "ERR timeout not supported for 'set'");
    }
}
