//! Leader/follower replication: the FOLLOW command, leader validation, and
//! the background loop that syncs to the leader's latest snapshot and then
//! replays its AOF stream.
//!
//! Replayed commands do not go through per-command classification: each one
//! is applied under the coarse writer lock (a scheduler write permit) and
//! re-journaled verbatim, so a follower's AOF is byte-compatible with the
//! leader's suffix it consumed.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use meridian_protocol::{codec, Value};

use meridian_common::error::{
    CommandError, MeridianError, MeridianResult, ProtocolError,
};

use crate::message::Message;
use crate::router::{self, Applied};
use crate::server::Server;
use crate::snapshot;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const READ_POLL: Duration = Duration::from_secs(1);

// ── RESP client connection ───────────────────────────────────────────────

pub struct RespConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RespConn {
    pub fn dial(host: &str, port: u16) -> MeridianResult<RespConn> {
        let addr = format!("{}:{}", host, port);
        let mut last_err = None;
        for resolved in std::net::ToSocketAddrs::to_socket_addrs(&addr)
            .map_err(MeridianError::Io)?
        {
            match TcpStream::connect_timeout(&resolved, DIAL_TIMEOUT) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(READ_POLL))
                        .map_err(MeridianError::Io)?;
                    return Ok(RespConn {
                        stream,
                        buf: Vec::new(),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(MeridianError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, addr)
        })))
    }

    pub fn do_cmd(&mut self, args: &[&str]) -> MeridianResult<Value> {
        let mut frame = BytesMut::new();
        let values: Vec<Value> = args.iter().map(|a| Value::bulk(*a)).collect();
        codec::encode_value(&Value::Array(values), &mut frame);
        self.stream.write_all(&frame).map_err(MeridianError::Io)?;
        loop {
            match self.read_value()? {
                Some(value) => return Ok(value),
                None => continue,
            }
        }
    }

    /// Read one value; `None` when the poll interval elapsed with no
    /// complete frame (so callers can check for shutdown).
    pub fn read_value(&mut self) -> MeridianResult<Option<Value>> {
        loop {
            if !self.buf.is_empty() {
                match codec::decode_value(&self.buf) {
                    Ok((value, consumed)) => {
                        self.buf.drain(0..consumed);
                        return Ok(Some(value));
                    }
                    Err(ProtocolError::Truncated { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            let mut chunk = [0u8; 16 * 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed.into()),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(MeridianError::Io(e)),
            }
        }
    }
}

fn server_map(conn: &mut RespConn) -> MeridianResult<std::collections::HashMap<String, String>> {
    let value = conn.do_cmd(&["server"])?;
    if let Some(err) = value.as_error() {
        return Err(MeridianError::Internal(err.to_string()));
    }
    let Value::Array(items) = value else {
        return Err(MeridianError::Internal("bad server reply".into()));
    };
    let mut map = std::collections::HashMap::new();
    for pair in items.chunks(2) {
        if let [k, v] = pair {
            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                map.insert(k.to_string(), v.to_string());
            }
        }
    }
    Ok(map)
}

// ── FOLLOW / REPLCONF commands ───────────────────────────────────────────

pub fn cmd_follow(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() != 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let host = args[1].to_lowercase();
    let port_arg = args[2].to_lowercase();

    if host == "no" && port_arg == "one" {
        let update = server.repl.is_follower();
        server.repl.set_follow("", 0);
        server.repl.save().map_err(MeridianError::Io)?;
        if update {
            server.followc.fetch_add(1, Ordering::SeqCst);
            server.fcup.store(false, Ordering::SeqCst);
            tracing::info!("following no one");
        }
        return Ok(Value::ok());
    }

    let port: u16 = port_arg
        .parse()
        .map_err(|_| CommandError::InvalidArg(args[2].clone()))?;
    let update = server.repl.follow_host() != host || server.repl.follow_port() != port;
    if update {
        validate_leader(server, &host, port)?;
        server.repl.set_follow(&host, port);
        server.repl.save().map_err(MeridianError::Io)?;
        let followc = server.followc.fetch_add(1, Ordering::SeqCst) + 1;
        server.fcup.store(false, Ordering::SeqCst);
        server.fcuponce.store(false, Ordering::SeqCst);
        tracing::info!("following new host '{}' '{}'", host, port);
        spawn_follow_loop(server, host, port, followc);
    }
    Ok(Value::ok())
}

pub fn cmd_replconf(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() != 3 {
        return Err(CommandError::InvalidArgCount.into());
    }
    if args[1].eq_ignore_ascii_case("listening-port") {
        let port: u16 = args[2]
            .parse()
            .map_err(|_| CommandError::InvalidArg(args[2].clone()))?;
        tracing::debug!("follower registered listening port {}", port);
        let _ = server;
        return Ok(Value::ok());
    }
    Err(CommandError::InvalidArg(args[1].clone()).into())
}

/// Check that `host:port` is a leader we may follow.
fn validate_leader(server: &Arc<Server>, host: &str, port: u16) -> MeridianResult<()> {
    let mut conn = RespConn::dial(host, port)
        .map_err(|e| MeridianError::Internal(format!("cannot follow: {}", e)))?;
    let map = server_map(&mut conn)
        .map_err(|e| MeridianError::Internal(format!("cannot follow: {}", e)))?;
    let id = map.get("id").cloned().unwrap_or_default();
    if id.is_empty() {
        return Err(MeridianError::Internal("cannot follow: invalid id".into()));
    }
    if id == server.server_id() {
        return Err(MeridianError::Internal("cannot follow self".into()));
    }
    if !map.get("following").cloned().unwrap_or_default().is_empty() {
        return Err(MeridianError::Internal(
            "cannot follow a follower".into(),
        ));
    }
    Ok(())
}

// ── The follow loop ──────────────────────────────────────────────────────

pub fn spawn_follow_loop(server: &Arc<Server>, host: String, port: u16, followc: u64) {
    let server = server.clone();
    std::thread::Builder::new()
        .name("meridian-follow".into())
        .spawn(move || follow_loop(server, host, port, followc))
        .expect("spawn follow thread");
}

fn still_following(server: &Arc<Server>, followc: u64) -> bool {
    !server.shutdown.is_stopped() && server.followc.load(Ordering::SeqCst) == followc
}

fn follow_loop(server: Arc<Server>, host: String, port: u16, followc: u64) {
    // Each turn is one attempt to start and maintain replication; when the
    // stream breaks we start over.
    loop {
        if !still_following(&server, followc) {
            return;
        }
        if let Err(e) = follow_once(&server, &host, port, followc) {
            if still_following(&server, followc) {
                tracing::error!("follow: {}", e);
            }
        }
        if server.shutdown.sleep(Duration::from_secs(1)) {
            return;
        }
    }
}

fn follow_once(
    server: &Arc<Server>,
    host: &str,
    port: u16,
    followc: u64,
) -> MeridianResult<()> {
    server.fcup.store(false, Ordering::SeqCst);
    validate_leader(server, host, port)?;

    let mut conn = RespConn::dial(host, port)?;
    let (l_top, f_top) = sync_to_leader_snapshot(server, &mut conn)?;

    let map = server_map(&mut conn)?;
    let l_size: u64 = map
        .get("aof_size")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MeridianError::Internal("leader reported no aof_size".into()))?;

    let my_port = server
        .config
        .server
        .listen_addr
        .rsplit(':')
        .next()
        .unwrap_or("0")
        .to_string();
    let reply = conn.do_cmd(&["replconf", "listening-port", &my_port])?;
    if reply.as_str() != Some("OK") {
        return Err(MeridianError::Internal(
            "invalid response to replconf request".into(),
        ));
    }

    let reply = conn.do_cmd(&["aof", &l_top.to_string()])?;
    if reply.as_str() != Some("OK") {
        return Err(MeridianError::Internal(
            "invalid response to aof live request".into(),
        ));
    }

    let mut caught_up = l_top >= l_size;
    if caught_up {
        server.fcup.store(true, Ordering::SeqCst);
        server.fcuponce.store(true, Ordering::SeqCst);
        tracing::info!("caught up");
    }

    loop {
        if !still_following(server, followc) {
            return Ok(());
        }
        let Some(value) = conn.read_value()? else {
            continue;
        };
        let Value::Array(items) = value else {
            return Err(MeridianError::Internal("invalid multibulk".into()));
        };
        let args: Vec<String> = items
            .iter()
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .collect();
        follow_apply(server, args)?;
        if !caught_up && server.aof_size() - f_top >= l_size - l_top {
            caught_up = true;
            server.fcup.store(true, Ordering::SeqCst);
            server.fcuponce.store(true, Ordering::SeqCst);
            tracing::info!("caught up");
        }
    }
}

/// Sync to the leader's latest snapshot when one exists. Returns
/// `(leader_offset, follower_offset)`: the AOF positions at which the two
/// logs line up.
fn sync_to_leader_snapshot(
    server: &Arc<Server>,
    conn: &mut RespConn,
) -> MeridianResult<(u64, u64)> {
    let reply = conn.do_cmd(&["snapshot", "latest", "meta"])?;
    let Value::Array(items) = reply else {
        return Err(MeridianError::Internal("bad snapshot meta reply".into()));
    };
    let leader_id = items
        .first()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let leader_offset = items
        .get(1)
        .and_then(|v| v.as_integer())
        .unwrap_or(0) as u64;

    // No snapshot on the leader: replay its log from the beginning, with a
    // clean local slate.
    if leader_id.is_empty() {
        reset_local(server)?;
        return Ok((0, 0));
    }

    // Already synced to this snapshot: reuse the recorded offsets.
    {
        let meta = server.snapshot_meta.lock();
        if meta.id() == leader_id && meta.loaded {
            return Ok((leader_offset, meta.offset()));
        }
    }

    // Load the snapshot if it is available locally; otherwise fall back to
    // a full replay. Snapshot distribution is the deployment's concern.
    let dir = snapshot::snapshot_dir(server, &leader_id);
    if !dir.is_dir() {
        tracing::warn!(
            "leader snapshot {} not present locally; falling back to full replay",
            leader_id
        );
        reset_local(server)?;
        return Ok((0, 0));
    }

    let permit = server.scheduler.write().map_err(MeridianError::Txn)?;
    let result = (|| {
        snapshot::load_snapshot(server, &leader_id)?;
        if let Some(aof) = &server.aof {
            aof.reset()?;
        }
        server.append_aof(&["loadsnapshot".to_string(), leader_id.clone()]);
        let f_top = server.aof_size();
        let mut meta = server.snapshot_meta.lock();
        meta.set(&leader_id, f_top);
        meta.loaded = true;
        meta.save()?;
        Ok((leader_offset, f_top))
    })();
    permit.done();
    result
}

fn reset_local(server: &Arc<Server>) -> MeridianResult<()> {
    let permit = server.scheduler.write().map_err(MeridianError::Txn)?;
    server.cols.write().clear();
    if let Some(aof) = &server.aof {
        aof.reset()?;
    }
    {
        let mut meta = server.snapshot_meta.lock();
        meta.set("", 0);
        meta.loaded = false;
    }
    permit.done();
    Ok(())
}

/// Apply one streamed command under the coarse writer lock and re-journal
/// it verbatim.
fn follow_apply(server: &Arc<Server>, args: Vec<String>) -> MeridianResult<()> {
    let mut msg = Message::new(args);
    let cmd = msg.command();
    match cmd.as_str() {
        "loadsnapshot" => {
            // The leader rewrote history underneath us; resync from scratch.
            return Err(MeridianError::Internal("leader loaded snapshot".into()));
        }
        "savesnapshot" => {
            let id = msg
                .args
                .get(1)
                .cloned()
                .ok_or(CommandError::InvalidArgCount)?;
            server.append_aof(&msg.args);
            let mut meta = server.snapshot_meta.lock();
            meta.set(&id, server.aof_size());
            meta.loaded = false;
            meta.save()?;
            Ok(())
        }
        _ => {
            let permit = server.scheduler.write().map_err(MeridianError::Txn)?;
            let status = meridian_txn::TxnStatus::unbounded();
            let result: MeridianResult<Applied> =
                router::execute_in_script(server, &mut msg, &status);
            if let Err(e) = &result {
                tracing::warn!("follow: replay of '{}' failed: {}", cmd, e);
            }
            server.append_aof(&msg.args);
            permit.done();
            Ok(())
        }
    }
}
