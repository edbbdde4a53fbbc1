//! TCP front end: one thread per connection, speaking RESP frames or
//! inline (telnet-style) command lines. The scheduler hands out blocking
//! permits, so the request path stays synchronous end to end.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use meridian_common::error::ProtocolError;
use meridian_protocol::{codec, Value};

use crate::message::{Message, OutputMode};
use crate::observability;
use crate::router;
use crate::server::Server;

pub fn serve(server: Arc<Server>, listener: TcpListener) -> std::io::Result<()> {
    tracing::info!("listening on {}", listener.local_addr()?);
    for stream in listener.incoming() {
        if server.shutdown.is_stopped() {
            return Ok(());
        }
        match stream {
            Ok(stream) => {
                let server = server.clone();
                std::thread::Builder::new()
                    .name("meridian-conn".into())
                    .spawn(move || {
                        if let Err(e) = handle_conn(&server, stream) {
                            tracing::debug!("connection ended: {}", e);
                        }
                    })?;
            }
            Err(e) => tracing::warn!("accept failed: {}", e),
        }
    }
    Ok(())
}

fn handle_conn(server: &Arc<Server>, mut stream: TcpStream) -> std::io::Result<()> {
    server.stats_total_conns.fetch_add(1, Ordering::Relaxed);
    observability::record_connection_opened();

    let mut output = OutputMode::Resp;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let Some(args) = next_command(&mut buf, &mut stream)? else {
            return Ok(());
        };
        if args.is_empty() {
            continue;
        }
        let cmd = args[0].to_lowercase();
        match cmd.as_str() {
            "quit" => {
                write_value(&mut stream, &Value::ok())?;
                return Ok(());
            }
            "output" => {
                match args.get(1).map(|a| a.to_lowercase()).as_deref() {
                    Some("json") => output = OutputMode::Json,
                    Some("resp") => output = OutputMode::Resp,
                    _ => {
                        write_value(
                            &mut stream,
                            &Value::error("ERR invalid argument".to_string()),
                        )?;
                        continue;
                    }
                }
                write_value(&mut stream, &Value::ok())?;
            }
            "aof" => {
                let offset = args.get(1).and_then(|a| a.parse::<u64>().ok());
                match offset {
                    Some(offset) => return stream_aof(server, stream, offset),
                    None => write_value(
                        &mut stream,
                        &Value::error("ERR invalid argument".to_string()),
                    )?,
                }
            }
            _ => {
                let start = Instant::now();
                let mut msg = Message::new(args);
                msg.output = output;
                let reply = router::handle_command(server, &mut msg);
                observability::record_command(&cmd, start.elapsed());
                let rendered = render_reply(&cmd, output, reply, start);
                write_value(&mut stream, &rendered)?;
            }
        }
    }
}

fn is_eval_command(cmd: &str) -> bool {
    matches!(
        cmd,
        "eval" | "evalsha" | "evalro" | "evalrosha" | "evalna" | "evalnasha"
    )
}

/// Wrap a reply for the connection's output mode. Eval commands render
/// their own JSON envelope (the Lua→JSON conversion is richer than the
/// RESP value model), so those pass through untouched.
fn render_reply(cmd: &str, output: OutputMode, reply: Value, start: Instant) -> Value {
    match output {
        OutputMode::Resp => reply,
        OutputMode::Json => {
            if is_eval_command(cmd) && !matches!(reply, Value::Error(_)) {
                return reply;
            }
            let envelope = match &reply {
                Value::Error(msg) => format!(
                    r#"{{"ok":false,"err":{},"elapsed":"{:?}"}}"#,
                    serde_json::Value::String(msg.clone()),
                    start.elapsed()
                ),
                ok => format!(
                    r#"{{"ok":true,"result":{},"elapsed":"{:?}"}}"#,
                    value_to_json(ok),
                    start.elapsed()
                ),
            };
            Value::bulk(envelope)
        }
    }
}

fn value_to_json(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Integer(n) => n.to_string(),
        Value::Float(f) => meridian_protocol::value::format_float(*f),
        Value::SimpleString(s) | Value::BulkString(s) | Value::Error(s) => {
            serde_json::Value::String(s.clone()).to_string()
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(value_to_json).collect();
            format!("[{}]", inner.join(","))
        }
    }
}

fn write_value(stream: &mut TcpStream, value: &Value) -> std::io::Result<()> {
    let mut frame = BytesMut::new();
    codec::encode_value(value, &mut frame);
    stream.write_all(&frame)
}

/// Pull the next complete command off the wire: a RESP array of bulk
/// strings, or an inline line for telnet-style clients. `None` on EOF.
fn next_command(
    buf: &mut Vec<u8>,
    stream: &mut TcpStream,
) -> std::io::Result<Option<Vec<String>>> {
    loop {
        if !buf.is_empty() {
            if matches!(buf[0], b'*' | b'$' | b'+' | b'-' | b':') {
                match codec::decode_value(buf) {
                    Ok((value, consumed)) => {
                        buf.drain(0..consumed);
                        let args = match value {
                            Value::Array(items) => items
                                .iter()
                                .map(|v| v.as_str().unwrap_or_default().to_string())
                                .collect(),
                            other => vec![other.flat()],
                        };
                        return Ok(Some(args));
                    }
                    Err(ProtocolError::Truncated { .. }) => {}
                    Err(e) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e.to_string(),
                        ))
                    }
                }
            } else if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(0..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                match codec::parse_inline(line) {
                    Ok(args) => return Ok(Some(args)),
                    Err(e) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e.to_string(),
                        ))
                    }
                }
            }
        }
        let mut chunk = [0u8; 16 * 1024];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Live-stream the AOF from `offset`: acknowledge, then push bytes as they
/// are appended. Used by followers.
fn stream_aof(server: &Arc<Server>, mut stream: TcpStream, offset: u64) -> std::io::Result<()> {
    let Some(aof) = &server.aof else {
        return write_value(&mut stream, &Value::error("ERR aof disabled".to_string()));
    };
    write_value(&mut stream, &Value::ok())?;
    tracing::info!("streaming aof from offset {}", offset);

    let mut pos = offset;
    loop {
        if server.shutdown.is_stopped() {
            return Ok(());
        }
        let chunk = aof
            .read_at(pos, 64 * 1024)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        if chunk.is_empty() {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }
        stream.write_all(&chunk)?;
        pos += chunk.len() as u64;
    }
}
