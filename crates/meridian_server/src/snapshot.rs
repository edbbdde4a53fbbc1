//! Snapshot glue: the `{id, offset}` meta record and the save/load
//! commands. A snapshot is one JSON file per collection under
//! `snapshots/<hexid>/`; the meta file remembers which snapshot corresponds
//! to which AOF offset so a follower can sync from the snapshot and stream
//! the rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use meridian_protocol::Value;
use meridian_store::Collection;

use meridian_common::error::{CommandError, MeridianError, MeridianResult, StoreError};

use crate::message::Message;
use crate::router::Applied;
use crate::server::Server;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    offset: u64,
}

/// Record of the last snapshot for this dataset. The `loaded` bit is not
/// persisted; it distinguishes a snapshot we actually loaded from one we
/// merely know about.
pub struct SnapshotMeta {
    path: PathBuf,
    record: MetaRecord,
    pub loaded: bool,
}

impl SnapshotMeta {
    pub fn load(dir: &Path) -> MeridianResult<SnapshotMeta> {
        if dir.as_os_str().is_empty() {
            return Ok(SnapshotMeta {
                path: PathBuf::new(),
                record: MetaRecord::default(),
                loaded: false,
            });
        }
        let path = dir.join("snapshot_meta");
        let record = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| MeridianError::Store(StoreError::Snapshot(e.to_string())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MetaRecord::default(),
            Err(e) => return Err(MeridianError::Io(e)),
        };
        Ok(SnapshotMeta {
            path,
            record,
            loaded: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn offset(&self) -> u64 {
        self.record.offset
    }

    pub fn set(&mut self, id: &str, offset: u64) {
        self.record.id = id.to_string();
        self.record.offset = offset;
    }

    pub fn save(&self) -> MeridianResult<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let data = serde_json::to_string_pretty(&self.record)
            .map_err(|e| MeridianError::Store(StoreError::Snapshot(e.to_string())))?;
        std::fs::write(&self.path, data).map_err(MeridianError::Io)
    }
}

pub(crate) fn snapshot_dir(server: &Server, id: &str) -> PathBuf {
    server.dir.join("snapshots").join(id)
}

fn random_snapshot_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// SAVESNAPSHOT: write every collection, journal `SAVESNAPSHOT <id>`, and
/// advance the meta record to the current AOF offset. Runs under the write
/// permit, so the data cannot move underneath it.
pub fn cmd_save_snapshot(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    if msg.args.len() != 1 {
        return Err(CommandError::InvalidArgCount.into());
    }
    if server.dir.as_os_str().is_empty() {
        return Err(StoreError::Snapshot("no data directory".into()).into());
    }
    let id = random_snapshot_id();
    let dir = snapshot_dir(server, &id);
    std::fs::create_dir_all(&dir).map_err(MeridianError::Io)?;

    tracing::info!("saving snapshot {}", id);
    {
        let cols = server.cols.read_recursive();
        for (key, col) in cols.iter() {
            let path = dir.join(format!("{}.json", key));
            let data = serde_json::to_vec(&col.to_snapshot())
                .map_err(|e| MeridianError::Store(StoreError::Snapshot(e.to_string())))?;
            std::fs::write(&path, data).map_err(MeridianError::Io)?;
        }
    }
    tracing::info!("saved snapshot {}", id);

    server.append_aof(&["savesnapshot".to_string(), id.clone()]);
    {
        let mut meta = server.snapshot_meta.lock();
        meta.set(&id, server.aof_size());
        meta.loaded = true;
        meta.save()?;
    }
    cleanup_stale(server);
    Ok(Applied::clean(Value::SimpleString(id)))
}

/// LOADSNAPSHOT <id>: replace the in-memory collections with the snapshot's
/// contents. Journaled verbatim so followers learn about it.
pub fn cmd_load_snapshot(server: &Arc<Server>, msg: &Message) -> MeridianResult<Applied> {
    if msg.args.len() != 2 {
        return Err(CommandError::InvalidArgCount.into());
    }
    let id = msg.args[1].clone();
    load_snapshot(server, &id)?;
    Ok(Applied::dirty(Value::ok()))
}

pub(crate) fn load_snapshot(server: &Arc<Server>, id: &str) -> MeridianResult<()> {
    let dir = snapshot_dir(server, id);
    let entries = std::fs::read_dir(&dir)
        .map_err(|_| MeridianError::Store(StoreError::Snapshot(format!("snapshot {} not found", id))))?;

    tracing::info!("loading snapshot {}", id);
    let mut cols = std::collections::BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(MeridianError::Io)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let text = std::fs::read_to_string(&path).map_err(MeridianError::Io)?;
        let snapshot = serde_json::from_str(&text)
            .map_err(|e| MeridianError::Store(StoreError::Snapshot(e.to_string())))?;
        let col = Collection::from_snapshot(snapshot)?;
        cols.insert(key, col);
    }
    *server.cols.write() = cols;
    {
        let mut meta = server.snapshot_meta.lock();
        let offset = meta.offset();
        meta.set(id, offset);
        meta.loaded = true;
    }
    tracing::info!("loaded snapshot {}", id);
    Ok(())
}

/// SNAPSHOT LATEST META: the follower sync handshake.
pub fn cmd_snapshot(server: &Arc<Server>, msg: &Message) -> MeridianResult<Value> {
    let args = &msg.args;
    if args.len() == 3
        && args[1].eq_ignore_ascii_case("latest")
        && args[2].eq_ignore_ascii_case("meta")
    {
        let meta = server.snapshot_meta.lock();
        return Ok(Value::Array(vec![
            Value::SimpleString(meta.id().to_string()),
            Value::Integer(meta.offset() as i64),
        ]));
    }
    Err(CommandError::InvalidArgCount.into())
}

/// Delete stale snapshot directories, keeping the current one and the
/// newest of the rest.
fn cleanup_stale(server: &Arc<Server>) {
    let snapshots = server.dir.join("snapshots");
    let current = server.snapshot_meta.lock().id().to_string();
    let Ok(entries) = std::fs::read_dir(&snapshots) else {
        return;
    };
    let mut stale: Vec<(std::time::SystemTime, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter(|e| e.file_name().to_string_lossy() != current.as_str())
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.path()))
        })
        .collect();
    if stale.len() < 2 {
        return;
    }
    stale.sort();
    for (_, path) in &stale[..stale.len() - 1] {
        tracing::info!("deleting stale snapshot {:?}", path);
        if let Err(e) = std::fs::remove_dir_all(path) {
            tracing::warn!("failed to remove {:?}: {}", path, e);
        }
    }
}
