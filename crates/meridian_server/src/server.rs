//! The server object: collections, scheduler, scripting engine, durability
//! log, and replication state, shared by every connection thread.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use meridian_common::config::{MeridianConfig, ReplicationState};
use meridian_common::error::MeridianResult;
use meridian_common::shutdown::ShutdownSignal;
use meridian_store::Collection;
use meridian_txn::{Scheduler, SchedulerHandle};

use crate::aof::Aof;
use crate::message::Message;
use crate::scripts::{LuaPool, ScriptRegistry};
use crate::snapshot::SnapshotMeta;

pub struct Server {
    pub(crate) config: MeridianConfig,
    pub(crate) repl: ReplicationState,
    pub(crate) dir: PathBuf,

    pub(crate) cols: RwLock<BTreeMap<String, Collection>>,

    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) scheduler_handle: Mutex<Option<SchedulerHandle>>,

    pub(crate) aof: Option<Aof>,
    pub(crate) snapshot_meta: Mutex<SnapshotMeta>,

    pub(crate) scripts: ScriptRegistry,
    pub(crate) lua_pool: LuaPool,

    /// Follower catch-up flags: currently caught up, and caught up at least
    /// once since the follow started.
    pub(crate) fcup: AtomicBool,
    pub(crate) fcuponce: AtomicBool,
    /// Generation counter for the follow loop; bumping it retires the
    /// previous loop.
    pub(crate) followc: AtomicU64,

    pub(crate) started: Instant,
    pub(crate) stats_total_conns: AtomicU64,
    pub(crate) stats_total_commands: AtomicU64,
    pub(crate) stats_expired: AtomicU64,

    pub(crate) shutdown: ShutdownSignal,
}

impl Server {
    /// Open (or create) a server rooted at `dir`, replaying the AOF if one
    /// exists.
    pub fn open(config: MeridianConfig, dir: &Path) -> MeridianResult<Arc<Server>> {
        std::fs::create_dir_all(dir).map_err(meridian_common::error::MeridianError::Io)?;
        let repl = ReplicationState::load(dir, random_id)
            .map_err(meridian_common::error::MeridianError::Io)?;
        let aof = if config.aof.enabled {
            Some(Aof::open(
                &dir.join("appendonly.aof"),
                config.aof.flush_threshold_bytes,
            )?)
        } else {
            None
        };
        let server = Self::assemble(config, repl, dir.to_path_buf(), aof)?;
        server.replay_aof()?;
        Ok(server)
    }

    /// An ephemeral server for tests: no data directory, no AOF.
    pub fn ephemeral() -> Arc<Server> {
        let config = MeridianConfig::default();
        let repl = ReplicationState::ephemeral(&random_id());
        Self::assemble(config, repl, PathBuf::new(), None).expect("ephemeral server")
    }

    fn assemble(
        config: MeridianConfig,
        repl: ReplicationState,
        dir: PathBuf,
        aof: Option<Aof>,
    ) -> MeridianResult<Arc<Server>> {
        let (scheduler, scheduler_handle) = Scheduler::new(
            Duration::from_millis(config.scheduler.initial_write_delay_ms),
            Duration::from_millis(config.scheduler.max_read_delay_ms),
        );
        let snapshot_meta = SnapshotMeta::load(&dir)?;

        let server = Arc::new_cyclic(|weak| Server {
            config,
            repl,
            dir,
            cols: RwLock::new(BTreeMap::new()),
            scheduler,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            aof,
            snapshot_meta: Mutex::new(snapshot_meta),
            scripts: ScriptRegistry::new(),
            lua_pool: LuaPool::new(weak.clone()),
            fcup: AtomicBool::new(false),
            fcuponce: AtomicBool::new(false),
            followc: AtomicU64::new(0),
            started: Instant::now(),
            stats_total_conns: AtomicU64::new(0),
            stats_total_commands: AtomicU64::new(0),
            stats_expired: AtomicU64::new(0),
            shutdown: ShutdownSignal::new(),
        });
        server.lua_pool.fill_initial();
        Ok(server)
    }

    /// Spawn the background maintenance loop (expiry sweep, interpreter
    /// pool pruning, scheduler gauge export) and, when the persisted state
    /// says so, the follow loop.
    pub fn start_background(self: &Arc<Self>) {
        let server = self.clone();
        std::thread::Builder::new()
            .name("meridian-background".into())
            .spawn(move || server.background_loop())
            .expect("spawn background thread");

        if self.repl.is_follower() {
            crate::follow::spawn_follow_loop(
                self,
                self.repl.follow_host(),
                self.repl.follow_port(),
                self.followc.load(Ordering::SeqCst),
            );
        }
    }

    /// Stop background work and the scheduler. Idempotent.
    pub fn stop(&self) {
        self.shutdown.stop();
        if let Some(handle) = self.scheduler_handle.lock().take() {
            handle.stop();
        }
    }

    fn background_loop(self: Arc<Self>) {
        let mut ticks: u64 = 0;
        loop {
            if self.shutdown.sleep(Duration::from_secs(1)) {
                return;
            }
            ticks += 1;
            self.sweep_expired();
            if ticks % 10 == 0 {
                self.lua_pool.prune();
            }
            crate::observability::record_scheduler_metrics(&self.scheduler.stats().snapshot());
        }
    }

    /// Delete expired items, journaling each deletion like a client DEL so
    /// followers stay in sync.
    fn sweep_expired(self: &Arc<Self>) {
        if self.repl.is_follower() {
            // The leader journals expirations; followers replay them.
            return;
        }
        let now = SystemTime::now();
        let stale: Vec<(String, String)> = {
            let cols = self.cols.read_recursive();
            cols.iter()
                .flat_map(|(key, col)| {
                    let mut ids = Vec::new();
                    let status = meridian_txn::TxnStatus::unbounded();
                    col.scan(false, &status, |id, item| {
                        if item.expired(now) {
                            ids.push((key.clone(), id.to_string()));
                        }
                        true
                    });
                    ids
                })
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let Ok(permit) = self.scheduler.write() else {
            return;
        };
        for (key, id) in stale {
            let removed = {
                let mut cols = self.cols.write();
                cols.get_mut(&key)
                    .and_then(|col| col.delete(&id))
                    .is_some()
            };
            if removed {
                self.stats_expired.fetch_add(1, Ordering::Relaxed);
                self.append_aof(&[
                    "del".to_string(),
                    key.clone(),
                    id.clone(),
                ]);
            }
        }
        permit.done();
    }

    // ── Collection helpers ───────────────────────────────────────────────

    pub(crate) fn with_col<R>(&self, key: &str, f: impl FnOnce(&Collection) -> R) -> Option<R> {
        let cols = self.cols.read_recursive();
        cols.get(key).map(f)
    }

    /// Run `f` against the collection for `key`, creating it when absent.
    /// The collection is dropped again if `f` leaves it empty.
    pub(crate) fn with_col_mut<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Collection) -> R,
    ) -> R {
        let mut cols = self.cols.write();
        let result = f(cols.entry(key.to_string()).or_default());
        if cols.get(key).is_some_and(|col| col.count() == 0) {
            cols.remove(key);
        }
        result
    }

    pub(crate) fn has_expired(&self, key: &str, id: &str) -> bool {
        let now = SystemTime::now();
        self.with_col(key, |col| col.get(id).is_some_and(|item| item.expired(now)))
            .unwrap_or(false)
    }

    // ── Durability ───────────────────────────────────────────────────────

    /// Append a mutating command to the AOF. Call only after the in-memory
    /// effect is visible and before the write permit completes.
    pub(crate) fn append_aof(&self, args: &[String]) {
        if let Some(aof) = &self.aof {
            if let Err(e) = aof.append(args) {
                tracing::error!("aof append failed: {}", e);
            }
        }
    }

    pub(crate) fn aof_size(&self) -> u64 {
        self.aof.as_ref().map(|a| a.size()).unwrap_or(0)
    }

    fn replay_aof(self: &Arc<Self>) -> MeridianResult<()> {
        let Some(aof) = &self.aof else {
            return Ok(());
        };
        let entries = aof.load()?;
        if entries.is_empty() {
            return Ok(());
        }
        tracing::info!("replaying {} aof entries", entries.len());
        for args in entries {
            let mut msg = Message::new(args);
            if let Err(e) = self.apply_replayed(&mut msg) {
                tracing::warn!("aof replay: {}: {}", msg.command(), e);
            }
        }
        Ok(())
    }

    /// Apply a command from the AOF at startup: straight through the
    /// data-command table, no scheduler, no re-journaling.
    fn apply_replayed(self: &Arc<Self>, msg: &mut Message) -> MeridianResult<()> {
        match msg.command().as_str() {
            "savesnapshot" | "loadsnapshot" => {
                // Snapshot markers position the log; the data is already in
                // the snapshot directories.
                Ok(())
            }
            _ => {
                let status = meridian_txn::TxnStatus::unbounded();
                crate::router::execute_in_script(self, msg, &status).map(|_| ())
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn repl(&self) -> &ReplicationState {
        &self.repl
    }

    /// Flush buffered AOF bytes to disk. A no-op when the log is disabled.
    pub fn aof_flush(&self) -> MeridianResult<()> {
        match &self.aof {
            Some(aof) => aof.flush(),
            None => Ok(()),
        }
    }

    pub fn server_id(&self) -> String {
        self.repl.server_id()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn caught_up_once(&self) -> bool {
        self.fcuponce.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.stop();
        if let Some(handle) = self.scheduler_handle.lock().take() {
            handle.stop();
        }
    }
}

pub(crate) fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let v: u8 = rng.gen_range(0..16);
            char::from_digit(v as u32, 16).unwrap_or('0')
        })
        .collect()
}
