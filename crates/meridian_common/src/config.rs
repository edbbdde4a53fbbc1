use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Top-level server configuration, loaded from `meridian.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeridianConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub aof: AofConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// RESP listen address.
    pub listen_addr: String,
    /// Data directory for the AOF, snapshots, and replication state.
    pub data_dir: String,
    /// Max concurrent client connections.
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Initial delay before interrupting in-flight scans for a pending write,
    /// in milliseconds. The scheduler adapts this at runtime.
    pub initial_write_delay_ms: u64,
    /// Max time a run of writes may hold off a pending read, in milliseconds.
    pub max_read_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AofConfig {
    /// Enable the append-only command log.
    pub enabled: bool,
    /// Flush the AOF buffer once it exceeds this many bytes.
    pub flush_threshold_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus listen address. Empty disables the exporter.
    #[serde(default)]
    pub listen_addr: String,
}

impl Default for MeridianConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            aof: AofConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9851".into(),
            data_dir: "data".into(),
            max_connections: 1024,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_write_delay_ms: 10,
            max_read_delay_ms: 10,
        }
    }
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_threshold_bytes: 10_240,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
        }
    }
}

impl MeridianConfig {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Replication state persisted across restarts: who we follow, whether the
/// node is read-only, and the node's stable identity.
///
/// Mutable at runtime by the FOLLOW and READONLY commands; every mutation is
/// written back to `<data_dir>/state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    server_id: String,
    #[serde(default)]
    follow_host: String,
    #[serde(default)]
    follow_port: u16,
    #[serde(default)]
    read_only: bool,
}

pub struct ReplicationState {
    path: PathBuf,
    inner: RwLock<PersistedState>,
}

impl ReplicationState {
    /// Load from `<dir>/state.json`, generating a fresh server id on first
    /// boot.
    pub fn load(dir: &Path, fresh_id: impl FnOnce() -> String) -> std::io::Result<Self> {
        let path = dir.join("state.json");
        let mut state: PersistedState = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(e),
        };
        if state.server_id.is_empty() {
            state.server_id = fresh_id();
        }
        let rs = Self {
            path,
            inner: RwLock::new(state),
        };
        rs.save()?;
        Ok(rs)
    }

    /// In-memory only, for tests.
    pub fn ephemeral(server_id: &str) -> Self {
        Self {
            path: PathBuf::new(),
            inner: RwLock::new(PersistedState {
                server_id: server_id.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn server_id(&self) -> String {
        self.inner.read().server_id.clone()
    }

    pub fn follow_host(&self) -> String {
        self.inner.read().follow_host.clone()
    }

    pub fn follow_port(&self) -> u16 {
        self.inner.read().follow_port
    }

    /// True when this node is replaying another node's command log.
    pub fn is_follower(&self) -> bool {
        !self.inner.read().follow_host.is_empty()
    }

    pub fn read_only(&self) -> bool {
        self.inner.read().read_only
    }

    pub fn set_follow(&self, host: &str, port: u16) {
        let mut inner = self.inner.write();
        inner.follow_host = host.to_string();
        inner.follow_port = port;
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.inner.write().read_only = read_only;
    }

    /// Persist the current state. A no-op for ephemeral instances.
    pub fn save(&self) -> std::io::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let state = self.inner.read().clone();
        let data = serde_json::to_string_pretty(&state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, data)
    }
}
