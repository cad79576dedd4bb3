//! Service configuration parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::node::{first_string_arg, string_list, string_prop, u64_prop};
use crate::{ConfigError, ConfigResult};

/// A missed heartbeat only expires a lease after this many intervals.
pub const MIN_EXPIRY_HEARTBEATS: u32 = 3;

/// Full configuration of a Kiln process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilnConfig {
    pub store: StoreConfig,
    pub lease: LeaseSettings,
    pub worker: WorkerSettings,
    pub log: LogSettings,
}

/// Which job store backend to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// One JSON file per job in `path`.
    Fs { path: PathBuf },
    /// A shared PostgreSQL database. Without a `url` the binary falls back to
    /// `DATABASE_URL`.
    Postgres {
        url: Option<String>,
        max_connections: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// How often a worker heartbeats a running job.
    pub heartbeat_interval: Duration,
    /// How long a lease survives without a heartbeat.
    pub expiry: Duration,
    /// How often the sweeper looks for expired leases.
    pub sweep_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            expiry: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    /// Channels the worker dequeues from.
    pub channels: Vec<String>,
    /// Job types the worker accepts; empty means every registered type.
    pub job_types: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            channels: Vec::new(),
            job_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    pub format: LogFormat,
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub filter: Option<String>,
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<KilnConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Parse a configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<KilnConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut store = None;
    let mut lease = None;
    let mut worker = None;
    let mut log = None;

    for node in doc.nodes() {
        match node.name().value() {
            "store" => set_once(&mut store, "store", parse_store(node)?)?,
            "lease" => set_once(&mut lease, "lease", parse_lease(node)?)?,
            "worker" => set_once(&mut worker, "worker", parse_worker(node)?)?,
            "log" => set_once(&mut log, "log", parse_log(node)?)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(KilnConfig {
        store: store.ok_or_else(|| ConfigError::MissingField("store".to_string()))?,
        lease: lease.unwrap_or_default(),
        worker: worker.unwrap_or_default(),
        log: log.unwrap_or_default(),
    })
}

fn set_once<T>(slot: &mut Option<T>, name: &str, value: T) -> ConfigResult<()> {
    if slot.is_some() {
        return Err(ConfigError::Duplicate(name.to_string()));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_store(node: &KdlNode) -> ConfigResult<StoreConfig> {
    let backend = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("store backend".to_string()))?;

    match backend.as_str() {
        "fs" => {
            let path = string_prop(node, "path")
                .ok_or_else(|| ConfigError::MissingField("store path".to_string()))?;
            Ok(StoreConfig::Fs {
                path: PathBuf::from(path),
            })
        }
        "postgres" => {
            let max_connections = u64_prop(node, "max-connections")?.unwrap_or(10);
            let max_connections = u32::try_from(max_connections)
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ConfigError::invalid("max-connections", "must be between 1 and 2^32-1")
                })?;
            Ok(StoreConfig::Postgres {
                url: string_prop(node, "url"),
                max_connections,
            })
        }
        other => Err(ConfigError::invalid(
            "store backend",
            format!("unknown backend: {}", other),
        )),
    }
}

fn parse_lease(node: &KdlNode) -> ConfigResult<LeaseSettings> {
    let defaults = LeaseSettings::default();
    let secs = |name: &str, default: Duration| -> ConfigResult<Duration> {
        Ok(u64_prop(node, name)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    };

    let lease = LeaseSettings {
        heartbeat_interval: secs("heartbeat-interval-secs", defaults.heartbeat_interval)?,
        expiry: secs("expiry-secs", defaults.expiry)?,
        sweep_interval: secs("sweep-interval-secs", defaults.sweep_interval)?,
    };

    if lease.heartbeat_interval.is_zero() {
        return Err(ConfigError::invalid("heartbeat-interval-secs", "must be positive"));
    }
    if lease.sweep_interval.is_zero() {
        return Err(ConfigError::invalid("sweep-interval-secs", "must be positive"));
    }
    let min_expiry = lease
        .heartbeat_interval
        .checked_mul(MIN_EXPIRY_HEARTBEATS)
        .ok_or_else(|| ConfigError::invalid("heartbeat-interval-secs", "too large"))?;
    if lease.expiry < min_expiry {
        return Err(ConfigError::invalid(
            "expiry-secs",
            format!(
                "must be at least {} heartbeat intervals",
                MIN_EXPIRY_HEARTBEATS
            ),
        ));
    }
    Ok(lease)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerSettings> {
    let poll_interval = u64_prop(node, "poll-interval-ms")?
        .map(Duration::from_millis)
        .unwrap_or(WorkerSettings::default().poll_interval);
    if poll_interval.is_zero() {
        return Err(ConfigError::invalid("poll-interval-ms", "must be positive"));
    }

    let channels = string_list(node, "channels");
    let job_types = string_list(node, "types");
    if channels.iter().chain(&job_types).any(|s| s.is_empty()) {
        return Err(ConfigError::invalid("worker", "names must not be empty"));
    }

    Ok(WorkerSettings {
        poll_interval,
        channels,
        job_types,
    })
}

fn parse_log(node: &KdlNode) -> ConfigResult<LogSettings> {
    let format = match string_prop(node, "format").as_deref() {
        None | Some("text") => LogFormat::Text,
        Some("json") => LogFormat::Json,
        Some(other) => {
            return Err(ConfigError::invalid(
                "log format",
                format!("expected text or json, got {}", other),
            ));
        }
    };
    Ok(LogSettings {
        format,
        filter: string_prop(node, "filter"),
    })
}
