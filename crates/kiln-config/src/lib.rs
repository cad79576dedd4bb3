//! KDL configuration parsing for the Kiln job queue.
//!
//! A configuration file picks the job store backend and tunes lease timing,
//! the worker poll loop and log output.

pub mod config;
pub mod error;
mod node;

pub use config::{
    KilnConfig, LeaseSettings, LogFormat, LogSettings, StoreConfig, WorkerSettings, load_config,
    parse_config,
};
pub use error::{ConfigError, ConfigResult};
