//! reaper-core — shared configuration and node types.
//!
//! Everything here is pure: config parsing and validation, the hostname
//! naming convention, and placement-group naming. No I/O beyond reading
//! the config file.

pub mod config;
pub mod error;
pub mod types;

pub use config::{InstanceDef, ReaperConfig, SuspendConfig, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
