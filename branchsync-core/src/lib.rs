//! branchsync core library: domain types, configuration, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes, change markers, on-disk repository layout
//! - [`config`]: YAML configuration file
//! - [`target`]: a validated, immutable sync target
//! - [`error`]: [`ConfigError`], [`LayoutError`]

pub mod config;
pub mod error;
pub mod target;
pub mod types;

pub use config::{Config, SourceMode, StoreConfig, TargetConfig};
pub use error::{ConfigError, LayoutError};
pub use target::{parse_repo_name, SshCredentials, Target};
pub use types::{ChangeEvent, ChangeMarkers, RepoLayout, TargetName};
