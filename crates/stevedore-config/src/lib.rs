//! Configuration system for the Stevedore workflow engine.
//!
//! Provides TOML-based configuration with:
//! - Checkpoint store settings (`[checkpoint]`): compression, integrity, expiry
//! - Coordination settings (`[coordination]`): timeout window, metrics queue
//! - Escalation settings (`[escalation]`): retry policies and extra routing rules
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
