//! Configuration loading
//!
//! Settings live in the `[encarch]` table of a TOML file (default
//! `/etc/encarch.toml`). A few values can be overridden on the command line;
//! overrides are applied before validation so they are checked like any
//! other value.

mod defaults;
mod settings;

pub use defaults::{
    default_config_path, CONFIG_SECTION, DEFAULT_CONFIG_PATH, DEFAULT_DEST_DATE_FORMAT,
    DEFAULT_GPG_BINARY, DEFAULT_INSTANCE_NAME, DEFAULT_SUBJECT_PREFIX,
};
pub use settings::{ArchiveConfig, ConfigError, ConfigOverrides, ReportSettings};
