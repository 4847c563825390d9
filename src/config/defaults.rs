//! Built-in defaults for optional settings

use std::path::PathBuf;

/// Configuration file read when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/encarch.toml";

/// Name of the TOML table holding all settings
pub const CONFIG_SECTION: &str = "encarch";

/// Instance name used in log lines and report subjects
pub const DEFAULT_INSTANCE_NAME: &str = "encarch";

/// strftime format of the per-run destination subdirectory (year-month)
pub const DEFAULT_DEST_DATE_FORMAT: &str = "%Y-%m";

/// Report subject prefix
pub const DEFAULT_SUBJECT_PREFIX: &str = "[encarch]";

/// Encryption program
pub const DEFAULT_GPG_BINARY: &str = "gpg";

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
