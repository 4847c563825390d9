//! Archive settings loaded from the `[encarch]` table of a TOML file

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone, Utc};
use encarch_crypto::{is_valid_suffix, GpgConfig};
use serde::Deserialize;

use super::defaults::{
    CONFIG_SECTION, DEFAULT_DEST_DATE_FORMAT, DEFAULT_GPG_BINARY, DEFAULT_INSTANCE_NAME,
    DEFAULT_SUBJECT_PREFIX,
};
use crate::catalog::NamePattern;
use crate::report::{EventLevel, ReportMode};
use crate::staging::paths_overlap;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    NotFound(PathBuf),

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("you MUST have a [{}] section; none found", CONFIG_SECTION)]
    MissingSection,

    #[error("{}", render_problems(.0))]
    Invalid(Vec<String>),

    #[error("cannot render destination date format '{0}'")]
    DateFormat(String),

    #[error("destination date format '{format}' renders '{rendered}', which leaves the destination root")]
    DateEscapesRoot { format: String, rendered: String },
}

fn render_problems(problems: &[String]) -> String {
    problems
        .iter()
        .map(|p| format!("\n* {}", p))
        .collect::<String>()
}

/// Settings that may be overridden from the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub temp_base: Option<PathBuf>,
    pub dest_root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    encarch: Option<RawSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    encrypt_to: Option<String>,
    source_base: Option<PathBuf>,
    source_match: Option<String>,
    dest_root: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    instance_name: Option<String>,
    temp_base: Option<PathBuf>,
    temp_preserve: Option<bool>,
    dest_date_format: Option<String>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    #[serde(default)]
    report: RawReport,
    #[serde(default)]
    gpg: RawGpg,
}

#[derive(Debug, Default, Deserialize)]
struct RawReport {
    on: Option<String>,
    summary_path: Option<PathBuf>,
    subject_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGpg {
    binary: Option<String>,
    homedir: Option<PathBuf>,
    always_trust: Option<bool>,
}

/// Report delivery settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    /// When to produce a report; `None` disables reporting
    pub mode: Option<ReportMode>,
    /// Where the JSON summary is written
    pub summary_path: Option<PathBuf>,
    /// Prefix of the report subject line
    pub subject_prefix: String,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            mode: None,
            summary_path: None,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }
    }
}

/// Validated archive settings
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Recipient fingerprint suffix
    pub encrypt_to: String,
    /// Directory scanned for files
    pub source_base: PathBuf,
    /// Shell glob matched against file names
    pub source_match: String,
    /// Destination mount; runs land in a dated subdirectory
    pub dest_root: PathBuf,
    /// Single-instance pid file
    pub pid_file: PathBuf,
    pub instance_name: String,
    /// Staging root; staging is skipped when unset
    pub temp_base: Option<PathBuf>,
    /// Keep staged copies after the run
    pub temp_preserve: bool,
    pub dest_date_format: String,
    pub log_level: EventLevel,
    pub log_file: Option<PathBuf>,
    pub report: ReportSettings,
    pub gpg: GpgConfig,
}

impl ArchiveConfig {
    /// Settings with every optional value at its default.
    pub fn new(
        encrypt_to: impl Into<String>,
        source_base: impl Into<PathBuf>,
        source_match: impl Into<String>,
        dest_root: impl Into<PathBuf>,
        pid_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            encrypt_to: encrypt_to.into(),
            source_base: source_base.into(),
            source_match: source_match.into(),
            dest_root: dest_root.into(),
            pid_file: pid_file.into(),
            instance_name: DEFAULT_INSTANCE_NAME.to_string(),
            temp_base: None,
            temp_preserve: false,
            dest_date_format: DEFAULT_DEST_DATE_FORMAT.to_string(),
            log_level: EventLevel::Info,
            log_file: None,
            report: ReportSettings::default(),
            gpg: GpgConfig::default(),
        }
    }

    /// Load settings from `path`, applying `overrides` before validation.
    pub fn load(path: &Path, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, overrides)
    }

    /// Parse settings from TOML text.
    pub fn parse(content: &str, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        let mut raw = file.encarch.ok_or(ConfigError::MissingSection)?;

        if let Some(ref level) = overrides.log_level {
            raw.log_level = Some(level.clone());
        }
        if let Some(ref temp) = overrides.temp_base {
            raw.temp_base = Some(temp.clone());
        }
        if let Some(ref dest) = overrides.dest_root {
            raw.dest_root = Some(dest.clone());
        }

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        fn required<T>(value: Option<T>, key: &str, problems: &mut Vec<String>) -> Option<T> {
            if value.is_none() {
                problems.push(format!("You must set '{}' in your configuration file", key));
            }
            value
        }

        let encrypt_to = required(non_empty(raw.encrypt_to), "encrypt_to", &mut problems);
        let source_base = required(non_empty_path(raw.source_base), "source_base", &mut problems);
        let source_match = required(non_empty(raw.source_match), "source_match", &mut problems);
        let dest_root = required(non_empty_path(raw.dest_root), "dest_root", &mut problems);
        let pid_file = required(non_empty_path(raw.pid_file), "pid_file", &mut problems);

        if let Some(ref fpr) = encrypt_to {
            if !is_valid_suffix(fpr) {
                problems.push(format!(
                    "Invalid 'encrypt_to' value '{}' - Must be 8 to 40 hex digits of a key fingerprint",
                    fpr
                ));
            }
        }
        if let Some(ref pattern) = source_match {
            if let Err(e) = NamePattern::new(pattern) {
                problems.push(format!("Invalid 'source_match' pattern: {}", e));
            }
        }

        let dest_date_format = raw
            .dest_date_format
            .unwrap_or_else(|| DEFAULT_DEST_DATE_FORMAT.to_string());
        if !is_renderable_date_format(&dest_date_format) {
            problems.push(format!(
                "Invalid 'dest_date_format' '{}' - Not a usable strftime format",
                dest_date_format
            ));
        } else if render_subdir(&dest_date_format, &Utc::now()).is_err() {
            problems.push(format!(
                "Invalid 'dest_date_format' '{}' - Must render to a relative path inside 'dest_root'",
                dest_date_format
            ));
        }

        let temp_base = non_empty_path(raw.temp_base);
        if let (Some(temp), Some(source)) = (&temp_base, &source_base) {
            if paths_overlap(temp, source) {
                problems.push(format!(
                    "Invalid 'temp_base' '{}' - Must not overlap 'source_base' '{}'",
                    temp.display(),
                    source.display()
                ));
            }
        }

        let log_level = match raw.log_level {
            Some(level) => match level.parse::<EventLevel>() {
                Ok(level) => level,
                Err(e) => {
                    problems.push(e.to_string());
                    EventLevel::Info
                }
            },
            None => EventLevel::Info,
        };

        let mode = match raw.report.on {
            Some(on) => match on.parse::<ReportMode>() {
                Ok(mode) => Some(mode),
                Err(_) => {
                    problems.push(format!("Invalid 'report.on' value '{}' - Must be all or errors", on));
                    None
                }
            },
            None => None,
        };
        if mode.is_some() && raw.report.summary_path.is_none() {
            problems.push("For reports, you must set 'report.summary_path' in your configuration file".to_string());
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        let (Some(encrypt_to), Some(source_base), Some(source_match), Some(dest_root), Some(pid_file)) =
            (encrypt_to, source_base, source_match, dest_root, pid_file)
        else {
            return Err(ConfigError::Invalid(vec!["Required settings missing".to_string()]));
        };

        Ok(Self {
            encrypt_to,
            source_base,
            source_match,
            dest_root,
            pid_file,
            instance_name: non_empty(raw.instance_name)
                .unwrap_or_else(|| DEFAULT_INSTANCE_NAME.to_string()),
            temp_base,
            temp_preserve: raw.temp_preserve.unwrap_or(false),
            dest_date_format,
            log_level,
            log_file: non_empty_path(raw.log_file),
            report: ReportSettings {
                mode,
                summary_path: raw.report.summary_path,
                subject_prefix: raw
                    .report
                    .subject_prefix
                    .unwrap_or_else(|| DEFAULT_SUBJECT_PREFIX.to_string()),
            },
            gpg: GpgConfig {
                binary: non_empty(raw.gpg.binary).unwrap_or_else(|| DEFAULT_GPG_BINARY.to_string()),
                homedir: non_empty_path(raw.gpg.homedir),
                always_trust: raw.gpg.always_trust.unwrap_or(false),
            },
        })
    }

    /// Staging is used when a temp base is configured
    pub fn staging_enabled(&self) -> bool {
        self.temp_base.is_some()
    }

    /// Staged copies are removed at the end of the run
    pub fn clears_staging(&self) -> bool {
        self.staging_enabled() && !self.temp_preserve
    }

    /// Dated destination directory for a run started at `now`.
    pub fn destination_base<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<PathBuf, ConfigError>
    where
        Tz::Offset: std::fmt::Display,
    {
        let subdir = render_subdir(&self.dest_date_format, now)?;
        Ok(self.dest_root.join(subdir))
    }
}

/// Render `format` for `now` as a path that stays below the destination root.
fn render_subdir<Tz: TimeZone>(format: &str, now: &DateTime<Tz>) -> Result<PathBuf, ConfigError>
where
    Tz::Offset: std::fmt::Display,
{
    let mut rendered = String::new();
    write!(rendered, "{}", now.format(format))
        .map_err(|_| ConfigError::DateFormat(format.to_string()))?;

    let subdir = PathBuf::from(&rendered);
    let mut named = false;
    for component in subdir.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ConfigError::DateEscapesRoot {
                    format: format.to_string(),
                    rendered,
                })
            }
        }
    }
    if !named {
        return Err(ConfigError::DateEscapesRoot {
            format: format.to_string(),
            rendered,
        });
    }
    Ok(subdir)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|p| !p.as_os_str().is_empty())
}

fn is_renderable_date_format(format: &str) -> bool {
    !format.trim().is_empty() && !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, Utc};

    const MINIMAL: &str = r#"
[encarch]
encrypt_to = "89ABCDEF"
source_base = "/srv/data"
source_match = "*.bak"
dest_root = "/mnt/usb"
pid_file = "/run/encarch.pid"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = ArchiveConfig::parse(MINIMAL, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.encrypt_to, "89ABCDEF");
        assert_eq!(config.source_base, PathBuf::from("/srv/data"));
        assert_eq!(config.instance_name, "encarch");
        assert_eq!(config.dest_date_format, "%Y-%m");
        assert_eq!(config.log_level, EventLevel::Info);
        assert!(config.temp_base.is_none());
        assert!(!config.staging_enabled());
        assert!(!config.clears_staging());
        assert!(config.report.mode.is_none());
        assert_eq!(config.gpg.binary, "gpg");
    }

    #[test]
    fn test_full_config() {
        let content = r#"
[encarch]
encrypt_to = "0123456789abcdef"
source_base = "/srv/data"
source_match = "backup-*.tar"
dest_root = "/mnt/usb"
pid_file = "/run/encarch.pid"
instance_name = "nightly"
temp_base = "/var/tmp/encarch"
temp_preserve = true
dest_date_format = "%Y/%m-%d"
log_level = "debug"
log_file = "/var/log/encarch.log"

[encarch.report]
on = "errors"
summary_path = "/var/lib/encarch/run_summary.json"
subject_prefix = "[nightly]"

[encarch.gpg]
binary = "/usr/local/bin/gpg2"
homedir = "/etc/encarch/gnupg"
always_trust = true
"#;
        let config = ArchiveConfig::parse(content, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.instance_name, "nightly");
        assert!(config.staging_enabled());
        assert!(!config.clears_staging());
        assert_eq!(config.log_level, EventLevel::Debug);
        assert_eq!(config.report.mode, Some(ReportMode::Errors));
        assert_eq!(config.report.subject_prefix, "[nightly]");
        assert_eq!(config.gpg.homedir, Some(PathBuf::from("/etc/encarch/gnupg")));
        assert!(config.gpg.always_trust);
    }

    #[test]
    fn test_missing_section() {
        let err = ArchiveConfig::parse("[other]\nx = 1\n", &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection));
    }

    #[test]
    fn test_all_missing_keys_reported_together() {
        let err = ArchiveConfig::parse("[encarch]\n", &ConfigOverrides::default()).unwrap_err();
        match err {
            ConfigError::Invalid(problems) => {
                assert_eq!(problems.len(), 5);
                assert!(problems.iter().any(|p| p.contains("'pid_file'")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values_reported() {
        let content = r#"
[encarch]
encrypt_to = "not-hex"
source_base = "/srv"
source_match = "["
dest_root = "/mnt"
pid_file = "/run/x.pid"
log_level = "loud"
dest_date_format = "%Y-%Q"

[encarch.report]
on = "sometimes"
"#;
        let err = ArchiveConfig::parse(content, &ConfigOverrides::default()).unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 5);
        assert!(problems.iter().any(|p| p.contains("encrypt_to")));
        assert!(problems.iter().any(|p| p.contains("source_match")));
        assert!(problems.iter().any(|p| p.contains("log level")));
        assert!(problems.iter().any(|p| p.contains("dest_date_format")));
        assert!(problems.iter().any(|p| p.contains("report.on")));
    }

    #[test]
    fn test_report_requires_summary_path() {
        let content = format!("{}\n[encarch.report]\non = \"all\"\n", MINIMAL);
        let err = ArchiveConfig::parse(&content, &ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("summary_path"));
    }

    #[test]
    fn test_overrides_apply_before_validation() {
        let overrides = ConfigOverrides {
            log_level: Some("warning".to_string()),
            temp_base: Some(PathBuf::from("/scratch")),
            dest_root: Some(PathBuf::from("/mnt/other")),
        };
        let config = ArchiveConfig::parse(MINIMAL, &overrides).unwrap();
        assert_eq!(config.log_level, EventLevel::Warning);
        assert_eq!(config.temp_base, Some(PathBuf::from("/scratch")));
        assert_eq!(config.dest_root, PathBuf::from("/mnt/other"));
        assert!(config.clears_staging());

        let bad = ConfigOverrides {
            log_level: Some("chatty".to_string()),
            ..ConfigOverrides::default()
        };
        assert!(ArchiveConfig::parse(MINIMAL, &bad).is_err());
    }

    #[test]
    fn test_empty_temp_base_disables_staging() {
        let content = format!("{}temp_base = \"\"\n", MINIMAL);
        let config = ArchiveConfig::parse(&content, &ConfigOverrides::default()).unwrap();
        assert!(!config.staging_enabled());
    }

    #[test]
    fn test_destination_base() {
        let config = ArchiveConfig::new("89ABCDEF", "/src", "*", "/mnt/usb", "/run/x.pid");
        let when = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(
            config.destination_base(&when).unwrap(),
            PathBuf::from("/mnt/usb/2024-03")
        );
        assert!(config.destination_base(&Local::now()).is_ok());
    }

    #[test]
    fn test_temp_base_overlapping_source_rejected() {
        for temp in ["/srv/data", "/srv/data/staging", "/srv", "/srv/data/./x/.."] {
            let content = format!("{}temp_base = \"{}\"\n", MINIMAL, temp);
            let err = ArchiveConfig::parse(&content, &ConfigOverrides::default()).unwrap_err();
            assert!(err.to_string().contains("'temp_base'"), "{temp}: {err}");
        }

        let overrides = ConfigOverrides {
            temp_base: Some(PathBuf::from("/srv/data/tmp")),
            ..ConfigOverrides::default()
        };
        assert!(ArchiveConfig::parse(MINIMAL, &overrides).is_err());
    }

    #[test]
    fn test_temp_base_beside_source_accepted() {
        let content = format!("{}temp_base = \"/srv/data-staging\"\n", MINIMAL);
        let config = ArchiveConfig::parse(&content, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.temp_base, Some(PathBuf::from("/srv/data-staging")));
    }

    #[test]
    fn test_escaping_date_format_rejected() {
        for format in ["/%Y", "../%Y-%m", "%Y/../../etc", "."] {
            let content = format!("{}dest_date_format = \"{}\"\n", MINIMAL, format);
            let err = ArchiveConfig::parse(&content, &ConfigOverrides::default()).unwrap_err();
            assert!(err.to_string().contains("inside 'dest_root'"), "{format}: {err}");
        }
    }

    #[test]
    fn test_destination_base_stays_under_root() {
        let mut config = ArchiveConfig::new("89ABCDEF", "/src", "*", "/mnt/usb", "/run/x.pid");
        let when = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        config.dest_date_format = "%Y/%m".to_string();
        assert_eq!(
            config.destination_base(&when).unwrap(),
            PathBuf::from("/mnt/usb/2024/03")
        );

        config.dest_date_format = "/tmp/%Y".to_string();
        assert!(matches!(
            config.destination_base(&when),
            Err(ConfigError::DateEscapesRoot { .. })
        ));
        config.dest_date_format = "%Y/..".to_string();
        assert!(matches!(
            config.destination_base(&when),
            Err(ConfigError::DateEscapesRoot { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ArchiveConfig::load(Path::new("/nonexistent/encarch.toml"), &ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_toml_syntax_error() {
        let err = ArchiveConfig::parse("[encarch\n", &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
