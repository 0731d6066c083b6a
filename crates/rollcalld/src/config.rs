use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Manifests the extractor needs before the daemon may report ready.
const DEFAULT_MODEL_FILES: [&str; 3] = [
    "tiny_face_detector_model-weights_manifest.json",
    "face_landmark_68_model-weights_manifest.json",
    "face_recognition_model-weights_manifest.json",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration.
///
/// Seeded from the TOML file named by `ROLLCALL_CONFIG` (if any), then
/// overridden by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance at or below which a probe matches.
    pub match_threshold: f32,
    /// Expected embedding length from the extractor.
    pub embedding_dim: usize,
    /// If set, the extractor model files must exist here for readiness.
    pub model_dir: Option<PathBuf>,
    pub model_files: Vec<String>,
    /// Whether to queue attendance notifications.
    pub notify_enabled: bool,
    /// Capacity of the notification outbox.
    pub notify_queue: usize,
    /// Report window when the caller gives no dates.
    pub report_default_days: u32,
    pub bus: BusKind,
    /// UIDs besides root and the daemon's own user that may enroll, record
    /// and read reports over the bus.
    pub operator_uids: Vec<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("rollcall.db"),
            match_threshold: rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD,
            embedding_dim: rollcall_core::types::DEFAULT_EMBEDDING_DIM,
            model_dir: None,
            model_files: DEFAULT_MODEL_FILES.iter().map(|s| s.to_string()).collect(),
            notify_enabled: true,
            notify_queue: 256,
            report_default_days: 7,
            bus: BusKind::Session,
            operator_uids: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the optional file and `ROLLCALL_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make matching or queueing meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive finite number, got {}",
                self.match_threshold
            )));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be at least 1".into()));
        }
        if self.notify_queue == 0 {
            return Err(ConfigError::Invalid("notify_queue must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = lookup("ROLLCALL_NOTIFY_ENABLED") {
            self.notify_enabled = v != "0";
        }
        self.match_threshold = env_parse(&lookup, "ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.embedding_dim = env_parse(&lookup, "ROLLCALL_EMBEDDING_DIM", self.embedding_dim);
        self.notify_queue = env_parse(&lookup, "ROLLCALL_NOTIFY_QUEUE", self.notify_queue);
        self.report_default_days =
            env_parse(&lookup, "ROLLCALL_REPORT_DEFAULT_DAYS", self.report_default_days);
        self.bus = env_parse(&lookup, "ROLLCALL_BUS", self.bus);
        if let Some(raw) = lookup("ROLLCALL_OPERATOR_UIDS") {
            match parse_uid_list(&raw) {
                Ok(uids) => self.operator_uids = uids,
                Err(_) => {
                    tracing::warn!(key = "ROLLCALL_OPERATOR_UIDS", value = %raw, "ignoring unparseable config override")
                }
            }
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Comma-separated UIDs; blanks are skipped.
fn parse_uid_list(raw: &str) -> Result<Vec<u32>, std::num::ParseIntError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// Parse `key` if present and well-formed; otherwise keep `default`.
fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable config override");
                default
            }
        },
        None => default,
    }
}
