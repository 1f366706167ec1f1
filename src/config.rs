use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file {path}: {message}")]
    Open { path: String, message: String },
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub rules: RuleConfig,

    #[serde(default = "default_event_feed_capacity")]
    pub event_feed_capacity: usize,

    /// DSL files loaded by `System::load_configured_sources`.
    #[serde(default)]
    pub dsl_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_timeout_per_action", with = "duration_ms")]
    pub timeout_per_action: Duration,

    #[serde(default)]
    pub retry_on_failure: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_per_action: default_timeout_per_action(),
            retry_on_failure: false,
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deepest cascade a rule-generated event may reach.
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_cascade_depth: default_max_cascade_depth(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            rules: RuleConfig::default(),
            event_feed_capacity: default_event_feed_capacity(),
            dsl_paths: vec![],
        }
    }
}

impl EngineConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "batch.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.event_feed_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_feed_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| ConfigError::Open {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| ConfigError::Parse(e.to_string()))
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
}

// デフォルト値の定義
fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> usize {
    10
}
fn default_timeout_per_action() -> Duration {
    Duration::from_secs(30)
}
fn default_max_retries() -> usize {
    1
}
fn default_max_cascade_depth() -> usize {
    8
}
fn default_event_feed_capacity() -> usize {
    256
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
