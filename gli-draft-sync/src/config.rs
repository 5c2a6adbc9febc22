//! Engine configuration.
//!
//! Each component has its own config struct with `Default` and
//! `for_testing()` constructors. [`EngineConfig`] gathers them and can be
//! loaded from TOML; durations are written in milliseconds:
//!
//! ```toml
//! [autosave]
//! debounce_ms = 1000
//! max_retries = 3
//!
//! [backup]
//! max_backups = 10
//! retention_days = 30
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autosave::AutoSaveConfig;
use crate::backup::BackupConfig;
use crate::channel::ChannelConfig;
use crate::recovery::RecoveryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub autosave: AutoSaveConfig,
    pub channel: ChannelConfig,
    pub recovery: RecoveryConfig,
    pub backup: BackupConfig,
}

impl EngineConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            autosave: AutoSaveConfig::for_testing(),
            channel: ChannelConfig::for_testing(),
            recovery: RecoveryConfig::for_testing(),
            backup: BackupConfig::for_testing(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.autosave.history_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "autosave.history_limit",
                reason: "must be at least 1".into(),
            });
        }
        if self.backup.max_backups == 0 {
            return Err(ConfigError::Invalid {
                field: "backup.max_backups",
                reason: "must be at least 1".into(),
            });
        }
        if self.recovery.rolling_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "recovery.rolling_limit",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde helper: `Option<Duration>` as optional integer milliseconds.
pub(crate) mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
