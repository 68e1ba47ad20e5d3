// THEORY:
// Every tunable in the crate lives in a plain struct with public fields, a
// `Default` that carries the reference values, and a `validate()` that rejects
// inconsistent combinations before anything runs. `MissionConfig` bundles the
// pieces the runner needs and can be loaded from a JSON file, where any field
// left out falls back to its default. Durations are written in seconds.

use crate::core_modules::tracker::TrackerConfig;
use crate::error::ConfigError;
use crate::missions::gate::GateMissionConfig;
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Longest timeout any mission may ask for.
pub(crate) const MAX_MISSION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Rejects a duration that is zero or longer than `max`.
pub(crate) fn check_duration(field: &str, value: Duration, max: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    if value > max {
        return Err(ConfigError::invalid(
            field,
            format!("must be at most {}s", max.as_secs_f64()),
        ));
    }
    Ok(())
}

/// `Duration` as fractional seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// `Option<Duration>` as fractional seconds or `null`.
pub(crate) mod option_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Everything the gate runner needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub scheduler: SchedulerConfig,
    pub gate: GateMissionConfig,
}

impl Default for MissionConfig {
    fn default() -> Self {
        let gate = GateMissionConfig::default();
        let scheduler = SchedulerConfig::default().with_channel(gate.channel.clone(), TrackerConfig::default());
        Self { scheduler, gate }
    }
}

impl MissionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.gate.validate()?;
        if !self.scheduler.channels.contains_key(&self.gate.channel) {
            return Err(ConfigError::invalid(
                "gate.channel",
                format!("no tracker configured for channel `{}`", self.gate.channel),
            ));
        }
        Ok(())
    }
}
