// ABOUTME: Configuration for the interpreter worker pool
//
// Defines PoolSettings with all tunable parameters:
// - Pool size bounds (min is an idle-cleanup floor, max a hard capacity cap)
// - Request and idle timeouts, health sweep interval
// - Spawn grace period and per-candidate acquire probe timeout

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Configuration for one worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Minimum number of workers kept through idle cleanup
    pub min_pool_size: usize,

    /// Maximum number of worker processes per pool
    pub max_pool_size: usize,

    /// Maximum time a `get_worker` call may wait
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Idle duration after which a worker becomes eligible for cleanup
    #[serde(with = "duration_secs")]
    pub worker_idle_timeout: Duration,

    /// Interval between monitor sweeps
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,

    /// Delay after spawning before the new process is trusted as alive
    #[serde(with = "duration_millis")]
    pub spawn_grace_period: Duration,

    /// Per-candidate sub-timeout used when probing a worker's semaphore
    #[serde(with = "duration_millis")]
    pub acquire_probe_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 3,
            request_timeout: Duration::from_secs(30),
            worker_idle_timeout: Duration::from_secs(600), // 10 minutes
            health_check_interval: Duration::from_secs(30),
            spawn_grace_period: Duration::from_millis(1000),
            acquire_probe_timeout: Duration::from_millis(100),
        }
    }
}

impl PoolSettings {
    /// Validate internal consistency of the settings
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSettings`] if `max_pool_size` is zero or
    /// smaller than `min_pool_size`.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_pool_size == 0 {
            return Err(PoolError::InvalidSettings(
                "max_pool_size must be at least 1".to_string(),
            ));
        }
        if self.max_pool_size < self.min_pool_size {
            return Err(PoolError::InvalidSettings(format!(
                "max_pool_size ({}) must be >= min_pool_size ({})",
                self.max_pool_size, self.min_pool_size
            )));
        }
        Ok(())
    }

    /// Parse settings from a TOML string
    pub fn from_toml_str(input: &str) -> PoolResult<Self> {
        let settings: Self = toml::from_str(input)
            .map_err(|e| PoolError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn from_toml_file(path: &Path) -> PoolResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

/// Serde helper for Duration as seconds (u64)
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
