use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{Result, SyncError};

/// Tunables for replay, compaction and maintenance.
///
/// Every field has a default, so a config file only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Synced ledger events older than this are archived
    pub retention_days: u32,

    /// Minimum age of an unreferenced provisional task before cleanup
    pub orphan_threshold_secs: i64,

    /// Send attempts per operation before it is marked failed
    pub max_attempts: u32,

    pub backoff_base_ms: u64,

    pub backoff_cap_ms: u64,

    pub maintenance_interval_secs: u64,

    /// Operations drained per replay round
    pub replay_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            orphan_threshold_secs: store::DEFAULT_ORPHAN_THRESHOLD_SECS,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            maintenance_interval_secs: 300,
            replay_batch_size: 25,
        }
    }
}

impl SyncConfig {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(SyncError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("invalid {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if self.replay_batch_size == 0 {
            return Err(SyncError::Config(
                "replay_batch_size must be at least 1".into(),
            ));
        }
        if self.orphan_threshold_secs < 0 {
            return Err(SyncError::Config(
                "orphan_threshold_secs must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn orphan_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.orphan_threshold_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    /// Delay before retry number `attempt` (1-based): the base doubled per
    /// attempt, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.orphan_threshold(), chrono::Duration::minutes(10));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(&path, r#"{"retention_days": 30, "max_attempts": 2}"#).unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.backoff_cap_ms, 30_000);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(SyncConfig::load(&path), Err(SyncError::Config(_))));

        fs::write(&path, r#"{"max_attempts": 0}"#).unwrap();
        assert!(matches!(SyncConfig::load(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(4000));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(30_000));
        assert_eq!(config.backoff_delay(200), Duration::from_millis(30_000));
    }
}
