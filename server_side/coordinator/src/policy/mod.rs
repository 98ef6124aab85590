//! What happens when a `WAIT` or `DETECT` does not resolve in time.
pub mod admin;
pub mod gate;

use std::{fmt, path::PathBuf, time::Duration};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::util::file_backed_json::FileBackedValue;
use admin::{AdminCommand, ConfigField};

pub use gate::{DetectGate, GateStatus, WaitGate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TimeoutStrategy {
    SkipContinue,
    PauseSystem,
    AbortReset,
    RetryBackoff,
}

impl TryFrom<u8> for TimeoutStrategy {
    type Error = String;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TimeoutStrategy::SkipContinue),
            1 => Ok(TimeoutStrategy::PauseSystem),
            2 => Ok(TimeoutStrategy::AbortReset),
            3 => Ok(TimeoutStrategy::RetryBackoff),
            other => Err(format!("unknown timeout strategy {}", other)),
        }
    }
}

impl From<TimeoutStrategy> for u8 {
    fn from(strategy: TimeoutStrategy) -> u8 {
        match strategy {
            TimeoutStrategy::SkipContinue => 0,
            TimeoutStrategy::PauseSystem => 1,
            TimeoutStrategy::AbortReset => 2,
            TimeoutStrategy::RetryBackoff => 3,
        }
    }
}

/// Persisted as `timeout.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Milliseconds a `WAIT` may block.
    pub max_wait_time: u64,
    pub strategy: TimeoutStrategy,
    pub max_timeout_warning: u32,
    pub auto_retry_count: u32,
    pub save_to_file: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            max_wait_time: 30000,
            strategy: TimeoutStrategy::SkipContinue,
            max_timeout_warning: 3,
            auto_retry_count: 2,
            save_to_file: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutStats {
    pub total_timeouts: u64,
    pub successful_waits: u64,
    pub retry_count: u64,
    pub total_wait_ms: u64,
}

impl TimeoutStats {
    /// Share of resolved waits that did not time out.
    pub fn success_rate(&self) -> Option<f64> {
        let resolved = self.successful_waits + self.total_timeouts;
        (resolved > 0).then(|| self.successful_waits as f64 / resolved as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockKind {
    Wait,
    Detect,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockKind::Wait => "WAIT",
            BlockKind::Detect => "DETECT",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Drop the wait and carry on with the queue.
    Continue,
    /// Arm the same wait again.
    Retry,
    Pause,
    AbortAndReset,
}

#[derive(Debug, Serialize)]
pub struct PolicySnapshot {
    pub config: TimeoutConfig,
    pub stats: TimeoutStats,
    pub success_rate: Option<f64>,
}

pub struct TimeoutPolicy {
    config: TimeoutConfig,
    store: Option<FileBackedValue<TimeoutConfig>>,
    stats: TimeoutStats,
    consecutive_timeouts: u32,
    consecutive_retries: u32,
}

impl TimeoutPolicy {
    pub fn new(config: TimeoutConfig) -> Self {
        TimeoutPolicy {
            config,
            store: None,
            stats: Default::default(),
            consecutive_timeouts: 0,
            consecutive_retries: 0,
        }
    }
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let store = FileBackedValue::new(path, TimeoutConfig::default)?;
        let mut policy = TimeoutPolicy::new(store.get().clone());
        policy.store = Some(store);
        Ok(policy)
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }
    pub fn stats(&self) -> &TimeoutStats {
        &self.stats
    }
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.config.max_wait_time)
    }
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            config: self.config.clone(),
            stats: self.stats.clone(),
            success_rate: self.stats.success_rate(),
        }
    }

    pub fn on_success(&mut self, kind: BlockKind, waited: Duration) {
        self.stats.successful_waits += 1;
        self.stats.total_wait_ms += waited.as_millis() as u64;
        self.consecutive_timeouts = 0;
        self.consecutive_retries = 0;
        info!("{} resolved after {} ms", kind, waited.as_millis());
    }

    pub fn on_timeout(&mut self, kind: BlockKind, waited: Duration) -> TimeoutOutcome {
        self.stats.total_timeouts += 1;
        self.stats.total_wait_ms += waited.as_millis() as u64;
        match self.config.strategy {
            TimeoutStrategy::SkipContinue => {
                self.consecutive_timeouts += 1;
                let threshold = self.config.max_timeout_warning.max(1);
                if self.consecutive_timeouts >= 2 * threshold {
                    warn!("{} timed out {} times in a row; pausing", kind, self.consecutive_timeouts);
                    self.consecutive_timeouts = 0;
                    TimeoutOutcome::Pause
                } else {
                    if self.consecutive_timeouts >= threshold {
                        warn!("{} timed out {} times in a row", kind, self.consecutive_timeouts);
                    } else {
                        info!("{} timed out; skipping", kind);
                    }
                    TimeoutOutcome::Continue
                }
            }
            TimeoutStrategy::PauseSystem => {
                warn!("{} timed out; pausing", kind);
                TimeoutOutcome::Pause
            }
            TimeoutStrategy::AbortReset => {
                warn!("{} timed out; aborting the queue", kind);
                TimeoutOutcome::AbortAndReset
            }
            TimeoutStrategy::RetryBackoff => {
                if self.consecutive_retries < self.config.auto_retry_count {
                    self.consecutive_retries += 1;
                    self.stats.retry_count += 1;
                    info!(
                        "{} timed out; retry {} of {}",
                        kind, self.consecutive_retries, self.config.auto_retry_count
                    );
                    TimeoutOutcome::Retry
                } else {
                    warn!("{} timed out after {} retries; pausing", kind, self.consecutive_retries);
                    self.consecutive_retries = 0;
                    TimeoutOutcome::Pause
                }
            }
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = Default::default();
        self.consecutive_timeouts = 0;
        self.consecutive_retries = 0;
    }

    fn update_config(&mut self, change: impl FnOnce(&mut TimeoutConfig)) {
        let was_saved = self.config.save_to_file;
        change(&mut self.config);
        if !(was_saved || self.config.save_to_file) {
            return;
        }
        match &mut self.store {
            Some(store) => {
                if let Err(e) = store.set(self.config.clone()) {
                    error!("failed to save timeout config to {:?}: {:#}", store.path(), e);
                }
            }
            None => warn!("timeout config has no file to be saved to"),
        }
    }

    pub fn apply(&mut self, command: AdminCommand) -> anyhow::Result<()> {
        match command {
            AdminCommand::Set(ConfigField::MaxWait, millis) => {
                if millis == 0 {
                    return Err(anyhow!("max wait must be positive"));
                }
                self.update_config(|config| config.max_wait_time = millis);
            }
            AdminCommand::Set(ConfigField::Strategy, value) => {
                let strategy = u8::try_from(value)
                    .map_err(|_| anyhow!("unknown timeout strategy {}", value))
                    .and_then(|value| TimeoutStrategy::try_from(value).map_err(|e| anyhow!(e)))?;
                self.update_config(|config| config.strategy = strategy);
            }
            AdminCommand::Set(ConfigField::Warning, count) => {
                let count = u32::try_from(count)?;
                self.update_config(|config| config.max_timeout_warning = count);
            }
            AdminCommand::Set(ConfigField::Retry, count) => {
                let count = u32::try_from(count)?;
                self.update_config(|config| config.auto_retry_count = count);
            }
            AdminCommand::Set(ConfigField::Save, flag) => {
                let save = match flag {
                    0 => false,
                    1 => true,
                    other => return Err(anyhow!("save flag must be 0 or 1, got {}", other)),
                };
                self.update_config(|config| config.save_to_file = save);
            }
            AdminCommand::ResetStats => {
                self.reset_stats();
                info!("timeout statistics reset");
            }
            AdminCommand::Status => {
                info!("timeout policy: {}", serde_json::to_string(&self.snapshot())?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;

    fn policy(strategy: TimeoutStrategy) -> TimeoutPolicy {
        TimeoutPolicy::new(TimeoutConfig {
            strategy,
            ..Default::default()
        })
    }
    fn second() -> Duration {
        Duration::from_secs(1)
    }

    #[test]
    fn test_retry_backoff_makes_three_attempts() {
        let mut policy = policy(TimeoutStrategy::RetryBackoff);
        assert_eq!(policy.config().auto_retry_count, 2);
        // The first attempt is the original wait; each Retry is another one.
        let mut attempts = 1;
        loop {
            match policy.on_timeout(BlockKind::Wait, second()) {
                TimeoutOutcome::Retry => attempts += 1,
                outcome => {
                    assert_eq!(outcome, TimeoutOutcome::Pause);
                    break;
                }
            }
        }
        assert_eq!(attempts, 3);
        assert_eq!(policy.stats().retry_count, 2);
        assert_eq!(policy.stats().total_timeouts, 3);
    }
    #[test]
    fn test_success_resets_retries() {
        let mut policy = policy(TimeoutStrategy::RetryBackoff);
        assert_eq!(policy.on_timeout(BlockKind::Wait, second()), TimeoutOutcome::Retry);
        policy.on_success(BlockKind::Wait, second());
        assert_eq!(policy.on_timeout(BlockKind::Wait, second()), TimeoutOutcome::Retry);
        assert_eq!(policy.on_timeout(BlockKind::Wait, second()), TimeoutOutcome::Retry);
        assert_eq!(policy.on_timeout(BlockKind::Wait, second()), TimeoutOutcome::Pause);
    }
    #[test]
    fn test_skip_continue_escalates_at_twice_the_warning_threshold() {
        let mut policy = policy(TimeoutStrategy::SkipContinue);
        let outcomes: Vec<_> = (0..6).map(|_| policy.on_timeout(BlockKind::Detect, second())).collect();
        assert_eq!(&outcomes[..5], &[TimeoutOutcome::Continue; 5]);
        assert_eq!(outcomes[5], TimeoutOutcome::Pause);
    }
    #[test]
    fn test_other_strategies() {
        assert_eq!(
            policy(TimeoutStrategy::PauseSystem).on_timeout(BlockKind::Wait, second()),
            TimeoutOutcome::Pause
        );
        assert_eq!(
            policy(TimeoutStrategy::AbortReset).on_timeout(BlockKind::Wait, second()),
            TimeoutOutcome::AbortAndReset
        );
    }
    #[test]
    fn test_success_rate() {
        let mut policy = policy(TimeoutStrategy::SkipContinue);
        assert_eq!(policy.stats().success_rate(), None);
        policy.on_success(BlockKind::Wait, second());
        policy.on_success(BlockKind::Wait, second());
        policy.on_success(BlockKind::Wait, second());
        policy.on_timeout(BlockKind::Wait, second());
        assert_eq!(policy.stats().success_rate(), Some(0.75));
        assert_eq!(policy.stats().total_wait_ms, 4000);
        policy.apply(AdminCommand::ResetStats).unwrap();
        assert_eq!(policy.stats(), &TimeoutStats::default());
    }
    #[test]
    fn test_admin_commands() {
        let mut policy = policy(TimeoutStrategy::SkipContinue);
        policy.apply(AdminCommand::Set(ConfigField::MaxWait, 5000)).unwrap();
        policy.apply(AdminCommand::Set(ConfigField::Strategy, 3)).unwrap();
        policy.apply(AdminCommand::Set(ConfigField::Retry, 4)).unwrap();
        assert_eq!(policy.max_wait(), Duration::from_secs(5));
        assert_eq!(policy.config().strategy, TimeoutStrategy::RetryBackoff);
        assert_eq!(policy.config().auto_retry_count, 4);
        assert!(policy.apply(AdminCommand::Set(ConfigField::Strategy, 9)).is_err());
        assert!(policy.apply(AdminCommand::Set(ConfigField::Save, 2)).is_err());
        assert!(policy.apply(AdminCommand::Set(ConfigField::MaxWait, 0)).is_err());
    }
    #[test]
    fn test_config_file_format() {
        let json = serde_json::to_value(TimeoutConfig::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "maxWaitTime": 30000,
                "strategy": 0,
                "maxTimeoutWarning": 3,
                "autoRetryCount": 2,
                "saveToFile": false
            })
        );
        assert!(serde_json::from_str::<TimeoutConfig>(
            r#"{"maxWaitTime":1,"strategy":7,"maxTimeoutWarning":1,"autoRetryCount":1,"saveToFile":true}"#
        )
        .is_err());
    }
    #[test]
    fn test_saved_config_survives_reload() {
        let dir = TempDir::new("policy").unwrap();
        let path = dir.path().join("timeout.json");
        {
            let mut policy = TimeoutPolicy::load(path.clone()).unwrap();
            policy.apply(AdminCommand::Set(ConfigField::MaxWait, 1234)).unwrap();
            assert!(!path.exists());
            policy.apply(AdminCommand::Set(ConfigField::Save, 1)).unwrap();
            assert!(path.exists());
        }
        let policy = TimeoutPolicy::load(path).unwrap();
        assert_eq!(policy.config().max_wait_time, 1234);
        assert!(policy.config().save_to_file);
    }
}
