//! Peer configuration.
//!
//! All intervals are stored in milliseconds so the struct maps one-to-one onto
//! the JSON config file the daemon reads.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Channel name cannot be empty")]
    EmptyChannel,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("Stale threshold ({stale_ms}ms) must exceed heartbeat interval ({heartbeat_ms}ms)")]
    StaleNotAboveHeartbeat { stale_ms: u64, heartbeat_ms: u64 },
    #[error("{field} must not exceed {max_ms}ms")]
    IntervalTooLarge { field: &'static str, max_ms: u64 },
}

/// Upper bound on every interval; timer deadlines are computed from these.
pub const MAX_INTERVAL_MS: u64 = 86_400_000;

/// Configuration for a beacon peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconConfig {
    /// Logical namespace; peers only see others on the same channel
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    /// How often to broadcast a heartbeat (default: 1s)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// How often to sweep stale peers and check for a leader (default: 1.5s)
    #[serde(default = "default_leader_check_interval")]
    pub leader_check_interval_ms: u64,

    /// Silence after which a peer is evicted (default: 3s)
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_ms: u64,

    /// Delay between the bootstrap status request and our announce (default: 100ms)
    #[serde(default = "default_announce_delay")]
    pub announce_delay_ms: u64,

    /// Delay before the first election after startup (default: 500ms)
    #[serde(default = "default_initial_election_delay")]
    pub initial_election_delay_ms: u64,
}

fn default_channel_name() -> String {
    "beacon".to_string()
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_leader_check_interval() -> u64 {
    1500
}

fn default_stale_threshold() -> u64 {
    3000
}

fn default_announce_delay() -> u64 {
    100
}

fn default_initial_election_delay() -> u64 {
    500
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            channel_name: default_channel_name(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            leader_check_interval_ms: default_leader_check_interval(),
            stale_threshold_ms: default_stale_threshold(),
            announce_delay_ms: default_announce_delay(),
            initial_election_delay_ms: default_initial_election_delay(),
        }
    }
}

impl BeaconConfig {
    /// Create a config for the given channel with default timings.
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            ..Self::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_leader_check_interval(mut self, interval: Duration) -> Self {
        self.leader_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_announce_delay(mut self, delay: Duration) -> Self {
        self.announce_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_initial_election_delay(mut self, delay: Duration) -> Self {
        self.initial_election_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn leader_check_interval(&self) -> Duration {
        Duration::from_millis(self.leader_check_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn announce_delay(&self) -> Duration {
        Duration::from_millis(self.announce_delay_ms)
    }

    pub fn initial_election_delay(&self) -> Duration {
        Duration::from_millis(self.initial_election_delay_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_name.trim().is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("heartbeatIntervalMs"));
        }
        if self.leader_check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("leaderCheckIntervalMs"));
        }
        for (field, value) in [
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("leaderCheckIntervalMs", self.leader_check_interval_ms),
            ("staleThresholdMs", self.stale_threshold_ms),
            ("announceDelayMs", self.announce_delay_ms),
            ("initialElectionDelayMs", self.initial_election_delay_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(ConfigError::IntervalTooLarge {
                    field,
                    max_ms: MAX_INTERVAL_MS,
                });
            }
        }
        if self.stale_threshold_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::StaleNotAboveHeartbeat {
                stale_ms: self.stale_threshold_ms,
                heartbeat_ms: self.heartbeat_interval_ms,
            });
        }
        if self.stale_threshold_ms < self.heartbeat_interval_ms.saturating_mul(3) {
            tracing::warn!(
                "Stale threshold {}ms is under 3x the heartbeat interval {}ms; expect false evictions",
                self.stale_threshold_ms,
                self.heartbeat_interval_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BeaconConfig::default();
        assert_eq!(config.channel_name, "beacon");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.leader_check_interval(), Duration::from_millis(1500));
        assert_eq!(config.stale_threshold(), Duration::from_secs(3));
        assert_eq!(config.announce_delay(), Duration::from_millis(100));
        assert_eq!(config.initial_election_delay(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = BeaconConfig::new("jobs")
            .with_heartbeat_interval(Duration::from_millis(200))
            .with_stale_threshold(Duration::from_millis(900));
        assert_eq!(config.channel_name, "jobs");
        assert_eq!(config.heartbeat_interval_ms, 200);
        assert_eq!(config.stale_threshold_ms, 900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_channel_rejected() {
        let config = BeaconConfig::new("  ");
        assert_eq!(config.validate(), Err(ConfigError::EmptyChannel));
    }

    #[test]
    fn test_stale_must_exceed_heartbeat() {
        let config = BeaconConfig::default()
            .with_heartbeat_interval(Duration::from_secs(2))
            .with_stale_threshold(Duration::from_secs(2));
        assert_eq!(
            config.validate(),
            Err(ConfigError::StaleNotAboveHeartbeat {
                stale_ms: 2000,
                heartbeat_ms: 2000
            })
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = BeaconConfig::default().with_leader_check_interval(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("leaderCheckIntervalMs"))
        );
    }

    #[test]
    fn test_huge_interval_rejected() {
        let config: BeaconConfig =
            serde_json::from_str(r#"{"initialElectionDelayMs":18446744073709551615}"#).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::IntervalTooLarge {
                field: "initialElectionDelayMs",
                max_ms: MAX_INTERVAL_MS
            })
        );
    }

    #[test]
    fn test_huge_heartbeat_does_not_overflow() {
        let config = BeaconConfig {
            heartbeat_interval_ms: u64::MAX / 2,
            stale_threshold_ms: u64::MAX,
            ..BeaconConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IntervalTooLarge { .. })
        ));

        let config = BeaconConfig::default()
            .with_heartbeat_interval(Duration::from_millis(MAX_INTERVAL_MS - 1))
            .with_stale_threshold(Duration::from_millis(MAX_INTERVAL_MS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: BeaconConfig =
            serde_json::from_str(r#"{"channelName":"ops","staleThresholdMs":5000}"#).unwrap();
        assert_eq!(config.channel_name, "ops");
        assert_eq!(config.stale_threshold_ms, 5000);
        assert_eq!(config.heartbeat_interval_ms, 1000);
    }
}
