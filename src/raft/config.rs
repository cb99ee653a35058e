//! Raft timing configuration

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing parameters of a replica.
///
/// The follower timeout must dominate the heartbeat interval by a wide
/// margin, and the candidate timeout must dominate the follower timeout, or
/// elections thrash. The defaults satisfy both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Tick period of the election, replication, and apply loops in
    /// milliseconds
    pub tick_interval_ms: u64,

    /// Heartbeat period of the leader in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Minimum follower election timeout in milliseconds (inclusive)
    pub follower_timeout_min_ms: u64,

    /// Maximum follower election timeout in milliseconds (inclusive)
    pub follower_timeout_max_ms: u64,

    /// Minimum candidate re-election timeout in milliseconds (inclusive)
    pub candidate_timeout_min_ms: u64,

    /// Maximum candidate re-election timeout in milliseconds (inclusive)
    pub candidate_timeout_max_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            heartbeat_interval_ms: 150,
            follower_timeout_min_ms: 300,
            follower_timeout_max_ms: 500,
            candidate_timeout_min_ms: 800,
            candidate_timeout_max_ms: 1000,
        }
    }
}

impl RaftConfig {
    /// Tick period as a Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Heartbeat period as a Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Draw a fresh follower timeout, uniform over the configured range.
    ///
    /// Each replica draws from its own RNG; sharing one across in-process
    /// replicas correlates their timeouts and defeats split-vote avoidance.
    pub fn draw_follower_timeout<R: Rng>(&self, rng: &mut R) -> Duration {
        let ms = rng.gen_range(self.follower_timeout_min_ms..=self.follower_timeout_max_ms);
        Duration::from_millis(ms)
    }

    /// Draw a fresh candidate timeout, uniform over the configured range.
    pub fn draw_candidate_timeout<R: Rng>(&self, rng: &mut R) -> Duration {
        let ms = rng.gen_range(self.candidate_timeout_min_ms..=self.candidate_timeout_max_ms);
        Duration::from_millis(ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::raft::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(crate::raft::RaftError::Config(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.follower_timeout_min_ms > self.follower_timeout_max_ms {
            return Err(crate::raft::RaftError::Config(
                "follower timeout range is inverted".to_string(),
            ));
        }

        if self.candidate_timeout_min_ms > self.candidate_timeout_max_ms {
            return Err(crate::raft::RaftError::Config(
                "candidate timeout range is inverted".to_string(),
            ));
        }

        if self.heartbeat_interval_ms >= self.follower_timeout_min_ms {
            return Err(crate::raft::RaftError::Config(
                "heartbeat_interval_ms must be less than follower_timeout_min_ms".to_string(),
            ));
        }

        Ok(())
    }
}
