use rand::Rng;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "election timeout window is empty: min {min:?} must be below max {max:?}"
    )]
    EmptyElectionWindow { min: Duration, max: Duration },

    #[error(
        "heartbeat interval {heartbeat:?} must be below the minimum election timeout {min:?}"
    )]
    HeartbeatTooSlow { heartbeat: Duration, min: Duration },

    #[error("max_entries_per_rpc must be at least 1")]
    EmptyBatch,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub rpc_timeout: Duration,
    pub max_entries_per_rpc: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(100),
            max_entries_per_rpc: 128,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::EmptyElectionWindow {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        if self.max_entries_per_rpc == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        Ok(())
    }

    /// Draws a fresh election timeout uniformly from the configured window.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        if min >= max {
            return self.election_timeout_min;
        }
        Duration::from_millis(rand::rng().random_range(min..max))
    }
}
