//! # config
//!
//! why: hold the timing knobs of a raft node in one serializable place
//! relations: read by node.rs (election window) and raft-node (tickers, rpc timeout)
//! what: RaftConfig with defaults, json loading and validation

use crate::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// timing configuration, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// leader heartbeat period
    pub heartbeat_interval: u64,
    /// apply pipeline polling period
    pub apply_interval: u64,
    /// deadline for a single outbound rpc
    pub rpc_timeout: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 300,
            election_timeout_max: 500,
            heartbeat_interval: 25,
            apply_interval: 10,
            rpc_timeout: 100,
        }
    }
}

impl RaftConfig {
    /// parse a (possibly partial) json document and validate it
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("election_timeout_min", self.election_timeout_min),
            ("election_timeout_max", self.election_timeout_max),
            ("heartbeat_interval", self.heartbeat_interval),
            ("apply_interval", self.apply_interval),
            ("rpc_timeout", self.rpc_timeout),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::InvertedElectionWindow {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election_min: self.election_timeout_min,
            });
        }
        Ok(())
    }

    /// draw a fresh election timeout, uniformly from the configured window
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn apply_period(&self) -> Duration {
        Duration::from_millis(self.apply_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(RaftConfig::default().validate(), Ok(()));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = RaftConfig::from_json(r#"{"heartbeat_interval": 40}"#).unwrap();
        assert_eq!(config.heartbeat_interval, 40);
        assert_eq!(config.election_timeout_min, 300);
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = RaftConfig::from_json(r#"{"election_timeout_min": 600}"#).unwrap_err();
        assert_eq!(err, ConfigError::InvertedElectionWindow { min: 600, max: 500 });
    }

    #[test]
    fn random_timeout_stays_in_window() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let t = config.random_election_timeout().as_millis() as u64;
            assert!((300..=500).contains(&t));
        }
    }
}
