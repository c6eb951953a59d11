//! Fleet core
//!
//! Data model, configuration rules and load-sharing algorithms of the EV
//! charging fleet controller. Nothing in here performs I/O.

mod allocator;
mod load_sharing;
mod models;
pub mod price;

pub use crate::allocator::*;
pub use crate::load_sharing::*;
pub use crate::models::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest load-sharing priority.
pub const MIN_PRIORITY: u8 = 1;
/// Lowest load-sharing priority.
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Priority {priority} is outside 1..=10")]
    PriorityOutOfRange { priority: u8 },
    #[error("Charge rate limit {amps}A is outside {min}..={max}A")]
    RateLimitOutOfRange { amps: u32, min: u32, max: u32 },
}

/// Electrical limits shared by the whole fleet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentLimits {
    /// Shared ceiling, e.g. the main fuse.
    pub capacity_amps: u32,
    /// Lowest non-zero current a vehicle accepts.
    pub min_charging_amps: u32,
    pub station_max_amps: u32,
}

impl Default for CurrentLimits {
    fn default() -> Self {
        CurrentLimits {
            capacity_amps: 32,
            min_charging_amps: 6,
            station_max_amps: 32,
        }
    }
}

/// An operator change to a station configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMutation {
    Mode(ChargingMode),
    Priority(u8),
    RateLimit(u32),
}

impl StationConfig {
    /// Configuration given to a station on first contact.
    pub fn initial(limits: &CurrentLimits) -> Self {
        StationConfig {
            mode: ChargingMode::Off,
            load_sharing_priority: DEFAULT_PRIORITY,
            charge_rate_limit_amps: limits.station_max_amps,
        }
    }

    /// Return the configuration with `mutation` applied, leaving `self` untouched.
    pub fn apply(
        &self,
        mutation: ConfigMutation,
        limits: &CurrentLimits,
    ) -> Result<StationConfig, ConfigError> {
        let mut next = self.clone();
        match mutation {
            ConfigMutation::Mode(mode) => next.mode = mode,
            ConfigMutation::Priority(priority) => {
                if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                    return Err(ConfigError::PriorityOutOfRange { priority });
                }
                next.load_sharing_priority = priority;
            }
            ConfigMutation::RateLimit(amps) => {
                if !(limits.min_charging_amps..=limits.station_max_amps).contains(&amps) {
                    return Err(ConfigError::RateLimitOutOfRange {
                        amps,
                        min: limits.min_charging_amps,
                        max: limits.station_max_amps,
                    });
                }
                next.charge_rate_limit_amps = amps;
            }
        }
        Ok(next)
    }
}
