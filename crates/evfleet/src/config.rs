use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use fleet_core::{CurrentLimits, Strategy};
use fleet_engine::EngineSettings;
use fleet_engine::persistence::DEFAULT_PERSISTENCE_PATH;
use fleet_engine::protocol::MAX_CHUNK_PAYLOAD;
use fleet_engine::scheduler::SchedulerSettings;
use fleet_engine::session::{FirmwareSettings, SessionSettings};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FIRMWARE_DIR: &str = "./data/firmware";

/// Service configuration, read from a JSON file. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub station_listen_addr: SocketAddr,
    pub http_listen_addr: SocketAddr,
    /// Shared ceiling in amps
    pub capacity_amps: u32,
    pub min_charging_amps: u32,
    pub station_max_amps: u32,
    pub tick_interval_secs: u64,
    pub telemetry_timeout_secs: u64,
    pub hello_timeout_secs: u64,
    pub lock_timeout_ms: u64,
    pub price_timeout_ms: u64,
    pub command_ack_timeout_ms: u64,
    pub command_retries: u32,
    pub firmware: FirmwareConfig,
    pub strategy: Strategy,
    pub persistence_path: PathBuf,
    /// Without pricing every instant is favorable.
    pub pricing: Option<PricingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FirmwareConfig {
    pub chunk_size: usize,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub store_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PricingConfig {
    pub price_file: PathBuf,
    #[serde(default)]
    pub skip_percent_expensive_hours: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let limits = CurrentLimits::default();
        let session = SessionSettings::default();
        let scheduler = SchedulerSettings::default();
        ServiceConfig {
            station_listen_addr: SocketAddr::from(([0, 0, 0, 0], 9091)),
            http_listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            capacity_amps: limits.capacity_amps,
            min_charging_amps: limits.min_charging_amps,
            station_max_amps: limits.station_max_amps,
            tick_interval_secs: scheduler.tick_interval.as_secs(),
            telemetry_timeout_secs: session.telemetry_timeout.as_secs(),
            hello_timeout_secs: session.hello_timeout.as_secs(),
            lock_timeout_ms: millis(scheduler.lock_timeout),
            price_timeout_ms: millis(scheduler.price_timeout),
            command_ack_timeout_ms: millis(session.command_ack_timeout),
            command_retries: session.command_retries,
            firmware: FirmwareConfig::default(),
            strategy: Strategy::default(),
            persistence_path: PathBuf::from(DEFAULT_PERSISTENCE_PATH),
            pricing: None,
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        let firmware = FirmwareSettings::default();
        FirmwareConfig {
            chunk_size: firmware.chunk_size,
            ack_timeout_ms: millis(firmware.ack_timeout),
            max_retries: firmware.max_retries,
            store_dir: PathBuf::from(DEFAULT_FIRMWARE_DIR),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ServiceConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: ServiceConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.capacity_amps > 0, "capacityAmps must be positive");
        ensure!(
            self.min_charging_amps > 0 && self.min_charging_amps <= self.station_max_amps,
            "minChargingAmps must lie in 1..=stationMaxAmps ({})",
            self.station_max_amps
        );
        // SetCurrent carries the amps in a single byte
        ensure!(
            self.station_max_amps <= u32::from(u8::MAX),
            "stationMaxAmps must not exceed {}",
            u8::MAX
        );
        ensure!(self.tick_interval_secs > 0, "tickIntervalSecs must be positive");
        ensure!(
            self.telemetry_timeout_secs > 0 && self.hello_timeout_secs > 0,
            "telemetryTimeoutSecs and helloTimeoutSecs must be positive"
        );
        if self.firmware.chunk_size == 0 || self.firmware.chunk_size > MAX_CHUNK_PAYLOAD {
            bail!(
                "firmware.chunkSize must lie in 1..={}, got {}",
                MAX_CHUNK_PAYLOAD,
                self.firmware.chunk_size
            );
        }
        if let Some(pricing) = &self.pricing {
            ensure!(
                pricing.skip_percent_expensive_hours <= 100,
                "pricing.skipPercentExpensiveHours must lie in 0..=100"
            );
        }
        Ok(())
    }

    pub fn limits(&self) -> CurrentLimits {
        CurrentLimits {
            capacity_amps: self.capacity_amps,
            min_charging_amps: self.min_charging_amps,
            station_max_amps: self.station_max_amps,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let telemetry_timeout = Duration::from_secs(self.telemetry_timeout_secs);
        EngineSettings {
            limits: self.limits(),
            strategy: self.strategy,
            session: SessionSettings {
                hello_timeout: Duration::from_secs(self.hello_timeout_secs),
                telemetry_timeout,
                command_ack_timeout: Duration::from_millis(self.command_ack_timeout_ms),
                command_retries: self.command_retries,
            },
            scheduler: SchedulerSettings {
                tick_interval: Duration::from_secs(self.tick_interval_secs),
                lock_timeout: Duration::from_millis(self.lock_timeout_ms),
                price_timeout: Duration::from_millis(self.price_timeout_ms),
                telemetry_timeout,
            },
            firmware: FirmwareSettings {
                chunk_size: self.firmware.chunk_size,
                ack_timeout: Duration::from_millis(self.firmware.ack_timeout_ms),
                max_retries: self.firmware.max_retries,
            },
        }
    }
}
