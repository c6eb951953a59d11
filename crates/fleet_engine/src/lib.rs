//! Fleet engine
//!
//! Runtime side of the EV charging fleet controller: the station wire
//! protocol and sessions, the Fleet Registry, the load-sharing scheduler and
//! the event fan-out, tied together by [`Engine`].

pub mod events;
pub mod firmware;
pub mod persistence;
pub mod pricing;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod shutdown;

use std::sync::Arc;

use fleet_core::price::PriceGate;
use fleet_core::{
    ChargingMode, ConfigMutation, CurrentLimits, EventMessage, FleetEvent, FleetSnapshot,
    StationConfig, Strategy,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::EventFanout;
use crate::firmware::{FirmwareError, FirmwareStore};
use crate::registry::{FleetRegistry, RegistryError};
use crate::scheduler::{LoadSharingScheduler, SchedulerSettings};
use crate::server::StationServer;
use crate::session::{FirmwareSettings, SessionError, SessionSettings};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub limits: CurrentLimits,
    pub strategy: Strategy,
    pub session: SessionSettings,
    pub scheduler: SchedulerSettings,
    pub firmware: FirmwareSettings,
}

#[derive(Error, Debug)]
pub enum FirmwarePushError {
    #[error("Unknown station {station_id}")]
    UnknownStation { station_id: String },
    #[error("Station {station_id} is not connected")]
    NotConnected { station_id: String },
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Entry point for operator commands.
pub struct Engine {
    registry: Arc<FleetRegistry>,
    events: Arc<EventFanout>,
    scheduler: Arc<LoadSharingScheduler>,
    firmware_store: Arc<dyn FirmwareStore>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        registry: Arc<FleetRegistry>,
        price_gate: Arc<dyn PriceGate>,
        firmware_store: Arc<dyn FirmwareStore>,
        settings: EngineSettings,
    ) -> Self {
        let events = Arc::new(EventFanout::new());
        let scheduler = Arc::new(LoadSharingScheduler::new(
            registry.clone(),
            events.clone(),
            price_gate,
            Box::new(settings.strategy),
            settings.scheduler,
        ));
        Engine {
            registry,
            events,
            scheduler,
            firmware_store,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<LoadSharingScheduler> {
        &self.scheduler
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn spawn_scheduler(&self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.scheduler.clone().run(shutdown))
    }

    pub async fn bind_station_server(
        &self,
        addr: impl tokio::net::ToSocketAddrs,
    ) -> std::io::Result<StationServer> {
        StationServer::bind(
            addr,
            self.registry.clone(),
            self.events.clone(),
            self.settings.session,
        )
        .await
    }

    pub fn list_stations(&self) -> FleetSnapshot {
        self.registry.snapshot(self.settings.scheduler.telemetry_timeout)
    }

    pub fn set_mode(
        &self,
        station_id: &str,
        mode: ChargingMode,
    ) -> Result<StationConfig, RegistryError> {
        self.mutate(station_id, ConfigMutation::Mode(mode))
    }

    pub fn set_priority(
        &self,
        station_id: &str,
        priority: u8,
    ) -> Result<StationConfig, RegistryError> {
        self.mutate(station_id, ConfigMutation::Priority(priority))
    }

    pub fn set_rate_limit(
        &self,
        station_id: &str,
        amps: u32,
    ) -> Result<StationConfig, RegistryError> {
        self.mutate(station_id, ConfigMutation::RateLimit(amps))
    }

    /// Persist the mutation, tell listeners right away and re-plan.
    fn mutate(
        &self,
        station_id: &str,
        mutation: ConfigMutation,
    ) -> Result<StationConfig, RegistryError> {
        let config = self.registry.update_config(station_id, mutation)?;
        self.events.publish(FleetEvent::ConfigChanged {
            station_id: station_id.to_string(),
            config: config.clone(),
        });
        self.scheduler.kick();
        Ok(config)
    }

    pub fn add_listener(&self, subscription_id: &str) -> mpsc::Receiver<EventMessage> {
        self.events.add_listener(subscription_id)
    }

    pub fn remove_listener(&self, subscription_id: &str) -> bool {
        self.events.remove_listener(subscription_id)
    }

    /// Detach every listener so their streams end.
    pub fn close_listeners(&self) {
        self.events.remove_all_listeners();
    }

    /// Store an image and return its version.
    pub async fn store_firmware(&self, image: Vec<u8>) -> Result<String, FirmwareError> {
        self.firmware_store.put(image).await
    }

    /// Send a stored firmware version to a connected station.
    pub async fn push_firmware(
        &self,
        station_id: &str,
        version: &str,
    ) -> Result<(), FirmwarePushError> {
        if !self.registry.contains(station_id) {
            return Err(FirmwarePushError::UnknownStation {
                station_id: station_id.to_string(),
            });
        }
        let image = self.firmware_store.get(version).await?;
        let session = self
            .registry
            .session(station_id)
            .ok_or_else(|| FirmwarePushError::NotConnected {
                station_id: station_id.to_string(),
            })?;

        info!("Pushing firmware {} to {}", version, station_id);
        let result = session.upload_firmware(&image, &self.settings.firmware).await;
        if let Err(SessionError::FirmwareTransferInProgress { .. }) = result {
            return result.map_err(FirmwarePushError::from);
        }
        if let Err(e) = &result {
            warn!("Firmware {} to {} failed: {}", version, station_id, e);
        }
        self.events.publish(FleetEvent::FirmwareTransferFinished {
            station_id: station_id.to_string(),
            version: version.to_string(),
            success: result.is_ok(),
            message: result.as_ref().err().map(ToString::to_string),
        });
        result.map_err(FirmwarePushError::from)
    }

    /// Close every open station session.
    pub fn close_sessions(&self) {
        for session in self.registry.sessions() {
            session.close();
        }
    }
}
