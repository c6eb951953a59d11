use std::sync::Arc;

use anyhow::Context;
use fleet_core::price::{AlwaysFavorable, PriceGate};
use fleet_engine::Engine;
use fleet_engine::firmware::DirectoryFirmwareStore;
use fleet_engine::persistence::JsonFileStore;
use fleet_engine::pricing::{CheapHoursPriceGate, JsonFilePriceSource};
use fleet_engine::registry::FleetRegistry;

use crate::config::ServiceConfig;

/// Everything the process runs on, built from the service configuration.
pub struct AppState {
    pub config: ServiceConfig,
    pub engine: Arc<Engine>,
}

impl AppState {
    /// Opens persistence and wires the engine. Fails only on unrecoverable
    /// startup errors.
    pub fn new(config: ServiceConfig) -> anyhow::Result<Self> {
        let store = JsonFileStore::open(&config.persistence_path).with_context(|| {
            format!(
                "Failed to open persistence at '{}'",
                config.persistence_path.display()
            )
        })?;
        let registry = FleetRegistry::open(Arc::new(store), config.limits())
            .context("Failed to load station configurations")?;

        let price_gate: Arc<dyn PriceGate> = match &config.pricing {
            Some(pricing) => {
                tracing::info!(
                    "Charging during cheap hours from {}, skipping the {}% most expensive",
                    pricing.price_file.display(),
                    pricing.skip_percent_expensive_hours
                );
                Arc::new(CheapHoursPriceGate::new(
                    JsonFilePriceSource::new(&pricing.price_file),
                    pricing.skip_percent_expensive_hours,
                ))
            }
            None => {
                tracing::info!("No pricing configured, every hour counts as cheap");
                Arc::new(AlwaysFavorable)
            }
        };

        let firmware_store = DirectoryFirmwareStore::new(&config.firmware.store_dir);
        let engine = Engine::new(
            Arc::new(registry),
            price_gate,
            Arc::new(firmware_store),
            config.engine_settings(),
        );

        Ok(AppState {
            config,
            engine: Arc::new(engine),
        })
    }
}
