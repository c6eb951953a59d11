//! Load-sharing control loop.
//!
//! Each tick snapshots the online stations, asks the price gate at most once,
//! plans the allocation, records it, and sends the commands that changed.
//! A failed tick leaves the previous decisions in force.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_core::price::{PriceError, PriceGate, PriceVerdict};
use fleet_core::{
    AllocationDecision, AllocationStrategy, FleetEvent, StationDemand, needs_price_verdict,
    plan_allocation,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::EventFanout;
use crate::registry::{FleetRegistry, RegistryError, ScheduledStation};
use crate::session::SessionError;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub lock_timeout: Duration,
    pub price_timeout: Duration,
    pub telemetry_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            tick_interval: Duration::from_secs(5),
            lock_timeout: Duration::from_millis(500),
            price_timeout: Duration::from_secs(2),
            telemetry_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Tick skipped: {0}")]
    Registry(#[from] RegistryError),
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub decisions: Vec<AllocationDecision>,
    pub commands_sent: usize,
}

pub struct LoadSharingScheduler {
    registry: Arc<FleetRegistry>,
    events: Arc<EventFanout>,
    price_gate: Arc<dyn PriceGate>,
    strategy: Box<dyn AllocationStrategy>,
    settings: SchedulerSettings,
    kick: Notify,
    /// Last current sent to each station, with the session it went to.
    applied: Mutex<HashMap<String, (Uuid, u32)>>,
}

impl LoadSharingScheduler {
    pub fn new(
        registry: Arc<FleetRegistry>,
        events: Arc<EventFanout>,
        price_gate: Arc<dyn PriceGate>,
        strategy: Box<dyn AllocationStrategy>,
        settings: SchedulerSettings,
    ) -> Self {
        LoadSharingScheduler {
            registry,
            events,
            price_gate,
            strategy,
            settings,
            kick: Notify::new(),
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Run a tick now instead of waiting for the interval.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut ticker = interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Load-sharing scheduler started, ticking every {:?}",
            self.settings.tick_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.kick.notified() => debug!("Out-of-band tick"),
                _ = shutdown.wait() => break,
            }
            if let Err(e) = self.tick().await {
                warn!("{}", e);
            }
        }
        info!("Load-sharing scheduler stopped");
    }

    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let stations = self
            .registry
            .scheduling_inputs(self.settings.lock_timeout, self.settings.telemetry_timeout)?;
        let demands: Vec<StationDemand> = stations.iter().map(|s| s.demand.clone()).collect();

        let verdict = if needs_price_verdict(&demands) {
            Some(self.price_verdict().await)
        } else {
            None
        };
        let decisions = plan_allocation(
            &demands,
            verdict.as_ref(),
            self.strategy.as_ref(),
            self.registry.limits(),
        );

        for decision in self
            .registry
            .record_decisions(&decisions, self.settings.lock_timeout)?
        {
            info!(
                "Station {} now gets {}A ({:?})",
                decision.station_id, decision.target_amps, decision.reason
            );
            self.events.publish(FleetEvent::DecisionChanged { decision });
        }

        let commands_sent = self.apply(&stations, &decisions);
        debug!(
            "Tick planned {} stations, sent {} commands",
            decisions.len(),
            commands_sent
        );
        Ok(TickReport {
            decisions,
            commands_sent,
        })
    }

    async fn price_verdict(&self) -> PriceVerdict {
        let query = async {
            let favorable = self.price_gate.is_price_currently_favorable().await?;
            let next = if favorable {
                None
            } else {
                self.price_gate.next_favorable_instant().await?
            };
            Ok::<_, PriceError>(PriceVerdict::from_answers(
                favorable,
                next,
                Utc::now(),
            ))
        };
        match timeout(self.settings.price_timeout, query).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!("Price gate failed, holding previous decisions: {}", e);
                PriceVerdict::Unavailable
            }
            Err(_) => {
                warn!(
                    "Price gate did not answer within {:?}, holding previous decisions",
                    self.settings.price_timeout
                );
                PriceVerdict::Unavailable
            }
        }
    }

    /// Send the decisions which differ from what each session was last told.
    ///
    /// Reductions go out first so the shared capacity is never exceeded in
    /// between, then increases from the highest priority down.
    fn apply(&self, stations: &[ScheduledStation], decisions: &[AllocationDecision]) -> usize {
        let mut applied = self.applied.lock();
        applied.retain(|station_id, _| {
            stations
                .iter()
                .any(|station| &station.demand.station_id == station_id)
        });

        let mut reductions = Vec::new();
        let mut increases = Vec::new();
        for station in stations {
            let Some(decision) = decisions
                .iter()
                .find(|d| d.station_id == station.demand.station_id)
            else {
                continue;
            };
            let session_id = station.session.session_id();
            let previous = applied
                .get(&decision.station_id)
                .filter(|(id, _)| *id == session_id)
                .map(|(_, amps)| *amps);
            let target = decision.target_amps;
            match previous {
                Some(amps) if amps == target => {}
                Some(amps) if target < amps => reductions.push(station),
                None if target == 0 => reductions.push(station),
                _ => increases.push(station),
            }
        }
        increases.sort_by(|a, b| {
            (a.demand.config.load_sharing_priority, &a.demand.station_id)
                .cmp(&(b.demand.config.load_sharing_priority, &b.demand.station_id))
        });

        let mut sent = 0;
        for station in reductions.into_iter().chain(increases) {
            let station_id = &station.demand.station_id;
            let Some(target) = decisions
                .iter()
                .find(|d| &d.station_id == station_id)
                .map(|d| d.target_amps)
            else {
                continue;
            };
            match station.session.set_current(target) {
                Ok(()) => {
                    applied.insert(station_id.clone(), (station.session.session_id(), target));
                    sent += 1;
                }
                Err(SessionError::FirmwareTransferInProgress { .. }) => {
                    debug!("Firmware transfer to {} running, retrying next tick", station_id)
                }
                Err(e) => warn!("Could not send {}A to {}: {}", target, station_id, e),
            }
        }
        sent
    }
}
