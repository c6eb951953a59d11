//! Fleet Registry: the single shared map of stations.
//!
//! Sessions write telemetry into it, operators write configuration, and the
//! scheduler reads both. Configuration outlives sessions; telemetry does not.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_core::{
    AllocationDecision, ChargingState, ConfigError, ConfigMutation, CurrentLimits, FleetSnapshot,
    StationConfig, StationDemand, StationView, Telemetry, TelemetrySnapshot, TelemetryTransition,
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::persistence::{KeyValueStore, PersistenceError};
use crate::session::SessionHandle;

const CONFIG_KEY_PREFIX: &str = "evCharging.station.";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown station {station_id}")]
    UnknownStation { station_id: String },
    #[error("Session {session_id} is no longer the session of {station_id}")]
    SessionSuperseded {
        station_id: String,
        session_id: Uuid,
    },
    #[error("Registry lock not acquired within {timeout:?}")]
    Busy { timeout: Duration },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

struct StationEntry {
    address: Option<String>,
    firmware_version: Option<String>,
    session: Option<SessionHandle>,
    telemetry: Option<TelemetrySnapshot>,
    last_seen: Option<Instant>,
    config: StationConfig,
    decision: Option<AllocationDecision>,
}

impl StationEntry {
    fn new(config: StationConfig) -> Self {
        StationEntry {
            address: None,
            firmware_version: None,
            session: None,
            telemetry: None,
            last_seen: None,
            config,
            decision: None,
        }
    }

    fn is_online(&self, now: Instant, telemetry_timeout: Duration) -> bool {
        self.session.is_some()
            && self
                .last_seen
                .is_some_and(|seen| now.duration_since(seen) < telemetry_timeout)
    }
}

/// An online station handed to a scheduler tick.
#[derive(Clone)]
pub struct ScheduledStation {
    pub demand: StationDemand,
    pub session: SessionHandle,
}

pub struct FleetRegistry {
    stations: RwLock<BTreeMap<String, StationEntry>>,
    store: Arc<dyn KeyValueStore>,
    limits: CurrentLimits,
    /// Serializes validate, persist and commit of config mutations.
    config_writes: Mutex<()>,
}

pub type SharedFleetRegistry = Arc<FleetRegistry>;

fn config_key(station_id: &str) -> String {
    format!("{CONFIG_KEY_PREFIX}{station_id}")
}

impl FleetRegistry {
    /// Open the registry with every configuration found in `store`.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        limits: CurrentLimits,
    ) -> Result<Self, RegistryError> {
        let mut stations = BTreeMap::new();
        for (key, value) in store.entries(CONFIG_KEY_PREFIX)? {
            let station_id = &key[CONFIG_KEY_PREFIX.len()..];
            match serde_json::from_value::<StationConfig>(value) {
                Ok(config) => {
                    stations.insert(station_id.to_string(), StationEntry::new(config));
                }
                Err(e) => warn!("Ignoring unreadable config of {}: {}", station_id, e),
            }
        }
        info!("Loaded {} station configurations", stations.len());
        Ok(FleetRegistry {
            stations: RwLock::new(stations),
            store,
            limits,
            config_writes: Mutex::new(()),
        })
    }

    pub fn limits(&self) -> &CurrentLimits {
        &self.limits
    }

    fn persist(&self, station_id: &str, config: &StationConfig) -> Result<(), PersistenceError> {
        let key = config_key(station_id);
        let value = serde_json::to_value(config).map_err(|source| PersistenceError::Encode {
            key: key.clone(),
            source,
        })?;
        self.store.put(&key, value)
    }

    /// Attach a freshly identified session, returning the one it supersedes.
    pub fn attach_session(
        &self,
        station_id: &str,
        firmware_version: &str,
        address: &str,
        session: SessionHandle,
    ) -> Option<SessionHandle> {
        // Held across the persist below so a concurrent update is not overwritten
        let _writing = self.config_writes.lock();
        let mut created = None;
        let superseded = {
            let mut stations = self.stations.write();
            let entry = stations.entry(station_id.to_string()).or_insert_with(|| {
                let config = StationConfig::initial(&self.limits);
                created = Some(config.clone());
                StationEntry::new(config)
            });
            entry.address = Some(address.to_string());
            entry.firmware_version = Some(firmware_version.to_string());
            entry.telemetry = None;
            entry.last_seen = None;
            entry.decision = None;
            entry.session.replace(session)
        };

        if let Some(config) = created {
            info!("First contact from {}, creating default config", station_id);
            if let Err(e) = self.persist(station_id, &config) {
                warn!("Could not persist default config of {}: {}", station_id, e);
            }
        }
        superseded
    }

    /// Detach `session_id` if it is still the session of the station.
    pub fn detach_session(&self, station_id: &str, session_id: Uuid) -> bool {
        let mut stations = self.stations.write();
        let Some(entry) = stations.get_mut(station_id) else {
            return false;
        };
        if entry
            .session
            .as_ref()
            .is_none_or(|session| session.session_id() != session_id)
        {
            return false;
        }
        entry.session = None;
        entry.telemetry = None;
        entry.last_seen = None;
        entry.decision = None;
        true
    }

    /// Replace the telemetry of a station and report a transition worth notifying.
    pub fn upsert_telemetry(
        &self,
        station_id: &str,
        session_id: Uuid,
        telemetry: Telemetry,
    ) -> Result<Option<TelemetryTransition>, RegistryError> {
        let mut stations = self.stations.write();
        let entry = stations
            .get_mut(station_id)
            .ok_or_else(|| RegistryError::UnknownStation {
                station_id: station_id.to_string(),
            })?;
        if entry
            .session
            .as_ref()
            .is_none_or(|session| session.session_id() != session_id)
        {
            return Err(RegistryError::SessionSuperseded {
                station_id: station_id.to_string(),
                session_id,
            });
        }

        let pilot_voltage = telemetry.pilot_voltage;
        let previous = entry.telemetry.as_ref().map(|t| t.data.pilot_voltage);
        let transition = match previous {
            _ if pilot_voltage.is_fault() && !previous.is_some_and(|p| p.is_fault()) => {
                Some(TelemetryTransition::Fault { pilot_voltage })
            }
            None => Some(TelemetryTransition::CameOnline),
            Some(from) if from != pilot_voltage => Some(TelemetryTransition::PilotChanged {
                from,
                to: pilot_voltage,
            }),
            Some(_) => None,
        };

        entry.telemetry = Some(TelemetrySnapshot {
            received_at: Utc::now(),
            data: telemetry,
        });
        entry.last_seen = Some(Instant::now());
        Ok(transition)
    }

    pub fn config(&self, station_id: &str) -> Result<StationConfig, RegistryError> {
        self.stations
            .read()
            .get(station_id)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| RegistryError::UnknownStation {
                station_id: station_id.to_string(),
            })
    }

    /// Validate, persist, then commit a config mutation.
    ///
    /// Nothing changes in memory unless the new config is durable.
    pub fn update_config(
        &self,
        station_id: &str,
        mutation: ConfigMutation,
    ) -> Result<StationConfig, RegistryError> {
        let _writing = self.config_writes.lock();
        let next = self.config(station_id)?.apply(mutation, &self.limits)?;
        self.persist(station_id, &next)?;

        let mut stations = self.stations.write();
        let entry = stations
            .get_mut(station_id)
            .ok_or_else(|| RegistryError::UnknownStation {
                station_id: station_id.to_string(),
            })?;
        entry.config = next.clone();
        info!("Config of {} is now {:?}", station_id, next);
        Ok(next)
    }

    /// Stations a tick should plan for, or `Busy` when the lock is contended.
    pub fn scheduling_inputs(
        &self,
        lock_timeout: Duration,
        telemetry_timeout: Duration,
    ) -> Result<Vec<ScheduledStation>, RegistryError> {
        let stations = self
            .stations
            .try_read_for(lock_timeout)
            .ok_or(RegistryError::Busy {
                timeout: lock_timeout,
            })?;
        let now = Instant::now();
        Ok(stations
            .iter()
            .filter(|(_, entry)| entry.is_online(now, telemetry_timeout))
            .filter_map(|(station_id, entry)| {
                let telemetry = entry.telemetry.as_ref()?;
                let session = entry.session.clone()?;
                Some(ScheduledStation {
                    demand: StationDemand {
                        station_id: station_id.clone(),
                        config: entry.config.clone(),
                        pilot_voltage: telemetry.data.pilot_voltage,
                        proximity_pilot_amps: telemetry.data.proximity_pilot_amps,
                        previous: entry.decision.clone(),
                    },
                    session,
                })
            })
            .collect())
    }

    /// Record the decisions of a tick, returning those which changed.
    pub fn record_decisions(
        &self,
        decisions: &[AllocationDecision],
        lock_timeout: Duration,
    ) -> Result<Vec<AllocationDecision>, RegistryError> {
        let mut stations = self
            .stations
            .try_write_for(lock_timeout)
            .ok_or(RegistryError::Busy {
                timeout: lock_timeout,
            })?;
        let mut changed = Vec::new();
        for decision in decisions {
            let Some(entry) = stations.get_mut(&decision.station_id) else {
                continue;
            };
            if entry.decision.as_ref() != Some(decision) {
                changed.push(decision.clone());
            }
            entry.decision = Some(decision.clone());
        }
        Ok(changed)
    }

    pub fn session(&self, station_id: &str) -> Option<SessionHandle> {
        self.stations
            .read()
            .get(station_id)
            .and_then(|entry| entry.session.clone())
    }

    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.stations
            .read()
            .values()
            .filter_map(|entry| entry.session.clone())
            .collect()
    }

    pub fn contains(&self, station_id: &str) -> bool {
        self.stations.read().contains_key(station_id)
    }

    pub fn snapshot(&self, telemetry_timeout: Duration) -> FleetSnapshot {
        let stations = self.stations.read();
        let now = Instant::now();
        FleetSnapshot {
            capacity_amps: self.limits.capacity_amps,
            stations: stations
                .iter()
                .map(|(station_id, entry)| {
                    let online = entry.is_online(now, telemetry_timeout);
                    let decision = if online { entry.decision.clone() } else { None };
                    StationView {
                        client_id: station_id.clone(),
                        address: entry.address.clone(),
                        firmware_version: entry.firmware_version.clone(),
                        online,
                        telemetry: entry.telemetry.clone(),
                        config: entry.config.clone(),
                        charging_state: ChargingState::derive(
                            entry.telemetry.as_ref().map(|t| &t.data),
                            decision.as_ref(),
                        ),
                        decision,
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persistence::{JsonFileStore, MemoryStore};
    use crate::session::SessionSettings;
    use fleet_core::{AllocationReason, ChargingMode, PilotVoltage, ProximityPilotAmps};
    use serde_json::Value;

    pub(crate) fn telemetry(pilot_voltage: PilotVoltage) -> Telemetry {
        Telemetry {
            charge_active: pilot_voltage == PilotVoltage::Volt6,
            duty_cycle: 53,
            pilot_voltage,
            proximity_pilot_amps: ProximityPilotAmps::Amp32,
            phase_millivolts: [230_000; 3],
            phase_milliamps: [0; 3],
            signal_strength_dbm: -60,
            health_counter: 1,
            diagnostics: Vec::new(),
        }
    }

    fn registry() -> FleetRegistry {
        FleetRegistry::open(Arc::new(MemoryStore::new()), CurrentLimits::default())
            .expect("Could not open registry")
    }

    fn attach(registry: &FleetRegistry, id: &str) -> SessionHandle {
        let session = SessionHandle::new(id.to_string(), SessionSettings::default());
        registry.attach_session(id, "v1", "10.0.0.2:5000", session.clone());
        session
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<Value>, PersistenceError> {
            Ok(None)
        }

        fn put(&self, key: &str, _value: Value) -> Result<(), PersistenceError> {
            Err(PersistenceError::Io {
                path: key.into(),
                source: std::io::Error::other("disk full"),
            })
        }

        fn entries(&self, _prefix: &str) -> Result<Vec<(String, Value)>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_first_contact_creates_default_config() {
        let registry = registry();
        attach(&registry, "C1");

        let config = registry.config("C1").expect("Could not get config");
        assert_eq!(config, StationConfig::initial(&CurrentLimits::default()));
        assert!(matches!(
            registry.config("C2"),
            Err(RegistryError::UnknownStation { .. })
        ));
    }

    /// Records whether the registry's station map was locked during a write.
    #[derive(Default)]
    struct LockCheckingStore {
        registry: std::sync::OnceLock<std::sync::Weak<FleetRegistry>>,
        writes: MemoryStore,
        written_while_locked: std::sync::atomic::AtomicBool,
    }

    impl KeyValueStore for LockCheckingStore {
        fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
            self.writes.get(key)
        }

        fn put(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
            if let Some(registry) = self.registry.get().and_then(|weak| weak.upgrade())
                && registry.stations.try_write().is_none()
            {
                self.written_while_locked
                    .store(true, std::sync::atomic::Ordering::SeqCst);
            }
            self.writes.put(key, value)
        }

        fn entries(&self, prefix: &str) -> Result<Vec<(String, Value)>, PersistenceError> {
            self.writes.entries(prefix)
        }
    }

    #[tokio::test]
    async fn test_default_config_persisted_outside_station_lock() {
        let store = Arc::new(LockCheckingStore::default());
        let registry = Arc::new(
            FleetRegistry::open(store.clone(), CurrentLimits::default())
                .expect("Could not open registry"),
        );
        let _ = store.registry.set(Arc::downgrade(&registry));

        attach(&registry, "C1");
        registry
            .update_config("C1", ConfigMutation::Mode(ChargingMode::On))
            .expect("Could not update config");

        assert!(
            store
                .writes
                .get(&config_key("C1"))
                .expect("Could not read")
                .is_some()
        );
        assert!(
            !store
                .written_while_locked
                .load(std::sync::atomic::Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_config_survives_restart() {
        let dir = tempfile::tempdir().expect("Could not create temp dir");
        let path = dir.path().join("store.json");
        {
            let store = Arc::new(JsonFileStore::open(&path).expect("Could not open store"));
            let registry =
                FleetRegistry::open(store, CurrentLimits::default()).expect("Could not open");
            attach(&registry, "C1");
            registry
                .update_config("C1", ConfigMutation::Priority(2))
                .expect("Could not set priority");
            registry
                .update_config("C1", ConfigMutation::Mode(ChargingMode::On))
                .expect("Could not set mode");
        }

        let store = Arc::new(JsonFileStore::open(&path).expect("Could not reopen store"));
        let registry = FleetRegistry::open(store, CurrentLimits::default()).expect("Could not open");
        let config = registry.config("C1").expect("Could not get config");
        assert_eq!(config.load_sharing_priority, 2);
        assert_eq!(config.mode, ChargingMode::On);

        let snapshot = registry.snapshot(Duration::from_secs(30));
        assert_eq!(snapshot.stations.len(), 1);
        assert!(!snapshot.stations[0].online);
    }

    #[tokio::test]
    async fn test_rejected_mutation_changes_nothing() {
        let registry = registry();
        attach(&registry, "C1");

        assert!(matches!(
            registry.update_config("C1", ConfigMutation::Priority(11)),
            Err(RegistryError::Config(ConfigError::PriorityOutOfRange { priority: 11 }))
        ));
        assert!(matches!(
            registry.update_config("C9", ConfigMutation::RateLimit(16)),
            Err(RegistryError::UnknownStation { .. })
        ));
        assert_eq!(
            registry.config("C1").expect("Could not get config").load_sharing_priority,
            fleet_core::DEFAULT_PRIORITY
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory() {
        let registry = FleetRegistry::open(Arc::new(FailingStore), CurrentLimits::default())
            .expect("Could not open registry");
        attach(&registry, "C1");

        assert!(matches!(
            registry.update_config("C1", ConfigMutation::Mode(ChargingMode::On)),
            Err(RegistryError::Persistence(_))
        ));
        assert_eq!(
            registry.config("C1").expect("Could not get config").mode,
            ChargingMode::Off
        );
    }

    #[tokio::test]
    async fn test_telemetry_transitions() {
        let registry = registry();
        let session = attach(&registry, "C1");
        let id = session.session_id();

        let upsert = |pilot| {
            registry
                .upsert_telemetry("C1", id, telemetry(pilot))
                .expect("Could not upsert")
        };
        assert_eq!(upsert(PilotVoltage::Volt12), Some(TelemetryTransition::CameOnline));
        assert_eq!(upsert(PilotVoltage::Volt12), None);
        assert_eq!(
            upsert(PilotVoltage::Volt9),
            Some(TelemetryTransition::PilotChanged {
                from: PilotVoltage::Volt12,
                to: PilotVoltage::Volt9
            })
        );
        assert_eq!(
            upsert(PilotVoltage::Fault),
            Some(TelemetryTransition::Fault {
                pilot_voltage: PilotVoltage::Fault
            })
        );
    }

    #[tokio::test]
    async fn test_superseded_session_cannot_write_or_detach() {
        let registry = registry();
        let old = attach(&registry, "C1");
        let new = attach(&registry, "C1");

        assert!(matches!(
            registry.upsert_telemetry("C1", old.session_id(), telemetry(PilotVoltage::Volt9)),
            Err(RegistryError::SessionSuperseded { .. })
        ));
        assert!(!registry.detach_session("C1", old.session_id()));
        assert!(registry.session("C1").is_some());
        assert!(registry.detach_session("C1", new.session_id()));
        assert!(registry.session("C1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_telemetry_is_offline() {
        let registry = registry();
        let session = attach(&registry, "C1");
        let timeout = Duration::from_secs(30);
        registry
            .upsert_telemetry("C1", session.session_id(), telemetry(PilotVoltage::Volt9))
            .expect("Could not upsert");

        assert_eq!(
            registry
                .scheduling_inputs(Duration::from_millis(10), timeout)
                .expect("Could not read")
                .len(),
            1
        );
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(registry
            .scheduling_inputs(Duration::from_millis(10), timeout)
            .expect("Could not read")
            .is_empty());
        assert!(!registry.snapshot(timeout).stations[0].online);
    }

    #[tokio::test]
    async fn test_scheduler_reads_time_out_when_locked() {
        let registry = registry();
        let _writer = registry.stations.write();
        assert!(matches!(
            registry.scheduling_inputs(Duration::from_millis(5), Duration::from_secs(30)),
            Err(RegistryError::Busy { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_decisions_reports_changes() {
        let registry = registry();
        let session = attach(&registry, "C1");
        registry
            .upsert_telemetry("C1", session.session_id(), telemetry(PilotVoltage::Volt6))
            .expect("Could not upsert");
        let decision = AllocationDecision {
            station_id: "C1".into(),
            target_amps: 16,
            reason: AllocationReason::CapacityLimited,
        };
        let lock = Duration::from_millis(10);

        let changed = registry
            .record_decisions(&[decision.clone()], lock)
            .expect("Could not record");
        assert_eq!(changed, vec![decision.clone()]);
        assert!(registry
            .record_decisions(&[decision], lock)
            .expect("Could not record")
            .is_empty());

        let view = &registry.snapshot(Duration::from_secs(30)).stations[0];
        assert!(view.online);
        assert_eq!(view.charging_state, ChargingState::Reduced);
    }
}
