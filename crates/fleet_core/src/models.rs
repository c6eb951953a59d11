use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control-pilot level reported by a station.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PilotVoltage {
    /// No vehicle, standby.
    Volt12,
    /// Vehicle connected, waiting for current.
    Volt9,
    /// Vehicle charging.
    Volt6,
    Volt3,
    Fault,
}

impl PilotVoltage {
    pub fn vehicle_connected(&self) -> bool {
        matches!(self, PilotVoltage::Volt9 | PilotVoltage::Volt6)
    }

    /// 3V and fault levels require the station to be commanded off.
    pub fn is_fault(&self) -> bool {
        matches!(self, PilotVoltage::Volt3 | PilotVoltage::Fault)
    }
}

/// Rated current of the attached cable, decoded from the proximity-pilot resistor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProximityPilotAmps {
    Amp13,
    Amp20,
    Amp32,
    Unknown,
}

impl ProximityPilotAmps {
    /// An unknown cable is treated as unusable.
    pub fn max_amps(&self) -> u32 {
        match self {
            ProximityPilotAmps::Amp13 => 13,
            ProximityPilotAmps::Amp20 => 20,
            ProximityPilotAmps::Amp32 => 32,
            ProximityPilotAmps::Unknown => 0,
        }
    }
}

/// Latest data pushed by a station.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub charge_active: bool,
    pub duty_cycle: u32,
    pub pilot_voltage: PilotVoltage,
    pub proximity_pilot_amps: ProximityPilotAmps,
    pub phase_millivolts: [u32; 3],
    pub phase_milliamps: [u32; 3],
    pub signal_strength_dbm: i8,
    pub health_counter: u32,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChargingMode {
    Off,
    On,
    ChargeDuringCheapHours,
}

/// Operator configuration of a station. Outlives its sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StationConfig {
    pub mode: ChargingMode,
    /// 1 is the highest priority.
    pub load_sharing_priority: u8,
    pub charge_rate_limit_amps: u32,
}

/// Why a station got the current it got.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationReason {
    Allocated,
    CapacityLimited,
    CableLimited,
    RateLimited,
    PriceGated,
    ManualOff,
    NoVehicle,
    Fault,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationDecision {
    pub station_id: String,
    /// 0 means the station must stop drawing current.
    pub target_amps: u32,
    pub reason: AllocationReason,
}

/// Scheduler view of one station, recomputed every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChargingState {
    Idle,
    Requesting,
    Allocated,
    Reduced,
    Suspended,
}

impl ChargingState {
    pub fn derive(telemetry: Option<&Telemetry>, decision: Option<&AllocationDecision>) -> Self {
        let (Some(telemetry), Some(decision)) = (telemetry, decision) else {
            return ChargingState::Idle;
        };
        match decision.reason {
            AllocationReason::ManualOff | AllocationReason::NoVehicle | AllocationReason::Fault => {
                ChargingState::Idle
            }
            _ if decision.target_amps == 0 => ChargingState::Suspended,
            AllocationReason::CapacityLimited => ChargingState::Reduced,
            _ if telemetry.charge_active => ChargingState::Allocated,
            _ => ChargingState::Requesting,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub received_at: DateTime<Utc>,
    pub data: Telemetry,
}

/// Read-only view of one station, without any session internals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StationView {
    pub client_id: String,
    pub address: Option<String>,
    pub firmware_version: Option<String>,
    pub online: bool,
    pub telemetry: Option<TelemetrySnapshot>,
    pub config: StationConfig,
    pub decision: Option<AllocationDecision>,
    pub charging_state: ChargingState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub capacity_amps: u32,
    pub stations: Vec<StationView>,
}

/// Notable change carried with a telemetry update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TelemetryTransition {
    CameOnline,
    PilotChanged {
        from: PilotVoltage,
        to: PilotVoltage,
    },
    Fault {
        pilot_voltage: PilotVoltage,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum FleetEvent {
    StationConnected {
        station_id: String,
        address: String,
    },
    StationDisconnected {
        station_id: String,
    },
    TelemetryUpdated {
        station_id: String,
        telemetry: Telemetry,
        transition: Option<TelemetryTransition>,
    },
    DecisionChanged {
        decision: AllocationDecision,
    },
    ConfigChanged {
        station_id: String,
        config: StationConfig,
    },
    FirmwareTransferFinished {
        station_id: String,
        version: String,
        success: bool,
        message: Option<String>,
    },
}

impl FleetEvent {
    pub fn station_id(&self) -> &str {
        match self {
            FleetEvent::StationConnected { station_id, .. }
            | FleetEvent::StationDisconnected { station_id }
            | FleetEvent::TelemetryUpdated { station_id, .. }
            | FleetEvent::ConfigChanged { station_id, .. }
            | FleetEvent::FirmwareTransferFinished { station_id, .. } => station_id,
            FleetEvent::DecisionChanged { decision } => &decision.station_id,
        }
    }
}

/// Envelope delivered to listeners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: FleetEvent,
}

impl EventMessage {
    pub fn new(event: FleetEvent) -> Self {
        EventMessage {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}
