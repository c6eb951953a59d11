use crate::price::PriceVerdict;
use crate::{
    AllocationDecision, AllocationReason, AllocationRequest, AllocationStrategy, ChargingMode,
    CurrentLimits, PilotVoltage, ProximityPilotAmps, StationConfig,
};

/// One online station as seen by a scheduler tick.
#[derive(Debug, Clone, PartialEq)]
pub struct StationDemand {
    pub station_id: String,
    pub config: StationConfig,
    pub pilot_voltage: PilotVoltage,
    pub proximity_pilot_amps: ProximityPilotAmps,
    /// Decision of the previous tick, kept when the price gate cannot answer.
    pub previous: Option<AllocationDecision>,
}

impl StationDemand {
    fn wants_price_check(&self) -> bool {
        self.config.mode == ChargingMode::ChargeDuringCheapHours
            && self.pilot_voltage.vehicle_connected()
    }

    /// Highest current this station may ever be given.
    fn ceiling(&self, limits: &CurrentLimits) -> u32 {
        self.proximity_pilot_amps
            .max_amps()
            .min(self.config.charge_rate_limit_amps)
            .min(limits.station_max_amps)
    }
}

/// Whether any of the demands needs the price gate this tick.
pub fn needs_price_verdict(demands: &[StationDemand]) -> bool {
    demands.iter().any(StationDemand::wants_price_check)
}

fn decision(station_id: &str, target_amps: u32, reason: AllocationReason) -> AllocationDecision {
    AllocationDecision {
        station_id: station_id.to_string(),
        target_amps,
        reason,
    }
}

/// Compute the decisions of one tick, sorted by station id.
///
/// `price` is only consulted for stations charging during cheap hours; `None`
/// is read as favorable.
pub fn plan_allocation(
    demands: &[StationDemand],
    price: Option<&PriceVerdict>,
    strategy: &dyn AllocationStrategy,
    limits: &CurrentLimits,
) -> Vec<AllocationDecision> {
    let mut decisions = Vec::with_capacity(demands.len());
    let mut requests = Vec::new();
    let mut capacity = limits.capacity_amps;

    for demand in demands {
        let id = demand.station_id.as_str();
        if demand.config.mode == ChargingMode::Off {
            decisions.push(decision(id, 0, AllocationReason::ManualOff));
            continue;
        }
        if demand.pilot_voltage.is_fault() {
            decisions.push(decision(id, 0, AllocationReason::Fault));
            continue;
        }
        if !demand.pilot_voltage.vehicle_connected() {
            decisions.push(decision(id, 0, AllocationReason::NoVehicle));
            continue;
        }
        let ceiling = demand.ceiling(limits);
        if demand.wants_price_check() {
            match price {
                Some(PriceVerdict::WaitUntil(_)) => {
                    decisions.push(decision(id, 0, AllocationReason::PriceGated));
                    continue;
                }
                Some(PriceVerdict::Unavailable) => {
                    // Keep what the station had, and keep it out of the shared pool
                    let held = match &demand.previous {
                        Some(previous) => {
                            decision(id, previous.target_amps.min(ceiling), previous.reason)
                        }
                        None => decision(id, 0, AllocationReason::PriceGated),
                    };
                    capacity = capacity.saturating_sub(held.target_amps);
                    decisions.push(held);
                    continue;
                }
                Some(PriceVerdict::Favorable) | None => {}
            }
        }
        if ceiling < limits.min_charging_amps {
            let reason = if demand.proximity_pilot_amps.max_amps() < limits.min_charging_amps {
                AllocationReason::CableLimited
            } else {
                AllocationReason::RateLimited
            };
            decisions.push(decision(id, 0, reason));
            continue;
        }
        requests.push((
            demand,
            AllocationRequest {
                station_id: demand.station_id.clone(),
                priority: demand.config.load_sharing_priority,
                min_amps: limits.min_charging_amps,
                max_amps: ceiling,
            },
        ));
    }

    let allocation_requests: Vec<AllocationRequest> =
        requests.iter().map(|(_, request)| request.clone()).collect();
    let allocations = strategy.allocate(capacity, &allocation_requests);

    for (demand, request) in &requests {
        let mut amps = allocations
            .get(&request.station_id)
            .copied()
            .unwrap_or(0)
            .min(request.max_amps);
        if amps < limits.min_charging_amps {
            amps = 0;
        }
        let cable = demand.proximity_pilot_amps.max_amps();
        let rate = demand.config.charge_rate_limit_amps;
        let reason = if amps < request.max_amps {
            AllocationReason::CapacityLimited
        } else if cable == request.max_amps && cable < limits.station_max_amps.min(rate) {
            AllocationReason::CableLimited
        } else if rate == request.max_amps && rate < limits.station_max_amps {
            AllocationReason::RateLimited
        } else {
            AllocationReason::Allocated
        };
        decisions.push(decision(&request.station_id, amps, reason));
    }

    decisions.sort_by(|a, b| a.station_id.cmp(&b.station_id));
    decisions
}
