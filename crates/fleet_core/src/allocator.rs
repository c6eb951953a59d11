use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// What one station asks of the shared capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub station_id: String,
    /// 1 is the highest priority.
    pub priority: u8,
    pub min_amps: u32,
    pub max_amps: u32,
}

impl AllocationRequest {
    /// A request which can never receive at least its minimum.
    fn is_infeasible(&self) -> bool {
        self.max_amps == 0 || self.max_amps < self.min_amps
    }
}

/// Splits a shared capacity between stations.
///
/// Implementations must never hand out more than `total_capacity_amps` in sum,
/// and every station gets either 0 or at least its `min_amps`. Every request
/// appears in the returned map.
pub trait AllocationStrategy: Send + Sync {
    fn allocate(
        &self,
        total_capacity_amps: u32,
        requests: &[AllocationRequest],
    ) -> HashMap<String, u32>;
}

/// Satisfies higher priorities first, sharing evenly within a priority.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityLoadSharing;

/// Shares evenly between all stations, ignoring their priority.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenLoadSharing;

/// Strategy selected at startup.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    #[default]
    PriorityLoadSharing,
    EvenLoadSharing,
}

impl AllocationStrategy for Strategy {
    fn allocate(
        &self,
        total_capacity_amps: u32,
        requests: &[AllocationRequest],
    ) -> HashMap<String, u32> {
        match self {
            Strategy::PriorityLoadSharing => {
                PriorityLoadSharing.allocate(total_capacity_amps, requests)
            }
            Strategy::EvenLoadSharing => EvenLoadSharing.allocate(total_capacity_amps, requests),
        }
    }
}

impl AllocationStrategy for PriorityLoadSharing {
    fn allocate(
        &self,
        total_capacity_amps: u32,
        requests: &[AllocationRequest],
    ) -> HashMap<String, u32> {
        let mut groups: BTreeMap<u8, Vec<&AllocationRequest>> = BTreeMap::new();
        for request in requests {
            groups.entry(request.priority).or_default().push(request);
        }

        let mut allocations = HashMap::with_capacity(requests.len());
        let mut remaining = total_capacity_amps;
        let mut starved = false;
        for group in groups.values() {
            if starved {
                for request in group {
                    allocations.insert(request.station_id.clone(), 0);
                }
                continue;
            }
            for (request, amps) in share_group(group, remaining) {
                remaining -= amps;
                // A lower priority may only draw once this one is fully served
                if amps < request.max_amps && !request.is_infeasible() {
                    starved = true;
                }
                allocations.insert(request.station_id.clone(), amps);
            }
        }
        allocations
    }
}

impl AllocationStrategy for EvenLoadSharing {
    fn allocate(
        &self,
        total_capacity_amps: u32,
        requests: &[AllocationRequest],
    ) -> HashMap<String, u32> {
        let group: Vec<&AllocationRequest> = requests.iter().collect();
        share_group(&group, total_capacity_amps)
            .into_iter()
            .map(|(request, amps)| (request.station_id.clone(), amps))
            .collect()
    }
}

/// Share `capacity` between requests of equal standing.
///
/// Members are admitted in station-id order as long as their minimum fits,
/// then the admitted ones are filled evenly.
fn share_group<'a>(
    group: &[&'a AllocationRequest],
    capacity: u32,
) -> Vec<(&'a AllocationRequest, u32)> {
    let mut members: Vec<&AllocationRequest> = group.to_vec();
    members.sort_by(|a, b| a.station_id.cmp(&b.station_id));

    let mut admitted = vec![false; members.len()];
    let mut allocated = vec![0u32; members.len()];
    let mut remaining = capacity;

    for (idx, member) in members.iter().enumerate() {
        if member.is_infeasible() || member.min_amps > remaining {
            continue;
        }
        admitted[idx] = true;
        allocated[idx] = member.min_amps;
        remaining -= member.min_amps;
    }
    fill_evenly(&members, &admitted, &mut allocated, remaining);

    members.into_iter().zip(allocated).collect()
}

/// Water-fill the admitted members up to their maximum.
fn fill_evenly(
    members: &[&AllocationRequest],
    admitted: &[bool],
    allocated: &mut [u32],
    mut remaining: u32,
) {
    loop {
        // The members which could take more current, in station-id order
        let hungry: Vec<usize> = (0..members.len())
            .filter(|&idx| admitted[idx] && allocated[idx] < members[idx].max_amps)
            .collect();
        if remaining == 0 || hungry.is_empty() {
            return;
        }
        let fair_share = remaining / hungry.len() as u32;
        if fair_share == 0 {
            // Integer remainder, one amp each in a stable order
            for &idx in hungry.iter().take(remaining as usize) {
                allocated[idx] += 1;
                remaining -= 1;
            }
            continue;
        }
        for idx in hungry {
            let additional = fair_share.min(members[idx].max_amps - allocated[idx]);
            allocated[idx] += additional;
            remaining -= additional;
        }
    }
}
