use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::Vehicle;

#[derive(Debug, Default)]
struct Tracked {
    /// vehicle index -> owning loadpoint
    owners: HashMap<usize, usize>,
    /// loadpoint -> vehicle indices it must release on its next cycle
    pending_release: HashMap<usize, Vec<usize>>,
}

/// Concurrency-safe registry arbitrating which vehicle is bound to which
/// loadpoint. The coordinator does not schedule anything; loadpoints consult
/// it through their adapter. Ownership transfer is cooperative: acquiring a
/// vehicle owned elsewhere flags the previous owner, which releases on its
/// next cycle.
pub struct Coordinator {
    vehicles: Vec<Arc<dyn Vehicle>>,
    tracked: Mutex<Tracked>,
}

impl Coordinator {
    pub fn new(vehicles: Vec<Arc<dyn Vehicle>>) -> Self {
        Self {
            vehicles,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    pub fn vehicles(&self) -> Vec<Arc<dyn Vehicle>> {
        self.vehicles.clone()
    }

    fn index_of(&self, vehicle: &Arc<dyn Vehicle>) -> Option<usize> {
        self.vehicles.iter().position(|v| Arc::ptr_eq(v, vehicle))
    }

    fn acquire(&self, owner: usize, vehicle: &Arc<dyn Vehicle>) {
        let Some(idx) = self.index_of(vehicle) else {
            warn!(vehicle = %vehicle.title(), "acquire of unregistered vehicle ignored");
            return;
        };

        let mut tracked = self.tracked.lock();
        if let Some(previous) = tracked.owners.insert(idx, owner) {
            if previous != owner {
                info!(
                    vehicle = %vehicle.title(),
                    from = previous,
                    to = owner,
                    "vehicle changed loadpoint"
                );
                tracked.pending_release.entry(previous).or_default().push(idx);
            }
        }
    }

    fn release(&self, vehicle: &Arc<dyn Vehicle>) {
        let Some(idx) = self.index_of(vehicle) else {
            return;
        };
        self.tracked.lock().owners.remove(&idx);
    }

    /// Vehicles not owned by another loadpoint, including `owner`'s own.
    fn available(&self, owner: usize) -> Vec<Arc<dyn Vehicle>> {
        let tracked = self.tracked.lock();
        self.vehicles
            .iter()
            .enumerate()
            .filter(|(idx, _)| match tracked.owners.get(idx) {
                Some(o) => *o == owner,
                None => true,
            })
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn take_pending_release(&self, owner: usize) -> Vec<Arc<dyn Vehicle>> {
        let mut tracked = self.tracked.lock();
        tracked
            .pending_release
            .remove(&owner)
            .unwrap_or_default()
            .into_iter()
            .map(|idx| self.vehicles[idx].clone())
            .collect()
    }

    /// Identifies the connected vehicle by vehicle-side charge state.
    /// Returns a vehicle only when exactly one available candidate reports
    /// being connected or charging; ambiguity yields none.
    ///
    /// The registry lock is not held across the vehicle queries.
    async fn identify_vehicle_by_status(&self, owner: usize) -> Option<Arc<dyn Vehicle>> {
        let candidates = self.available(owner);

        let mut matches = Vec::new();
        for vehicle in candidates {
            let Some(state) = vehicle.charge_state() else {
                continue;
            };
            match state.status().await {
                Ok(status) if status.is_connected() => matches.push(vehicle),
                Ok(_) => {}
                Err(err) => {
                    debug!(vehicle = %vehicle.title(), error = %err, "vehicle status unavailable");
                }
            }
        }

        match matches.len() {
            1 => matches.pop(),
            n => {
                if n > 1 {
                    debug!(candidates = n, "vehicle identification ambiguous");
                }
                None
            }
        }
    }
}

/// Per-loadpoint view of the coordinator. Carries the loadpoint identity so
/// method signatures on the loadpoint side stay simple.
#[derive(Clone)]
pub struct CoordinatorAdapter {
    loadpoint: usize,
    coordinator: Arc<Coordinator>,
}

impl CoordinatorAdapter {
    pub fn new(loadpoint: usize, coordinator: Arc<Coordinator>) -> Self {
        Self {
            loadpoint,
            coordinator,
        }
    }

    pub fn vehicles(&self) -> Vec<Arc<dyn Vehicle>> {
        self.coordinator.vehicles()
    }

    pub fn acquire(&self, vehicle: &Arc<dyn Vehicle>) {
        self.coordinator.acquire(self.loadpoint, vehicle);
    }

    pub fn release(&self, vehicle: &Arc<dyn Vehicle>) {
        self.coordinator.release(vehicle);
    }

    pub fn available_vehicles(&self) -> Vec<Arc<dyn Vehicle>> {
        self.coordinator.available(self.loadpoint)
    }

    pub fn take_pending_release(&self) -> Vec<Arc<dyn Vehicle>> {
        self.coordinator.take_pending_release(self.loadpoint)
    }

    pub async fn identify_vehicle_by_status(&self) -> Option<Arc<dyn Vehicle>> {
        self.coordinator
            .identify_vehicle_by_status(self.loadpoint)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::SimVehicle;
    use crate::device::ChargeStatus;

    fn vehicles(list: Vec<SimVehicle>) -> Vec<Arc<dyn Vehicle>> {
        list.into_iter()
            .map(|v| Arc::new(v) as Arc<dyn Vehicle>)
            .collect()
    }

    #[test]
    fn acquire_flags_previous_owner_for_release() {
        let coordinator = Arc::new(Coordinator::new(vehicles(vec![
            SimVehicle::new("ioniq", 58.0),
            SimVehicle::new("zoe", 52.0),
        ])));
        let garage = CoordinatorAdapter::new(0, coordinator.clone());
        let carport = CoordinatorAdapter::new(1, coordinator.clone());

        let ioniq = coordinator.vehicles()[0].clone();
        garage.acquire(&ioniq);
        assert_eq!(carport.available_vehicles().len(), 1);

        carport.acquire(&ioniq);
        let stolen = garage.take_pending_release();
        assert_eq!(stolen.len(), 1);
        assert!(Arc::ptr_eq(&stolen[0], &ioniq));
        // drained after one read
        assert!(garage.take_pending_release().is_empty());

        // now owned by the carport
        assert_eq!(garage.available_vehicles().len(), 1);
        assert_eq!(carport.available_vehicles().len(), 2);
    }

    #[test]
    fn release_returns_vehicle_to_the_pool() {
        let coordinator = Arc::new(Coordinator::new(vehicles(vec![SimVehicle::new(
            "ioniq", 58.0,
        )])));
        let garage = CoordinatorAdapter::new(0, coordinator.clone());
        let carport = CoordinatorAdapter::new(1, coordinator.clone());

        let ioniq = coordinator.vehicles()[0].clone();
        garage.acquire(&ioniq);
        assert!(carport.available_vehicles().is_empty());

        garage.release(&ioniq);
        assert_eq!(carport.available_vehicles().len(), 1);
    }

    #[tokio::test]
    async fn identifies_unique_connected_vehicle() {
        let coordinator = Arc::new(Coordinator::new(vehicles(vec![
            SimVehicle::new("ioniq", 58.0).with_status(ChargeStatus::C),
            SimVehicle::new("zoe", 52.0).with_status(ChargeStatus::A),
        ])));
        let garage = CoordinatorAdapter::new(0, coordinator.clone());

        let found = garage.identify_vehicle_by_status().await.expect("a match");
        assert_eq!(found.title(), "ioniq");
    }

    #[tokio::test]
    async fn acquired_vehicle_is_invisible_to_other_loadpoints() {
        let coordinator = Arc::new(Coordinator::new(vehicles(vec![
            SimVehicle::new("ioniq", 58.0).with_status(ChargeStatus::C),
            SimVehicle::new("zoe", 52.0).with_status(ChargeStatus::A),
        ])));
        let garage = CoordinatorAdapter::new(0, coordinator.clone());
        let carport = CoordinatorAdapter::new(1, coordinator.clone());

        let found = garage.identify_vehicle_by_status().await.expect("a match");
        garage.acquire(&found);

        assert!(carport.identify_vehicle_by_status().await.is_none());
    }

    #[tokio::test]
    async fn ambiguity_yields_none() {
        let coordinator = Arc::new(Coordinator::new(vehicles(vec![
            SimVehicle::new("ioniq", 58.0).with_status(ChargeStatus::B),
            SimVehicle::new("zoe", 52.0).with_status(ChargeStatus::C),
        ])));
        let garage = CoordinatorAdapter::new(0, coordinator);

        assert!(garage.identify_vehicle_by_status().await.is_none());
    }

    #[tokio::test]
    async fn vehicles_without_charge_state_are_skipped() {
        let coordinator = Arc::new(Coordinator::new(vehicles(vec![
            SimVehicle::new("ioniq", 58.0),
            SimVehicle::new("zoe", 52.0).with_status(ChargeStatus::B),
        ])));
        let garage = CoordinatorAdapter::new(0, coordinator);

        let found = garage.identify_vehicle_by_status().await.expect("a match");
        assert_eq!(found.title(), "zoe");
    }
}
