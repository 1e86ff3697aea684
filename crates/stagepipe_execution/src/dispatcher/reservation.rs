use std::collections::BTreeMap;
use std::sync::Arc;

use crate::container::StageContainer;
use crate::packet::PacketType;

/// Reserved worker slots on a single stage container.
///
/// Slots are released when this is dropped.
#[derive(Debug)]
pub struct WorkerReservation {
    container: Arc<StageContainer>,
    count: usize,
}

impl WorkerReservation {
    /// Wrap slots that were already reserved on the container.
    pub(crate) fn new(container: Arc<StageContainer>, count: usize) -> Self {
        WorkerReservation { container, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn packet_type(&self) -> PacketType {
        self.container.packet_type()
    }

    /// Split a single slot off into its own reservation.
    pub(crate) fn split_one(&mut self) -> Option<WorkerReservation> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        Some(WorkerReservation::new(self.container.clone(), 1))
    }
}

impl Drop for WorkerReservation {
    fn drop(&mut self) {
        if self.count > 0 {
            self.container.unreserve(self.count);
        }
    }
}

/// Reservations for all stage types a query needs.
#[derive(Debug, Default)]
pub struct WorkerReservations {
    reservations: BTreeMap<PacketType, WorkerReservation>,
}

impl WorkerReservations {
    pub fn get(&self, packet_type: &PacketType) -> usize {
        self.reservations
            .get(packet_type)
            .map(|r| r.count())
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.reservations.values().map(|r| r.count()).sum()
    }

    pub(crate) fn insert(&mut self, reservation: WorkerReservation) {
        self.reservations
            .insert(reservation.packet_type(), reservation);
    }

    pub(crate) fn take_one(&mut self, packet_type: &PacketType) -> Option<WorkerReservation> {
        self.reservations.get_mut(packet_type)?.split_one()
    }

    /// Reservations with slots left after handing out per packet slots.
    pub(crate) fn into_remaining(self) -> impl Iterator<Item = WorkerReservation> {
        self.reservations.into_values().filter(|r| r.count() > 0)
    }
}
