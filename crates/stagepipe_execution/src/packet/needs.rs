use std::collections::BTreeMap;

use super::PacketType;

/// Number of workers a query needs per stage type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerNeeds {
    needs: BTreeMap<PacketType, usize>,
}

impl WorkerNeeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, packet_type: PacketType, count: usize) {
        if count == 0 {
            return;
        }
        *self.needs.entry(packet_type).or_insert(0) += count;
    }

    pub fn get(&self, packet_type: &PacketType) -> usize {
        self.needs.get(packet_type).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.needs.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.needs.is_empty()
    }

    /// Iterate needs in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = (&PacketType, usize)> {
        self.needs.iter().map(|(ty, count)| (ty, *count))
    }
}
