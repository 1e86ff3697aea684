use std::collections::VecDeque;

use super::Packet;

/// A non-empty list of pairwise mergeable packets executed together.
///
/// The front packet is the primary. Its inputs are the ones that get
/// executed.
#[derive(Debug)]
pub struct PacketList {
    packets: VecDeque<Packet>,
}

impl PacketList {
    pub fn new(packet: Packet) -> Self {
        PacketList {
            packets: VecDeque::from([packet]),
        }
    }

    /// Create a list from packets. Returns None if there are none.
    pub fn from_packets(packets: VecDeque<Packet>) -> Option<Self> {
        if packets.is_empty() {
            return None;
        }
        Some(PacketList { packets })
    }

    pub fn primary(&self) -> &Packet {
        &self.packets[0]
    }

    pub fn primary_mut(&mut self) -> &mut Packet {
        &mut self.packets[0]
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Add a packet sharing this list's run.
    ///
    /// Pushed to the back so the primary stays at the front.
    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    pub fn into_packets(self) -> VecDeque<Packet> {
        self.packets
    }
}
