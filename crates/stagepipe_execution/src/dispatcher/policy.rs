use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::packet::Packet;

/// Per query state used by a policy while assigning the packets of one
/// query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryState {
    /// CPU picked for the query, if the policy assigns per query.
    pub cpu: Option<usize>,
    /// Number of packets assigned so far.
    pub assigned: usize,
}

/// Decides which CPU the packets of a query should prefer.
///
/// The assignment is recorded as a hint on the packet.
pub trait SchedulingPolicy: Debug + Send + Sync {
    fn create_query_state(&self) -> QueryState {
        QueryState::default()
    }

    fn assign(&self, packet: &mut Packet, state: &mut QueryState);
}

/// Leave placement to the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsDefaultPolicy;

impl SchedulingPolicy for OsDefaultPolicy {
    fn assign(&self, packet: &mut Packet, state: &mut QueryState) {
        packet.set_cpu_hint(None);
        state.assigned += 1;
    }
}

/// Spread packets over CPUs round robin.
///
/// With `per_query` set, all packets of a query get the same CPU and queries
/// are spread instead.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    num_cpus: usize,
    per_query: bool,
    next: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new(num_cpus: usize) -> Self {
        RoundRobinPolicy {
            num_cpus: num_cpus.max(1),
            per_query: false,
            next: AtomicUsize::new(0),
        }
    }

    pub fn per_query(num_cpus: usize) -> Self {
        RoundRobinPolicy {
            per_query: true,
            ..Self::new(num_cpus)
        }
    }

    fn next_cpu(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.num_cpus
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl SchedulingPolicy for RoundRobinPolicy {
    fn create_query_state(&self) -> QueryState {
        QueryState {
            cpu: self.per_query.then(|| self.next_cpu()),
            assigned: 0,
        }
    }

    fn assign(&self, packet: &mut Packet, state: &mut QueryState) {
        let cpu = match state.cpu {
            Some(cpu) => cpu,
            None => self.next_cpu(),
        };
        packet.set_cpu_hint(Some(cpu));
        state.assigned += 1;
    }
}

/// Assign every packet in the tree rooted at `packet`.
pub fn assign_packet_tree(policy: &dyn SchedulingPolicy, packet: &mut Packet) -> QueryState {
    let mut state = policy.create_query_state();
    packet.visit_mut(&mut |p| policy.assign(p, &mut state));
    state
}
