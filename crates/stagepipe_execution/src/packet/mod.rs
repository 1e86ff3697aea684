//! Packets are requests for a stage to run an operator on behalf of a query.
pub mod list;
pub mod needs;

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use stagepipe_error::{Result, StagepipeError};

use crate::dispatcher::reservation::{WorkerReservation, WorkerReservations};
use crate::tuple::fifo::{FifoReader, FifoWriter};
use crate::tuple::filter::TupleFilter;
use crate::tuple::{Outcome, Page};

use self::needs::WorkerNeeds;

/// Value of `next_tuple_on_merge` for packets not in a running adaptor.
pub(crate) const NEXT_TUPLE_UNINITIALIZED: u64 = 0;

/// First value of an adaptor's tuple cursor.
pub(crate) const NEXT_TUPLE_INITIAL_VALUE: u64 = 1;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub u64);

impl PacketId {
    fn next() -> Self {
        PacketId(NEXT_PACKET_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet-{}", self.0)
    }
}

/// Type tag of a packet, derived from its payload type.
///
/// Stages are registered per packet type.
#[derive(Debug, Clone, Copy)]
pub struct PacketType {
    id: TypeId,
    name: &'static str,
}

impl PacketType {
    pub fn of<P: PacketPayload>() -> Self {
        let full = std::any::type_name::<P>();
        let name = full.rsplit("::").next().unwrap_or(full);
        PacketType {
            id: TypeId::of::<P>(),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for PacketType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PacketType {}

impl Hash for PacketType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for PacketType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PacketType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Operator parameters carried by a packet.
pub trait PacketPayload: fmt::Debug + Send + Sync + 'static {
    /// Whether a packet with this payload can share the execution of a
    /// packet with `other`.
    ///
    /// Only consulted for packets of the same type with merging enabled.
    fn is_mergeable(&self, _other: &dyn PacketPayload) -> bool {
        false
    }

    /// Declare workers needed beyond the ones for the packet tree itself,
    /// e.g. for packets the stage dispatches at runtime.
    fn declare_worker_needs(&self, _needs: &mut WorkerNeeds) {}

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Unsubmitted,
    Submitted,
}

/// An input of a packet, along with the reader for that input's output.
#[derive(Debug)]
pub struct PacketInput {
    packet: Packet,
    reader: FifoReader,
}

impl PacketInput {
    pub fn new(packet: Packet, reader: FifoReader) -> Result<Self> {
        if packet.output.tuple_size() != reader.tuple_size() {
            return Err(StagepipeError::new(format!(
                "Input reader tuple size {} doesn't match output of {}",
                reader.tuple_size(),
                packet.label
            )));
        }
        Ok(PacketInput { packet, reader })
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn into_parts(self) -> (Packet, FifoReader) {
        (self.packet, self.reader)
    }
}

#[derive(Debug)]
pub struct Packet {
    id: PacketId,
    label: String,
    packet_type: PacketType,
    state: PacketState,
    output: FifoWriter,
    filter: Arc<dyn TupleFilter>,
    payload: Arc<dyn PacketPayload>,
    inputs: Vec<PacketInput>,
    merge_enabled: bool,
    /// Worker slots released when the packet is destroyed.
    reservations: Vec<WorkerReservation>,
    cpu_hint: Option<usize>,
    pub(crate) next_tuple_on_merge: u64,
    pub(crate) next_tuple_needed: u64,
}

impl Packet {
    /// Create a new packet writing to `output` through `filter`.
    ///
    /// Merging is disabled by default.
    pub fn new<P: PacketPayload>(
        label: impl Into<String>,
        payload: P,
        output: FifoWriter,
        filter: impl TupleFilter,
    ) -> Result<Self> {
        let label = label.into();
        if filter.output_tuple_size() != output.tuple_size() {
            return Err(StagepipeError::new(format!(
                "Filter output tuple size {} doesn't match output fifo tuple size {} for packet '{label}'",
                filter.output_tuple_size(),
                output.tuple_size(),
            )));
        }
        if filter.input_tuple_size() == 0 {
            return Err(StagepipeError::new(format!(
                "Filter input tuple size must be non-zero for packet '{label}'"
            )));
        }

        Ok(Packet {
            id: PacketId::next(),
            label,
            packet_type: PacketType::of::<P>(),
            state: PacketState::Unsubmitted,
            output,
            filter: Arc::new(filter),
            payload: Arc::new(payload),
            inputs: Vec::new(),
            merge_enabled: false,
            reservations: Vec::new(),
            cpu_hint: None,
            next_tuple_on_merge: NEXT_TUPLE_UNINITIALIZED,
            next_tuple_needed: NEXT_TUPLE_UNINITIALIZED,
        })
    }

    pub fn with_input(mut self, input: PacketInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_merging(mut self, enabled: bool) -> Self {
        self.merge_enabled = enabled;
        self
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn is_merge_enabled(&self) -> bool {
        self.merge_enabled
    }

    pub fn payload(&self) -> &Arc<dyn PacketPayload> {
        &self.payload
    }

    pub fn filter(&self) -> &dyn TupleFilter {
        self.filter.as_ref()
    }

    /// Size of the tuples the stage must produce for this packet.
    pub fn stage_tuple_size(&self) -> usize {
        self.filter.input_tuple_size()
    }

    pub fn inputs(&self) -> &[PacketInput] {
        &self.inputs
    }

    pub fn cpu_hint(&self) -> Option<usize> {
        self.cpu_hint
    }

    pub fn set_cpu_hint(&mut self, cpu: Option<usize>) {
        self.cpu_hint = cpu;
    }

    pub fn reserved_workers(&self) -> usize {
        self.reservations.iter().map(|r| r.count()).sum()
    }

    /// Call `f` on this packet and every packet below it.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Packet)) {
        f(self);
        for input in &mut self.inputs {
            input.packet.visit_mut(f);
        }
    }

    /// Check whether this packet can share the execution of `other`.
    pub fn is_mergeable(&self, other: &Packet) -> bool {
        MergeSignature::of(self).accepts(other)
    }

    /// Declare one worker for this packet's type, any extras from the
    /// payload, and the needs of all inputs.
    pub fn declare_worker_needs(&self, needs: &mut WorkerNeeds) {
        needs.declare(self.packet_type, 1);
        self.payload.declare_worker_needs(needs);
        for input in &self.inputs {
            input.packet.declare_worker_needs(needs);
        }
    }

    /// Attach one reserved worker slot to every packet in the tree.
    pub(crate) fn attach_reservations(&mut self, reservations: &mut WorkerReservations) {
        self.visit_mut(&mut |packet| {
            if let Some(slot) = reservations.take_one(&packet.packet_type) {
                packet.reservations.push(slot);
            }
        });
    }

    pub(crate) fn hold_reservations(&mut self, reservations: impl IntoIterator<Item = WorkerReservation>) {
        self.reservations.extend(reservations);
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = PacketState::Submitted;
    }

    pub(crate) fn take_inputs(&mut self) -> Vec<PacketInput> {
        std::mem::take(&mut self.inputs)
    }

    /// Filter and project every tuple in `page` into the output.
    pub(crate) fn deliver_page(&mut self, page: &Page) -> Outcome {
        let filter = &self.filter;
        for tuple in page.iter() {
            if !filter.select(tuple) {
                continue;
            }
            let outcome = self.output.append_with(|dest| filter.project(dest, tuple));
            if outcome.should_stop() {
                return outcome;
            }
        }
        Outcome::Continue
    }

    /// Send EOF and destroy the packet.
    pub(crate) fn finish(mut self) {
        self.output.send_eof();
    }

    /// Abort the output and destroy the packet.
    pub(crate) fn abort(mut self, reason: &str) {
        self.output.abort(reason);
    }
}

/// Snapshot of everything that determines whether packets can be merged
/// with a given packet.
///
/// Taken before the inputs of a primary packet are moved out for execution.
#[derive(Debug, Clone)]
pub(crate) struct MergeSignature {
    packet_type: PacketType,
    merge_enabled: bool,
    stage_tuple_size: usize,
    payload: Arc<dyn PacketPayload>,
    /// Output filter and signature of each input.
    inputs: Vec<(Arc<dyn TupleFilter>, MergeSignature)>,
}

impl MergeSignature {
    pub(crate) fn of(packet: &Packet) -> Self {
        MergeSignature {
            packet_type: packet.packet_type,
            merge_enabled: packet.merge_enabled,
            stage_tuple_size: packet.stage_tuple_size(),
            payload: packet.payload.clone(),
            inputs: packet
                .inputs
                .iter()
                .map(|input| (input.packet.filter.clone(), MergeSignature::of(&input.packet)))
                .collect(),
        }
    }

    /// Whether `packet` can join the run this signature describes.
    pub(crate) fn accepts(&self, packet: &Packet) -> bool {
        let other = MergeSignature::of(packet);
        self.merge_enabled && other.merge_enabled && self.same_work(&other)
    }

    /// Whether both signatures produce the same tuples. Root output filters
    /// don't matter since every packet gets its own.
    fn same_work(&self, other: &MergeSignature) -> bool {
        self.packet_type == other.packet_type
            && self.stage_tuple_size == other.stage_tuple_size
            && self.payload.is_mergeable(other.payload.as_ref())
            && self.inputs.len() == other.inputs.len()
            && self
                .inputs
                .iter()
                .zip(&other.inputs)
                .all(|((filter_a, sig_a), (filter_b, sig_b))| {
                    filter_a.is_equivalent(filter_b.as_ref()) && sig_a.same_work(sig_b)
                })
    }
}
