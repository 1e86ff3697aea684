use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use stagepipe_error::{Result, StagepipeError};
use tracing::{debug, error, trace};

use crate::config::ExecutionConfig;
use crate::dispatcher::StageDirectory;
use crate::packet::list::PacketList;
use crate::packet::{
    MergeSignature,
    Packet,
    PacketId,
    PacketInput,
    PacketPayload,
    NEXT_TUPLE_INITIAL_VALUE,
    NEXT_TUPLE_UNINITIALIZED,
};
use crate::stage::ErasedStage;
use crate::tuple::fifo::{tuple_fifo_with_config, FifoReader, FifoWriter};
use crate::tuple::{Outcome, Page};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdaptorStatus {
    /// New packets may still be merged in.
    Accepting,
    /// No more packets are admitted.
    Closed,
    /// The stage completed and all packets were finished or requeued.
    CleanedUp,
    /// The stage failed and all packets were aborted.
    Aborted,
}

/// Part of a running adaptor shared with its container.
///
/// The container uses this to merge newly dispatched packets into the run.
#[derive(Debug)]
pub(crate) struct RunningStage {
    stage: &'static str,
    primary: PacketId,
    signature: MergeSignature,
    replayable: bool,
    state: Mutex<RunningState>,
}

#[derive(Debug)]
struct RunningState {
    /// Packets receiving output. Taken out while a page is delivered.
    packets: VecDeque<Packet>,
    /// Sequence number of the next tuple to be delivered.
    next_tuple: u64,
    status: AdaptorStatus,
    cancelled: bool,
}

impl RunningStage {
    pub(crate) fn primary(&self) -> PacketId {
        self.primary
    }

    /// Try to attach a packet to this run, handing it back if it can't be.
    pub(crate) fn try_merge(&self, mut packet: Packet) -> Result<(), Packet> {
        let mut state = self.state.lock();
        if state.status != AdaptorStatus::Accepting || state.cancelled {
            return Err(packet);
        }
        if !self.signature.accepts(&packet) {
            return Err(packet);
        }

        debug!(
            stage = self.stage,
            primary = %self.primary,
            packet = %packet.id(),
            next_tuple = state.next_tuple,
            "merged packet into running stage"
        );

        packet.next_tuple_on_merge = state.next_tuple;
        state.packets.push_front(packet);
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.state.lock().cancelled = true;
    }

    fn stop_accepting(&self) {
        let mut state = self.state.lock();
        if state.status == AdaptorStatus::Accepting {
            state.status = AdaptorStatus::Closed;
        }
    }

    /// Deliver a page to every attached packet.
    ///
    /// The packet list is taken out for the copy so that merges don't wait
    /// on it. Packets merged in the meantime stay in front.
    fn deliver_page(&self, page: &Page) -> Result<Outcome> {
        let (packets, next_tuple) = {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(StagepipeError::new(format!(
                    "Stage '{}' canceled",
                    self.stage
                )));
            }
            state.next_tuple += page.tuple_count() as u64;
            if !self.replayable && state.status == AdaptorStatus::Accepting {
                state.status = AdaptorStatus::Closed;
            }
            (std::mem::take(&mut state.packets), state.next_tuple)
        };

        trace!(
            stage = self.stage,
            tuples = page.tuple_count(),
            packets = packets.len(),
            "delivering page"
        );

        let mut remaining = VecDeque::with_capacity(packets.len());
        for mut packet in packets {
            match packet.deliver_page(page) {
                Outcome::Terminated => {
                    debug!(stage = self.stage, packet = %packet.id(), "consumer terminated output");
                    packet.finish();
                }
                _ if packet.next_tuple_needed != NEXT_TUPLE_UNINITIALIZED
                    && next_tuple >= packet.next_tuple_needed =>
                {
                    debug!(stage = self.stage, packet = %packet.id(), "packet received all tuples");
                    packet.finish();
                }
                _ => remaining.push_back(packet),
            }
        }

        let mut state = self.state.lock();
        state.packets.extend(remaining);
        if state.packets.is_empty() {
            // Merges after a stop would miss the rest of the output.
            if state.status == AdaptorStatus::Accepting {
                state.status = AdaptorStatus::Closed;
            }
            return Ok(Outcome::StopEarly);
        }

        Ok(Outcome::Continue)
    }

    /// Finish every packet that saw the whole output, and return the ones
    /// that joined late so they can be run again.
    fn cleanup(&self) -> Option<PacketList> {
        let packets = {
            let mut state = self.state.lock();
            state.status = AdaptorStatus::CleanedUp;
            std::mem::take(&mut state.packets)
        };

        let mut residual = VecDeque::new();
        for mut packet in packets {
            if packet.next_tuple_on_merge == NEXT_TUPLE_INITIAL_VALUE {
                packet.finish();
                continue;
            }

            debug!(
                stage = self.stage,
                packet = %packet.id(),
                needed = packet.next_tuple_on_merge,
                "requeueing late packet"
            );
            packet.next_tuple_needed = packet.next_tuple_on_merge;
            packet.next_tuple_on_merge = NEXT_TUPLE_UNINITIALIZED;
            residual.push_back(packet);
        }

        PacketList::from_packets(residual)
    }

    fn abort_queries(&self, err: &StagepipeError) {
        let packets = {
            let mut state = self.state.lock();
            state.status = AdaptorStatus::Aborted;
            std::mem::take(&mut state.packets)
        };

        error!(
            stage = self.stage,
            primary = %self.primary,
            packets = packets.len(),
            %err,
            "aborting queries"
        );

        for packet in packets {
            packet.abort(err.get_msg());
        }
    }
}

/// Context a stage runs in.
///
/// Owns the inputs of the primary packet and fans produced tuples out to all
/// packets sharing the run.
#[derive(Debug)]
pub struct StageAdaptor {
    running: Arc<RunningStage>,
    directory: Arc<StageDirectory>,
    payload: Arc<dyn PacketPayload>,
    cpu_hint: Option<usize>,
    /// Inputs of the primary packet not yet dispatched.
    inputs: Vec<Option<PacketInput>>,
    /// Tuples staged by `output`.
    page: Page,
    /// Set once there's no packet left to deliver to.
    stopped: bool,
}

impl StageAdaptor {
    pub(crate) fn new(
        mut list: PacketList,
        stage: &'static str,
        replayable: bool,
        directory: Arc<StageDirectory>,
    ) -> Self {
        let primary = list.primary_mut();
        let signature = MergeSignature::of(primary);
        let payload = primary.payload().clone();
        let primary_id = primary.id();
        let cpu_hint = primary.cpu_hint();
        let page = Page::new(primary.stage_tuple_size(), directory.config().page_size);
        let inputs = primary.take_inputs().into_iter().map(Some).collect();

        let mut packets = list.into_packets();
        for packet in packets.iter_mut() {
            packet.next_tuple_on_merge = NEXT_TUPLE_INITIAL_VALUE;
        }

        let running = Arc::new(RunningStage {
            stage,
            primary: primary_id,
            signature,
            replayable,
            state: Mutex::new(RunningState {
                packets,
                next_tuple: NEXT_TUPLE_INITIAL_VALUE,
                status: AdaptorStatus::Accepting,
                cancelled: false,
            }),
        });

        StageAdaptor {
            running,
            directory,
            payload,
            cpu_hint,
            inputs,
            page,
            stopped: false,
        }
    }

    pub(crate) fn running(&self) -> &Arc<RunningStage> {
        &self.running
    }

    pub fn stage_name(&self) -> &'static str {
        self.running.stage
    }

    pub fn config(&self) -> &ExecutionConfig {
        self.directory.config()
    }

    /// Size of the tuples the stage must output.
    pub fn tuple_size(&self) -> usize {
        self.page.tuple_size()
    }

    /// CPU the primary packet was assigned to by a scheduling policy.
    pub fn cpu_hint(&self) -> Option<usize> {
        self.cpu_hint
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop admitting new packets into this run.
    pub fn stop_accepting_packets(&self) {
        self.running.stop_accepting();
    }

    /// Dispatch the packet for input `idx` and return the reader for its
    /// output.
    pub fn dispatch_input(&mut self, idx: usize) -> Result<FifoReader> {
        let input = self
            .inputs
            .get_mut(idx)
            .and_then(|input| input.take())
            .ok_or_else(|| {
                StagepipeError::new(format!(
                    "Input {idx} for stage '{}' missing or already dispatched",
                    self.running.stage
                ))
            })?;

        let (packet, reader) = input.into_parts();
        self.directory.dispatch_packet(packet)?;

        Ok(reader)
    }

    /// Dispatch a packet created while running, e.g. the inner relation of a
    /// nested loop join.
    pub fn dispatch_packet(&self, packet: Packet) -> Result<()> {
        self.directory.dispatch_packet(packet)
    }

    /// Create a fifo using the dispatcher's page size and capacity.
    pub fn tuple_fifo(&self, tuple_size: usize) -> Result<(FifoWriter, FifoReader)> {
        tuple_fifo_with_config(tuple_size, self.config().fifo_config())
    }

    /// Output a single tuple.
    ///
    /// Tuples are staged into a page, and delivered once the page is full.
    pub fn output(&mut self, tuple: &[u8]) -> Result<Outcome> {
        if self.stopped {
            return Ok(Outcome::StopEarly);
        }
        self.page.append(tuple)?;
        if !self.page.is_full() {
            return Ok(Outcome::Continue);
        }
        self.flush()
    }

    /// Output a full page of tuples. Staged tuples are delivered first.
    pub fn output_page(&mut self, page: &Page) -> Result<Outcome> {
        if page.tuple_size() != self.page.tuple_size() {
            return Err(StagepipeError::new(format!(
                "Stage '{}' output page with tuple size {}, expected {}",
                self.running.stage,
                page.tuple_size(),
                self.page.tuple_size()
            )));
        }

        let outcome = self.flush()?;
        if outcome.should_stop() || page.is_empty() {
            return Ok(outcome);
        }

        self.deliver(page)
    }

    /// Deliver any staged tuples.
    pub fn flush(&mut self) -> Result<Outcome> {
        if self.stopped {
            return Ok(Outcome::StopEarly);
        }
        if self.page.is_empty() {
            return Ok(Outcome::Continue);
        }

        let outcome = self.running.deliver_page(&self.page)?;
        self.page.clear();
        if outcome == Outcome::StopEarly {
            self.stopped = true;
        }
        Ok(outcome)
    }

    fn deliver(&mut self, page: &Page) -> Result<Outcome> {
        let outcome = self.running.deliver_page(page)?;
        if outcome == Outcome::StopEarly {
            self.stopped = true;
        }
        Ok(outcome)
    }

    /// Run the stage to completion and settle every attached packet.
    ///
    /// Returns packets that joined late and need another run.
    pub(crate) fn run(mut self, stage: &mut dyn ErasedStage) -> Option<PacketList> {
        let payload = self.payload.clone();
        let result = catch_unwind(AssertUnwindSafe(|| {
            stage.process_erased(&mut self, payload.as_ref())?;
            self.flush().map(|_| ())
        }))
        .unwrap_or_else(|panic| {
            Err(StagepipeError::new(format!(
                "Stage '{}' panicked: {}",
                self.running.stage,
                panic_message(panic.as_ref())
            )))
        });

        self.running.stop_accepting();
        // Terminates inputs the stage never dispatched.
        self.inputs.clear();

        match result {
            Ok(()) => self.running.cleanup(),
            Err(e) => {
                self.running.abort_queries(&e);
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;
    use crate::stage::Stage;
    use crate::stages::echo::EchoPacket;
    use crate::testutil::{drain_i32s, i32_tuple, packet_with_reader, small_page_config};

    fn test_directory() -> Arc<StageDirectory> {
        Arc::new(StageDirectory::new(
            small_page_config(8, 1),
            Vec::new(),
            HashMap::new(),
        ))
    }

    fn echo_packet(directory: &StageDirectory) -> (Packet, FifoReader) {
        let (packet, reader) = packet_with_reader(directory.config(), 4, EchoPacket).unwrap();
        (packet.with_merging(true), reader)
    }

    #[derive(Debug, Default)]
    struct Failing;

    impl Stage for Failing {
        type Packet = EchoPacket;

        const NAME: &'static str = "failing";

        fn process(&mut self, _adaptor: &mut StageAdaptor, _packet: &EchoPacket) -> Result<()> {
            Err(StagepipeError::new("stage failed"))
        }
    }

    #[derive(Debug, Default)]
    struct Counting;

    impl Stage for Counting {
        type Packet = EchoPacket;

        const NAME: &'static str = "counting";

        fn process(&mut self, adaptor: &mut StageAdaptor, _packet: &EchoPacket) -> Result<()> {
            for v in 1..=3 {
                adaptor.output(&i32_tuple(v))?;
            }
            Ok(())
        }
    }

    #[test]
    fn stopped_run_rejects_merges() {
        let directory = test_directory();
        let (packet, reader) = echo_packet(&directory);
        drop(reader);

        let mut adaptor =
            StageAdaptor::new(PacketList::new(packet), "echo", true, directory.clone());
        assert_eq!(Outcome::Continue, adaptor.output(&i32_tuple(1)).unwrap());
        assert_eq!(Outcome::StopEarly, adaptor.output(&i32_tuple(2)).unwrap());
        assert!(adaptor.is_stopped());
        assert_eq!(AdaptorStatus::Closed, adaptor.running().state.lock().status);

        let (late, _late_reader) = echo_packet(&directory);
        assert!(adaptor.running().try_merge(late).is_err());
    }

    #[test]
    fn replayable_run_accepts_merges_while_delivering() {
        let directory = test_directory();
        let (packet, mut reader) = echo_packet(&directory);

        let mut adaptor =
            StageAdaptor::new(PacketList::new(packet), "echo", true, directory.clone());
        adaptor.output(&i32_tuple(1)).unwrap();
        adaptor.output(&i32_tuple(2)).unwrap();
        assert_eq!(AdaptorStatus::Accepting, adaptor.running().state.lock().status);

        let (late, mut late_reader) = echo_packet(&directory);
        adaptor.running().try_merge(late).unwrap();
        adaptor.output(&i32_tuple(3)).unwrap();
        adaptor.flush().unwrap();

        let residual = adaptor.running().cleanup().unwrap();
        assert_eq!(1, residual.len());
        assert_eq!(3, residual.primary().next_tuple_needed);
        drop(residual);

        assert_eq!(vec![1, 2, 3], drain_i32s(&mut reader).unwrap());
        // Dropped residual aborts the late packet after its suffix.
        late_reader.get_page().unwrap_err();
    }

    #[test]
    fn error_aborts_every_merged_packet() {
        let directory = test_directory();
        let (first, mut first_reader) = echo_packet(&directory);
        let (second, mut second_reader) = echo_packet(&directory);

        let mut list = PacketList::new(first);
        list.push(second);
        let adaptor = StageAdaptor::new(list, Failing::NAME, false, directory);
        let running = adaptor.running().clone();

        assert!(adaptor.run(&mut Failing).is_none());
        assert_eq!(AdaptorStatus::Aborted, running.state.lock().status);

        for reader in [&mut first_reader, &mut second_reader] {
            let err = reader.get_page().unwrap_err();
            assert!(err.get_msg().contains("stage failed"), "{err}");
        }
    }

    #[test]
    fn completed_run_finishes_every_merged_packet() {
        let directory = test_directory();
        let (first, mut first_reader) = echo_packet(&directory);
        let (second, mut second_reader) = echo_packet(&directory);

        let mut list = PacketList::new(first);
        list.push(second);
        let adaptor = StageAdaptor::new(list, Counting::NAME, false, directory);
        let running = adaptor.running().clone();

        assert!(adaptor.run(&mut Counting).is_none());
        assert_eq!(AdaptorStatus::CleanedUp, running.state.lock().status);

        assert_eq!(vec![1, 2, 3], drain_i32s(&mut first_reader).unwrap());
        assert_eq!(vec![1, 2, 3], drain_i32s(&mut second_reader).unwrap());
    }

    #[test]
    fn cancelled_run_aborts_on_next_delivery() {
        let directory = test_directory();
        let (packet, mut reader) = echo_packet(&directory);

        let adaptor =
            StageAdaptor::new(PacketList::new(packet), Counting::NAME, false, directory);
        adaptor.running().cancel();

        assert!(adaptor.run(&mut Counting).is_none());
        let err = reader.get_page().unwrap_err();
        assert!(err.get_msg().contains("canceled"), "{err}");
    }
}
