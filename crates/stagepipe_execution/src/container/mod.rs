pub mod adaptor;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use stagepipe_error::{Result, ResultExt, StagepipeError};
use tracing::{debug, trace, warn};

use crate::config::StageConfig;
use crate::dispatcher::StageDirectory;
use crate::packet::list::PacketList;
use crate::packet::{Packet, PacketType};
use crate::stage::StageFactory;

use self::adaptor::{RunningStage, StageAdaptor};

const SHUTDOWN_REASON: &str = "Dispatcher shut down";

/// Queue and workers for a single stage type.
#[derive(Debug)]
pub struct StageContainer {
    factory: Box<dyn StageFactory>,
    config: StageConfig,
    state: Mutex<ContainerState>,
    /// Signaled when a packet list is queued or on shutdown.
    queue_nonempty: Condvar,
    /// Signaled when reserved slots are released.
    workers_released: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct ContainerState {
    queue: VecDeque<PacketList>,
    /// Adaptors currently running, in the order they started.
    running: Vec<Arc<RunningStage>>,
    /// Number of reserved worker slots.
    reserved: usize,
    shutdown: bool,
}

impl StageContainer {
    pub(crate) fn new(factory: Box<dyn StageFactory>, config: StageConfig) -> Self {
        StageContainer {
            factory,
            config,
            state: Mutex::new(ContainerState::default()),
            queue_nonempty: Condvar::new(),
            workers_released: Condvar::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.factory.name()
    }

    pub fn packet_type(&self) -> PacketType {
        self.factory.packet_type()
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.config.workers
    }

    /// Number of worker slots not reserved.
    pub fn available_workers(&self) -> usize {
        let state = self.state.lock();
        self.config.workers.saturating_sub(state.reserved)
    }

    /// Number of packet lists waiting for a worker.
    pub fn queued_lists(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Merge the packet into a running or queued list if possible, otherwise
    /// queue it in a new list.
    pub(crate) fn enqueue(&self, packet: Packet) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(StagepipeError::new(format!(
                "Stage '{}' is shut down, cannot dispatch {}",
                self.name(),
                packet.label()
            )));
        }

        let mut packet = packet;
        if self.config.sharing_enabled && packet.is_merge_enabled() {
            for running in &state.running {
                match running.try_merge(packet) {
                    Ok(()) => return Ok(()),
                    Err(p) => packet = p,
                }
            }

            if let Some(list) = state
                .queue
                .iter_mut()
                .find(|list| list.primary().is_mergeable(&packet))
            {
                debug!(
                    stage = self.name(),
                    primary = %list.primary().id(),
                    packet = %packet.id(),
                    "merged packet into queued list"
                );
                list.push(packet);
                return Ok(());
            }
        }

        trace!(stage = self.name(), packet = %packet.id(), "queueing packet");
        state.queue.push_back(PacketList::new(packet));
        self.queue_nonempty.notify_one();

        Ok(())
    }

    /// Reserve `n` worker slots, blocking until they're available.
    pub(crate) fn reserve(&self, n: usize) -> Result<()> {
        if n > self.config.workers {
            return Err(StagepipeError::new(format!(
                "Cannot reserve {n} workers for stage '{}', it only has {}",
                self.name(),
                self.config.workers
            )));
        }

        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(StagepipeError::new(format!(
                    "Stage '{}' is shut down",
                    self.name()
                )));
            }
            if self.config.workers - state.reserved >= n {
                state.reserved += n;
                return Ok(());
            }
            self.workers_released.wait(&mut state);
        }
    }

    pub(crate) fn unreserve(&self, n: usize) {
        let mut state = self.state.lock();
        if n > state.reserved {
            warn!(
                stage = self.name(),
                n,
                reserved = state.reserved,
                "releasing more workers than reserved"
            );
        }
        state.reserved = state.reserved.saturating_sub(n);
        self.workers_released.notify_all();
    }

    /// Start the worker threads.
    pub(crate) fn spawn_workers(
        self: &Arc<Self>,
        directory: &Arc<StageDirectory>,
    ) -> Result<()> {
        let mut handles = self.handles.lock();
        for idx in 0..self.config.workers {
            let container = self.clone();
            let directory = directory.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{idx}", self.name()))
                .spawn(move || container.worker_loop(directory))
                .context("Failed to spawn stage worker")?;
            handles.push(handle);
        }
        Ok(())
    }

    fn worker_loop(&self, directory: Arc<StageDirectory>) {
        debug!(stage = self.name(), "worker started");

        let mut bound_cpu = None;
        loop {
            let adaptor = {
                let mut state = self.state.lock();
                while state.queue.is_empty() && !state.shutdown {
                    self.queue_nonempty.wait(&mut state);
                }
                let list = match state.queue.pop_front() {
                    Some(list) if !state.shutdown => list,
                    _ => break,
                };

                let adaptor = StageAdaptor::new(
                    list,
                    self.name(),
                    self.factory.is_replayable(),
                    directory.clone(),
                );
                // Registered before releasing the lock so packets dispatched
                // from here on can merge into it.
                state.running.push(adaptor.running().clone());
                adaptor
            };

            let running = adaptor.running().clone();
            debug!(stage = self.name(), primary = %running.primary(), "running stage");

            if let Some(cpu) = adaptor.cpu_hint() {
                if bound_cpu != Some(cpu) && self.bind_to_cpu(cpu) {
                    bound_cpu = Some(cpu);
                }
            }

            let mut stage = self.factory.create();
            let residual = adaptor.run(stage.as_mut());

            self.state
                .lock()
                .running
                .retain(|r| !Arc::ptr_eq(r, &running));
            if let Some(list) = residual {
                self.requeue_residual(list);
            }
        }

        debug!(stage = self.name(), "worker stopped");
    }

    /// Queue packets that joined a run late so a worker replays it for them.
    ///
    /// Aborted instead once the container is shut down.
    fn requeue_residual(&self, list: PacketList) {
        {
            let mut state = self.state.lock();
            if !state.shutdown {
                trace!(
                    stage = self.name(),
                    packets = list.len(),
                    "requeueing residual packets"
                );
                state.queue.push_back(list);
                self.queue_nonempty.notify_one();
                return;
            }
        }

        debug!(
            stage = self.name(),
            packets = list.len(),
            "aborting residual packets after shutdown"
        );
        for packet in list.into_packets() {
            packet.abort(SHUTDOWN_REASON);
        }
    }

    /// Pin the current worker thread to `cpu`, wrapping around the available
    /// cores.
    fn bind_to_cpu(&self, cpu: usize) -> bool {
        let cores = match core_affinity::get_core_ids() {
            Some(cores) if !cores.is_empty() => cores,
            _ => {
                warn!(stage = self.name(), cpu, "unable to list cores, not binding worker");
                return false;
            }
        };

        let core = cores[cpu % cores.len()];
        if !core_affinity::set_for_current(core) {
            warn!(stage = self.name(), cpu, core = core.id, "failed to bind worker");
            return false;
        }

        debug!(stage = self.name(), cpu, core = core.id, "bound worker to core");
        true
    }

    /// Cancel running stages, drop queued packets and wake all workers.
    pub(crate) fn shutdown(&self) {
        let queued = {
            let mut state = self.state.lock();
            state.shutdown = true;
            for running in &state.running {
                running.cancel();
            }
            self.queue_nonempty.notify_all();
            self.workers_released.notify_all();
            std::mem::take(&mut state.queue)
        };

        for list in queued {
            for packet in list.into_packets() {
                packet.abort(SHUTDOWN_REASON);
            }
        }
    }

    pub(crate) fn join_workers(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!(stage = self.name(), "stage worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::TypedStageFactory;
    use crate::stages::echo::{Echo, EchoPacket};
    use crate::testutil::{packet_with_reader, small_page_config};
    use crate::tuple::fifo::FifoReader;

    /// Container without workers, so queued lists stay queued.
    fn idle_container(config: StageConfig) -> StageContainer {
        StageContainer::new(Box::new(TypedStageFactory::<Echo>::new()), config)
    }

    fn echo_packet(merging: bool) -> (Packet, FifoReader) {
        let (packet, reader) = packet_with_reader(&small_page_config(8, 1), 4, EchoPacket).unwrap();
        (packet.with_merging(merging), reader)
    }

    #[test]
    fn mergeable_packets_share_queued_list() {
        let container = idle_container(StageConfig::with_workers(1));

        let (first, _first_reader) = echo_packet(true);
        let (second, _second_reader) = echo_packet(true);
        let (unmergeable, _reader) = echo_packet(false);

        container.enqueue(first).unwrap();
        container.enqueue(second).unwrap();
        assert_eq!(1, container.queued_lists());

        container.enqueue(unmergeable).unwrap();
        assert_eq!(2, container.queued_lists());

        let state = container.state.lock();
        assert_eq!(2, state.queue[0].len());
        assert_eq!(1, state.queue[1].len());
    }

    #[test]
    fn sharing_disabled_keeps_lists_apart() {
        let container = idle_container(StageConfig::with_workers(1).without_sharing());

        let (first, _first_reader) = echo_packet(true);
        let (second, _second_reader) = echo_packet(true);
        container.enqueue(first).unwrap();
        container.enqueue(second).unwrap();

        assert_eq!(2, container.queued_lists());
    }

    #[test]
    fn shutdown_aborts_queued_packets() {
        let container = idle_container(StageConfig::with_workers(1));

        let (first, mut first_reader) = echo_packet(true);
        let (second, mut second_reader) = echo_packet(true);
        container.enqueue(first).unwrap();
        container.enqueue(second).unwrap();

        container.shutdown();
        assert_eq!(0, container.queued_lists());
        for reader in [&mut first_reader, &mut second_reader] {
            let err = reader.get_page().unwrap_err();
            assert!(err.get_msg().contains(SHUTDOWN_REASON), "{err}");
        }

        let (late, _late_reader) = echo_packet(true);
        container.enqueue(late).unwrap_err();
    }

    #[test]
    fn residual_requeued_while_running() {
        let container = idle_container(StageConfig::with_workers(1));

        let (packet, _reader) = echo_packet(true);
        container.requeue_residual(PacketList::new(packet));
        assert_eq!(1, container.queued_lists());
    }

    #[test]
    fn residual_after_shutdown_is_aborted() {
        let container = idle_container(StageConfig::with_workers(1));
        container.shutdown();

        let (packet, mut reader) = echo_packet(true);
        container.requeue_residual(PacketList::new(packet));

        assert_eq!(0, container.queued_lists());
        let err = reader.get_page().unwrap_err();
        assert!(err.get_msg().contains(SHUTDOWN_REASON), "{err}");
    }

    #[test]
    fn reserve_more_than_workers() {
        let container = idle_container(StageConfig::with_workers(2));

        container.reserve(2).unwrap();
        assert_eq!(0, container.available_workers());
        container.unreserve(2);
        assert_eq!(2, container.available_workers());

        let err = container.reserve(3).unwrap_err();
        assert!(err.get_msg().contains("only has 2"), "{err}");
    }
}
