//! Routing of packets to the stage containers that execute them.
pub mod policy;
pub mod reservation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use stagepipe_error::{Result, StagepipeError};
use tracing::{debug, info};

use crate::config::{ExecutionConfig, StageConfig};
use crate::container::StageContainer;
use crate::packet::needs::WorkerNeeds;
use crate::packet::{Packet, PacketState, PacketType};
use crate::stage::{Stage, TypedStageFactory};
use crate::tuple::fifo::{tuple_fifo_with_config, FifoReader, FifoWriter};

use self::policy::{assign_packet_tree, QueryState, SchedulingPolicy};
use self::reservation::{WorkerReservation, WorkerReservations};

/// Registry of stage containers, fixed once the dispatcher is built.
#[derive(Debug)]
pub(crate) struct StageDirectory {
    config: ExecutionConfig,
    /// Containers in registration order.
    containers: Vec<Arc<StageContainer>>,
    by_type: HashMap<PacketType, Arc<StageContainer>>,
    policies: HashMap<String, Arc<dyn SchedulingPolicy>>,
}

impl StageDirectory {
    pub(crate) fn new(
        config: ExecutionConfig,
        containers: Vec<Arc<StageContainer>>,
        policies: HashMap<String, Arc<dyn SchedulingPolicy>>,
    ) -> Self {
        let by_type = containers
            .iter()
            .map(|c| (c.packet_type(), c.clone()))
            .collect();
        StageDirectory {
            config,
            containers,
            by_type,
            policies,
        }
    }

    pub(crate) fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn container(&self, packet_type: &PacketType) -> Result<&Arc<StageContainer>> {
        self.by_type.get(packet_type).ok_or_else(|| {
            StagepipeError::new(format!(
                "No stage registered for packet type '{packet_type}'"
            ))
        })
    }

    pub(crate) fn dispatch_packet(&self, mut packet: Packet) -> Result<()> {
        let container = self.container(&packet.packet_type())?;
        if packet.stage_tuple_size() > self.config.page_size {
            return Err(StagepipeError::new(format!(
                "Tuple size {} for packet '{}' exceeds page size {}",
                packet.stage_tuple_size(),
                packet.label(),
                self.config.page_size
            )));
        }

        debug!(
            stage = container.name(),
            packet = %packet.id(),
            label = packet.label(),
            cpu = ?packet.cpu_hint(),
            "dispatching packet"
        );

        packet.mark_submitted();
        container.enqueue(packet)
    }

    fn shutdown(&self) {
        for container in &self.containers {
            container.shutdown();
        }
        for container in &self.containers {
            container.join_workers();
        }
    }
}

/// Collects stage registrations before any worker starts.
#[derive(Debug)]
pub struct DispatcherBuilder {
    config: ExecutionConfig,
    containers: Vec<Arc<StageContainer>>,
    policies: HashMap<String, Arc<dyn SchedulingPolicy>>,
}

impl DispatcherBuilder {
    pub fn new(config: ExecutionConfig) -> Self {
        DispatcherBuilder {
            config,
            containers: Vec::new(),
            policies: HashMap::new(),
        }
    }

    /// Register a stage using the default stage config.
    pub fn register_stage<S: Stage>(self) -> Result<Self> {
        let config = self.config.default_stage_config();
        self.register_stage_with::<S>(config)
    }

    pub fn register_stage_with<S: Stage>(mut self, config: StageConfig) -> Result<Self> {
        let packet_type = PacketType::of::<S::Packet>();
        if self
            .containers
            .iter()
            .any(|c| c.packet_type() == packet_type)
        {
            return Err(StagepipeError::new(format!(
                "Duplicate stage registered for packet type '{packet_type}'"
            )));
        }
        if config.workers == 0 {
            return Err(StagepipeError::new(format!(
                "Stage '{}' needs at least one worker",
                S::NAME
            )));
        }

        let factory = Box::new(TypedStageFactory::<S>::new());
        self.containers
            .push(Arc::new(StageContainer::new(factory, config)));

        Ok(self)
    }

    /// Register a named scheduling policy.
    pub fn register_policy(
        mut self,
        name: impl Into<String>,
        policy: impl SchedulingPolicy + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if self.policies.contains_key(&name) {
            return Err(StagepipeError::new(format!(
                "Duplicate scheduling policy '{name}'"
            )));
        }
        self.policies.insert(name, Arc::new(policy));
        Ok(self)
    }

    /// Seal the registry and start all stage workers.
    pub fn build(self) -> Result<Dispatcher> {
        let directory = Arc::new(StageDirectory::new(
            self.config,
            self.containers,
            self.policies,
        ));

        for container in &directory.containers {
            if let Err(e) = container.spawn_workers(&directory) {
                directory.shutdown();
                return Err(e);
            }
        }

        info!(
            stages = directory.containers.len(),
            workers = directory
                .containers
                .iter()
                .map(|c| c.num_workers())
                .sum::<usize>(),
            "dispatcher started"
        );

        Ok(Dispatcher {
            directory,
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Entry point for running packets.
#[derive(Debug)]
pub struct Dispatcher {
    directory: Arc<StageDirectory>,
    shut_down: AtomicBool,
}

impl Dispatcher {
    pub fn builder(config: ExecutionConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub fn config(&self) -> &ExecutionConfig {
        self.directory.config()
    }

    /// Create a fifo using the configured page size and capacity.
    pub fn tuple_fifo(&self, tuple_size: usize) -> Result<(FifoWriter, FifoReader)> {
        tuple_fifo_with_config(tuple_size, self.config().fifo_config())
    }

    /// Send a packet to the container for its type.
    ///
    /// Input packets are dispatched by the stage once it needs them.
    pub fn dispatch_packet(&self, packet: Packet) -> Result<()> {
        self.directory.dispatch_packet(packet)
    }

    /// Reserve workers on every container named in `needs`.
    ///
    /// Containers are reserved in a fixed order so concurrent queries can't
    /// deadlock each other. Blocks until all workers are available.
    pub fn reserve_workers(&self, needs: &WorkerNeeds) -> Result<WorkerReservations> {
        let mut reservations = WorkerReservations::default();
        for (packet_type, count) in needs.iter() {
            let container = self.directory.container(packet_type)?;
            container.reserve(count)?;
            reservations.insert(WorkerReservation::new(container.clone(), count));
        }
        Ok(reservations)
    }

    /// Reserve workers for the whole packet tree, then dispatch it.
    ///
    /// Each packet releases its worker when it completes.
    pub fn submit(&self, mut packet: Packet) -> Result<()> {
        if packet.state() != PacketState::Unsubmitted {
            return Err(StagepipeError::new(format!(
                "Packet '{}' already submitted",
                packet.label()
            )));
        }

        let mut needs = WorkerNeeds::new();
        packet.declare_worker_needs(&mut needs);
        let mut reservations = self.reserve_workers(&needs)?;

        packet.attach_reservations(&mut reservations);
        // Extra needs declared by payloads are held until the root completes.
        packet.hold_reservations(reservations.into_remaining());

        self.dispatch_packet(packet)
    }

    /// Assign the packet tree using a registered policy.
    pub fn assign_with_policy(&self, name: &str, packet: &mut Packet) -> Result<QueryState> {
        let policy = self.directory.policies.get(name).ok_or_else(|| {
            StagepipeError::new(format!("Unknown scheduling policy '{name}'"))
        })?;
        Ok(assign_packet_tree(policy.as_ref(), packet))
    }

    pub fn is_sharing_enabled(&self, packet_type: &PacketType) -> Result<bool> {
        Ok(self.directory.container(packet_type)?.config().sharing_enabled)
    }

    pub fn available_workers(&self, packet_type: &PacketType) -> Result<usize> {
        Ok(self.directory.container(packet_type)?.available_workers())
    }

    /// Number of packet lists waiting for a worker of the stage.
    pub fn queued_lists(&self, packet_type: &PacketType) -> Result<usize> {
        Ok(self.directory.container(packet_type)?.queued_lists())
    }

    /// Names of registered stages, in registration order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.directory
            .containers
            .iter()
            .map(|c| c.name())
            .collect()
    }

    /// Cancel running stages and stop all workers.
    ///
    /// Called on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down dispatcher");
        self.directory.shutdown();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
