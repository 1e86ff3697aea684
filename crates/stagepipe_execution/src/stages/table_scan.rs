use std::any::Any;
use std::sync::Arc;

use stagepipe_error::Result;

use crate::container::adaptor::StageAdaptor;
use crate::packet::needs::WorkerNeeds;
use crate::packet::{Packet, PacketInput, PacketPayload, PacketType};
use crate::stage::Stage;
use crate::storage::{ScanPredicate, TupleStore};
use crate::tuple::fifo::{tuple_fifo_with_config, FifoConfig};
use crate::tuple::filter::TrivialFilter;

use super::bnl_join::TupleSource;

#[derive(Debug, Clone)]
pub struct TableScanPacket {
    pub store: Arc<dyn TupleStore>,
    pub predicate: Option<ScanPredicate>,
}

impl TableScanPacket {
    pub fn new(store: Arc<dyn TupleStore>) -> Self {
        TableScanPacket {
            store,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: ScanPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

impl PacketPayload for TableScanPacket {
    fn is_mergeable(&self, other: &dyn PacketPayload) -> bool {
        match other.as_any().downcast_ref::<TableScanPacket>() {
            Some(other) => {
                Arc::ptr_eq(&self.store, &other.store) && self.predicate == other.predicate
            }
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Scans a tuple store.
#[derive(Debug, Default)]
pub struct TableScan;

impl Stage for TableScan {
    type Packet = TableScanPacket;

    const NAME: &'static str = "table_scan";

    const REPLAYABLE: bool = true;

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        let mut iter = packet.store.open(packet.predicate.as_ref())?;
        while let Some(tuple) = iter.next()? {
            if adaptor.output(tuple)?.should_stop() {
                break;
            }
        }
        Ok(())
    }
}

/// Produces a fresh scan of a store every time it's reset.
#[derive(Debug, Clone)]
pub struct TableScanSource {
    packet: TableScanPacket,
    fifo: FifoConfig,
}

impl TableScanSource {
    pub fn new(packet: TableScanPacket, fifo: FifoConfig) -> Self {
        TableScanSource { packet, fifo }
    }
}

impl TupleSource for TableScanSource {
    fn tuple_size(&self) -> usize {
        self.packet.store.tuple_size()
    }

    fn reset(&self) -> Result<PacketInput> {
        let tuple_size = self.tuple_size();
        let (writer, reader) = tuple_fifo_with_config(tuple_size, self.fifo)?;
        let packet = Packet::new(
            "table_scan_source",
            self.packet.clone(),
            writer,
            TrivialFilter::new(tuple_size),
        )?;
        PacketInput::new(packet, reader)
    }

    fn declare_worker_needs(&self, needs: &mut WorkerNeeds) {
        needs.declare(PacketType::of::<TableScanPacket>(), 1);
    }
}
