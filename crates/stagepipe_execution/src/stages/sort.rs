use std::any::Any;
use std::sync::Arc;

use stagepipe_error::{Result, StagepipeError};
use tracing::debug;

use crate::container::adaptor::StageAdaptor;
use crate::packet::PacketPayload;
use crate::stage::Stage;
use crate::tuple::key::{KeyCompare, KeyExtractor};

/// In memory sort of the input.
#[derive(Debug, Clone)]
pub struct SortPacket {
    pub key: Arc<dyn KeyExtractor>,
    pub compare: Arc<dyn KeyCompare>,
}

impl SortPacket {
    pub fn new(key: impl KeyExtractor + 'static, compare: impl KeyCompare + 'static) -> Self {
        SortPacket {
            key: Arc::new(key),
            compare: Arc::new(compare),
        }
    }
}

impl PacketPayload for SortPacket {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Sort {
    /// Buffered input tuples.
    tuples: Vec<u8>,
}

impl Stage for Sort {
    type Packet = SortPacket;

    const NAME: &'static str = "sort";

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        let tuple_size = adaptor.tuple_size();
        let mut input = adaptor.dispatch_input(0)?;
        if input.tuple_size() != tuple_size {
            return Err(StagepipeError::new(format!(
                "Sort input tuple size {} doesn't match output tuple size {tuple_size}",
                input.tuple_size()
            )));
        }
        packet.key.check_tuple_size(tuple_size)?;

        while let Some(page) = input.get_page()? {
            self.tuples.extend_from_slice(page.as_bytes());
        }

        let mut sorted: Vec<&[u8]> = self.tuples.chunks_exact(tuple_size).collect();
        sorted.sort_by(|a, b| {
            packet
                .compare
                .compare(packet.key.extract(a), packet.key.extract(b))
        });

        debug!(tuples = sorted.len(), "sorted input");

        for tuple in sorted {
            if adaptor.output(tuple)?.should_stop() {
                break;
            }
        }

        Ok(())
    }
}
