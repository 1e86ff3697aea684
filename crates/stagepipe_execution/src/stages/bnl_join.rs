use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use stagepipe_error::Result;
use tracing::trace;

use crate::container::adaptor::StageAdaptor;
use crate::packet::needs::WorkerNeeds;
use crate::packet::{PacketInput, PacketPayload};
use crate::stage::Stage;

use super::hash_join::{check_join_sizes, TupleJoin};

/// Produces the inner relation of a nested loop join.
pub trait TupleSource: Debug + Send + Sync {
    fn tuple_size(&self) -> usize;

    /// Create a new packet producing the relation from the start.
    fn reset(&self) -> Result<PacketInput>;

    /// Workers needed by the packets this source creates.
    fn declare_worker_needs(&self, needs: &mut WorkerNeeds);
}

/// Block nested loop join.
///
/// Input 0 is the outer (left) relation. The inner (right) relation is
/// produced again from the source for every outer page.
#[derive(Debug, Clone)]
pub struct BnlJoinPacket {
    pub join: Arc<dyn TupleJoin>,
    pub inner: Arc<dyn TupleSource>,
}

impl BnlJoinPacket {
    pub fn new(join: impl TupleJoin + 'static, inner: impl TupleSource + 'static) -> Self {
        BnlJoinPacket {
            join: Arc::new(join),
            inner: Arc::new(inner),
        }
    }
}

impl PacketPayload for BnlJoinPacket {
    fn declare_worker_needs(&self, needs: &mut WorkerNeeds) {
        self.inner.declare_worker_needs(needs);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct BnlJoin;

impl Stage for BnlJoin {
    type Packet = BnlJoinPacket;

    const NAME: &'static str = "bnl_join";

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        let join = packet.join.as_ref();

        let mut outer = adaptor.dispatch_input(0)?;
        check_join_sizes(join, adaptor, outer.tuple_size(), packet.inner.tuple_size())?;

        let mut out = vec![0; join.output_tuple_size()];
        while let Some(outer_page) = outer.get_page()? {
            let (inner_packet, mut inner) = packet.inner.reset()?.into_parts();
            adaptor.dispatch_packet(inner_packet)?;

            let mut inner_pages = 0;
            while let Some(inner_page) = inner.get_page()? {
                inner_pages += 1;
                for outer_tuple in outer_page.iter() {
                    let outer_key = join.left_key(outer_tuple);
                    for inner_tuple in inner_page.iter() {
                        if outer_key != join.right_key(inner_tuple) {
                            continue;
                        }
                        join.join(&mut out, outer_tuple, inner_tuple);
                        if adaptor.output(&out)?.should_stop() {
                            return Ok(());
                        }
                    }
                }
            }

            trace!(
                outer_tuples = outer_page.tuple_count(),
                inner_pages,
                "joined outer page"
            );
        }

        Ok(())
    }
}
