use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use hashbrown::HashMap;
use stagepipe_error::{Result, StagepipeError};
use tracing::debug;

use crate::container::adaptor::StageAdaptor;
use crate::packet::PacketPayload;
use crate::stage::Stage;
use crate::tuple::key::{KeyExtractor, OffsetKeyExtractor};

/// Describes how tuples of two relations join.
pub trait TupleJoin: Debug + Send + Sync {
    fn left_tuple_size(&self) -> usize;

    fn right_tuple_size(&self) -> usize;

    fn output_tuple_size(&self) -> usize;

    fn left_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8];

    fn right_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8];

    /// Write the joined tuple.
    fn join(&self, dest: &mut [u8], left: &[u8], right: &[u8]);

    /// Check that keys can be read from both sides.
    fn check_keys(&self) -> Result<()> {
        Ok(())
    }
}

/// Equi-join on fixed offset keys, outputting the left tuple followed by the
/// right tuple.
#[derive(Debug, Clone, Copy)]
pub struct ConcatJoin {
    pub left_tuple_size: usize,
    pub right_tuple_size: usize,
    pub left_key: OffsetKeyExtractor,
    pub right_key: OffsetKeyExtractor,
}

impl TupleJoin for ConcatJoin {
    fn left_tuple_size(&self) -> usize {
        self.left_tuple_size
    }

    fn right_tuple_size(&self) -> usize {
        self.right_tuple_size
    }

    fn output_tuple_size(&self) -> usize {
        self.left_tuple_size + self.right_tuple_size
    }

    fn left_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
        self.left_key.extract(tuple)
    }

    fn right_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
        self.right_key.extract(tuple)
    }

    fn join(&self, dest: &mut [u8], left: &[u8], right: &[u8]) {
        let (l, r) = dest.split_at_mut(self.left_tuple_size);
        l.copy_from_slice(left);
        r.copy_from_slice(right);
    }

    fn check_keys(&self) -> Result<()> {
        self.left_key.check_tuple_size(self.left_tuple_size)?;
        self.right_key.check_tuple_size(self.right_tuple_size)
    }
}

/// Check that the inputs and output of a join stage match the join.
pub(crate) fn check_join_sizes(
    join: &dyn TupleJoin,
    adaptor: &StageAdaptor,
    left_size: usize,
    right_size: usize,
) -> Result<()> {
    if join.left_tuple_size() != left_size
        || join.right_tuple_size() != right_size
        || join.output_tuple_size() != adaptor.tuple_size()
    {
        return Err(StagepipeError::new(format!(
            "Join expects ({}, {}) -> {}, got ({left_size}, {right_size}) -> {}",
            join.left_tuple_size(),
            join.right_tuple_size(),
            join.output_tuple_size(),
            adaptor.tuple_size(),
        )));
    }
    join.check_keys()
}

/// Hash join building on the left input and probing with the right.
///
/// Input 0 is the left relation, input 1 the right relation.
#[derive(Debug, Clone)]
pub struct HashJoinPacket {
    pub join: Arc<dyn TupleJoin>,
}

impl HashJoinPacket {
    pub fn new(join: impl TupleJoin + 'static) -> Self {
        HashJoinPacket {
            join: Arc::new(join),
        }
    }
}

impl PacketPayload for HashJoinPacket {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct HashJoin {
    /// Left tuples keyed by join key, concatenated per key.
    table: HashMap<Vec<u8>, Vec<u8>>,
}

impl Stage for HashJoin {
    type Packet = HashJoinPacket;

    const NAME: &'static str = "hash_join";

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        let join = packet.join.as_ref();

        let mut left = adaptor.dispatch_input(0)?;
        let mut right = adaptor.dispatch_input(1)?;
        check_join_sizes(join, adaptor, left.tuple_size(), right.tuple_size())?;

        let mut build_tuples = 0;
        while let Some(page) = left.get_page()? {
            for tuple in page.iter() {
                self.table
                    .entry_ref(join.left_key(tuple))
                    .or_default()
                    .extend_from_slice(tuple);
                build_tuples += 1;
            }
        }
        debug!(build_tuples, keys = self.table.len(), "built hash table");

        if self.table.is_empty() {
            // Nothing can match.
            right.terminate();
            return Ok(());
        }

        let left_size = join.left_tuple_size();
        let mut out = vec![0; join.output_tuple_size()];
        while let Some(page) = right.get_page()? {
            for tuple in page.iter() {
                let matches = match self.table.get(join.right_key(tuple)) {
                    Some(matches) => matches,
                    None => continue,
                };
                for left_tuple in matches.chunks_exact(left_size) {
                    join.join(&mut out, left_tuple, tuple);
                    if adaptor.output(&out)?.should_stop() {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}
