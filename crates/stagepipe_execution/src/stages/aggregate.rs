use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use stagepipe_error::{Result, StagepipeError};

use crate::container::adaptor::StageAdaptor;
use crate::packet::PacketPayload;
use crate::stage::Stage;
use crate::tuple::key::KeyExtractor;

/// Aggregate function over a group of tuples.
///
/// The output tuple doubles as the aggregate state.
pub trait TupleAggregate: Debug + Send + Sync {
    fn output_tuple_size(&self) -> usize;

    /// Start a new group with its first tuple.
    fn init(&self, dest: &mut [u8], first: &[u8]);

    fn update(&self, dest: &mut [u8], tuple: &[u8]);

    /// Check that the aggregate can read input tuples of `tuple_size` bytes.
    fn check_input_tuple_size(&self, _tuple_size: usize) -> Result<()> {
        Ok(())
    }

    /// Finalize the state before it's output.
    fn finish(&self, _dest: &mut [u8]) {}
}

/// Counts tuples, output as a little-endian i64.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountAggregate;

impl TupleAggregate for CountAggregate {
    fn output_tuple_size(&self) -> usize {
        8
    }

    fn init(&self, dest: &mut [u8], _first: &[u8]) {
        dest.copy_from_slice(&1_i64.to_le_bytes());
    }

    fn update(&self, dest: &mut [u8], _tuple: &[u8]) {
        let count = read_i64(dest) + 1;
        dest.copy_from_slice(&count.to_le_bytes());
    }
}

/// Sums a little-endian i32 column into an i64.
#[derive(Debug, Clone, Copy)]
pub struct I32SumAggregate {
    pub offset: usize,
}

impl TupleAggregate for I32SumAggregate {
    fn output_tuple_size(&self) -> usize {
        8
    }

    fn init(&self, dest: &mut [u8], first: &[u8]) {
        let v = read_i32(&first[self.offset..]) as i64;
        dest.copy_from_slice(&v.to_le_bytes());
    }

    fn update(&self, dest: &mut [u8], tuple: &[u8]) {
        let sum = read_i64(dest) + read_i32(&tuple[self.offset..]) as i64;
        dest.copy_from_slice(&sum.to_le_bytes());
    }

    fn check_input_tuple_size(&self, tuple_size: usize) -> Result<()> {
        if self.offset + 4 > tuple_size {
            return Err(StagepipeError::new(format!(
                "Cannot sum i32 at offset {} in tuples of size {tuple_size}",
                self.offset
            )));
        }
        Ok(())
    }
}

fn read_i32(buf: &[u8]) -> i32 {
    let mut b = [0; 4];
    b.copy_from_slice(&buf[..4]);
    i32::from_le_bytes(b)
}

fn read_i64(buf: &[u8]) -> i64 {
    let mut b = [0; 8];
    b.copy_from_slice(&buf[..8]);
    i64::from_le_bytes(b)
}

/// Aggregates runs of consecutive tuples with equal keys.
///
/// Input must be sorted on the key. Without a key the whole input is a
/// single group, and empty input produces no output.
#[derive(Debug, Clone)]
pub struct AggregatePacket {
    pub aggregate: Arc<dyn TupleAggregate>,
    pub key: Option<Arc<dyn KeyExtractor>>,
}

impl AggregatePacket {
    pub fn new(aggregate: impl TupleAggregate + 'static) -> Self {
        AggregatePacket {
            aggregate: Arc::new(aggregate),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl KeyExtractor + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }
}

impl PacketPayload for AggregatePacket {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Aggregate;

impl Stage for Aggregate {
    type Packet = AggregatePacket;

    const NAME: &'static str = "aggregate";

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        let aggregate = packet.aggregate.as_ref();
        if aggregate.output_tuple_size() != adaptor.tuple_size() {
            return Err(StagepipeError::new(format!(
                "Aggregate produces tuples of size {}, packet expects {}",
                aggregate.output_tuple_size(),
                adaptor.tuple_size()
            )));
        }

        let mut input = adaptor.dispatch_input(0)?;
        aggregate.check_input_tuple_size(input.tuple_size())?;
        if let Some(key) = &packet.key {
            key.check_tuple_size(input.tuple_size())?;
        }

        let mut state = vec![0; aggregate.output_tuple_size()];
        let mut group_key: Option<Vec<u8>> = None;

        while let Some(page) = input.get_page()? {
            for tuple in page.iter() {
                let key: &[u8] = match &packet.key {
                    Some(extractor) => extractor.extract(tuple),
                    None => &[],
                };

                let same_group = group_key.as_deref() == Some(key);
                if same_group {
                    aggregate.update(&mut state, tuple);
                    continue;
                }

                if group_key.is_some() {
                    aggregate.finish(&mut state);
                    if adaptor.output(&state)?.should_stop() {
                        return Ok(());
                    }
                }

                aggregate.init(&mut state, tuple);
                group_key = Some(key.to_vec());
            }
        }

        if group_key.is_some() {
            aggregate.finish(&mut state);
            adaptor.output(&state)?;
        }

        Ok(())
    }
}
