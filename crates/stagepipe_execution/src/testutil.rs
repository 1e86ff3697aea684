//! Helpers for tests working with i32 tuples.
use std::sync::Arc;

use stagepipe_error::Result;

use crate::config::ExecutionConfig;
use crate::packet::{Packet, PacketInput, PacketPayload};
use crate::storage::MemoryTable;
use crate::tuple::fifo::{tuple_fifo_with_config, FifoReader};
use crate::tuple::filter::TrivialFilter;

pub fn i32_tuple(v: i32) -> [u8; 4] {
    v.to_le_bytes()
}

pub fn read_i32(tuple: &[u8]) -> i32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&tuple[..4]);
    i32::from_le_bytes(buf)
}

pub fn read_i64(tuple: &[u8]) -> i64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&tuple[..8]);
    i64::from_le_bytes(buf)
}

/// Table with a single i32 column.
pub fn i32_table(values: impl IntoIterator<Item = i32>) -> Result<Arc<MemoryTable>> {
    let tuples: Vec<_> = values.into_iter().map(i32_tuple).collect();
    let table = MemoryTable::try_from_tuples(4, tuples.iter().map(|t| &t[..]))?;
    Ok(Arc::new(table))
}

/// Small pages so tests cross page boundaries.
pub fn small_page_config(page_size: usize, workers: usize) -> ExecutionConfig {
    ExecutionConfig {
        page_size,
        fifo_capacity: None,
        default_stage_workers: workers,
    }
}

/// Build a packet with a trivial filter, returning the reader for its
/// output.
pub fn packet_with_reader<P: PacketPayload>(
    config: &ExecutionConfig,
    tuple_size: usize,
    payload: P,
) -> Result<(Packet, FifoReader)> {
    let (writer, reader) = tuple_fifo_with_config(tuple_size, config.fifo_config())?;
    let packet = Packet::new(
        format!("test_{}", std::any::type_name::<P>()),
        payload,
        writer,
        TrivialFilter::new(tuple_size),
    )?;
    Ok((packet, reader))
}

/// Build a packet usable as input of another packet.
pub fn input_packet<P: PacketPayload>(
    config: &ExecutionConfig,
    tuple_size: usize,
    payload: P,
    merging: bool,
) -> Result<PacketInput> {
    let (packet, reader) = packet_with_reader(config, tuple_size, payload)?;
    PacketInput::new(packet.with_merging(merging), reader)
}

/// Read all tuples until EOF.
pub fn drain_tuples(reader: &mut FifoReader) -> Result<Vec<Vec<u8>>> {
    let mut tuples = Vec::new();
    while let Some(page) = reader.get_page()? {
        tuples.extend(page.iter().map(|t| t.to_vec()));
    }
    Ok(tuples)
}

pub fn drain_i32s(reader: &mut FifoReader) -> Result<Vec<i32>> {
    Ok(drain_tuples(reader)?.iter().map(|t| read_i32(t)).collect())
}
