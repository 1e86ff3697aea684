use std::sync::Arc;
use std::time::{Duration, Instant};

use similar_asserts::assert_eq;
use stagepipe_execution::config::ExecutionConfig;
use stagepipe_execution::dispatcher::Dispatcher;
use stagepipe_execution::packet::{PacketInput, PacketType};
use stagepipe_execution::stages::aggregate::{
    AggregatePacket,
    CountAggregate,
    I32SumAggregate,
    TupleAggregate,
};
use stagepipe_execution::stages::bnl_join::BnlJoinPacket;
use stagepipe_execution::stages::file_dump::FileDumpPacket;
use stagepipe_execution::stages::file_scan::FileScanPacket;
use stagepipe_execution::stages::func_call::FuncCallPacket;
use stagepipe_execution::stages::hash_join::{ConcatJoin, HashJoinPacket};
use stagepipe_execution::stages::register_builtin_stages;
use stagepipe_execution::stages::sort::SortPacket;
use stagepipe_execution::stages::table_scan::{TableScanPacket, TableScanSource};
use stagepipe_execution::storage::{MemoryTable, ScanPredicate};
use stagepipe_execution::testutil::{
    drain_i32s,
    drain_tuples,
    i32_table,
    input_packet,
    packet_with_reader,
    read_i32,
    read_i64,
    small_page_config,
};
use stagepipe_execution::tuple::key::{I32Compare, OffsetKeyExtractor};

fn builtin_dispatcher(config: ExecutionConfig) -> Dispatcher {
    logutil::configure_test_logger();
    register_builtin_stages(Dispatcher::builder(config))
        .unwrap()
        .build()
        .unwrap()
}

fn pair(a: i32, b: i32) -> [u8; 8] {
    let mut buf = [0; 8];
    buf[..4].copy_from_slice(&a.to_le_bytes());
    buf[4..].copy_from_slice(&b.to_le_bytes());
    buf
}

fn read_pair(tuple: &[u8]) -> (i32, i32) {
    (read_i32(&tuple[..4]), read_i32(&tuple[4..8]))
}

fn pair_table(pairs: &[(i32, i32)]) -> Arc<MemoryTable> {
    let tuples: Vec<_> = pairs.iter().map(|(a, b)| pair(*a, *b)).collect();
    Arc::new(MemoryTable::try_from_tuples(8, tuples.iter().map(|t| &t[..])).unwrap())
}

/// Sums the second column per key, outputting (key i32, sum i64).
#[derive(Debug)]
struct KeyedSum;

impl TupleAggregate for KeyedSum {
    fn output_tuple_size(&self) -> usize {
        12
    }

    fn init(&self, dest: &mut [u8], first: &[u8]) {
        dest[..4].copy_from_slice(&first[..4]);
        dest[4..].copy_from_slice(&(read_i32(&first[4..]) as i64).to_le_bytes());
    }

    fn update(&self, dest: &mut [u8], tuple: &[u8]) {
        let sum = read_i64(&dest[4..]) + read_i32(&tuple[4..]) as i64;
        dest[4..].copy_from_slice(&sum.to_le_bytes());
    }
}

#[test]
fn file_dump_then_scan() {
    let dispatcher = builtin_dispatcher(small_page_config(16, 1));
    let config = dispatcher.config().clone();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tuples.dat");

    let scan = input_packet(
        &config,
        4,
        TableScanPacket::new(i32_table(1..=10).unwrap()),
        false,
    )
    .unwrap();
    let (dump, mut dump_reader) =
        packet_with_reader(&config, 4, FileDumpPacket::new(&path)).unwrap();
    dispatcher.dispatch_packet(dump.with_input(scan)).unwrap();

    // Dump outputs nothing, EOF means the file is written.
    assert_eq!(Vec::<i32>::new(), drain_i32s(&mut dump_reader).unwrap());
    assert_eq!(40, std::fs::metadata(&path).unwrap().len());

    let (scan, mut reader) = packet_with_reader(&config, 4, FileScanPacket::new(&path)).unwrap();
    dispatcher.dispatch_packet(scan).unwrap();
    assert_eq!((1..=10).collect::<Vec<_>>(), drain_i32s(&mut reader).unwrap());
}

#[test]
fn file_scan_missing_file() {
    let dispatcher = builtin_dispatcher(small_page_config(16, 1));
    let config = dispatcher.config().clone();
    let dir = tempfile::tempdir().unwrap();

    let (scan, mut reader) =
        packet_with_reader(&config, 4, FileScanPacket::new(dir.path().join("missing"))).unwrap();
    dispatcher.dispatch_packet(scan).unwrap();

    let err = reader.get_page().unwrap_err();
    assert!(err.get_msg().contains("Failed to open"), "{err}");
}

#[test]
fn scan_with_predicate() {
    let dispatcher = builtin_dispatcher(small_page_config(16, 1));
    let config = dispatcher.config().clone();

    let payload = TableScanPacket::new(i32_table(1..=10).unwrap())
        .with_predicate(ScanPredicate::new("gt_7", |t| read_i32(t) > 7));
    let (scan, mut reader) = packet_with_reader(&config, 4, payload).unwrap();
    dispatcher.dispatch_packet(scan).unwrap();

    assert_eq!(vec![8, 9, 10], drain_i32s(&mut reader).unwrap());
}

#[test]
fn sort_then_aggregate() {
    let dispatcher = builtin_dispatcher(small_page_config(16, 1));
    let config = dispatcher.config().clone();

    let rows = vec![(3, 1), (1, 10), (2, 5), (1, 20), (3, 2), (2, 5)];
    let feed = FuncCallPacket::new("rows", move |adaptor| {
        for (k, v) in &rows {
            if adaptor.output(&pair(*k, *v))?.should_stop() {
                break;
            }
        }
        Ok(())
    });
    let feed = input_packet(&config, 8, feed, false).unwrap();

    let sort = SortPacket::new(OffsetKeyExtractor::new(0, 4), I32Compare);
    let (sort, sort_reader) = packet_with_reader(&config, 8, sort).unwrap();
    let sort = PacketInput::new(sort.with_input(feed), sort_reader).unwrap();

    let agg = AggregatePacket::new(KeyedSum).with_key(OffsetKeyExtractor::new(0, 4));
    let (agg, mut reader) = packet_with_reader(&config, 12, agg).unwrap();
    dispatcher.dispatch_packet(agg.with_input(sort)).unwrap();

    let groups: Vec<_> = drain_tuples(&mut reader)
        .unwrap()
        .iter()
        .map(|t| (read_i32(&t[..4]), read_i64(&t[4..])))
        .collect();
    assert_eq!(vec![(1, 30), (2, 10), (3, 3)], groups);
}

#[test]
fn count_without_key() {
    let dispatcher = builtin_dispatcher(small_page_config(16, 1));
    let config = dispatcher.config().clone();

    let scan = input_packet(
        &config,
        4,
        TableScanPacket::new(i32_table(0..25).unwrap()),
        false,
    )
    .unwrap();
    let (agg, mut reader) =
        packet_with_reader(&config, 8, AggregatePacket::new(CountAggregate)).unwrap();
    dispatcher.dispatch_packet(agg.with_input(scan)).unwrap();

    let counts: Vec<_> = drain_tuples(&mut reader)
        .unwrap()
        .iter()
        .map(|t| read_i64(t))
        .collect();
    assert_eq!(vec![25], counts);
}

#[test]
fn aggregate_rejects_out_of_bounds_column() {
    let dispatcher = builtin_dispatcher(small_page_config(16, 1));
    let config = dispatcher.config().clone();

    let scan = input_packet(
        &config,
        4,
        TableScanPacket::new(i32_table(1..=3).unwrap()),
        false,
    )
    .unwrap();
    let agg = AggregatePacket::new(I32SumAggregate { offset: 2 });
    let (agg, mut reader) = packet_with_reader(&config, 8, agg).unwrap();
    dispatcher.dispatch_packet(agg.with_input(scan)).unwrap();

    let err = drain_tuples(&mut reader).unwrap_err();
    assert!(err.get_msg().contains("Cannot sum i32 at offset 2"), "{err}");
}

#[test]
fn sort_rejects_out_of_bounds_key() {
    let dispatcher = builtin_dispatcher(small_page_config(16, 1));
    let config = dispatcher.config().clone();

    let scan = input_packet(
        &config,
        4,
        TableScanPacket::new(i32_table([3, 1, 2]).unwrap()),
        false,
    )
    .unwrap();
    let sort = SortPacket::new(OffsetKeyExtractor::new(2, 4), I32Compare);
    let (sort, mut reader) = packet_with_reader(&config, 4, sort).unwrap();
    dispatcher.dispatch_packet(sort.with_input(scan)).unwrap();

    let err = drain_tuples(&mut reader).unwrap_err();
    assert!(err.get_msg().contains("out of bounds"), "{err}");
}

fn pair_join() -> ConcatJoin {
    ConcatJoin {
        left_tuple_size: 8,
        right_tuple_size: 8,
        left_key: OffsetKeyExtractor::new(0, 4),
        right_key: OffsetKeyExtractor::new(0, 4),
    }
}

fn read_joined(tuples: Vec<Vec<u8>>) -> Vec<((i32, i32), (i32, i32))> {
    tuples
        .iter()
        .map(|t| (read_pair(&t[..8]), read_pair(&t[8..])))
        .collect()
}

#[test]
fn hash_join_matches() {
    let dispatcher = builtin_dispatcher(small_page_config(32, 1));
    let config = dispatcher.config().clone();

    let left = pair_table(&[(1, 10), (2, 20), (1, 11)]);
    let right = pair_table(&[(1, 100), (3, 300), (2, 200)]);

    let left = input_packet(&config, 8, TableScanPacket::new(left), false).unwrap();
    let right = input_packet(&config, 8, TableScanPacket::new(right), false).unwrap();
    let (join, mut reader) =
        packet_with_reader(&config, 16, HashJoinPacket::new(pair_join())).unwrap();
    dispatcher
        .dispatch_packet(join.with_input(left).with_input(right))
        .unwrap();

    let joined = read_joined(drain_tuples(&mut reader).unwrap());
    assert_eq!(
        vec![
            ((1, 10), (1, 100)),
            ((1, 11), (1, 100)),
            ((2, 20), (2, 200)),
        ],
        joined
    );
}

#[test]
fn hash_join_rejects_out_of_bounds_key() {
    let dispatcher = builtin_dispatcher(small_page_config(32, 1));
    let config = dispatcher.config().clone();

    let left = TableScanPacket::new(pair_table(&[(1, 10)]));
    let left = input_packet(&config, 8, left, false).unwrap();
    let right = TableScanPacket::new(pair_table(&[(1, 100)]));
    let right = input_packet(&config, 8, right, false).unwrap();
    let join = ConcatJoin {
        right_key: OffsetKeyExtractor::new(6, 4),
        ..pair_join()
    };
    let (join, mut reader) = packet_with_reader(&config, 16, HashJoinPacket::new(join)).unwrap();
    dispatcher
        .dispatch_packet(join.with_input(left).with_input(right))
        .unwrap();

    let err = drain_tuples(&mut reader).unwrap_err();
    assert!(err.get_msg().contains("out of bounds"), "{err}");
}

#[test]
fn bnl_join_rescans_inner() {
    // Two tuples per outer page so the inner relation is produced twice.
    let dispatcher = builtin_dispatcher(small_page_config(16, 2));
    let config = dispatcher.config().clone();

    let outer = pair_table(&[(1, 10), (2, 20), (1, 11)]);
    let inner = pair_table(&[(2, 200), (1, 100)]);

    let outer = input_packet(&config, 8, TableScanPacket::new(outer), false).unwrap();
    let source = TableScanSource::new(TableScanPacket::new(inner), config.fifo_config());
    let (join, mut reader) =
        packet_with_reader(&config, 16, BnlJoinPacket::new(pair_join(), source)).unwrap();

    let scan_type = PacketType::of::<TableScanPacket>();
    dispatcher.submit(join.with_input(outer)).unwrap();

    let joined = read_joined(drain_tuples(&mut reader).unwrap());
    assert_eq!(
        vec![
            ((1, 10), (1, 100)),
            ((2, 20), (2, 200)),
            ((1, 11), (1, 100)),
        ],
        joined
    );

    // Slots reserved for the inner scans are held by the join packet.
    let deadline = Instant::now() + Duration::from_secs(10);
    while dispatcher.available_workers(&scan_type).unwrap() != 2 {
        assert!(Instant::now() < deadline, "scan workers never released");
        std::thread::sleep(Duration::from_millis(1));
    }
}
