use chrono::{Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_decimal::Decimal;
use std::time::Duration;
use tempfile::TempDir;

use chain_activity_tracker::blockchain::evm::{group_by_transaction, widen, RawLog, TxClassifier, TRANSFER_TOPIC};
use chain_activity_tracker::config::TrackerConfig;
use chain_activity_tracker::database::{BackingStore, Database};
use chain_activity_tracker::models::{AddressType, Chain, KnownAddress, KnownAddresses, PriceBook, Tag, Transfer};
use chain_activity_tracker::tracker::{LargeTransferDetector, NotifiedHashes};

const TOKEN: &str = "0x0de08c1abe5fb86dd7fd2ac90400ace305138d5b";
const POOL: &str = "0x00000000000000000000000000000000000000aa";

fn create_test_transfer(id: u64) -> Transfer {
    let from = format!("0x{:040x}", id % 50);
    let to = format!("0x{:040x}", 1000 + id);
    let mut tf = Transfer::new(&format!("0x{:064x}", id), Chain::Idena, 1000 + id, 0);
    tf.timestamp = Some(Utc::now() - ChronoDuration::seconds((id % 3000) as i64));
    tf.signer = Some(from.clone());
    tf.changes = Transfer::create_changes(&from, Some(&to), Decimal::from(1000 + id * 7));
    tf.tags.insert(Tag::Send);
    tf
}

fn create_swap_logs(count: u64) -> Vec<RawLog> {
    (0..count)
        .map(|i| {
            let user = format!("0x{:040x}", 5000 + i);
            let (from, to) = if i % 2 == 0 { (POOL.to_string(), user) } else { (user, POOL.to_string()) };
            serde_json::from_value(serde_json::json!({
                "address": TOKEN,
                "topics": [TRANSFER_TOPIC, widen(&from), widen(&to)],
                "data": format!("0x{:064x}", (i + 1) * 1_000_000_000_000_000u64),
                "blockNumber": "0x64",
                "transactionHash": format!("0x{:064x}", i / 2),
                "logIndex": format!("0x{:x}", i),
            }))
            .expect("valid log")
        })
        .collect()
}

fn bench_database_insert(c: &mut Criterion) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("bench.db");
    let database = Database::new(db_path.to_str().unwrap()).expect("Failed to create database");

    let mut group = c.benchmark_group("database_insert");
    let mut next_id = 0u64;
    for size in [1u64, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("insert_transfers", size), size, |b, &size| {
            b.iter(|| {
                let tfs: Vec<Transfer> = (next_id..next_id + size).map(create_test_transfer).collect();
                next_id += size;
                let _ = database.insert_transfers(black_box(&tfs));
            });
        });
    }
    group.finish();
}

fn bench_recent_transfers(c: &mut Criterion) {
    let database = Database::new_in_memory().expect("Failed to create database");
    let tfs: Vec<Transfer> = (0..2000).map(create_test_transfer).collect();
    database.insert_transfers(&tfs).expect("Failed to store transfers");

    c.bench_function("get_recent_transfers", |b| {
        b.iter(|| {
            let _ = database.get_recent_transfers(black_box(Utc::now() - ChronoDuration::hours(1)));
        });
    });
}

fn bench_classify(c: &mut Criterion) {
    let registry = KnownAddresses::from_entries([(POOL.to_string(), KnownAddress::new(AddressType::Pool))]);
    let prices = PriceBook::default();
    let classifier = TxClassifier::new(&registry, &prices, TOKEN);
    let groups = group_by_transaction(create_swap_logs(400));

    c.bench_function("classify_swaps", |b| {
        b.iter(|| {
            for logs in &groups {
                let _ = classifier.classify(black_box(logs), None, "0x0000000000000000000000000000000000005000");
            }
        });
    });
}

fn bench_large_transfer_check(c: &mut Criterion) {
    let config = TrackerConfig::default();
    let prices = PriceBook::default();
    let notified = NotifiedHashes::default();

    let mut group = c.benchmark_group("large_transfer_check");
    for count in [100u64, 1000].iter() {
        let tfs: Vec<Transfer> = (0..*count).map(create_test_transfer).collect();
        group.bench_with_input(BenchmarkId::new("window", count), &tfs, |b, tfs| {
            b.iter(|| {
                let mut detector = LargeTransferDetector::new();
                detector.check(black_box(tfs), Utc::now(), &config, &prices, &notified)
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(50);
    targets = bench_database_insert, bench_recent_transfers, bench_classify, bench_large_transfer_check
);
criterion_main!(benches);
