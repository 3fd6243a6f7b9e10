//! Benchmarks for the wire-protocol hot path.
//!
//! Run with: `cargo bench --bench protocol_bench`

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pg_logical_replication::protocol::messages::parse_error_fields;
use pg_logical_replication::protocol::replication::{
    encode_standby_status_update, parse_copy_data, StandbyStatus,
};
use pg_logical_replication::Lsn;

fn make_xlogdata_payload(data_size: usize) -> Bytes {
    let mut v = Vec::with_capacity(1 + 24 + data_size);
    v.push(b'w');
    v.extend_from_slice(&0x0123_4567_89AB_CDEFu64.to_be_bytes()); // wal_start
    v.extend_from_slice(&0xFEDC_BA98_7654_3210u64.to_be_bytes()); // wal_end
    v.extend_from_slice(&1_234_567_890i64.to_be_bytes()); // server_time
    v.extend_from_slice(&vec![0x42u8; data_size]);
    Bytes::from(v)
}

fn make_keepalive_payload() -> Bytes {
    let mut v = Vec::with_capacity(18);
    v.push(b'k');
    v.extend_from_slice(&100u64.to_be_bytes());
    v.extend_from_slice(&200i64.to_be_bytes());
    v.push(1);
    Bytes::from(v)
}

fn make_error_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"SERROR\0");
    payload.extend_from_slice(b"VERROR\0");
    payload.extend_from_slice(b"C55006\0");
    payload.extend_from_slice(b"Mreplication slot \"slot1\" is active for PID 4242\0");
    payload.extend_from_slice(b"Fslot.c\0");
    payload.extend_from_slice(b"L523\0");
    payload.extend_from_slice(b"RReplicationSlotAcquire\0");
    payload.push(0);
    payload
}

fn bench_parse_xlogdata(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_xlogdata");

    for size in [64, 256, 1024, 4096, 16384] {
        let payload = make_xlogdata_payload(size);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| parse_copy_data(black_box(payload.clone())));
        });
    }

    group.finish();
}

fn bench_parse_keepalive(c: &mut Criterion) {
    let payload = make_keepalive_payload();

    c.bench_function("parse_keepalive", |b| {
        b.iter(|| parse_copy_data(black_box(payload.clone())));
    });
}

fn bench_encode_status_update(c: &mut Criterion) {
    let status = StandbyStatus {
        written: Lsn(0x1234_5678_9ABC_DEF0),
        flushed: Lsn(0x1234_5678_9ABC_0000),
        applied: Lsn(0x1234_5678_9ABC_0000),
        reply_requested: false,
    };

    c.bench_function("encode_standby_status_update", |b| {
        b.iter(|| encode_standby_status_update(black_box(status), black_box(1_234_567_890)));
    });
}

fn bench_parse_error_fields(c: &mut Criterion) {
    let payload = make_error_payload();

    c.bench_function("parse_error_fields", |b| {
        b.iter(|| parse_error_fields(black_box(&payload)));
    });
}

fn bench_lsn_roundtrip(c: &mut Criterion) {
    c.bench_function("lsn_parse_format", |b| {
        b.iter(|| {
            let text = black_box(Lsn(0x16_B374_D848)).to_string();
            Lsn::parse(black_box(&text)).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_parse_xlogdata,
    bench_parse_keepalive,
    bench_encode_status_update,
    bench_parse_error_fields,
    bench_lsn_roundtrip,
);
criterion_main!(benches);
