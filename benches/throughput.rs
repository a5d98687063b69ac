//! Throughput Benchmark for dbgate
//!
//! Measures the per-packet costs on the data path: framing, command
//! classification and buffer handling, plus the cost of a pool broadcast.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dbgate::buffer::Buffer;
use dbgate::config::CoreConfig;
use dbgate::protocol::{
    classify, classify_sql, encode_packet, PacketParser, ParserLimits, Phase, Role,
};
use dbgate::session::{ErrorAction, Router, RouterFactory};
use dbgate::worker::{Context, WorkerPool};
use dbgate::{CloseReason, DescriptorId, PacketMeta};
use std::sync::Arc;
use std::time::Duration;

fn command_stream(count: usize, sql: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x03];
    payload.extend_from_slice(sql);
    let mut out = Vec::new();
    for _ in 0..count {
        out.extend(encode_packet(0, &payload, 0xFF_FFFF).to_vec());
    }
    out
}

fn client_parser() -> PacketParser {
    let mut parser = PacketParser::new(Role::Client, ParserLimits::default());
    parser.set_phase(Phase::Command);
    parser
}

/// Benchmark framing of client command streams
fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    let small = command_stream(1_000, b"SELECT id FROM t WHERE id = 1");
    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_function("small_commands", |b| {
        b.iter(|| {
            let mut parser = client_parser();
            let mut buf = Buffer::from(small.clone());
            black_box(parser.feed(&mut buf).packets.len());
        });
    });

    // The same stream arriving in 1500 byte segments
    let segments: Vec<Bytes> = small
        .chunks(1500)
        .map(Bytes::copy_from_slice)
        .collect();
    group.bench_function("segmented_commands", |b| {
        b.iter(|| {
            let mut parser = client_parser();
            let mut buf = Buffer::new();
            let mut packets = 0;
            for segment in &segments {
                buf.append(segment.clone());
                packets += parser.feed(&mut buf).packets.len();
            }
            black_box(packets);
        });
    });

    // A packet spanning several frames
    let large = {
        let mut payload = vec![0x03];
        payload.extend(std::iter::repeat(b'x').take(4 * 1024 * 1024));
        encode_packet(0, &payload, 0xFF_FFFF).to_vec()
    };
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("multi_frame_packet", |b| {
        b.iter(|| {
            let mut parser = client_parser();
            let mut buf = Buffer::from(large.clone());
            black_box(parser.feed(&mut buf).packets.len());
        });
    });

    group.finish();
}

/// Benchmark command classification
fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(1));

    group.bench_function("select", |b| {
        let payload = b"\x03SELECT a, b FROM t WHERE c = 'x' ORDER BY a";
        b.iter(|| black_box(classify(payload)));
    });

    group.bench_function("session_command", |b| {
        let payload = b"\x03SET autocommit = 0";
        b.iter(|| black_box(classify(payload)));
    });

    group.bench_function("commented_multi_statement", |b| {
        let sql = b"/* batch */ INSERT INTO t VALUES (1, 'a;b'); -- x\nUPDATE t SET a = 2";
        b.iter(|| black_box(classify_sql(sql)));
    });

    group.finish();
}

/// Benchmark buffer operations on the forwarding path
fn bench_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");
    group.throughput(Throughput::Elements(1));

    let mut chain = Buffer::new();
    for _ in 0..16 {
        chain.append(Bytes::from(vec![0u8; 4096]));
    }

    group.bench_function("clone_shallow", |b| {
        b.iter(|| black_box(chain.clone_shallow()));
    });

    group.bench_function("split_across_segments", |b| {
        b.iter(|| {
            let mut buf = chain.clone_shallow();
            let head = buf.split_to(10_000);
            black_box((head.len(), buf.len()));
        });
    });

    group.bench_function("copy_on_write_byte", |b| {
        b.iter(|| {
            let mut buf = chain.clone_shallow();
            black_box(buf.set_byte(3, 1));
        });
    });

    group.finish();
}

struct IdleRouter;

impl Router for IdleRouter {
    fn on_client_accepted(&mut self, _: &mut Context<'_>, _: DescriptorId) {}
    fn on_packet_ready(&mut self, _: &mut Context<'_>, _: DescriptorId, _: Buffer, _: PacketMeta) {}
    fn on_descriptor_error(
        &mut self,
        _: &mut Context<'_>,
        _: DescriptorId,
        _: &CloseReason,
    ) -> ErrorAction {
        ErrorAction::Close
    }
    fn on_descriptor_closed(&mut self, _: &mut Context<'_>, _: DescriptorId) {}
}

/// Benchmark cross-thread broadcasts
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    group.measurement_time(Duration::from_secs(10));

    for workers in [1, 4, 16] {
        let factory: Arc<dyn RouterFactory> =
            Arc::new(|_worker: usize| Box::new(IdleRouter) as Box<dyn Router>);
        let config = CoreConfig {
            workers,
            ..Default::default()
        };
        let pool = WorkerPool::start(config, factory).unwrap();

        group.bench_function(format!("wait_{}_workers", workers), |b| {
            b.iter(|| black_box(pool.broadcast_wait(|_| Ok(())).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_framing,
    bench_classify,
    bench_buffer,
    bench_broadcast,
);

criterion_main!(benches);
