//! Post/poll cycle benchmark over the loopback fabric.
//!
//! Measures the broker's bookkeeping cost per operation (slot selection,
//! batching, completion draining) without hardware in the path.
//!
//! Run with:
//! ```bash
//! cargo bench --bench post_poll
//! ```

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rcbroker::testing::{ArenaBuffer, LoopbackFabric, LoopbackTransport, PeerStub};
use rcbroker::{
    BrokerConfig, DeviceRegistry, NopHandler, PeerEndpoint, RcBroker, RemoteAddr, RetryPolicy,
};

const SERVER: u32 = 0;
const PEER: u32 = 1;
const MAX_IN_FLIGHT: u32 = 64;
const MAX_MSG_SIZE: u32 = 1024;
const MESSAGE_SIZE: u32 = 64;

struct Bench {
    _fabric: LoopbackFabric,
    _buffer: ArenaBuffer,
    broker: RcBroker<LoopbackTransport, NopHandler>,
    stub: PeerStub,
}

fn build(doorbell_batch_size: u32) -> Bench {
    let fabric = LoopbackFabric::new();
    let stub = PeerStub::new(&fabric, PEER, 0, SERVER, MAX_IN_FLIGHT, MAX_MSG_SIZE);
    let config = BrokerConfig::new()
        .with_server_id(SERVER)
        .with_max_in_flight(MAX_IN_FLIGHT)
        .with_max_msg_size(MAX_MSG_SIZE)
        .with_doorbell_batch_size(doorbell_batch_size)
        .with_retry_policy(RetryPolicy::bounded(Duration::from_micros(100), 1000));
    let buffer = ArenaBuffer::new(config.region_size_per_peer());
    let peers = vec![PeerEndpoint::new(PEER, 0, "127.0.0.1:11211".parse().unwrap())];
    let mut broker = RcBroker::new(
        config,
        Arc::new(fabric.transport()),
        buffer.arena(),
        peers,
        NopHandler,
    )
    .expect("broker creation failed");
    broker
        .establish(&DeviceRegistry::new(), None)
        .expect("establishment failed");
    Bench {
        _fabric: fabric,
        _buffer: buffer,
        broker,
        stub,
    }
}

fn bench_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("send");
    group.throughput(Throughput::Elements(1));
    for doorbell in [1u32, 8, 32] {
        let mut bench = build(doorbell);
        group.bench_with_input(
            BenchmarkId::new("doorbell", doorbell),
            &doorbell,
            |b, _| {
                b.iter(|| {
                    bench
                        .broker
                        .post_send(PEER, None, MESSAGE_SIZE, 0)
                        .unwrap();
                    bench.broker.flush(PEER).unwrap();
                    bench.broker.poll_send(PEER);
                    bench.stub.drain_received();
                });
            },
        );
    }
    group.finish();
}

fn bench_remote_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("remote_write");
    group.throughput(Throughput::Bytes(MESSAGE_SIZE as u64));
    let mut bench = build(1);
    group.bench_function("64b", |b| {
        b.iter(|| {
            bench
                .broker
                .post_write(PEER, None, MESSAGE_SIZE, RemoteAddr::Offset(0), 0)
                .unwrap();
            bench.broker.poll_send(PEER);
        });
    });
    group.finish();
}

fn bench_recv(c: &mut Criterion) {
    let mut group = c.benchmark_group("recv");
    group.throughput(Throughput::Elements(1));
    let mut bench = build(1);
    bench.stub.connect_to(rcbroker::QpIdentity::new(SERVER, 0, PEER));
    group.bench_function("poll_recv", |b| {
        b.iter(|| {
            bench.stub.send(0, &[7u8; MESSAGE_SIZE as usize], 1);
            bench.broker.poll_recv(PEER).unwrap();
            bench.stub.drain_sent();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_send, bench_remote_write, bench_recv);
criterion_main!(benches);
