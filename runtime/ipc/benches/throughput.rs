//! Copying vs zero-copy transfer over the loopback link

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipc_service::config::{ELEMENT_SIZE, MAX_PAYLOAD_SIZE};
use ipc_service::mock::LoopbackLink;
use ipc_service::{Endpoint, EndpointConfig, FnHandler, Instance, InstanceRegistry, TxWait};

const SLOTS: usize = 16;

struct Bench {
    registry: InstanceRegistry,
    link: LoopbackLink,
    host: Arc<Instance>,
    remote: Arc<Instance>,
    ept: Endpoint,
}

impl Bench {
    fn new() -> Self {
        let link = LoopbackLink::new(SLOTS, ELEMENT_SIZE).expect("link");
        let registry = InstanceRegistry::new();
        let host = registry.create(link.host_config("bench-host").build()).expect("host");
        let remote = registry.create(link.remote_config("bench-remote").build()).expect("remote");

        let ept = host
            .register_endpoint(EndpointConfig::new("bench"), FnHandler::new(|_| {}))
            .expect("host endpoint");
        remote
            .register_endpoint(
                EndpointConfig::new("bench"),
                FnHandler::new(|frame| {
                    black_box(frame.data());
                }),
            )
            .expect("remote endpoint");

        let bench = Self {
            registry,
            link,
            host,
            remote,
            ept,
        };
        bench.drain();
        bench.drain();
        assert!(bench.ept.is_bound());
        bench
    }

    fn drain(&self) {
        let mut kicked = 0u32;
        let _ = self
            .registry
            .mailbox_event_handle(&**self.link.host_mailbox(), &mut kicked);
        let _ = self
            .registry
            .mailbox_event_handle(&**self.link.remote_mailbox(), &mut kicked);
        let _ = self.host.receive();
        let _ = self.remote.receive();
    }
}

fn bench_transfer(c: &mut Criterion) {
    let bench = Bench::new();
    let mut group = c.benchmark_group("transfer");

    for size in [16usize, 128, MAX_PAYLOAD_SIZE] {
        let payload = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes((size * SLOTS) as u64));

        group.bench_with_input(BenchmarkId::new("copy", size), &payload, |b, payload| {
            b.iter(|| {
                for _ in 0..SLOTS {
                    bench.ept.send(black_box(payload)).expect("send");
                }
                bench.drain();
            })
        });

        group.bench_with_input(BenchmarkId::new("zero_copy", size), &payload, |b, payload| {
            b.iter(|| {
                for _ in 0..SLOTS {
                    let mut buf = bench.ept.get_tx_buffer(size, TxWait::NoWait).expect("buffer");
                    buf[..size].copy_from_slice(payload);
                    bench.ept.send_nocopy(buf, size).expect("send");
                }
                bench.drain();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transfer);
criterion_main!(benches);
