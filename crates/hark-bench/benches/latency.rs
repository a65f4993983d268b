//! Latency benchmarks for Hark.
//!
//! These benchmarks measure the time an event spends inside the hub, from
//! `handle` to the target connection's queue.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hark_core::{Hub, MemoryUserStore};
use hark_protocol::{codec, ClientEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

/// Benchmark decode + relay + receive for a signaling event.
fn bench_relay_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_latency");
    let rt = runtime();

    group.bench_function("private_message", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let hub = Hub::new(Arc::new(MemoryUserStore::auto_admit()));
                let (mut alice, _alice_rx) = hub.connect();
                let (mut bob, mut bob_rx) = hub.connect();
                hub.handle(&mut alice, ClientEvent::register("alice")).await;
                hub.handle(&mut bob, ClientEvent::register("bob")).await;
                while bob_rx.try_recv().is_ok() {}

                let start = Instant::now();
                for _ in 0..iters {
                    hub.handle(&mut alice, ClientEvent::private_message("bob", "ping"))
                        .await;
                    let _ = bob_rx.try_recv();
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("ice_candidate_from_json", |b| {
        let text = codec::encode_json(&ClientEvent::ice_candidate(
            "bob",
            json!({"candidate": "candidate:1 1 UDP 2122252543 10.0.0.2 49203 typ host"}),
        ))
        .unwrap();

        b.iter_custom(|iters| {
            rt.block_on(async {
                let hub = Hub::new(Arc::new(MemoryUserStore::auto_admit()));
                let (mut alice, _alice_rx) = hub.connect();
                let (mut bob, mut bob_rx) = hub.connect();
                hub.handle(&mut bob, ClientEvent::register("bob")).await;
                while bob_rx.try_recv().is_ok() {}

                let start = Instant::now();
                for _ in 0..iters {
                    let event = codec::decode_json(black_box(&text)).unwrap();
                    hub.handle(&mut alice, event).await;
                    let _ = bob_rx.try_recv();
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark a full register / disconnect cycle as seen by one observer.
fn bench_presence_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence_churn");
    let rt = runtime();

    group.bench_function("register_disconnect", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let hub = Hub::new(Arc::new(MemoryUserStore::auto_admit()));
                let (_observer, mut observer_rx) = hub.connect();

                let start = Instant::now();
                for i in 0..iters {
                    let (mut session, _rx) = hub.connect();
                    hub.handle(&mut session, ClientEvent::register(format!("user:{}", i % 64)))
                        .await;
                    hub.disconnect(&mut session).await;
                    while observer_rx.try_recv().is_ok() {}
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("status_query", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let hub = Hub::new(Arc::new(MemoryUserStore::auto_admit()));
                let (mut alice, mut alice_rx) = hub.connect();
                hub.handle(&mut alice, ClientEvent::register("alice")).await;
                while alice_rx.try_recv().is_ok() {}

                let start = Instant::now();
                for _ in 0..iters {
                    hub.handle(&mut alice, ClientEvent::status("alice")).await;
                    if let Ok(event) = alice_rx.try_recv() {
                        black_box(event);
                    }
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_relay_latency, bench_presence_churn);
criterion_main!(benches);
