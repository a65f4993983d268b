//! Codec benchmarks for hark-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hark_protocol::{codec, ClientEvent, Encoding, ServerEvent};
use serde_json::json;

fn sample_offer() -> serde_json::Value {
    json!({
        "type": "offer",
        "sdp": "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".repeat(8),
    })
}

fn bench_decode_json(c: &mut Criterion) {
    let text = codec::encode_json(&ClientEvent::call_user("bob", sample_offer())).unwrap();

    let mut group = c.benchmark_group("decode_json");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("call_user", |b| {
        b.iter(|| codec::decode_json::<ClientEvent>(black_box(&text)))
    });
    group.finish();
}

fn bench_decode_msgpack(c: &mut Criterion) {
    let encoded = codec::encode(&ClientEvent::call_user("bob", sample_offer())).unwrap();

    let mut group = c.benchmark_group("decode_msgpack");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("call_user", |b| {
        b.iter(|| codec::decode::<ClientEvent>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_encode_status(c: &mut Criterion) {
    let event = ServerEvent::status("user-0001", true);

    let mut group = c.benchmark_group("encode_status");
    group.bench_function("json", |b| {
        b.iter(|| codec::encode_as(black_box(&event), Encoding::Json))
    });
    group.bench_function("msgpack", |b| {
        b.iter(|| codec::encode_as(black_box(&event), Encoding::MessagePack))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_decode_json,
    bench_decode_msgpack,
    bench_encode_status
);
criterion_main!(benches);
