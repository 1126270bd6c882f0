//! Codec benchmarks.

use courier_protocol::{codec, ChatMessage, Frame};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn chat_frame(len: usize) -> Frame {
    Frame::message(
        "/topic/public",
        ChatMessage::chat("alice", "x".repeat(len), 1_700_000_000_000),
    )
}

fn bench_msgpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("msgpack");

    for (name, len) in [("64B", 64usize), ("1KB", 1024)] {
        let frame = chat_frame(len);
        let encoded = codec::encode(&frame).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| codec::encode(black_box(&frame)))
        });
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| codec::decode(black_box(&encoded)))
        });
    }

    group.finish();
}

fn bench_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("json");

    for (name, len) in [("64B", 64usize), ("1KB", 1024)] {
        let frame = chat_frame(len);
        let text = codec::encode_json(&frame).unwrap();
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| codec::encode_json(black_box(&frame)))
        });
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| codec::decode_json(black_box(&text)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_msgpack, bench_json);
criterion_main!(benches);
