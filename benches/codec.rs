//! STOMP and SockJS codec benchmark suite.
//!
//! Benchmarks frame encoding and decoding at different payload sizes:
//! - Payload sizes: 0 B, 1 KiB, 64 KiB
//! - Chunk sizes for the buffering decoder: 64 B, 1 KiB
//!
//! Run with: cargo bench --bench codec
//! Results saved to: target/criterion/

use std::hint::black_box;

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use stomp_websocket::sockjs::SockJsFrame;
use stomp_websocket::{
    BufferingStompDecoder, MessageHeaders, StompCommand, StompDecoder, StompEncoder, StompHeaders,
};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[0, 1024, 64 * 1024];
const CHUNK_SIZES: &[usize] = &[64, 1024];
const BUFFER_SIZE_LIMIT: usize = 256 * 1024;

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let encoder = StompEncoder::new();

    let mut group = c.benchmark_group("stomp_encode");
    for &size in PAYLOAD_SIZES {
        let headers = message_headers(size);
        let payload = vec![b'x'; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("message", size), &payload, |b, payload| {
            b.iter(|| encoder.encode(black_box(&headers), black_box(payload)).unwrap());
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let decoder = StompDecoder::new();

    let mut group = c.benchmark_group("stomp_decode");
    for &size in PAYLOAD_SIZES {
        let frame = encoded_frame(size);

        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("message", size), &frame, |b, frame| {
            b.iter(|| {
                let mut buffer = BytesMut::from(frame.as_slice());
                decoder.decode(black_box(&mut buffer)).unwrap()
            });
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Buffering Decoder
// ============================================================================

fn bench_buffering(c: &mut Criterion) {
    let frame = encoded_frame(64 * 1024);

    let mut group = c.benchmark_group("stomp_buffering");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    for &chunk_size in CHUNK_SIZES {
        group.bench_with_input(
            BenchmarkId::new("chunked", chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut decoder = BufferingStompDecoder::new(StompDecoder::new(), BUFFER_SIZE_LIMIT);
                    let mut decoded = 0;
                    for chunk in frame.chunks(chunk_size) {
                        decoded += decoder.decode(black_box(chunk)).unwrap().len();
                    }
                    assert_eq!(decoded, 1);
                });
            },
        );
    }
    group.finish();
}

// ============================================================================
// Benchmark: SockJS Framing
// ============================================================================

fn bench_sockjs(c: &mut Criterion) {
    let mut group = c.benchmark_group("sockjs_frame");
    for &size in PAYLOAD_SIZES {
        let text = String::from_utf8(encoded_frame(size)).unwrap();
        let messages = [text];
        let content = SockJsFrame::message(&messages).unwrap().content().to_owned();

        group.bench_with_input(BenchmarkId::new("encode", size), &messages, |b, messages| {
            b.iter(|| SockJsFrame::message(black_box(messages)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("parse", size), &content, |b, content| {
            b.iter(|| {
                SockJsFrame::parse(black_box(content))
                    .unwrap()
                    .messages()
                    .unwrap()
            });
        });
    }
    group.finish();
}

// ============================================================================
// Helper Functions
// ============================================================================

fn message_headers(size: usize) -> MessageHeaders {
    let mut native = StompHeaders::new();
    native.set("destination", "/topic/bench");
    native.set("subscription", "sub-0");
    native.set("message-id", "bench-0");
    native.set("content-type", "text/plain");
    native.set("content-length", size.to_string());
    MessageHeaders::with_native(StompCommand::Message, native)
}

fn encoded_frame(size: usize) -> Vec<u8> {
    let payload = vec![b'x'; size];
    StompEncoder::new()
        .encode(&message_headers(size), &payload)
        .unwrap()
        .to_vec()
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_buffering,
    bench_sockjs
);
criterion_main!(benches);
