//! Chunked Transcoding Property Tests
//!
//! Arbitrary bodies framed and unframed through the codec helpers and
//! through a running tunnel with arbitrary block and chunk sizes.

use proxy_tunnel::chunked::{decode_chunked, encode_chunked};
use proxy_tunnel::config::TunnelConfig;
use proxy_tunnel::consumer::Consumer;
use proxy_tunnel::io_buffer::IoBuffer;
use proxy_tunnel::loopback::Loopback;
use proxy_tunnel::producer::{ChunkingAction, Producer};
use proxy_tunnel::{Tunnel, TunnelEvent, TunnelRole};
use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

/// Block and chunk sizes small enough to split bodies many ways
#[derive(Debug, Clone, Copy)]
struct Sizes {
    block: usize,
    chunk: i64,
}

impl Arbitrary for Sizes {
    fn arbitrary(g: &mut Gen) -> Self {
        Sizes {
            block: 1 + usize::arbitrary(g) % 97,
            chunk: 1 + i64::from(u8::arbitrary(g)),
        }
    }
}

fn run_tunnel(
    wire: Vec<u8>,
    total: i64,
    action: ChunkingAction,
    sizes: Sizes,
) -> (Tunnel, Vec<u8>, Vec<u8>) {
    let mut tunnel = Tunnel::new(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", wire, sizes.block);
    let client = io.sink("client", sizes.block + 7);
    let cache = io.sink("cache", sizes.block * 2);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        total,
        &start,
        Box::new(|_: TunnelEvent, _: &Producer| {}),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.set_producer_chunking_action(pid, 0, action, true, true);
    tunnel.set_producer_chunking_size(pid, sizes.chunk);
    tunnel.add_consumer(
        client.endpoint(),
        pid,
        Box::new(|_: TunnelEvent, _: &Consumer| {}),
        TunnelRole::HttpClient,
        "client",
        0,
    );
    tunnel.add_consumer(
        cache.endpoint(),
        pid,
        Box::new(|_: TunnelEvent, _: &Consumer| {}),
        TunnelRole::CacheWrite,
        "cache",
        0,
    );
    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    let client_bytes = client.written().to_vec();
    let cache_bytes = cache.written().to_vec();
    (tunnel, client_bytes, cache_bytes)
}

fn prop_encode_decode_identity(body: Vec<u8>, sizes: Sizes) -> TestResult {
    let wire = encode_chunked(&body, sizes.chunk);
    match decode_chunked(&wire, true) {
        Ok(decoded) => TestResult::from_bool(decoded == body),
        Err(_) => TestResult::failed(),
    }
}

fn prop_encoded_chunks_respect_max_size(body: Vec<u8>, sizes: Sizes) -> TestResult {
    if body.is_empty() {
        return TestResult::discard();
    }
    let wire = encode_chunked(&body, sizes.chunk);
    let full_chunks = body.len() as i64 / sizes.chunk;
    let header = format!("{:x}\r\n", sizes.chunk);
    let count = wire
        .windows(header.len())
        .filter(|w| *w == header.as_bytes())
        .count() as i64;
    TestResult::from_bool(wire.ends_with(b"0\r\n\r\n") && count >= full_chunks)
}

fn prop_tunnel_dechunks_any_split(body: Vec<u8>, sizes: Sizes) -> TestResult {
    let wire = encode_chunked(&body, sizes.chunk);
    let (tunnel, client, cache) = run_tunnel(wire, -1, ChunkingAction::Dechunk, sizes);
    if tunnel.is_tunnel_alive() {
        return TestResult::error("tunnel stalled");
    }
    TestResult::from_bool(client == body && cache == body)
}

fn prop_tunnel_chunks_any_split(body: Vec<u8>, sizes: Sizes) -> TestResult {
    let total = body.len() as i64;
    let (tunnel, client, cache) = run_tunnel(body.clone(), total, ChunkingAction::Chunk, sizes);
    if tunnel.is_tunnel_alive() {
        return TestResult::error("tunnel stalled");
    }
    match decode_chunked(&client, true) {
        Ok(decoded) => TestResult::from_bool(decoded == body && cache == body),
        Err(_) => TestResult::failed(),
    }
}

fn prop_consumer_lengths_match_producer(body: Vec<u8>, sizes: Sizes) -> TestResult {
    let total = body.len() as i64;
    let (tunnel, client, cache) = run_tunnel(body, total, ChunkingAction::None, sizes);
    let producer = &tunnel.producers()[0];
    let consumed = producer.bytes_consumed();
    let lengths_match = tunnel.consumers().iter().all(|c| {
        c.bytes_to_write() == Some(consumed - c.skip_bytes()) || c.bytes_to_write().is_none()
    });
    TestResult::from_bool(
        lengths_match && client.len() as i64 == consumed && cache.len() as i64 == consumed,
    )
}

#[test]
fn test_encode_decode_identity() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop_encode_decode_identity as fn(Vec<u8>, Sizes) -> TestResult);
}

#[test]
fn test_encoded_chunks_respect_max_size() {
    QuickCheck::new()
        .tests(100)
        .quickcheck(prop_encoded_chunks_respect_max_size as fn(Vec<u8>, Sizes) -> TestResult);
}

#[test]
fn test_tunnel_dechunks_any_split() {
    QuickCheck::new()
        .tests(100)
        .quickcheck(prop_tunnel_dechunks_any_split as fn(Vec<u8>, Sizes) -> TestResult);
}

#[test]
fn test_tunnel_chunks_any_split() {
    QuickCheck::new()
        .tests(100)
        .quickcheck(prop_tunnel_chunks_any_split as fn(Vec<u8>, Sizes) -> TestResult);
}

#[test]
fn test_consumer_lengths_match_producer() {
    QuickCheck::new()
        .tests(100)
        .quickcheck(prop_consumer_lengths_match_producer as fn(Vec<u8>, Sizes) -> TestResult);
}

#[test]
fn test_decoder_rejects_bad_size_line() {
    assert!(decode_chunked(b"g\r\n", true).is_err());
    assert!(decode_chunked(b"5\r\nhel", true).is_err());
    assert_eq!(decode_chunked(b"3\nabc\r\n0\r\n\r\n", false).unwrap(), b"abc");
}
