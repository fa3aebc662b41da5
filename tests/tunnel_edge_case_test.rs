//! Tunnel Edge Case Tests
//!
//! Zero-length bodies, truncated and malformed input, failing endpoints,
//! ranged cache reads and request body capture.

use proxy_tunnel::chunked::encode_chunked;
use proxy_tunnel::config::{PostBufferConfig, TunnelConfig};
use proxy_tunnel::consumer::Consumer;
use proxy_tunnel::endpoint::EHTTP_ERROR;
use proxy_tunnel::io_buffer::IoBuffer;
use proxy_tunnel::loopback::Loopback;
use proxy_tunnel::producer::{ChunkingAction, Producer, ProducerOutcome};
use proxy_tunnel::{Tunnel, TunnelEvent, TunnelRole};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'A' + (i % 26) as u8).collect()
}

fn noop_producer() -> Box<dyn FnMut(TunnelEvent, &Producer) + Send> {
    Box::new(|_: TunnelEvent, _: &Producer| {})
}

fn noop_consumer() -> Box<dyn FnMut(TunnelEvent, &Consumer) + Send> {
    Box::new(|_: TunnelEvent, _: &Consumer| {})
}

fn counting_tunnel(config: &TunnelConfig) -> (Tunnel, Arc<AtomicUsize>) {
    let mut tunnel = Tunnel::new(config);
    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    tunnel.set_done_handler(Box::new(move |_: &Tunnel| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    (tunnel, done)
}

#[test]
fn test_zero_length_body_finishes_without_io() {
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", Vec::new(), 1024);
    let client = io.sink("client", 1024);
    let cache = io.sink("cache", 1024);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        0,
        &start,
        noop_producer(),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);
    tunnel.add_consumer(cache.endpoint(), pid, noop_consumer(), TunnelRole::CacheWrite, "cache", 0);

    tunnel.tunnel_run(None);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    io.run(&mut tunnel);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(source.reads_started(), 0);
    assert_eq!(client.writes_started(), 0);
    assert!(!tunnel.is_tunnel_alive());
    assert!(tunnel.producer(pid).read_success());
    assert_eq!(tunnel.metrics().snapshot().current_cache_connections, 0);
}

#[test]
fn test_bounded_body_ending_early_aborts_cache_write() {
    let data = body(6_000);
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", data.clone(), 1000);
    let client = io.sink("client", 1000);
    let cache = io.sink("cache", 1000);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    // origin promised more than it sends
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        10_000,
        &start,
        noop_producer(),
        TunnelRole::HttpServer,
        "origin",
    );
    let client_id = tunnel
        .add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0)
        .unwrap();
    let cache_id = tunnel
        .add_consumer(cache.endpoint(), pid, noop_consumer(), TunnelRole::CacheWrite, "cache", 0)
        .unwrap();

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(tunnel.producer(pid).is_truncated());
    assert!(!tunnel.producer(pid).read_success());
    assert_eq!(tunnel.producer(pid).outcome(), Some(ProducerOutcome::ClientFail));
    assert_eq!(cache.close_code(), Some(EHTTP_ERROR));
    assert!(!tunnel.consumer(cache_id).is_alive());
    // the client still gets everything that arrived
    assert_eq!(&client.written()[..], &data[..]);
    assert_eq!(tunnel.consumer(client_id).bytes_to_write(), Some(6_000));

    let snapshot = tunnel.metrics().snapshot();
    assert_eq!(snapshot.truncated_transfers, 1);
    assert_eq!(snapshot.current_cache_connections, 0);
}

#[test]
fn test_truncated_chunked_body_aborts_cache_write() {
    let data = body(3_000);
    let wire = encode_chunked(&data, 1000);
    // lose the last chunk and the terminator
    let cut = wire[..wire.len() - 1200].to_vec();
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", cut, 512);
    let client = io.sink("client", 512);
    let cache = io.sink("cache", 512);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        -1,
        &start,
        noop_producer(),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.set_producer_chunking_action(pid, 0, ChunkingAction::Dechunk, true, true);
    tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);
    tunnel.add_consumer(cache.endpoint(), pid, noop_consumer(), TunnelRole::CacheWrite, "cache", 0);

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(tunnel.producer(pid).is_truncated());
    assert_eq!(tunnel.producer(pid).outcome(), Some(ProducerOutcome::ClientFail));
    assert!(cache.is_closed());
    let written = client.written();
    assert!(!written.is_empty());
    assert!(written.len() < data.len());
    assert_eq!(&written[..], &data[..written.len()]);
}

#[test]
fn test_malformed_chunk_size_fails_producer() {
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", b"g\r\n".to_vec(), 64);
    let client = io.sink("client", 64);
    let cache = io.sink("cache", 64);

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = events.clone();
    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        -1,
        &start,
        Box::new(move |event: TunnelEvent, _: &Producer| {
            seen.lock().unwrap().push(event);
        }),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.set_producer_chunking_action(pid, 0, ChunkingAction::Dechunk, true, true);
    tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);
    tunnel.add_consumer(cache.endpoint(), pid, noop_consumer(), TunnelRole::CacheWrite, "cache", 0);

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    assert_eq!(*events.lock().unwrap(), vec![TunnelEvent::ParseError]);
    let producer = tunnel.producer(pid);
    assert!(!producer.read_success());
    assert_eq!(producer.outcome(), Some(ProducerOutcome::ClientFail));
    assert!(source.read_cancelled());
    assert!(cache.is_closed());
    assert!(client.written().is_empty());
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(tunnel.metrics().snapshot().chunked_parse_errors, 1);
}

#[test]
fn test_read_error_keeps_partial_data_for_client() {
    let data = body(5_000);
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", data.clone(), 1000);
    source.fail_at(2000);
    let client = io.sink("client", 1000);
    let cache = io.sink("cache", 1000);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        data.len() as i64,
        &start,
        noop_producer(),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);
    tunnel.add_consumer(cache.endpoint(), pid, noop_consumer(), TunnelRole::CacheWrite, "cache", 0);

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(tunnel.producer(pid).outcome(), Some(ProducerOutcome::ClientFail));
    assert_eq!(tunnel.producer(pid).bytes_read(), 2000);
    assert!(cache.is_closed());
    assert_eq!(&client.written()[..], &data[..2000]);
    assert!(!tunnel.is_tunnel_alive());
}

#[test]
fn test_failed_consumer_leaves_others_running() {
    let data = body(4_000);
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", data.clone(), 1000);
    let client = io.sink("client", 1000);
    let cache = io.sink("cache", 1000);
    cache.fail_next_write();

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        data.len() as i64,
        &start,
        noop_producer(),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);
    let cache_id = tunnel
        .add_consumer(cache.endpoint(), pid, noop_consumer(), TunnelRole::CacheWrite, "cache", 0)
        .unwrap();

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!tunnel.consumer(cache_id).is_alive());
    assert_eq!(&client.written()[..], &data[..]);
    assert!(tunnel.producer(pid).read_success());
}

#[test]
fn test_consumer_not_added_after_producer_failure() {
    let mut tunnel = Tunnel::new(&TunnelConfig::default());
    let io = Loopback::new();
    let source = io.source("origin", b"g\r\n".to_vec(), 64);
    let client = io.sink("client", 64);
    let late = io.sink("late", 64);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        -1,
        &start,
        noop_producer(),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.set_producer_chunking_action(pid, 0, ChunkingAction::Dechunk, true, true);
    tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);
    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    let added = tunnel.add_consumer(late.endpoint(), pid, noop_consumer(), TunnelRole::CacheWrite, "late", 0);
    assert!(added.is_none());
    assert_eq!(tunnel.consumers().len(), 1);
}

#[test]
fn test_range_read_serves_requested_slice() {
    let data = body(100);
    let header = b"HDR:";
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let object = io.source("cache-object", data.clone(), 3);
    let client = io.sink("client", 64);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    buffer.write(header);
    let pid = tunnel.add_producer(
        Some(object.endpoint()),
        (header.len() + data.len()) as i64,
        &start,
        noop_producer(),
        TunnelRole::CacheRead,
        "cache-read",
    );
    tunnel.set_producer_range(pid, 10, 29, header.len() as i64);
    tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    let mut expected = header.to_vec();
    expected.extend_from_slice(&data[10..30]);
    assert_eq!(&client.written()[..], &expected[..]);
    assert_eq!(tunnel.producer(pid).bytes_read(), 20);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn test_request_body_is_captured_for_replay() {
    let data = body(1_500);
    let config = TunnelConfig {
        post_buffer: PostBufferConfig {
            enabled: true,
            max_size: 2048,
        },
        ..Default::default()
    };
    let (mut tunnel, done) = counting_tunnel(&config);
    let io = Loopback::new();
    let request = io.source("client", data.clone(), 400);
    let origin = io.sink("origin", 400);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(request.endpoint()),
        data.len() as i64,
        &start,
        noop_producer(),
        TunnelRole::HttpClient,
        "user agent",
    );
    tunnel.add_consumer(origin.endpoint(), pid, noop_consumer(), TunnelRole::HttpServer, "origin", 0);

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    assert_eq!(&origin.written()[..], &data[..]);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    let post = tunnel.post_buffer().unwrap();
    assert!(post.is_valid());
    assert!(post.is_done());
    assert_eq!(post.copied(), 1_500);
    let replay = post.replay_reader().unwrap();
    assert_eq!(&replay.read(4096)[..], &data[..]);
}

#[test]
fn test_oversized_request_body_disables_capture() {
    let data = body(5_000);
    let config = TunnelConfig {
        post_buffer: PostBufferConfig {
            enabled: true,
            max_size: 2048,
        },
        ..Default::default()
    };
    let (mut tunnel, done) = counting_tunnel(&config);
    let io = Loopback::new();
    let request = io.source("client", data.clone(), 1000);
    let origin = io.sink("origin", 1000);

    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    let pid = tunnel.add_producer(
        Some(request.endpoint()),
        data.len() as i64,
        &start,
        noop_producer(),
        TunnelRole::HttpClient,
        "user agent",
    );
    tunnel.add_consumer(origin.endpoint(), pid, noop_consumer(), TunnelRole::HttpServer, "origin", 0);

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    // the transfer itself is unaffected
    assert_eq!(&origin.written()[..], &data[..]);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    let post = tunnel.post_buffer().unwrap();
    assert!(!post.is_valid());
    assert!(post.replay_reader().is_none());
    assert_eq!(tunnel.metrics().snapshot().post_buffer_overflows, 1);
}

#[test]
fn test_half_closed_client_sends_only_buffered_body() {
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    let io = Loopback::new();
    let request = io.source("client", Vec::new(), 64);
    request.set_half_closed(true);
    let origin = io.sink("origin", 64);

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = events.clone();
    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    buffer.write(b"partial body");
    let pid = tunnel.add_producer(
        Some(request.endpoint()),
        100,
        &start,
        Box::new(move |event: TunnelEvent, _: &Producer| {
            seen.lock().unwrap().push(event);
        }),
        TunnelRole::HttpClient,
        "user agent",
    );
    tunnel.add_consumer(origin.endpoint(), pid, noop_consumer(), TunnelRole::HttpServer, "origin", 0);

    tunnel.tunnel_run(None);
    io.run(&mut tunnel);

    assert_eq!(&origin.written()[..], b"partial body");
    assert_eq!(request.reads_started(), 0);
    assert_eq!(*events.lock().unwrap(), vec![TunnelEvent::Precomplete]);
    assert!(tunnel.producer(pid).read_success());
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reset_allows_reuse() {
    let (mut tunnel, done) = counting_tunnel(&TunnelConfig::default());
    for round in 0..2 {
        let data = body(1_000 + round);
        let io = Loopback::new();
        let source = io.source("origin", data.clone(), 256);
        let client = io.sink("client", 256);
        let buffer = IoBuffer::new();
        let start = buffer.alloc_reader();
        let pid = tunnel.add_producer(
            Some(source.endpoint()),
            data.len() as i64,
            &start,
            noop_producer(),
            TunnelRole::HttpServer,
            "origin",
        );
        tunnel.add_consumer(client.endpoint(), pid, noop_consumer(), TunnelRole::HttpClient, "client", 0);
        tunnel.tunnel_run(None);
        io.run(&mut tunnel);
        assert_eq!(&client.written()[..], &data[..]);
        tunnel.reset();
    }
    assert_eq!(done.load(Ordering::SeqCst), 2);
}
