use proxy_tunnel::{
    config::Config,
    consumer::Consumer,
    io_buffer::IoBuffer,
    logging::{LoggerManager, DEFAULT_KEEP_DAYS},
    loopback::{Loopback, DEFAULT_BLOCK_SIZE},
    metrics::TunnelMetrics,
    producer::{ChunkingAction, Producer},
    Result, Tunnel, TunnelError, TunnelEvent, TunnelRole,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn parse_action(action: &str) -> ChunkingAction {
    match action {
        "chunk" => ChunkingAction::Chunk,
        "dechunk" => ChunkingAction::Dechunk,
        "passthru" => ChunkingAction::PassthruChunked,
        _ => ChunkingAction::None,
    }
}

fn parse_usize(matches: &clap::ArgMatches, id: &str, default: usize) -> Result<usize> {
    match matches.get_one::<String>(id) {
        Some(value) => value
            .parse()
            .map_err(|e| TunnelError::ConfigError(format!("Invalid --{} {}: {}", id, value, e))),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Config::build_cli().get_matches();
    let config = Config::from_matches(&matches)?;

    let mut logger = LoggerManager::new(config.logging.clone());
    logger.initialize()?;
    let removed = logger.rotate_logs(DEFAULT_KEEP_DAYS)?;
    if removed > 0 {
        debug!("Removed {} old log files", removed);
    }

    info!(
        "Starting proxy-tunnel v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    let input = matches
        .get_one::<String>("input")
        .ok_or_else(|| TunnelError::ConfigError("--input is required".to_string()))?;
    let output = matches
        .get_one::<String>("output")
        .ok_or_else(|| TunnelError::ConfigError("--output is required".to_string()))?;
    let cache_output = matches.get_one::<String>("cache-output");
    let action = parse_action(
        matches
            .get_one::<String>("action")
            .map(String::as_str)
            .unwrap_or("none"),
    );
    let block_size = parse_usize(&matches, "block-size", DEFAULT_BLOCK_SIZE)?;

    let data = tokio::fs::read(input)
        .await
        .map_err(|e| TunnelError::IoError(format!("Failed to read {}: {}", input, e)))?;
    let skip_bytes = parse_usize(&matches, "skip-bytes", 0)?.min(data.len());
    info!(
        "Tunneling {} ({} bytes, {} header bytes) with action {:?}",
        input,
        data.len(),
        skip_bytes,
        action
    );

    let metrics = Arc::new(TunnelMetrics::new());
    let mut tunnel = Tunnel::with_metrics(&config.tunnel, metrics.clone());
    tunnel.set_done_handler(Box::new(|t: &Tunnel| {
        info!("Tunnel {} finished", t.id());
    }));

    let io = Loopback::new();
    // the header arrives with the first read; the body is streamed
    let buffer = IoBuffer::new();
    let start = buffer.alloc_reader();
    buffer.write(&data[..skip_bytes]);
    let source = io.source("origin", data[skip_bytes..].to_vec(), block_size);

    let total_bytes = match action {
        ChunkingAction::None | ChunkingAction::Chunk => data.len() as i64,
        // chunked framing ends the body, not a length
        ChunkingAction::Dechunk | ChunkingAction::PassthruChunked => -1,
    };
    let pid = tunnel.add_producer(
        Some(source.endpoint()),
        total_bytes,
        &start,
        Box::new(|event: TunnelEvent, p: &Producer| {
            debug!("Producer {} finished with {}", p.name(), event);
        }),
        TunnelRole::HttpServer,
        "origin",
    );
    tunnel.set_producer_chunking_action(
        pid,
        skip_bytes as i64,
        action,
        config.tunnel.chunking.drop_chunked_trailers,
        config.tunnel.chunking.strict_chunk_parsing,
    );

    let client = io.sink("client", block_size);
    tunnel.add_consumer(
        client.endpoint(),
        pid,
        Box::new(|event: TunnelEvent, c: &Consumer| {
            debug!("Consumer {} finished with {}", c.name(), event);
        }),
        TunnelRole::HttpClient,
        "client",
        0,
    );
    let cache = cache_output.map(|_| io.sink("cache", block_size));
    if let Some(cache) = &cache {
        tunnel.add_consumer(
            cache.endpoint(),
            pid,
            Box::new(|event: TunnelEvent, c: &Consumer| {
                debug!("Consumer {} finished with {}", c.name(), event);
            }),
            TunnelRole::CacheWrite,
            "cache",
            skip_bytes as i64,
        );
    }

    tunnel.tunnel_run(None);
    let events = io.run(&mut tunnel);
    debug!("Delivered {} events", events);

    tokio::fs::write(output, client.written())
        .await
        .map_err(|e| TunnelError::IoError(format!("Failed to write {}: {}", output, e)))?;
    if let (Some(path), Some(cache)) = (cache_output, &cache) {
        if cache.is_closed() {
            warn!("Cache write aborted, not writing {}", path);
        } else {
            tokio::fs::write(path, cache.written())
                .await
                .map_err(|e| TunnelError::IoError(format!("Failed to write {}: {}", path, e)))?;
        }
    }

    let producer = tunnel.producer(pid);
    info!(
        "Producer read {} bytes, consumed {}; client wrote {} bytes",
        producer.bytes_read(),
        producer.bytes_consumed(),
        client.written_len()
    );
    debug!("Metrics: {}", metrics.to_json()?);

    if tunnel.is_tunnel_alive() {
        error!("Tunnel stalled with live parties");
        return Err(TunnelError::InternalError("tunnel did not finish".to_string()));
    }
    if !producer.read_success() {
        error!("Producer did not finish successfully: {:?}", producer.last_event());
        return Err(TunnelError::EndpointError(format!(
            "producer ended with {:?}",
            producer.last_event()
        )));
    }
    Ok(())
}
