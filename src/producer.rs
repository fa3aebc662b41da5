//! Producer Module
//!
//! A producer is one byte source of a tunnel: an endpoint read into a buffer
//! (or pre-buffered static data), optionally transcoded by a chunk codec,
//! fanned out to its consumers.

use crate::chunked::{ChunkedHandler, ChunkedState};
use crate::consumer::ConsumerId;
use crate::endpoint::EndpointRef;
use crate::event::{TunnelEvent, TunnelRole};
use crate::io_buffer::{IoBuffer, IoBufferReader};
use crate::tunnel::{Tunnel, MAX_PRODUCERS};
use crate::vio::{Vio, UNBOUNDED};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// Completion callback for a producer, invoked with the triggering event
pub type ProducerHandler = Box<dyn FnMut(TunnelEvent, &Producer) + Send>;

/// Slot index of a producer in its tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(pub(crate) usize);

impl ProducerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// What the tunnel does to the producer's bytes on their way out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChunkingAction {
    /// Plain bytes forwarded unchanged
    #[default]
    None,
    /// Plain bytes in, chunked encoding out
    Chunk,
    /// Chunked encoding in, plain bytes out
    Dechunk,
    /// Chunked encoding in and out; cache writers still get plain bytes
    PassthruChunked,
}

/// How the producer's side of the transfer ended, set once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerOutcome {
    Success,
    /// The client side failed
    ClientFail,
    /// The server side failed
    ServerFail,
}

/// Requested byte range of a cache read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    /// Response header bytes written ahead of the range
    pub header_bytes: i64,
}

impl ByteRange {
    /// Bytes covered by the range. A range too large for a byte count
    /// reads until end of stream.
    pub fn byte_count(&self) -> i64 {
        i64::try_from(self.end.saturating_sub(self.start))
            .ok()
            .and_then(|n| n.checked_add(1))
            .unwrap_or(UNBOUNDED)
    }
}

pub struct Producer {
    pub(crate) id: ProducerId,
    pub(crate) name: String,
    pub(crate) role: TunnelRole,
    /// `None` for static producers
    pub(crate) endpoint: Option<EndpointRef>,
    pub(crate) handler: Option<ProducerHandler>,

    pub(crate) consumers: Vec<ConsumerId>,
    pub(crate) self_consumer: Option<ConsumerId>,
    pub(crate) flow_control_source: Option<ProducerId>,

    pub(crate) read_vio: Option<Vio>,
    pub(crate) read_buffer: Option<IoBuffer>,
    pub(crate) buffer_start: Option<IoBufferReader>,

    pub(crate) total_bytes: i64,
    pub(crate) init_bytes_done: i64,
    pub(crate) ntodo: i64,
    /// Raw bytes read off the endpoint
    pub(crate) bytes_read: i64,
    /// Source bytes taken by the tunnel, headers included
    pub(crate) bytes_consumed: i64,

    pub(crate) chunking_action: ChunkingAction,
    pub(crate) chunked: ChunkedHandler,
    pub(crate) do_chunking: bool,
    pub(crate) do_dechunking: bool,
    pub(crate) do_chunked_passthru: bool,
    pub(crate) drop_trailers: bool,
    pub(crate) strict_chunk_parsing: bool,
    pub(crate) range: Option<ByteRange>,

    pub(crate) alive: bool,
    pub(crate) read_success: bool,
    pub(crate) outcome: Option<ProducerOutcome>,
    pub(crate) last_event: Option<TunnelEvent>,
    /// Completion or failure has been processed
    pub(crate) finalized: bool,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("alive", &self.alive)
            .field("read_success", &self.read_success)
            .field("total_bytes", &self.total_bytes)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_consumed", &self.bytes_consumed)
            .field("chunking_action", &self.chunking_action)
            .field("consumers", &self.consumers)
            .finish_non_exhaustive()
    }
}

impl Producer {
    fn new(
        id: ProducerId,
        endpoint: Option<EndpointRef>,
        handler: ProducerHandler,
        role: TunnelRole,
        name: &str,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            role,
            endpoint,
            handler: Some(handler),
            consumers: Vec::new(),
            self_consumer: None,
            flow_control_source: None,
            read_vio: None,
            read_buffer: None,
            buffer_start: None,
            total_bytes: 0,
            init_bytes_done: 0,
            ntodo: 0,
            bytes_read: 0,
            bytes_consumed: 0,
            chunking_action: ChunkingAction::None,
            chunked: ChunkedHandler::new(),
            do_chunking: false,
            do_dechunking: false,
            do_chunked_passthru: false,
            drop_trailers: false,
            strict_chunk_parsing: false,
            range: None,
            alive: false,
            read_success: false,
            outcome: None,
            last_event: None,
            finalized: false,
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> TunnelRole {
        self.role
    }

    pub fn endpoint(&self) -> Option<&EndpointRef> {
        self.endpoint.as_ref()
    }

    /// Pre-buffered source with no endpoint
    pub fn is_static(&self) -> bool {
        self.endpoint.is_none()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn read_success(&self) -> bool {
        self.read_success
    }

    pub fn outcome(&self) -> Option<ProducerOutcome> {
        self.outcome
    }

    pub(crate) fn update_outcome_if_not_set(&mut self, outcome: ProducerOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    pub fn consumers(&self) -> &[ConsumerId] {
        &self.consumers
    }

    pub fn self_consumer(&self) -> Option<ConsumerId> {
        self.self_consumer
    }

    pub fn read_vio(&self) -> Option<&Vio> {
        self.read_vio.as_ref()
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes
    }

    pub fn init_bytes_done(&self) -> i64 {
        self.init_bytes_done
    }

    pub fn ntodo(&self) -> i64 {
        self.ntodo
    }

    pub fn bytes_read(&self) -> i64 {
        self.bytes_read
    }

    pub fn bytes_consumed(&self) -> i64 {
        self.bytes_consumed
    }

    pub fn chunking_action(&self) -> ChunkingAction {
        self.chunking_action
    }

    pub fn chunked(&self) -> &ChunkedHandler {
        &self.chunked
    }

    pub fn last_event(&self) -> Option<TunnelEvent> {
        self.last_event
    }

    /// Transfer ended before the message did
    pub fn is_truncated(&self) -> bool {
        self.chunked.truncated()
    }

    pub fn is_handling_chunked_content(&self) -> bool {
        self.do_chunking || self.do_dechunking || self.do_chunked_passthru
    }

    pub fn is_throttled(&self) -> bool {
        self.flow_control_source.is_some()
    }

    pub fn flow_control_source(&self) -> Option<ProducerId> {
        self.flow_control_source
    }

    /// Bytes still due from the endpoint, unbounded when the length is unknown
    pub fn remaining(&self) -> i64 {
        match &self.read_vio {
            Some(vio) => vio.ntodo(),
            None if self.ntodo == UNBOUNDED => UNBOUNDED,
            None => self.ntodo,
        }
    }

    /// Snapshot of the final raw read count from the outstanding read
    pub(crate) fn settle_bytes_read(&mut self) {
        if let Some(ndone) = self.read_vio.as_ref().map(Vio::ndone) {
            self.bytes_read = ndone;
            if !self.is_handling_chunked_content() {
                self.bytes_consumed += ndone;
            }
        }
    }
}

impl Tunnel {
    /// Register a byte source.
    ///
    /// `total_bytes` includes whatever `reader_start` already holds; a
    /// negative value or [`UNBOUNDED`] means "until end of stream". A
    /// producer without an endpoint is static: it is never alive and counts
    /// as successfully read, since all its data is already buffered.
    ///
    /// # Panics
    ///
    /// Panics when the tunnel already holds `MAX_PRODUCERS` producers.
    pub fn add_producer(
        &mut self,
        endpoint: Option<EndpointRef>,
        total_bytes: i64,
        reader_start: &IoBufferReader,
        handler: ProducerHandler,
        role: TunnelRole,
        name: &str,
    ) -> ProducerId {
        debug!("[{}] adding producer '{}'", self.id, name);
        assert!(
            self.producers.len() < MAX_PRODUCERS,
            "tunnel {} out of producer slots adding '{}'",
            self.id,
            name
        );

        let id = ProducerId(self.producers.len());
        let is_static = endpoint.is_none();
        let mut p = Producer::new(id, endpoint, handler, role, name);
        p.read_buffer = Some(reader_start.buffer().clone());
        p.buffer_start = Some(reader_start.clone());
        p.init_bytes_done = reader_start.read_avail();
        p.chunked.set_max_chunk_size(self.chunking.max_chunk_size);

        if total_bytes < 0 || total_bytes == UNBOUNDED {
            p.total_bytes = UNBOUNDED;
            p.ntodo = UNBOUNDED;
        } else {
            p.total_bytes = total_bytes;
            p.ntodo = (total_bytes - p.init_bytes_done).max(0);
        }

        if is_static {
            p.alive = false;
            p.read_success = true;
        } else {
            p.alive = true;
        }
        self.metrics.cache_connection_opened(role);
        self.producers.push(p);
        id
    }

    /// Register pre-buffered data as a static producer
    pub fn add_static_producer(
        &mut self,
        reader_start: &IoBufferReader,
        handler: ProducerHandler,
        role: TunnelRole,
        name: &str,
    ) -> ProducerId {
        let total = reader_start.read_avail();
        self.add_producer(None, total, reader_start, handler, role, name)
    }

    /// Set the header bytes held in front of the body and how the body is
    /// transcoded.
    pub fn set_producer_chunking_action(
        &mut self,
        pid: ProducerId,
        skip_bytes: i64,
        action: ChunkingAction,
        drop_trailers: bool,
        strict: bool,
    ) {
        let p = &mut self.producers[pid.0];
        p.drop_trailers = drop_trailers;
        p.strict_chunk_parsing = strict;
        p.chunked.skip_bytes = skip_bytes;
        p.chunking_action = action;
        match action {
            ChunkingAction::Chunk => p.chunked.state = ChunkedState::WriteChunk,
            ChunkingAction::Dechunk | ChunkingAction::PassthruChunked => {
                p.chunked.state = ChunkedState::ReadSize
            }
            ChunkingAction::None => {}
        }
    }

    /// Largest chunk emitted when chunking; 0 restores the default
    pub fn set_producer_chunking_size(&mut self, pid: ProducerId, size: i64) {
        self.producers[pid.0].chunked.set_max_chunk_size(size);
    }

    /// Serve only `start..=end` of a cache read, with `header_bytes` of
    /// response header already placed ahead of it
    pub fn set_producer_range(&mut self, pid: ProducerId, start: u64, end: u64, header_bytes: i64) {
        self.producers[pid.0].range = Some(ByteRange {
            start,
            end: end.max(start),
            header_bytes,
        });
    }

    /// Bytes read from `pid` but not yet flushed, maximised over every
    /// consumer path. Stops early once `limit` is reached.
    pub fn backlog(&self, pid: ProducerId, limit: u64) -> u64 {
        let mut visited = HashSet::new();
        self.backlog_from(pid, limit, &mut visited)
    }

    fn backlog_from(&self, pid: ProducerId, limit: u64, visited: &mut HashSet<ProducerId>) -> u64 {
        if !visited.insert(pid) {
            return 0;
        }
        let p = &self.producers[pid.0];
        let mut zret = 0u64;

        for &cid in &p.consumers {
            let c = &self.consumers[cid.0];
            let Some(write_vio) = c.write_vio.as_ref().filter(|_| c.alive) else {
                continue;
            };
            let mut n = 0u64;
            let endpoint_backlog = if c.role == TunnelRole::Transform {
                c.endpoint.backlog(limit)
            } else {
                None
            };
            match endpoint_backlog {
                Some(held) => n += held,
                None => {
                    if let Some(reader) = write_vio.reader() {
                        n += reader.read_avail().max(0) as u64;
                    }
                }
            }
            if n >= limit {
                return n;
            }

            if !c.role.is_sink() {
                if let Some(dsp) = c.self_producer {
                    n += self.backlog_from(dsp, limit, visited);
                }
            }
            if n >= limit {
                return n;
            }
            zret = zret.max(n);
        }

        if let Some(reader) = &p.chunked.chunked_reader {
            zret += reader.read_avail().max(0) as u64;
        }
        zret
    }

    /// Make `src` the throttling authority for `pid` and every producer
    /// chained below it through non-sink consumers.
    pub fn set_throttle_src(&mut self, pid: ProducerId, src: Option<ProducerId>) {
        let mut visited = HashSet::new();
        self.set_throttle_src_from(pid, src, &mut visited);
    }

    fn set_throttle_src_from(
        &mut self,
        pid: ProducerId,
        src: Option<ProducerId>,
        visited: &mut HashSet<ProducerId>,
    ) {
        if !visited.insert(pid) {
            return;
        }
        self.producers[pid.0].flow_control_source = src;
        let chained: Vec<ProducerId> = self.producers[pid.0]
            .consumers
            .iter()
            .map(|cid| &self.consumers[cid.0])
            .filter(|c| !c.role.is_sink())
            .filter_map(|c| c.self_producer)
            .collect();
        for dsp in chained {
            self.set_throttle_src_from(dsp, src, visited);
        }
    }

    /// Pause `pid`'s chain with `pid` as the source, unless already paused
    pub fn throttle(&mut self, pid: ProducerId) {
        if !self.producers[pid.0].is_throttled() {
            self.set_throttle_src(pid, Some(pid));
            self.metrics.record_throttle();
        }
    }

    pub fn unthrottle(&mut self, pid: ProducerId) {
        if self.producers[pid.0].is_throttled() {
            self.set_throttle_src(pid, None);
            self.metrics.record_unthrottle();
        }
    }
}
