//! Tunnel Module
//!
//! The orchestrator. A tunnel moves the body of one transaction from its
//! producers to their consumers: it starts the reads and writes, reacts to
//! every I/O completion handed back through [`Tunnel::main_handler`], drives
//! chunked transcoding, applies flow control, and tells the owning
//! transaction when every party is finished.
//!
//! All methods run on the owner's serialized context; the tunnel itself
//! never locks or blocks.

use crate::config::{ChunkingConfig, FlowControlConfig, TunnelConfig};
use crate::consumer::{Consumer, ConsumerId};
use crate::event::{TunnelEvent, TunnelRole};
use crate::metrics::TunnelMetrics;
use crate::post_buffer::PostBuffer;
use crate::producer::{ChunkingAction, Producer, ProducerId, ProducerOutcome};
use crate::vio::{Vio, UNBOUNDED};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const MAX_PRODUCERS: usize = 2;
pub const MAX_CONSUMERS: usize = 4;

/// Called once when nothing in the tunnel is alive any more
pub type DoneHandler = Box<dyn FnMut(&Tunnel) + Send>;

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    Idle,
    Running,
    Done,
    Aborted,
}

pub struct Tunnel {
    pub(crate) id: u64,
    pub(crate) producers: Vec<Producer>,
    pub(crate) consumers: Vec<Consumer>,
    pub(crate) state: TunnelState,
    pub(crate) active: bool,
    pub(crate) reentrancy_count: u32,
    /// Done notification owed once the outermost dispatch returns
    pub(crate) call_sm: bool,
    pub(crate) done_notified: bool,
    pub(crate) flow_state: FlowControlConfig,
    pub(crate) chunking: ChunkingConfig,
    pub(crate) post_buffer: Option<PostBuffer>,
    pub(crate) body_bytes_to_copy: i64,
    pub(crate) metrics: Arc<TunnelMetrics>,
    done_handler: Option<DoneHandler>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("active", &self.active)
            .field("producers", &self.producers)
            .field("consumers", &self.consumers)
            .field("flow_state", &self.flow_state)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(config: &TunnelConfig) -> Self {
        Self::with_metrics(config, Arc::new(TunnelMetrics::new()))
    }

    /// Build a tunnel that reports into shared `metrics`
    pub fn with_metrics(config: &TunnelConfig, metrics: Arc<TunnelMetrics>) -> Self {
        let mut tunnel = Self {
            id: NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed),
            producers: Vec::with_capacity(MAX_PRODUCERS),
            consumers: Vec::with_capacity(MAX_CONSUMERS),
            state: TunnelState::Idle,
            active: false,
            reentrancy_count: 0,
            call_sm: false,
            done_notified: false,
            flow_state: FlowControlConfig::default(),
            chunking: config.chunking.clone(),
            post_buffer: None,
            body_bytes_to_copy: 0,
            metrics,
            done_handler: None,
        };
        tunnel.set_flow_control(&config.flow_control);
        if config.post_buffer.enabled {
            tunnel.post_buffer = Some(PostBuffer::new(config.post_buffer.max_size));
        }
        tunnel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Apply flow-control settings; zero water marks keep the current value
    pub fn set_flow_control(&mut self, config: &FlowControlConfig) {
        self.flow_state.enabled = config.enabled;
        if config.low_water > 0 {
            self.flow_state.low_water = config.low_water;
        }
        if config.high_water > 0 {
            self.flow_state.high_water = config.high_water;
        }
        if self.flow_state.low_water > self.flow_state.high_water {
            warn!(
                "[{}] low water {} above high water {}, clamping",
                self.id, self.flow_state.low_water, self.flow_state.high_water
            );
            self.flow_state.low_water = self.flow_state.high_water;
        }
    }

    pub fn flow_control(&self) -> &FlowControlConfig {
        &self.flow_state
    }

    /// Chunking defaults new producers start from
    pub fn chunking(&self) -> &ChunkingConfig {
        &self.chunking
    }

    pub fn set_done_handler(&mut self, handler: DoneHandler) {
        self.done_handler = Some(handler);
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn metrics(&self) -> &Arc<TunnelMetrics> {
        &self.metrics
    }

    pub fn post_buffer(&self) -> Option<&PostBuffer> {
        self.post_buffer.as_ref()
    }

    pub fn post_buffer_mut(&mut self) -> Option<&mut PostBuffer> {
        self.post_buffer.as_mut()
    }

    /// Install or remove request body capture
    pub fn set_post_buffer(&mut self, post_buffer: Option<PostBuffer>) {
        self.post_buffer = post_buffer;
    }

    pub fn producer(&self, id: ProducerId) -> &Producer {
        &self.producers[id.0]
    }

    pub fn consumer(&self, id: ConsumerId) -> &Consumer {
        &self.consumers[id.0]
    }

    pub fn producers(&self) -> &[Producer] {
        &self.producers
    }

    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    pub fn is_tunnel_alive(&self) -> bool {
        self.producers.iter().any(|p| p.alive) || self.consumers.iter().any(|c| c.alive)
    }

    pub fn has_cache_writer(&self) -> bool {
        self.consumers
            .iter()
            .any(|c| c.alive && c.role == TunnelRole::CacheWrite)
    }

    fn has_consumer_role(&self, pid: ProducerId, role: TunnelRole) -> bool {
        self.producers[pid.0]
            .consumers
            .iter()
            .any(|cid| self.consumers[cid.0].role == role)
    }

    /// Forget every party so the tunnel can serve the next transaction
    pub fn reset(&mut self) {
        if self.is_tunnel_alive() {
            warn!("[{}] resetting tunnel with live parties", self.id);
        }
        self.active = false;
        self.deallocate_buffers();
        self.clear_slots();
        self.state = TunnelState::Idle;
    }

    pub(crate) fn clear_slots(&mut self) {
        self.producers.clear();
        self.consumers.clear();
        self.call_sm = false;
        self.done_notified = false;
        self.reentrancy_count = 0;
        self.body_bytes_to_copy = 0;
    }

    /// Start one producer, or every runnable producer when `producer` is
    /// `None`. Notifies the owner straight away when nothing is left alive
    /// afterwards, as happens for zero-length bodies.
    pub fn tunnel_run(&mut self, producer: Option<ProducerId>) {
        self.reentrancy_count += 1;
        debug!(
            "[{}] tunnel_run started, producer is {}",
            self.id,
            if producer.is_some() { "provided" } else { "none" }
        );
        if self.state == TunnelState::Idle {
            self.state = TunnelState::Running;
            self.metrics.record_tunnel_started();
            info!(
                "[{}] tunnel running with {} producers and {} consumers",
                self.id,
                self.producers.len(),
                self.consumers.len()
            );
        }

        match producer {
            Some(pid) => self.producer_run(pid),
            None => {
                for i in 0..self.producers.len() {
                    let p = &self.producers[i];
                    if p.alive || (p.is_static() && p.buffer_start.is_some()) {
                        self.producer_run(ProducerId(i));
                    }
                }
            }
        }
        self.reentrancy_count -= 1;

        if !self.is_tunnel_alive() {
            self.notify_done();
        }
    }

    pub(crate) fn producer_run(&mut self, pid: ProducerId) {
        let Some(start) = self.producers[pid.0].buffer_start.clone() else {
            warn!(
                "[{}] producer '{}' already started",
                self.id, self.producers[pid.0].name
            );
            return;
        };
        let has_cache_writer = self.has_consumer_role(pid, TunnelRole::CacheWrite);
        let transform_consumer = self.has_consumer_role(pid, TunnelRole::Transform);

        let action = {
            let p = &mut self.producers[pid.0];
            let action = p.chunking_action;
            if !p.is_static() {
                match action {
                    ChunkingAction::Chunk => p.do_chunking = true,
                    ChunkingAction::Dechunk => p.do_dechunking = true,
                    ChunkingAction::PassthruChunked => {
                        p.do_chunked_passthru = true;
                        // cache writes always store the decoded body
                        if has_cache_writer {
                            p.do_dechunking = true;
                        }
                    }
                    ChunkingAction::None => {}
                }
            }
            if !p.is_handling_chunked_content() {
                p.bytes_consumed += p.total_bytes.min(p.init_bytes_done);
            }
            action
        };
        self.active = true;

        let mut chunked_start = None;
        let mut dechunked_start = None;
        let mut passthrough_start = None;
        if self.producers[pid.0].is_handling_chunked_content() {
            self.body_bytes_to_copy = 0;
            let p = &mut self.producers[pid.0];
            let mode = if p.do_chunking {
                crate::chunked::ChunkedMode::Encode
            } else if p.do_dechunking {
                crate::chunked::ChunkedMode::Decode
            } else {
                crate::chunked::ChunkedMode::Passthru
            };
            let drop_trailers = p.drop_trailers && p.do_chunked_passthru;
            p.chunked
                .init(&start, mode, drop_trailers, p.strict_chunk_parsing);
            let skip = p.chunked.skip_bytes;

            // headers go into the intermediate buffers ahead of the body
            if p.do_chunking {
                if let Some(buf) = p.chunked.chunked_buffer() {
                    let reader = buf.alloc_reader();
                    buf.write_from(&start, skip);
                    chunked_start = Some(reader);
                }
            }
            if p.do_dechunking {
                if let Some(buf) = p.chunked.dechunked_buffer() {
                    debug!(
                        "[{}] [producer_run] do_dechunking chunked_reader avail = {}",
                        self.id,
                        p.chunked
                            .chunked_reader
                            .as_ref()
                            .map(|r| r.read_avail())
                            .unwrap_or(0)
                    );
                    let reader = buf.alloc_reader();
                    // a transform already sent the header to the client
                    if !transform_consumer {
                        buf.write_from(&start, skip);
                        debug!("[{}] [producer_run] copied header of size {}", self.id, skip);
                    }
                    dechunked_start = Some(reader);
                }
            }
            if p.chunked.drops_trailers() {
                if let Some(buf) = p.chunked.chunked_buffer() {
                    let reader = buf.alloc_reader();
                    buf.write_from(&start, skip);
                    passthrough_start = Some(reader);
                }
            }
        }

        let mut producer_n;
        let consumer_n;
        let mut read_start_pos = None;
        {
            let p = &self.producers[pid.0];
            match p.range.filter(|_| p.role == TunnelRole::CacheRead) {
                Some(range) => {
                    read_start_pos = Some(range.start);
                    producer_n = range.byte_count();
                    consumer_n = producer_n.saturating_add(range.header_bytes);
                }
                None => {
                    consumer_n = p.total_bytes;
                    producer_n = p.ntodo;
                }
            }
            if !p.is_handling_chunked_content() {
                let copied = self.post_buffer.as_ref().map(PostBuffer::copied).unwrap_or(0);
                self.body_bytes_to_copy = producer_n.saturating_sub(copied);
            }
        }

        // readers first, so buffered data cannot be trimmed away
        let consumers = self.producers[pid.0].consumers.clone();
        for &cid in &consumers {
            let role = self.consumers[cid.0].role;
            let base = if role == TunnelRole::CacheWrite {
                match action {
                    ChunkingAction::Chunk | ChunkingAction::None => None,
                    ChunkingAction::Dechunk | ChunkingAction::PassthruChunked => dechunked_start.as_ref(),
                }
            } else {
                match action {
                    ChunkingAction::Chunk => chunked_start.as_ref(),
                    ChunkingAction::Dechunk => dechunked_start.as_ref(),
                    ChunkingAction::PassthruChunked => passthrough_start.as_ref(),
                    ChunkingAction::None => None,
                }
            };
            let reader = base.unwrap_or(&start).clone_reader();
            let skip = self.consumers[cid.0].skip_bytes;
            if skip > 0 {
                if skip > reader.read_avail() {
                    warn!(
                        "[{}] consumer '{}' skips {} bytes but only {} are buffered",
                        self.id,
                        self.consumers[cid.0].name,
                        skip,
                        reader.read_avail()
                    );
                }
                reader.consume(skip);
            }
            self.consumers[cid.0].buffer_reader = Some(reader);
        }

        if self.post_capture_applies(pid, None) {
            let role = self.producers[pid.0].role;
            let skip = self.producers[pid.0].chunked.skip_bytes;
            let avail = start.read_avail();
            if let Some(post) = self.post_buffer.as_mut() {
                debug!(
                    "[{}] client post: {} max size: {}",
                    self.id,
                    avail,
                    post.max_size()
                );
                if avail > post.max_size() {
                    warn!(
                        "[{}] post exceeds buffer limit, buffer_avail={} limit={}",
                        self.id,
                        avail,
                        post.max_size()
                    );
                    post.disable();
                    self.metrics.record_post_buffer_overflow();
                    if role == TunnelRole::BufferRead {
                        self.fail_producer(TunnelEvent::Error, pid);
                        self.chain_abort_all(pid);
                        start.dealloc();
                        self.producers[pid.0].buffer_start = None;
                        return;
                    }
                } else if role == TunnelRole::HttpClient {
                    if !post.is_attached() {
                        post.attach(&start);
                        post.skip(skip);
                    }
                    post.copy_partial(self.body_bytes_to_copy);
                    self.body_bytes_to_copy = 0;
                }
            }
        }

        let (do_chunking, do_dechunking, do_passthru) = {
            let p = &self.producers[pid.0];
            (p.do_chunking, p.do_dechunking, p.do_chunked_passthru)
        };
        if do_chunking {
            if let Some(reader) = chunked_start.take() {
                reader.dealloc();
            }
            let p = &mut self.producers[pid.0];
            let skip = p.chunked.skip_bytes;
            if let Some(reader) = &p.chunked.dechunked_reader {
                reader.consume(skip);
            }
            p.bytes_consumed += skip;

            // body bytes already buffered get framed now
            self.producer_handler(TunnelEvent::ReadReady, pid);
        } else if do_dechunking || do_passthru {
            for reader in [dechunked_start.take(), passthrough_start.take()]
                .into_iter()
                .flatten()
            {
                reader.dealloc();
            }
            let p = &mut self.producers[pid.0];
            let skip = p.chunked.skip_bytes;
            if !transform_consumer {
                if let Some(reader) = &p.chunked.chunked_reader {
                    if reader.read_avail() >= skip {
                        reader.consume(skip);
                        p.bytes_consumed += skip;
                        debug!("[{}] [producer_run] skipped header of {} bytes", self.id, skip);
                    }
                }
            }

            self.producer_handler(TunnelEvent::ReadReady, pid);
            let post_done = self.post_buffer.as_ref().is_some_and(PostBuffer::is_done);
            if post_done && self.producers[pid.0].role == TunnelRole::HttpClient {
                // replaying a finished chunked body: nothing left to read
                producer_n = 0;
            }
        }

        let mut half_closed = false;
        for &cid in &consumers {
            if !self.consumers[cid.0].alive {
                continue;
            }
            let mut c_write = consumer_n;
            let p = &self.producers[pid.0];
            if !p.alive {
                // only the initial read carried data; the length is known now
                c_write = self.final_consumer_bytes_to_write(pid, cid);
            } else {
                // an unknown length stays unknown
                if c_write != UNBOUNDED {
                    c_write -= self.consumers[cid.0].skip_bytes;
                }
                // chunking grows the body
                if p.do_chunking {
                    c_write = UNBOUNDED;
                }
            }
            if c_write < 0 {
                error!(
                    "[{}] negative write size {} for consumer '{}'",
                    self.id, c_write, self.consumers[cid.0].name
                );
                c_write = 0;
            }

            if c_write == 0 {
                self.consumers[cid.0].write_vio = None;
                self.consumer_handler(TunnelEvent::WriteComplete, cid);
                continue;
            }

            let Some(reader) = self.consumers[cid.0].buffer_reader.clone() else {
                continue;
            };
            // a half-closed client has sent everything it ever will
            let p = &mut self.producers[pid.0];
            if p.role == TunnelRole::HttpClient
                && p.endpoint.as_ref().is_some_and(|e| e.is_half_closed())
            {
                c_write = c_write.min(reader.read_avail());
                if p.alive {
                    p.alive = false;
                    p.update_outcome_if_not_set(ProducerOutcome::Success);
                    half_closed = true;
                }
            }

            debug!("[{}] start write vio {} bytes", self.id, c_write);
            let endpoint = self.consumers[cid.0].endpoint.clone();
            match endpoint.begin_write(c_write, &reader) {
                None => {
                    self.consumer_handler(TunnelEvent::Error, cid);
                }
                Some(vio) => {
                    let nothing_to_do = vio.ntodo() == 0;
                    self.consumers[cid.0].write_vio = Some(vio);
                    if nothing_to_do && self.consumers[cid.0].alive {
                        self.consumer_handler(TunnelEvent::WriteComplete, cid);
                    }
                }
            }
        }
        if half_closed {
            let p = &mut self.producers[pid.0];
            p.read_success = true;
            p.finalized = true;
            self.call_producer_handler(pid, TunnelEvent::Precomplete);
        }

        if self.producers[pid.0].alive {
            if producer_n == 0 {
                // everything is already buffered
                let p = &mut self.producers[pid.0];
                p.read_success = true;
                p.update_outcome_if_not_set(ProducerOutcome::Success);
                debug!("[{}] [tunnel_run] producer already done", self.id);
                self.producer_handler(TunnelEvent::Precomplete, pid);
            } else {
                let p = &self.producers[pid.0];
                if let (Some(endpoint), Some(buffer)) = (p.endpoint.clone(), p.read_buffer.clone()) {
                    let vio = match read_start_pos {
                        Some(offset) => endpoint.begin_pread(producer_n, &buffer, offset),
                        None => {
                            debug!("[{}] start read vio {} bytes", self.id, producer_n);
                            endpoint.begin_read(producer_n, &buffer)
                        }
                    };
                    match vio {
                        Some(vio) => {
                            self.producers[pid.0].read_vio = Some(vio.clone());
                            endpoint.reenable(&vio);
                        }
                        None => {
                            warn!("[{}] endpoint '{}' refused read", self.id, endpoint.name());
                            self.fail_producer(TunnelEvent::Error, pid);
                        }
                    }
                }
            }
        } else {
            // producer finished early, make sure the consumers get going
            self.reenable_consumers(pid);
        }

        start.dealloc();
        self.producers[pid.0].buffer_start = None;
    }

    fn post_capture_applies(&self, pid: ProducerId, event: Option<TunnelEvent>) -> bool {
        let Some(post) = &self.post_buffer else {
            return false;
        };
        if !post.is_valid() {
            return false;
        }
        let p = &self.producers[pid.0];
        match p.role {
            TunnelRole::BufferRead => true,
            TunnelRole::HttpClient => match event {
                None => p.alive,
                Some(event) => matches!(event, TunnelEvent::ReadReady | TunnelEvent::ReadComplete),
            },
            _ => false,
        }
    }

    fn copy_post_data(&mut self, event: TunnelEvent, pid: ProducerId) -> TunnelEvent {
        let p = &self.producers[pid.0];
        let (role, chunked, total) = (p.role, p.is_handling_chunked_content(), p.total_bytes);
        debug!("[{}] [producer_handler] capture [{} {}]", self.id, p.name, event);
        let Some(post) = self.post_buffer.as_mut() else {
            return event;
        };

        if post.would_overflow() {
            warn!(
                "[{}] post exceeds buffer limit, buffer_avail={} reader_avail={} limit={}",
                self.id,
                post.buffer_avail(),
                post.reader_avail(),
                post.max_size()
            );
            post.disable();
            self.metrics.record_post_buffer_overflow();
            if role == TunnelRole::BufferRead {
                return TunnelEvent::Error;
            }
            return event;
        }
        if role == TunnelRole::HttpClient {
            if !chunked {
                // nothing consumed by a codec, take the rest of the body
                self.body_bytes_to_copy = total.saturating_sub(post.copied());
            }
            post.copy_partial(self.body_bytes_to_copy);
            self.body_bytes_to_copy = 0;
            if event.is_read_completion() {
                post.set_done(true);
            }
        }
        event
    }

    /// Single entry point for I/O completions. Returns true when this call
    /// finished the tunnel and the owner was notified.
    pub fn main_handler(&mut self, event: TunnelEvent, vio: &Vio) -> bool {
        self.reentrancy_count += 1;

        let sm_callback = if let Some(pid) = self.producer_for_vio(vio) {
            if self.producers[pid.0].alive {
                self.producer_handler(event, pid)
            } else {
                debug!(
                    "[{}] ignoring {} for finished producer '{}'",
                    self.id, event, self.producers[pid.0].name
                );
                false
            }
        } else if let Some(cid) = self.consumer_for_vio(vio) {
            if self.consumers[cid.0].alive {
                self.consumer_handler(event, cid)
            } else {
                debug!(
                    "[{}] ignoring {} for finished consumer '{}'",
                    self.id, event, self.consumers[cid.0].name
                );
                false
            }
        } else {
            // presumably a delayed event for a party that is gone
            debug!("[{}] ignoring {} for unknown vio {}", self.id, event, vio.id());
            false
        };

        if self.call_sm || (sm_callback && !self.is_tunnel_alive()) {
            if self.reentrancy_count == 1 {
                self.reentrancy_count = 0;
                self.notify_done();
                return true;
            }
            self.call_sm = true;
        }
        self.reentrancy_count -= 1;
        false
    }

    fn producer_for_vio(&self, vio: &Vio) -> Option<ProducerId> {
        self.producers
            .iter()
            .find(|p| p.read_vio.as_ref().is_some_and(|v| v.same(vio)))
            .map(|p| p.id)
    }

    fn consumer_for_vio(&self, vio: &Vio) -> Option<ConsumerId> {
        self.consumers
            .iter()
            .find(|c| c.write_vio.as_ref().is_some_and(|v| v.same(vio)))
            .map(|c| c.id)
    }

    /// Frame plain body bytes for a chunking producer
    fn producer_handler_dechunked(&mut self, event: TunnelEvent, pid: ProducerId) -> TunnelEvent {
        debug!(
            "[{}] producer_handler_dechunked [{} {}]",
            self.id, self.producers[pid.0].name, event
        );
        if !matches!(
            event,
            TunnelEvent::ReadReady
                | TunnelEvent::ReadComplete
                | TunnelEvent::Precomplete
                | TunnelEvent::Eos
        ) {
            return event;
        }

        let p = &mut self.producers[pid.0];
        if event.is_read_completion() {
            // final sizes below depend on this
            p.alive = false;
        }
        p.last_event = Some(event);
        p.chunked.last_server_event = Some(event);
        let (consumed, done) = p.chunked.generate_chunked_content();
        p.bytes_consumed += consumed;
        self.body_bytes_to_copy = consumed;

        if done {
            let consumers = self.producers[pid.0].consumers.clone();
            for cid in consumers {
                if !self.consumers[cid.0].alive {
                    continue;
                }
                let n = self.final_consumer_bytes_to_write(pid, cid);
                if let Some(vio) = &self.consumers[cid.0].write_vio {
                    vio.set_nbytes(n);
                }
            }
        }
        event
    }

    /// Run the chunk decoder and translate the event to what it means for
    /// the decoded body
    fn producer_handler_chunked(&mut self, event: TunnelEvent, pid: ProducerId) -> TunnelEvent {
        debug!(
            "[{}] producer_handler_chunked [{} {}]",
            self.id, self.producers[pid.0].name, event
        );
        match event {
            TunnelEvent::ReadReady
            | TunnelEvent::ReadComplete
            | TunnelEvent::InactivityTimeout
            | TunnelEvent::Precomplete
            | TunnelEvent::Eos => {}
            _ => return event,
        }

        let p = &mut self.producers[pid.0];
        p.last_event = Some(event);
        p.chunked.last_server_event = Some(event);
        let (consumed, done) = p.chunked.process_chunked_content();
        p.bytes_consumed += consumed;
        self.body_bytes_to_copy = consumed;

        if p.chunked.is_error() {
            debug!(
                "[{}] producer_handler_chunked [{} chunk decoding error]",
                self.id, p.name
            );
            p.chunked.truncation = true;
            self.metrics.record_parse_error();
            return TunnelEvent::ParseError;
        }

        match event {
            TunnelEvent::ReadReady if done => return TunnelEvent::ReadComplete,
            TunnelEvent::Precomplete
            | TunnelEvent::Eos
            | TunnelEvent::ReadComplete
            | TunnelEvent::InactivityTimeout
                if !done =>
            {
                p.chunked.truncation = true;
            }
            _ => {}
        }
        event
    }

    /// Handle an event for a producer. Returns true when the owner was
    /// called back.
    pub(crate) fn producer_handler(&mut self, event: TunnelEvent, pid: ProducerId) -> bool {
        debug!(
            "[{}] producer_handler [{} {}]",
            self.id, self.producers[pid.0].name, event
        );

        let (do_chunking, handles_chunked) = {
            let p = &self.producers[pid.0];
            (p.do_chunking, p.do_dechunking || p.do_chunked_passthru)
        };
        let mut event = if do_chunking {
            self.producer_handler_dechunked(event, pid)
        } else if handles_chunked {
            self.producer_handler_chunked(event, pid)
        } else {
            self.producers[pid.0].last_event = Some(event);
            event
        };

        if self.post_capture_applies(pid, Some(event)) {
            event = self.copy_post_data(event, pid);
        }

        match event {
            TunnelEvent::ReadReady => {
                self.reenable_consumers(pid);
                false
            }
            TunnelEvent::Precomplete | TunnelEvent::ReadComplete | TunnelEvent::Eos => {
                self.complete_producer(event, pid);
                true
            }
            TunnelEvent::Error
            | TunnelEvent::ActiveTimeout
            | TunnelEvent::InactivityTimeout
            | TunnelEvent::ConsumerDetach
            | TunnelEvent::ParseError => {
                if self.producers[pid.0].alive {
                    self.fail_producer(event, pid);
                    true
                } else {
                    false
                }
            }
            TunnelEvent::WriteReady | TunnelEvent::WriteComplete | TunnelEvent::Done => {
                warn!(
                    "[{}] producer '{}' got unexpected event {}",
                    self.id, self.producers[pid.0].name, event
                );
                false
            }
        }
    }

    fn reenable_consumers(&self, pid: ProducerId) {
        for cid in &self.producers[pid.0].consumers {
            let c = &self.consumers[cid.0];
            if let Some(vio) = c.write_vio.as_ref().filter(|_| c.alive) {
                c.endpoint.reenable(vio);
            }
        }
    }

    /// The producer read everything it is going to read
    fn complete_producer(&mut self, event: TunnelEvent, pid: ProducerId) {
        let p = &mut self.producers[pid.0];
        if p.finalized {
            return;
        }
        p.finalized = true;
        p.alive = false;
        let ended_short = event == TunnelEvent::Eos
            && p.total_bytes != UNBOUNDED
            && p.read_vio.as_ref().is_some_and(|v| v.ntodo() > 0);
        p.settle_bytes_read();
        if ended_short {
            p.chunked.truncation = true;
        }
        p.read_success = !p.chunked.truncated();
        let (role, bytes_read, truncated) = (p.role, p.bytes_read, !p.read_success);

        self.metrics.record_bytes_read(bytes_read);
        self.metrics.cache_connection_closed(role);
        if truncated {
            warn!(
                "[{}] producer '{}' truncated after {} bytes ({})",
                self.id, self.producers[pid.0].name, bytes_read, event
            );
            self.metrics.record_truncation();
            self.chain_abort_cache_write(pid);
        }

        // the owner settles sizes before consumers see the tail
        self.call_producer_handler(pid, event);
        let outcome = if truncated {
            ProducerOutcome::ClientFail
        } else {
            ProducerOutcome::Success
        };
        self.producers[pid.0].update_outcome_if_not_set(outcome);
        self.finish_all_internal(pid, false);

        let bytes_consumed = self.producers[pid.0].bytes_consumed;
        for cid in self.producers[pid.0].consumers.clone() {
            let c = &self.consumers[cid.0];
            if let Some(vio) = c.write_vio.as_ref().filter(|_| c.alive) {
                if vio.nbytes() == UNBOUNDED {
                    vio.set_nbytes(bytes_consumed - c.skip_bytes);
                }
                c.endpoint.reenable(vio);
            }
        }
    }

    /// The producer's read failed or timed out
    pub(crate) fn fail_producer(&mut self, event: TunnelEvent, pid: ProducerId) {
        let p = &mut self.producers[pid.0];
        if p.finalized {
            return;
        }
        p.finalized = true;
        p.alive = false;
        if p.read_vio.is_some() {
            p.settle_bytes_read();
        } else {
            p.bytes_read = 0;
        }
        p.read_success = false;
        // no more reads may land in tunnel buffers
        if let Some(endpoint) = &p.endpoint {
            endpoint.cancel_read();
        }
        let (role, bytes_read) = (p.role, p.bytes_read);
        self.metrics.record_bytes_read(bytes_read);
        self.metrics.cache_connection_closed(role);

        self.call_producer_handler(pid, event);
        self.producers[pid.0].update_outcome_if_not_set(ProducerOutcome::ClientFail);

        // partial bodies never reach the cache; other sinks get what arrived
        self.chain_abort_cache_write(pid);
        self.finish_all_internal(pid, false);
    }

    /// Handle an event for a consumer. Returns true when the owner was
    /// called back.
    pub(crate) fn consumer_handler(&mut self, event: TunnelEvent, cid: ConsumerId) -> bool {
        debug!(
            "[{}] consumer_handler [{} {}]",
            self.id, self.consumers[cid.0].name, event
        );
        if !self.consumers[cid.0].alive {
            return false;
        }
        let pid = self.consumers[cid.0].producer;

        match event {
            TunnelEvent::WriteReady => {
                self.consumer_reenable(cid);
                false
            }
            TunnelEvent::WriteComplete
            | TunnelEvent::Eos
            | TunnelEvent::Error
            | TunnelEvent::ActiveTimeout
            | TunnelEvent::InactivityTimeout => {
                let c = &mut self.consumers[cid.0];
                c.alive = false;
                c.bytes_written = c.write_vio.as_ref().map(Vio::ndone).unwrap_or(0);
                let (role, written) = (c.role, c.bytes_written);
                self.metrics.record_bytes_written(written);
                self.metrics.cache_connection_closed(role);

                self.call_consumer_handler(cid, event);

                let p = &mut self.producers[pid.0];
                if p.outcome.is_none() {
                    if event == TunnelEvent::WriteComplete {
                        p.outcome = Some(ProducerOutcome::Success);
                        // a finished write means the read worked too
                        p.read_success = true;
                        if p.alive {
                            self.producer_handler(TunnelEvent::ReadComplete, pid);
                        }
                    } else if role == TunnelRole::HttpServer {
                        p.outcome = Some(ProducerOutcome::ClientFail);
                    } else if role == TunnelRole::HttpClient {
                        p.outcome = Some(ProducerOutcome::ServerFail);
                    }
                }

                // released after the owner saw the consumer
                if let Some(reader) = self.consumers[cid.0].buffer_reader.take() {
                    reader.dealloc();
                }

                // a removed consumer may have made room upstream
                let p = &self.producers[pid.0];
                if p.alive {
                    if let Some(vio) = p.read_vio.clone() {
                        if p.is_throttled() {
                            self.consumer_reenable(cid);
                        } else if let Some(endpoint) = &p.endpoint {
                            endpoint.reenable(&vio);
                        }
                    }
                }
                true
            }
            TunnelEvent::ReadReady
            | TunnelEvent::ReadComplete
            | TunnelEvent::Precomplete
            | TunnelEvent::ConsumerDetach
            | TunnelEvent::ParseError
            | TunnelEvent::Done => {
                warn!(
                    "[{}] consumer '{}' got unexpected event {}",
                    self.id, self.consumers[cid.0].name, event
                );
                false
            }
        }
    }

    /// Flow-control decision made whenever a consumer can take more data
    pub(crate) fn consumer_reenable(&mut self, cid: ConsumerId) {
        let pid = self.consumers[cid.0].producer;
        let (c_role, c_endpoint) = {
            let c = &self.consumers[cid.0];
            (c.role, c.endpoint.clone())
        };
        if !self.producers[pid.0].alive {
            return;
        }
        let high_water = self.flow_state.high_water;
        let low_water = self.flow_state.low_water;

        // only external sources are subject to flow control; the high water
        // check is inclusive, the low water check strict
        let mut backlog = if self.flow_state.enabled && self.producers[pid.0].role.is_source() {
            self.backlog(pid, high_water)
        } else {
            0
        };
        let srcp = self.producers[pid.0].flow_control_source;

        if backlog >= high_water {
            debug!("[{}] Throttle {} {} / {}", self.id, pid, backlog, high_water);
            self.throttle(pid);
            return;
        }

        if let Some(src) = srcp {
            if self.producers[src.0].alive && c_role.is_sink() {
                // the source decides, which may not be this consumer's producer
                if src != pid {
                    backlog = self.backlog(src, low_water);
                }
                if backlog < low_water {
                    debug!("[{}] Unthrottle {} {} / {}", self.id, src, backlog, low_water);
                    self.unthrottle(src);
                    let s = &self.producers[src.0];
                    if let (Some(endpoint), Some(vio)) = (&s.endpoint, &s.read_vio) {
                        endpoint.reenable(vio);
                    }
                    self.producer_handler(TunnelEvent::ReadReady, src);
                } else if c_role == TunnelRole::HttpClient {
                    // the socket write may drain before we hear about it
                    c_endpoint.trap_write_buffer_empty();
                }
            }
        }

        let p = &self.producers[pid.0];
        if !p.is_throttled() {
            if let (Some(endpoint), Some(vio)) = (&p.endpoint, &p.read_vio) {
                endpoint.reenable(vio);
            }
        }
    }

    pub(crate) fn call_producer_handler(&mut self, pid: ProducerId, event: TunnelEvent) {
        if let Some(mut handler) = self.producers[pid.0].handler.take() {
            handler(event, &self.producers[pid.0]);
            self.producers[pid.0].handler = Some(handler);
        }
    }

    pub(crate) fn call_consumer_handler(&mut self, cid: ConsumerId, event: TunnelEvent) {
        if let Some(mut handler) = self.consumers[cid.0].handler.take() {
            handler(event, &self.consumers[cid.0]);
            self.consumers[cid.0].handler = Some(handler);
        }
    }

    fn notify_done(&mut self) {
        self.active = false;
        self.call_sm = false;
        if self.done_notified {
            return;
        }
        self.done_notified = true;
        if self.state == TunnelState::Running {
            self.state = TunnelState::Done;
        }
        self.metrics.record_tunnel_completed();
        info!("[{}] tunnel done", self.id);
        if let Some(mut handler) = self.done_handler.take() {
            handler(self);
            self.done_handler = Some(handler);
        }
    }
}
