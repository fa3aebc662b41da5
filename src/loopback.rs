//! Loopback I/O Module
//!
//! An in-process I/O layer for the tunnel. Endpoints move bytes between
//! memory and tunnel buffers in bounded steps and report completions as
//! queued events; [`Loopback::run`] drains the queue and hands each event to
//! [`Tunnel::main_handler`], playing the part of the event dispatcher that
//! serializes a transaction.
//!
//! Nothing is delivered re-entrantly: an endpoint reenabled from inside a
//! handler only schedules a step, which runs after the handler returns.

use crate::endpoint::{EndpointRef, IoEndpoint};
use crate::event::TunnelEvent;
use crate::io_buffer::{IoBuffer, IoBufferReader};
use crate::tunnel::Tunnel;
use crate::vio::Vio;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace, warn};

/// Jobs processed before [`Loopback::run`] assumes a livelock
pub const MAX_JOBS: usize = 1_000_000;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// An endpoint that does its work in scheduled steps
pub trait Steppable: Send + Sync {
    fn step(&self);
}

pub enum Job {
    Event(TunnelEvent, Vio),
    Step(Arc<dyn Steppable>),
}

/// FIFO of pending events and endpoint steps, shared by every endpoint of
/// one transaction
#[derive(Clone, Default)]
pub struct EventQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_event(&self, event: TunnelEvent, vio: &Vio) {
        trace!("queue event {} for vio {}", event, vio.id());
        self.lock().push_back(Job::Event(event, vio.clone()));
    }

    pub fn push_step(&self, step: Arc<dyn Steppable>) {
        self.lock().push_back(Job::Step(step));
    }

    pub fn pop(&self) -> Option<Job> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Drives tunnels over in-memory endpoints
#[derive(Clone, Default)]
pub struct Loopback {
    queue: EventQueue,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn source(&self, name: &str, data: impl Into<Bytes>, block_size: usize) -> Arc<MemSource> {
        MemSource::new(&self.queue, name, data, block_size)
    }

    pub fn sink(&self, name: &str, block_size: usize) -> Arc<MemSink> {
        MemSink::new(&self.queue, name, block_size)
    }

    pub fn transform(&self, name: &str, block_size: usize) -> Arc<MemTransform> {
        MemTransform::new(&self.queue, name, block_size)
    }

    /// Process queued work until nothing is left. Returns the number of
    /// events delivered to the tunnel.
    pub fn run(&self, tunnel: &mut Tunnel) -> usize {
        let mut delivered = 0;
        let mut jobs = 0;
        while let Some(job) = self.queue.pop() {
            jobs += 1;
            if jobs > MAX_JOBS {
                warn!("loopback stopped after {} jobs with work pending", MAX_JOBS);
                break;
            }
            match job {
                Job::Event(event, vio) => {
                    delivered += 1;
                    tunnel.main_handler(event, &vio);
                }
                Job::Step(endpoint) => endpoint.step(),
            }
        }
        debug!("loopback idle after {} events", delivered);
        delivered
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Close bookkeeping shared by the memory endpoints
#[derive(Debug, Default, Clone, Copy)]
struct CloseRecord {
    count: usize,
    code: Option<i32>,
}

#[derive(Debug)]
struct SourceState {
    data: Bytes,
    pos: usize,
    block_size: usize,
    /// Keep reading without a reenable while the buffer retains less
    read_ahead: u64,
    fail_at: Option<usize>,
    half_closed: bool,
    vio: Option<Vio>,
    scheduled: bool,
    reads_started: usize,
    read_cancelled: bool,
    closed: CloseRecord,
}

/// Reads a fixed byte string in blocks. Like a socket with a buffer water
/// mark it reads ahead on its own until the tunnel buffer holds
/// `read_ahead` bytes, then waits for a reenable.
pub struct MemSource {
    name: String,
    queue: EventQueue,
    this: Weak<MemSource>,
    state: Mutex<SourceState>,
}

impl MemSource {
    pub fn new(queue: &EventQueue, name: &str, data: impl Into<Bytes>, block_size: usize) -> Arc<Self> {
        let data = data.into();
        let block_size = block_size.max(1);
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            queue: queue.clone(),
            this: this.clone(),
            state: Mutex::new(SourceState {
                data,
                pos: 0,
                block_size,
                read_ahead: 4 * block_size as u64,
                fail_at: None,
                half_closed: false,
                vio: None,
                scheduled: false,
                reads_started: 0,
                read_cancelled: false,
                closed: CloseRecord::default(),
            }),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> EndpointRef {
        self.clone()
    }

    pub fn set_read_ahead(&self, bytes: u64) {
        lock(&self.state).read_ahead = bytes;
    }

    /// Report an error instead of delivering data at byte `pos`
    pub fn fail_at(&self, pos: usize) {
        lock(&self.state).fail_at = Some(pos);
    }

    pub fn set_half_closed(&self, half_closed: bool) {
        lock(&self.state).half_closed = half_closed;
    }

    /// Bytes handed to the tunnel so far
    pub fn delivered(&self) -> usize {
        lock(&self.state).pos
    }

    pub fn reads_started(&self) -> usize {
        lock(&self.state).reads_started
    }

    pub fn read_cancelled(&self) -> bool {
        lock(&self.state).read_cancelled
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closed.count
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn close_code(&self) -> Option<i32> {
        lock(&self.state).closed.code
    }

    fn schedule(&self, state: &mut SourceState) {
        if state.scheduled {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            state.scheduled = true;
            self.queue.push_step(this);
        }
    }

    fn start_read(&self, vio: Vio, pos: Option<usize>) -> Option<Vio> {
        let mut state = lock(&self.state);
        if state.closed.count > 0 {
            return None;
        }
        if let Some(pos) = pos {
            state.pos = pos.min(state.data.len());
        }
        state.reads_started += 1;
        state.read_cancelled = false;
        state.vio = Some(vio.clone());
        Some(vio)
    }
}

impl IoEndpoint for MemSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_read(&self, nbytes: i64, buffer: &IoBuffer) -> Option<Vio> {
        self.start_read(Vio::read(nbytes, buffer.clone()), None)
    }

    fn begin_pread(&self, nbytes: i64, buffer: &IoBuffer, offset: u64) -> Option<Vio> {
        let vio = Vio::pread(nbytes, buffer.clone(), offset);
        self.start_read(vio, Some(offset as usize))
    }

    fn begin_write(&self, _nbytes: i64, _reader: &IoBufferReader) -> Option<Vio> {
        None
    }

    fn reenable(&self, vio: &Vio) {
        let mut state = lock(&self.state);
        if state.vio.as_ref().is_some_and(|v| v.same(vio)) {
            self.schedule(&mut state);
        }
    }

    fn close(&self, error: Option<i32>) {
        let mut state = lock(&self.state);
        state.closed.count += 1;
        state.closed.code = error;
        state.vio = None;
    }

    fn cancel_read(&self) {
        let mut state = lock(&self.state);
        state.vio = None;
        state.read_cancelled = true;
    }

    fn is_half_closed(&self) -> bool {
        lock(&self.state).half_closed
    }
}

impl Steppable for MemSource {
    fn step(&self) {
        let mut state = lock(&self.state);
        state.scheduled = false;
        let Some(vio) = state.vio.clone() else {
            return;
        };
        let Some(buffer) = vio.buffer() else {
            return;
        };

        let ntodo = vio.ntodo();
        if ntodo == 0 {
            state.vio = None;
            self.queue.push_event(TunnelEvent::ReadComplete, &vio);
            return;
        }
        if state.fail_at.is_some_and(|at| state.pos >= at) {
            state.vio = None;
            self.queue.push_event(TunnelEvent::Error, &vio);
            return;
        }
        let remaining = state.data.len() - state.pos;
        if remaining == 0 {
            state.vio = None;
            self.queue.push_event(TunnelEvent::Eos, &vio);
            return;
        }

        let mut n = state.block_size.min(remaining);
        n = n.min(usize::try_from(ntodo).unwrap_or(usize::MAX));
        if let Some(at) = state.fail_at {
            n = n.min(at - state.pos);
        }
        let block = state.data.slice(state.pos..state.pos + n);
        state.pos += n;
        buffer.append(block);
        vio.add_done(n as i64);
        trace!("{} delivered {} bytes", self.name, n);

        if vio.ntodo() == 0 {
            state.vio = None;
            self.queue.push_event(TunnelEvent::ReadComplete, &vio);
        } else {
            self.queue.push_event(TunnelEvent::ReadReady, &vio);
            if buffer.retained() < state.read_ahead {
                self.schedule(&mut state);
            }
        }
    }
}

#[derive(Debug)]
struct SinkState {
    vio: Option<Vio>,
    written: BytesMut,
    block_size: usize,
    paused: bool,
    fail: bool,
    scheduled: bool,
    completed: bool,
    writes_started: usize,
    write_cancelled: bool,
    backlog: Option<u64>,
    traps: usize,
    closed: CloseRecord,
}

/// Collects everything written to it, one block per step
pub struct MemSink {
    name: String,
    queue: EventQueue,
    this: Weak<MemSink>,
    state: Mutex<SinkState>,
}

impl MemSink {
    pub fn new(queue: &EventQueue, name: &str, block_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            queue: queue.clone(),
            this: this.clone(),
            state: Mutex::new(SinkState {
                vio: None,
                written: BytesMut::new(),
                block_size: block_size.max(1),
                paused: false,
                fail: false,
                scheduled: false,
                completed: false,
                writes_started: 0,
                write_cancelled: false,
                backlog: None,
                traps: 0,
                closed: CloseRecord::default(),
            }),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> EndpointRef {
        self.clone()
    }

    pub fn written(&self) -> Bytes {
        lock(&self.state).written.clone().freeze()
    }

    pub fn written_len(&self) -> usize {
        lock(&self.state).written.len()
    }

    /// Stop taking data until [`MemSink::resume`]
    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    pub fn resume(&self) {
        let mut state = lock(&self.state);
        state.paused = false;
        if state.vio.is_some() {
            self.schedule(&mut state);
        }
    }

    /// Report an error on the next step
    pub fn fail_next_write(&self) {
        lock(&self.state).fail = true;
    }

    /// Report a fixed internal backlog, as a buffering transform would
    pub fn set_backlog(&self, backlog: Option<u64>) {
        lock(&self.state).backlog = backlog;
    }

    pub fn is_completed(&self) -> bool {
        lock(&self.state).completed
    }

    pub fn writes_started(&self) -> usize {
        lock(&self.state).writes_started
    }

    pub fn write_cancelled(&self) -> bool {
        lock(&self.state).write_cancelled
    }

    pub fn trap_count(&self) -> usize {
        lock(&self.state).traps
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closed.count
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn close_code(&self) -> Option<i32> {
        lock(&self.state).closed.code
    }

    fn schedule(&self, state: &mut SinkState) {
        if state.scheduled || state.paused {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            state.scheduled = true;
            self.queue.push_step(this);
        }
    }
}

impl IoEndpoint for MemSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_read(&self, _nbytes: i64, _buffer: &IoBuffer) -> Option<Vio> {
        None
    }

    fn begin_write(&self, nbytes: i64, reader: &IoBufferReader) -> Option<Vio> {
        let mut state = lock(&self.state);
        if state.closed.count > 0 {
            return None;
        }
        let vio = Vio::write(nbytes, reader.clone());
        state.vio = Some(vio.clone());
        state.completed = false;
        state.write_cancelled = false;
        state.writes_started += 1;
        self.schedule(&mut state);
        Some(vio)
    }

    fn reenable(&self, vio: &Vio) {
        let mut state = lock(&self.state);
        if state.vio.as_ref().is_some_and(|v| v.same(vio)) {
            self.schedule(&mut state);
        }
    }

    fn close(&self, error: Option<i32>) {
        let mut state = lock(&self.state);
        state.closed.count += 1;
        state.closed.code = error;
        state.vio = None;
    }

    fn cancel_write(&self) {
        let mut state = lock(&self.state);
        state.vio = None;
        state.write_cancelled = true;
    }

    fn trap_write_buffer_empty(&self) {
        lock(&self.state).traps += 1;
    }

    fn backlog(&self, _limit: u64) -> Option<u64> {
        lock(&self.state).backlog
    }
}

impl Steppable for MemSink {
    fn step(&self) {
        let mut state = lock(&self.state);
        state.scheduled = false;
        if state.paused {
            return;
        }
        let Some(vio) = state.vio.clone() else {
            return;
        };
        if state.fail {
            state.fail = false;
            state.vio = None;
            self.queue.push_event(TunnelEvent::Error, &vio);
            return;
        }
        let Some(reader) = vio.reader() else {
            return;
        };

        let ntodo = usize::try_from(vio.ntodo()).unwrap_or(usize::MAX);
        let avail = usize::try_from(reader.read_avail()).unwrap_or(0);
        let n = avail.min(ntodo).min(state.block_size);
        if n > 0 {
            let block = reader.read(n);
            state.written.extend_from_slice(&block);
            vio.add_done(block.len() as i64);
            trace!("{} wrote {} bytes", self.name, block.len());
        }

        if vio.ntodo() == 0 {
            if !state.completed {
                state.completed = true;
                self.queue.push_event(TunnelEvent::WriteComplete, &vio);
            }
            return;
        }
        if n > 0 {
            self.queue.push_event(TunnelEvent::WriteReady, &vio);
            if reader.read_avail() > 0 {
                self.schedule(&mut state);
            }
        }
    }
}

#[derive(Debug)]
struct TransformState {
    write_vio: Option<Vio>,
    read_vio: Option<Vio>,
    pending: BytesMut,
    block_size: usize,
    input_done: bool,
    scheduled: bool,
    backlog: Option<u64>,
    closed: CloseRecord,
}

/// Identity transform: whatever the tunnel writes in comes back out as a
/// chained producer's input
pub struct MemTransform {
    name: String,
    queue: EventQueue,
    this: Weak<MemTransform>,
    state: Mutex<TransformState>,
}

impl MemTransform {
    pub fn new(queue: &EventQueue, name: &str, block_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            queue: queue.clone(),
            this: this.clone(),
            state: Mutex::new(TransformState {
                write_vio: None,
                read_vio: None,
                pending: BytesMut::new(),
                block_size: block_size.max(1),
                input_done: false,
                scheduled: false,
                backlog: None,
                closed: CloseRecord::default(),
            }),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> EndpointRef {
        self.clone()
    }

    /// Override the reported internal backlog
    pub fn set_backlog(&self, backlog: Option<u64>) {
        lock(&self.state).backlog = backlog;
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closed.count
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    fn schedule(&self, state: &mut TransformState) {
        if state.scheduled {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            state.scheduled = true;
            self.queue.push_step(this);
        }
    }
}

impl IoEndpoint for MemTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_read(&self, nbytes: i64, buffer: &IoBuffer) -> Option<Vio> {
        let mut state = lock(&self.state);
        if state.closed.count > 0 {
            return None;
        }
        let vio = Vio::read(nbytes, buffer.clone());
        state.read_vio = Some(vio.clone());
        Some(vio)
    }

    fn begin_write(&self, nbytes: i64, reader: &IoBufferReader) -> Option<Vio> {
        let mut state = lock(&self.state);
        if state.closed.count > 0 {
            return None;
        }
        let vio = Vio::write(nbytes, reader.clone());
        state.write_vio = Some(vio.clone());
        state.input_done = false;
        self.schedule(&mut state);
        Some(vio)
    }

    fn reenable(&self, vio: &Vio) {
        let mut state = lock(&self.state);
        let known = [&state.write_vio, &state.read_vio]
            .into_iter()
            .flatten()
            .any(|v| v.same(vio));
        if known {
            self.schedule(&mut state);
        }
    }

    fn close(&self, error: Option<i32>) {
        let mut state = lock(&self.state);
        state.closed.count += 1;
        state.closed.code = error;
        state.write_vio = None;
        state.read_vio = None;
    }

    fn cancel_read(&self) {
        lock(&self.state).read_vio = None;
    }

    fn cancel_write(&self) {
        lock(&self.state).write_vio = None;
    }

    fn backlog(&self, _limit: u64) -> Option<u64> {
        let state = lock(&self.state);
        Some(state.backlog.unwrap_or(state.pending.len() as u64))
    }
}

impl Steppable for MemTransform {
    fn step(&self) {
        let mut state = lock(&self.state);
        state.scheduled = false;
        let mut again = false;

        if let Some(vio) = state.write_vio.clone() {
            if let Some(reader) = vio.reader() {
                let ntodo = usize::try_from(vio.ntodo()).unwrap_or(usize::MAX);
                let avail = usize::try_from(reader.read_avail()).unwrap_or(0);
                let n = avail.min(ntodo).min(state.block_size);
                if n > 0 {
                    let block = reader.read(n);
                    state.pending.extend_from_slice(&block);
                    vio.add_done(block.len() as i64);
                }
                if vio.ntodo() == 0 {
                    state.input_done = true;
                    state.write_vio = None;
                    self.queue.push_event(TunnelEvent::WriteComplete, &vio);
                } else if n > 0 {
                    self.queue.push_event(TunnelEvent::WriteReady, &vio);
                    again |= reader.read_avail() > 0;
                }
            }
        }

        if let Some(vio) = state.read_vio.clone() {
            if let Some(buffer) = vio.buffer() {
                let ntodo = usize::try_from(vio.ntodo()).unwrap_or(usize::MAX);
                let n = state.pending.len().min(ntodo).min(state.block_size);
                if n > 0 {
                    let block = state.pending.split_to(n).freeze();
                    buffer.append(block);
                    vio.add_done(n as i64);
                }
                if vio.ntodo() == 0 {
                    state.read_vio = None;
                    self.queue.push_event(TunnelEvent::ReadComplete, &vio);
                } else if state.input_done && state.pending.is_empty() {
                    state.read_vio = None;
                    self.queue.push_event(TunnelEvent::Eos, &vio);
                } else if n > 0 {
                    self.queue.push_event(TunnelEvent::ReadReady, &vio);
                    again |= !state.pending.is_empty();
                }
            }
        }

        if again {
            self.schedule(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_stops_at_read_ahead_limit() {
        let queue = EventQueue::new();
        let source = MemSource::new(&queue, "src", &b"abcdefgh"[..], 3);
        source.set_read_ahead(3);
        let buffer = IoBuffer::new();
        let reader = buffer.alloc_reader();

        let vio = source.begin_read(8, &buffer).unwrap();
        assert!(queue.is_empty());
        source.reenable(&vio);
        source.reenable(&vio);
        assert_eq!(queue.len(), 1);

        let drain = |queue: &EventQueue| {
            while let Some(job) = queue.pop() {
                if let Job::Step(s) = job {
                    s.step();
                }
            }
        };
        drain(&queue);
        assert_eq!(reader.read_avail(), 3);
        assert_eq!(vio.ndone(), 3);

        reader.consume(3);
        source.reenable(&vio);
        drain(&queue);
        assert_eq!(vio.ndone(), 6);
    }

    #[test]
    fn test_source_reports_eos_when_exhausted() {
        let queue = EventQueue::new();
        let source = MemSource::new(&queue, "src", &b"ab"[..], 8);
        let buffer = IoBuffer::new();
        let vio = source.begin_read(-1, &buffer).unwrap();

        let mut events = Vec::new();
        for _ in 0..2 {
            source.reenable(&vio);
            while let Some(job) = queue.pop() {
                match job {
                    Job::Step(s) => s.step(),
                    Job::Event(e, _) => events.push(e),
                }
            }
        }
        assert_eq!(events, vec![TunnelEvent::ReadReady, TunnelEvent::Eos]);
    }

    #[test]
    fn test_sink_completes_once() {
        let queue = EventQueue::new();
        let sink = MemSink::new(&queue, "sink", 2);
        let buffer = IoBuffer::new();
        let reader = buffer.alloc_reader();
        buffer.write(b"xyz");

        let vio = sink.begin_write(3, &reader).unwrap();
        let mut events = Vec::new();
        while let Some(job) = queue.pop() {
            match job {
                Job::Step(s) => s.step(),
                Job::Event(e, _) => events.push(e),
            }
        }
        sink.reenable(&vio);
        while let Some(job) = queue.pop() {
            match job {
                Job::Step(s) => s.step(),
                Job::Event(e, _) => events.push(e),
            }
        }
        assert_eq!(&sink.written()[..], b"xyz");
        assert_eq!(events, vec![TunnelEvent::WriteReady, TunnelEvent::WriteComplete]);
    }
}
