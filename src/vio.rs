//! VIO Module
//!
//! A `Vio` describes one outstanding read or write issued on an endpoint:
//! how many bytes were asked for, how many are done, and which buffer or
//! reader carries the data. The handle is shared between the tunnel and the
//! endpoint servicing it; completion events carry it back to the tunnel.

use crate::io_buffer::{IoBuffer, IoBufferReader};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Byte count meaning "until the endpoint signals end of stream"
pub const UNBOUNDED: i64 = i64::MAX;

/// Normalize a requested byte count: negative values mean unbounded
pub fn normalize_nbytes(n: i64) -> i64 {
    if n < 0 {
        UNBOUNDED
    } else {
        n
    }
}

static NEXT_VIO_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOp {
    Read,
    Write,
}

#[derive(Debug)]
struct VioState {
    nbytes: i64,
    ndone: i64,
    buffer: Option<IoBuffer>,
    reader: Option<IoBufferReader>,
    offset: u64,
}

/// Shared handle to an outstanding I/O operation
#[derive(Debug, Clone)]
pub struct Vio {
    id: u64,
    op: VioOp,
    state: Arc<Mutex<VioState>>,
}

impl Vio {
    /// Describe a read of `nbytes` into `buffer`
    pub fn read(nbytes: i64, buffer: IoBuffer) -> Self {
        Self::new(VioOp::Read, nbytes, Some(buffer), None, 0)
    }

    /// Describe a positioned read starting at `offset` in the source
    pub fn pread(nbytes: i64, buffer: IoBuffer, offset: u64) -> Self {
        Self::new(VioOp::Read, nbytes, Some(buffer), None, offset)
    }

    /// Describe a write of `nbytes` taken from `reader`
    pub fn write(nbytes: i64, reader: IoBufferReader) -> Self {
        Self::new(VioOp::Write, nbytes, None, Some(reader), 0)
    }

    fn new(
        op: VioOp,
        nbytes: i64,
        buffer: Option<IoBuffer>,
        reader: Option<IoBufferReader>,
        offset: u64,
    ) -> Self {
        Self {
            id: NEXT_VIO_ID.fetch_add(1, Ordering::Relaxed),
            op,
            state: Arc::new(Mutex::new(VioState {
                nbytes: normalize_nbytes(nbytes),
                ndone: 0,
                buffer,
                reader,
                offset,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn op(&self) -> VioOp {
        self.op
    }

    pub fn nbytes(&self) -> i64 {
        self.lock().nbytes
    }

    pub fn set_nbytes(&self, nbytes: i64) {
        self.lock().nbytes = normalize_nbytes(nbytes);
    }

    pub fn ndone(&self) -> i64 {
        self.lock().ndone
    }

    /// Record `n` more bytes transferred
    pub fn add_done(&self, n: i64) {
        let mut state = self.lock();
        state.ndone = state.ndone.saturating_add(n);
    }

    /// Bytes still to transfer; unbounded stays unbounded
    pub fn ntodo(&self) -> i64 {
        let state = self.lock();
        if state.nbytes == UNBOUNDED {
            UNBOUNDED
        } else {
            (state.nbytes - state.ndone).max(0)
        }
    }

    pub fn buffer(&self) -> Option<IoBuffer> {
        self.lock().buffer.clone()
    }

    pub fn reader(&self) -> Option<IoBufferReader> {
        self.lock().reader.clone()
    }

    /// Source offset for a positioned read
    pub fn offset(&self) -> u64 {
        self.lock().offset
    }

    pub fn same(&self, other: &Vio) -> bool {
        self.id == other.id
    }
}
