//! Endpoint Module
//!
//! The narrow contract the tunnel consumes from the I/O layer. An endpoint
//! is a byte stream (socket, cache object, transform) that can service one
//! read and one write at a time. Completion is reported asynchronously by
//! the I/O layer handing the `Vio` back to [`crate::tunnel::Tunnel::main_handler`].
//!
//! Methods take `&self`: an endpoint may be shared between a consumer and a
//! producer of the same tunnel (a transform), so implementations keep their
//! own interior state.

use crate::io_buffer::{IoBuffer, IoBufferReader};
use crate::vio::Vio;
use std::sync::Arc;

/// Shared handle to an endpoint
pub type EndpointRef = Arc<dyn IoEndpoint>;

pub trait IoEndpoint: Send + Sync {
    /// Human-readable name used in tracing output
    fn name(&self) -> &str {
        "endpoint"
    }

    /// Start reading up to `nbytes` into `buffer`. `None` means the read
    /// could not be started.
    fn begin_read(&self, nbytes: i64, buffer: &IoBuffer) -> Option<Vio>;

    /// Start a positioned read at `offset`; endpoints without random access
    /// ignore the offset.
    fn begin_pread(&self, nbytes: i64, buffer: &IoBuffer, offset: u64) -> Option<Vio> {
        let _ = offset;
        self.begin_read(nbytes, buffer)
    }

    /// Start writing up to `nbytes` taken from `reader`
    fn begin_write(&self, nbytes: i64, reader: &IoBufferReader) -> Option<Vio>;

    /// Resume an operation after the tunnel moved data or made room
    fn reenable(&self, vio: &Vio);

    /// Close the endpoint, optionally with an error code
    fn close(&self, error: Option<i32>);

    /// Drop the outstanding read so no further read events arrive
    fn cancel_read(&self) {}

    /// Drop the outstanding write so no further write events arrive
    fn cancel_write(&self) {}

    /// The peer closed its sending side; everything it will send is buffered
    fn is_half_closed(&self) -> bool {
        false
    }

    /// Request a write-ready event once the endpoint's own write buffer drains
    fn trap_write_buffer_empty(&self) {}

    /// Bytes held inside the endpoint, for endpoints that buffer internally
    /// (transforms). Stops counting once `limit` is reached.
    fn backlog(&self, limit: u64) -> Option<u64> {
        let _ = limit;
        None
    }
}

/// Error code passed to [`IoEndpoint::close`] when the tunnel aborts a party
pub const EHTTP_ERROR: i32 = 20_000;

/// Identity comparison for endpoint handles
pub fn same_endpoint(a: &EndpointRef, b: &EndpointRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
