//! Proxy Tunnel - body tunneling engine for a caching reverse proxy
//!
//! This library moves message bodies from producers (origin connections,
//! cache reads, buffered data) to any number of consumers (client
//! connections, cache writes, transforms) with chunked transcoding, flow
//! control and chained aborts. The I/O layer is abstracted behind
//! [`endpoint::IoEndpoint`]; [`loopback`] provides an in-memory one.

pub mod chunked;
pub mod config;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod io_buffer;
pub mod logging;
pub mod loopback;
pub mod metrics;
pub mod post_buffer;
pub mod producer;
pub mod teardown;
pub mod tunnel;
pub mod vio;

pub use error::{Result, TunnelError};
pub use event::{TunnelEvent, TunnelRole};
pub use tunnel::{Tunnel, TunnelState};
