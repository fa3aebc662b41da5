//! Event Module
//!
//! The event vocabulary shared by the I/O layer, the tunnel and the owning
//! transaction, and the role tags that distinguish tunnel parties.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Events delivered to and raised by the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelEvent {
    ReadReady,
    ReadComplete,
    Eos,
    Error,
    ActiveTimeout,
    InactivityTimeout,
    WriteReady,
    WriteComplete,
    /// Producer is finished although its endpoint never reported it
    Precomplete,
    ConsumerDetach,
    /// Chunked decoding failed
    ParseError,
    /// Nothing in the tunnel is alive any more
    Done,
}

impl TunnelEvent {
    /// Events after which a producer is finished without failure
    pub fn is_read_completion(self) -> bool {
        matches!(
            self,
            TunnelEvent::ReadComplete | TunnelEvent::Eos | TunnelEvent::Precomplete
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TunnelEvent::Error
                | TunnelEvent::ActiveTimeout
                | TunnelEvent::InactivityTimeout
                | TunnelEvent::ConsumerDetach
                | TunnelEvent::ParseError
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TunnelEvent::ReadReady => "VC_EVENT_READ_READY",
            TunnelEvent::ReadComplete => "VC_EVENT_READ_COMPLETE",
            TunnelEvent::Eos => "VC_EVENT_EOS",
            TunnelEvent::Error => "VC_EVENT_ERROR",
            TunnelEvent::ActiveTimeout => "VC_EVENT_ACTIVE_TIMEOUT",
            TunnelEvent::InactivityTimeout => "VC_EVENT_INACTIVITY_TIMEOUT",
            TunnelEvent::WriteReady => "VC_EVENT_WRITE_READY",
            TunnelEvent::WriteComplete => "VC_EVENT_WRITE_COMPLETE",
            TunnelEvent::Precomplete => "HTTP_TUNNEL_EVENT_PRECOMPLETE",
            TunnelEvent::ConsumerDetach => "HTTP_TUNNEL_EVENT_CONSUMER_DETACH",
            TunnelEvent::ParseError => "HTTP_TUNNEL_EVENT_PARSE_ERROR",
            TunnelEvent::Done => "HTTP_TUNNEL_EVENT_DONE",
        }
    }
}

impl fmt::Display for TunnelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Role of a producer or consumer in the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelRole {
    HttpClient,
    HttpServer,
    CacheRead,
    CacheWrite,
    Transform,
    /// Pre-buffered data with no endpoint
    Static,
    /// Captured request body replayed for retry or redirect
    BufferRead,
}

impl TunnelRole {
    /// Roles that terminate a chain rather than feeding another producer
    pub fn is_sink(self) -> bool {
        matches!(self, TunnelRole::HttpClient | TunnelRole::CacheWrite)
    }

    /// Roles that pull data from outside the proxy
    pub fn is_source(self) -> bool {
        matches!(
            self,
            TunnelRole::HttpServer | TunnelRole::CacheRead | TunnelRole::HttpClient
        )
    }

    pub fn is_cache(self) -> bool {
        matches!(self, TunnelRole::CacheRead | TunnelRole::CacheWrite)
    }
}

impl fmt::Display for TunnelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelRole::HttpClient => "http-client",
            TunnelRole::HttpServer => "http-server",
            TunnelRole::CacheRead => "cache-read",
            TunnelRole::CacheWrite => "cache-write",
            TunnelRole::Transform => "transform",
            TunnelRole::Static => "static",
            TunnelRole::BufferRead => "buffer-read",
        };
        f.write_str(name)
    }
}
