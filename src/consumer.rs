//! Consumer Module
//!
//! A consumer is one byte sink of a tunnel, bound to exactly one producer
//! for its whole life. It writes from its own cursor into that producer's
//! (possibly transcoded) buffer.

use crate::endpoint::EndpointRef;
use crate::event::{TunnelEvent, TunnelRole};
use crate::io_buffer::IoBufferReader;
use crate::producer::ProducerId;
use crate::tunnel::{Tunnel, MAX_CONSUMERS};
use crate::vio::Vio;
use std::fmt;
use tracing::debug;

/// Completion callback for a consumer, invoked with the triggering event
pub type ConsumerHandler = Box<dyn FnMut(TunnelEvent, &Consumer) + Send>;

/// Slot index of a consumer in its tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub(crate) usize);

impl ConsumerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

pub struct Consumer {
    pub(crate) id: ConsumerId,
    pub(crate) name: String,
    pub(crate) role: TunnelRole,
    pub(crate) endpoint: EndpointRef,
    pub(crate) handler: Option<ConsumerHandler>,
    pub(crate) producer: ProducerId,
    /// Producer fed by this consumer's output
    pub(crate) self_producer: Option<ProducerId>,
    pub(crate) buffer_reader: Option<IoBufferReader>,
    pub(crate) write_vio: Option<Vio>,
    pub(crate) skip_bytes: i64,
    pub(crate) alive: bool,
    pub(crate) bytes_written: i64,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("endpoint", &self.endpoint.name())
            .field("producer", &self.producer)
            .field("self_producer", &self.self_producer)
            .field("skip_bytes", &self.skip_bytes)
            .field("alive", &self.alive)
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> TunnelRole {
        self.role
    }

    pub fn endpoint(&self) -> &EndpointRef {
        &self.endpoint
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    pub fn self_producer(&self) -> Option<ProducerId> {
        self.self_producer
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_sink(&self) -> bool {
        self.role.is_sink()
    }

    pub fn skip_bytes(&self) -> i64 {
        self.skip_bytes
    }

    pub fn bytes_written(&self) -> i64 {
        self.bytes_written
    }

    pub fn write_vio(&self) -> Option<&Vio> {
        self.write_vio.as_ref()
    }

    pub fn buffer_reader(&self) -> Option<&IoBufferReader> {
        self.buffer_reader.as_ref()
    }

    /// Bytes the endpoint has been asked to write, once writing started
    pub fn bytes_to_write(&self) -> Option<i64> {
        self.write_vio.as_ref().map(Vio::nbytes)
    }
}

impl Tunnel {
    /// Attach a sink to `producer`.
    ///
    /// Returns `None` when the producer already died without reading its
    /// data successfully; nothing is allocated in that case.
    ///
    /// # Panics
    ///
    /// Panics when the tunnel already holds `MAX_CONSUMERS` consumers.
    pub fn add_consumer(
        &mut self,
        endpoint: EndpointRef,
        producer: ProducerId,
        handler: ConsumerHandler,
        role: TunnelRole,
        name: &str,
        skip_bytes: i64,
    ) -> Option<ConsumerId> {
        debug!("[{}] adding consumer '{}'", self.id, name);

        let p = &self.producers[producer.0];
        if !p.alive && !p.read_success {
            debug!(
                "[{}] consumer '{}' not added due to producer failure",
                self.id, name
            );
            return None;
        }
        assert!(
            self.consumers.len() < MAX_CONSUMERS,
            "tunnel {} out of consumer slots adding '{}'",
            self.id,
            name
        );

        let id = ConsumerId(self.consumers.len());
        self.consumers.push(Consumer {
            id,
            name: name.to_string(),
            role,
            endpoint,
            handler: Some(handler),
            producer,
            self_producer: None,
            buffer_reader: None,
            write_vio: None,
            skip_bytes: skip_bytes.max(0),
            alive: true,
            bytes_written: 0,
        });
        self.producers[producer.0].consumers.push(id);
        self.metrics.cache_connection_opened(role);
        Some(id)
    }

    /// Feed `consumer`'s output into `producer`. A chain hooked under a
    /// throttled producer starts out throttled by the same source.
    pub fn chain(&mut self, consumer: ConsumerId, producer: ProducerId) {
        self.producers[producer.0].self_consumer = Some(consumer);
        self.consumers[consumer.0].self_producer = Some(producer);

        let upstream = self.consumers[consumer.0].producer;
        if let Some(src) = self.producers[upstream.0].flow_control_source {
            self.set_throttle_src(producer, Some(src));
        }
    }

    /// Look up the producer reading from `endpoint`
    pub fn get_producer(&self, endpoint: &EndpointRef) -> Option<ProducerId> {
        self.producers
            .iter()
            .find(|p| {
                p.endpoint
                    .as_ref()
                    .is_some_and(|e| crate::endpoint::same_endpoint(e, endpoint))
            })
            .map(|p| p.id)
    }

    /// Look up the consumer writing to `endpoint`
    pub fn get_consumer(&self, endpoint: &EndpointRef) -> Option<ConsumerId> {
        self.consumers
            .iter()
            .find(|c| crate::endpoint::same_endpoint(&c.endpoint, endpoint))
            .map(|c| c.id)
    }
}
