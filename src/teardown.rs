//! Teardown Module
//!
//! Finishing and aborting parties: final write lengths once a producer is
//! exhausted, chained aborts that leave no endpoint open, and whole-tunnel
//! kill/abort used by the owning transaction.

use crate::consumer::ConsumerId;
use crate::endpoint::EHTTP_ERROR;
use crate::event::{TunnelEvent, TunnelRole};
use crate::producer::{ChunkingAction, ProducerId};
use crate::tunnel::{Tunnel, TunnelState};
use crate::vio::UNBOUNDED;
use std::collections::HashSet;
use tracing::{debug, error, info};

impl Tunnel {
    /// Close every live party reachable from `pid`, consumers first, then
    /// the producer's own endpoint.
    pub fn chain_abort_all(&mut self, pid: ProducerId) {
        let mut visited = HashSet::new();
        self.chain_abort_all_from(pid, &mut visited);
    }

    fn chain_abort_all_from(&mut self, pid: ProducerId, visited: &mut HashSet<ProducerId>) {
        if !visited.insert(pid) {
            return;
        }
        debug!("[{}] chain_abort_all [{}]", self.id, self.producers[pid.0].name);

        for cid in self.producers[pid.0].consumers.clone() {
            let c = &mut self.consumers[cid.0];
            if c.alive {
                c.alive = false;
                c.write_vio = None;
                c.endpoint.close(Some(EHTTP_ERROR));
                let role = c.role;
                self.update_stats_after_abort(role);
            }
            if let Some(selfp) = self.consumers[cid.0].self_producer {
                self.chain_abort_all_from(selfp, visited);
            }
        }

        let p = &mut self.producers[pid.0];
        if p.alive {
            p.alive = false;
            p.finalized = true;
            p.settle_bytes_read();
            let self_consumer = p.self_consumer;
            p.read_vio = None;
            if let Some(endpoint) = &p.endpoint {
                endpoint.close(Some(EHTTP_ERROR));
            }
            let role = p.role;
            if let Some(cid) = self_consumer {
                self.consumers[cid.0].alive = false;
            }
            self.metrics.record_origin_shutdown_abort();
            self.update_stats_after_abort(role);
        }
    }

    /// Close only the cache writers reachable from `pid` so a partial body
    /// is never committed. Other consumers keep going.
    pub fn chain_abort_cache_write(&mut self, pid: ProducerId) {
        let mut visited = HashSet::new();
        self.chain_abort_cache_write_from(pid, &mut visited);
    }

    fn chain_abort_cache_write_from(&mut self, pid: ProducerId, visited: &mut HashSet<ProducerId>) {
        if !visited.insert(pid) {
            return;
        }
        for cid in self.producers[pid.0].consumers.clone() {
            let c = &mut self.consumers[cid.0];
            if !c.alive {
                continue;
            }
            if c.role == TunnelRole::CacheWrite {
                debug!("[{}] aborting cache write '{}'", self.id, c.name);
                c.alive = false;
                c.write_vio = None;
                c.endpoint.close(Some(EHTTP_ERROR));
                if let Some(reader) = c.buffer_reader.take() {
                    reader.dealloc();
                }
                self.update_stats_after_abort(TunnelRole::CacheWrite);
            } else if let Some(selfp) = c.self_producer {
                self.chain_abort_cache_write_from(selfp, visited);
            }
        }
    }

    /// Total bytes `cid` must write once its producer is exhausted.
    /// [`UNBOUNDED`] while the producer is still reading, 0 for a dead
    /// consumer.
    pub fn final_consumer_bytes_to_write(&self, pid: ProducerId, cid: ConsumerId) -> i64 {
        let p = &self.producers[pid.0];
        let c = &self.consumers[cid.0];
        if p.alive {
            return UNBOUNDED;
        }
        if !c.alive {
            return 0;
        }

        let skip = p.chunked.skip_bytes;
        let total = if c.role == TunnelRole::CacheWrite {
            match p.chunking_action {
                ChunkingAction::Chunk | ChunkingAction::None => p.bytes_consumed,
                ChunkingAction::Dechunk | ChunkingAction::PassthruChunked => {
                    skip + p.chunked.dechunked_size
                }
            }
        } else {
            match p.chunking_action {
                ChunkingAction::Chunk => skip + p.chunked.chunked_size,
                ChunkingAction::Dechunk => skip + p.chunked.dechunked_size,
                // trailer bytes are consumed but never emitted
                ChunkingAction::PassthruChunked if p.chunked.drops_trailers() => {
                    skip + p.chunked.chunked_size
                }
                ChunkingAction::PassthruChunked | ChunkingAction::None => p.bytes_consumed,
            }
        };
        total - c.skip_bytes
    }

    /// Settle final write lengths for `pid`'s consumers, recursing through
    /// chains when `chain` is set, and complete any consumer that already
    /// wrote everything.
    pub(crate) fn finish_all_internal(&mut self, pid: ProducerId, chain: bool) {
        let mut visited = HashSet::new();
        self.finish_all_from(pid, chain, &mut visited);
    }

    fn finish_all_from(&mut self, pid: ProducerId, chain: bool, visited: &mut HashSet<ProducerId>) {
        if !visited.insert(pid) {
            return;
        }
        for cid in self.producers[pid.0].consumers.clone() {
            if !self.consumers[cid.0].alive {
                continue;
            }
            let n = self.final_consumer_bytes_to_write(pid, cid);
            let c = &self.consumers[cid.0];
            if let Some(vio) = &c.write_vio {
                if n < 0 {
                    error!(
                        "[{}] final write size {} for consumer '{}' is negative",
                        self.id, n, c.name
                    );
                }
                vio.set_nbytes(n.max(0));
            }

            if chain {
                if let Some(selfp) = c.self_producer {
                    self.chain_finish_from(selfp, visited);
                }
            }

            // no event will come for a write that has nothing left to do
            let c = &self.consumers[cid.0];
            let finished = c.alive
                && c.write_vio
                    .as_ref()
                    .is_some_and(|vio| vio.nbytes() == vio.ndone());
            if finished {
                self.consumer_handler(TunnelEvent::WriteComplete, cid);
            }
        }
    }

    /// Settle `pid`'s own consumers only
    pub fn local_finish_all(&mut self, pid: ProducerId) {
        self.finish_all_internal(pid, false);
    }

    /// Finish `pid` and everything chained below it
    pub fn chain_finish_all(&mut self, pid: ProducerId) {
        let mut visited = HashSet::new();
        self.chain_finish_from(pid, &mut visited);
    }

    fn chain_finish_from(&mut self, pid: ProducerId, visited: &mut HashSet<ProducerId>) {
        if let Some(cid) = self.producers[pid.0].self_consumer {
            self.consumers[cid.0].alive = false;
        }
        self.producers[pid.0].alive = false;
        self.finish_all_from(pid, true, visited);
    }

    /// Close a producer's endpoint. Its self-consumer, if still running,
    /// is finished with what it wrote so far.
    pub fn close_producer(&mut self, pid: ProducerId) {
        if let Some(cid) = self.producers[pid.0].self_consumer {
            let c = &mut self.consumers[cid.0];
            if c.alive {
                c.alive = false;
                if let Some(vio) = &c.write_vio {
                    c.bytes_written = vio.ndone();
                }
            }
        }
        if let Some(endpoint) = &self.producers[pid.0].endpoint {
            endpoint.close(None);
        }
    }

    /// Close a consumer's endpoint. Its self-producer, if still running,
    /// is finished with what it read so far.
    pub fn close_consumer(&mut self, cid: ConsumerId) {
        if let Some(pid) = self.consumers[cid.0].self_producer {
            let p = &mut self.producers[pid.0];
            if p.alive {
                p.alive = false;
                if let Some(vio) = &p.read_vio {
                    p.bytes_read = vio.ndone();
                }
            }
        }
        self.consumers[cid.0].endpoint.close(None);
    }

    /// Abort every chain, release buffers and clear the tunnel
    pub fn kill_tunnel(&mut self) {
        info!("[{}] killing tunnel", self.id);
        // static producers have no endpoint but their consumers still do
        for i in 0..self.producers.len() {
            self.chain_abort_all(ProducerId(i));
        }
        self.active = false;
        self.deallocate_buffers();
        self.clear_slots();
        self.state = TunnelState::Aborted;
        self.metrics.record_tunnel_aborted();
    }

    /// Cancel outstanding I/O and close every live endpoint, then clear
    /// the tunnel. Unlike [`Tunnel::kill_tunnel`] no error code is passed
    /// to the endpoints.
    pub fn abort_tunnel(&mut self) {
        info!("[{}] aborting tunnel", self.id);
        self.active = false;
        self.deallocate_buffers();
        for p in &mut self.producers {
            if p.alive {
                if let Some(endpoint) = &p.endpoint {
                    endpoint.cancel_read();
                    endpoint.close(None);
                }
            }
            p.alive = false;
        }
        for c in &mut self.consumers {
            if c.alive {
                c.endpoint.cancel_write();
                c.endpoint.close(None);
            }
            c.alive = false;
        }
        self.clear_slots();
        self.state = TunnelState::Aborted;
        self.metrics.record_tunnel_aborted();
    }

    /// Release every reader and intermediate buffer the tunnel holds.
    /// Returns the number of producer buffers released.
    pub fn deallocate_buffers(&mut self) -> usize {
        debug_assert!(!self.active, "deallocating buffers of an active tunnel");
        let mut released = 0;
        for p in &mut self.producers {
            if p.read_buffer.take().is_some() {
                released += 1;
            }
            if let Some(start) = p.buffer_start.take() {
                start.dealloc();
            }
            p.chunked.clear();
        }
        for c in &mut self.consumers {
            if let Some(reader) = c.buffer_reader.take() {
                reader.dealloc();
            }
        }
        if released > 0 {
            debug!("[{}] released {} producer buffers", self.id, released);
        }
        released
    }

    pub(crate) fn update_stats_after_abort(&self, role: TunnelRole) {
        self.metrics.cache_connection_closed(role);
    }
}
