//! POST Buffer Module
//!
//! Keeps a bounded copy of a client request body while it is tunneled to the
//! origin, so the transaction can replay it after a redirect. Once the body
//! outgrows the limit the copy is dropped and replay is disabled for the
//! rest of the transaction; the transfer itself carries on.

use crate::io_buffer::{IoBuffer, IoBufferReader};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct PostBuffer {
    max_size: i64,
    /// Cursor on the client producer's buffer, positioned at the body
    source: Option<IoBufferReader>,
    copy: IoBuffer,
    /// Holds the captured bytes until the buffer is dropped
    copy_start: IoBufferReader,
    copied: i64,
    done: bool,
    valid: bool,
}

impl PostBuffer {
    pub fn new(max_size: i64) -> Self {
        let copy = IoBuffer::new();
        let copy_start = copy.alloc_reader();
        Self {
            max_size: max_size.max(0),
            source: None,
            copy,
            copy_start,
            copied: 0,
            done: false,
            valid: true,
        }
    }

    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    /// Replay is still possible
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Give up on replay and release everything captured so far
    pub fn disable(&mut self) {
        if self.valid {
            debug!("disabling request body capture after {} bytes", self.copied);
        }
        self.valid = false;
        if let Some(source) = self.source.take() {
            source.dealloc();
        }
        self.copy_start.consume(self.copy_start.read_avail());
    }

    pub fn is_attached(&self) -> bool {
        self.source.is_some()
    }

    /// Start capturing from an independent cursor at `start`
    pub fn attach(&mut self, start: &IoBufferReader) {
        if let Some(old) = self.source.replace(start.clone_reader()) {
            old.dealloc();
        }
    }

    /// Step the source cursor past `n` bytes that are not body
    pub fn skip(&mut self, n: i64) {
        if let Some(source) = &self.source {
            source.consume(n.min(source.read_avail()));
        }
    }

    /// Bytes already copied
    pub fn buffer_avail(&self) -> i64 {
        self.copy_start.read_avail()
    }

    /// Bytes waiting on the source cursor
    pub fn reader_avail(&self) -> i64 {
        self.source.as_ref().map(|r| r.read_avail()).unwrap_or(0)
    }

    /// Captured plus pending bytes would exceed the limit
    pub fn would_overflow(&self) -> bool {
        self.buffer_avail() + self.reader_avail() > self.max_size
    }

    /// Copy up to `n` pending bytes into the capture buffer
    pub fn copy_partial(&mut self, n: i64) -> i64 {
        if !self.valid {
            return 0;
        }
        let Some(source) = self.source.as_ref() else {
            return 0;
        };
        let n = n.min(source.read_avail());
        if n <= 0 {
            return 0;
        }
        if self.copied + n > self.max_size {
            warn!(
                "request body exceeds capture limit, copied={} pending={} limit={}",
                self.copied, n, self.max_size
            );
            self.disable();
            return 0;
        }
        let moved = self.copy.write_from(source, n);
        source.consume(moved);
        self.copied += moved;
        moved
    }

    pub fn copied(&self) -> i64 {
        self.copied
    }

    pub fn set_done(&mut self, done: bool) {
        self.done = done;
    }

    /// The whole body has been captured
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// A fresh cursor over the captured body, for seeding a replay producer
    pub fn replay_reader(&self) -> Option<IoBufferReader> {
        if self.valid && self.done {
            Some(self.copy_start.clone_reader())
        } else {
            None
        }
    }
}

impl Drop for PostBuffer {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            source.dealloc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_body_for_replay() {
        let client = IoBuffer::new();
        let start = client.alloc_reader();
        client.write(b"name=value");

        let mut post = PostBuffer::new(64);
        post.attach(&start);
        assert_eq!(post.copy_partial(100), 10);
        post.set_done(true);

        let replay = post.replay_reader().unwrap();
        assert_eq!(&replay.read(64)[..], b"name=value");
        // the client cursor is untouched
        assert_eq!(start.read_avail(), 10);
    }

    #[test]
    fn test_overflow_disables_replay() {
        let client = IoBuffer::new();
        let start = client.alloc_reader();
        client.write(&[b'x'; 32]);

        let mut post = PostBuffer::new(16);
        post.attach(&start);
        assert!(post.would_overflow());
        assert_eq!(post.copy_partial(32), 0);
        assert!(!post.is_valid());
        post.set_done(true);
        assert!(post.replay_reader().is_none());
    }
}
