//! IO Buffer Module
//!
//! A multi-reader append-only byte queue. Producers append blocks, every
//! consumer owns an independent read cursor, and a block is released only
//! once every cursor has moved past it. Blocks are `Bytes`, so handing a
//! range from one buffer to another is a reference, not a copy.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct BufferInner {
    blocks: VecDeque<Bytes>,
    /// Absolute offset of the first retained byte
    base: u64,
    /// Absolute offset one past the last written byte
    end: u64,
    /// Reader id -> absolute cursor position
    readers: HashMap<u64, u64>,
    next_reader_id: u64,
}

impl BufferInner {
    fn push(&mut self, block: Bytes) -> usize {
        let len = block.len();
        if len > 0 {
            self.end += len as u64;
            self.blocks.push_back(block);
        }
        len
    }

    /// Collect up to `max` bytes starting at absolute offset `pos`.
    fn slices_from(&self, pos: u64, max: u64) -> Vec<Bytes> {
        let mut out = Vec::new();
        if pos < self.base || max == 0 {
            return out;
        }
        let mut remaining = max;
        let mut block_start = self.base;
        for block in &self.blocks {
            let block_end = block_start + block.len() as u64;
            if block_end > pos {
                let from = pos.saturating_sub(block_start) as usize;
                let take = ((block.len() - from) as u64).min(remaining) as usize;
                out.push(block.slice(from..from + take));
                remaining -= take as u64;
                if remaining == 0 {
                    break;
                }
            }
            block_start = block_end;
        }
        out
    }

    fn contiguous_from(&self, pos: u64) -> Option<Bytes> {
        self.slices_from(pos, u64::MAX).into_iter().next()
    }

    /// Drop every byte that no reader can see any more.
    fn trim(&mut self) {
        let floor = self.readers.values().copied().min().unwrap_or(self.end);
        while let Some(front) = self.blocks.front_mut() {
            let front_end = self.base + front.len() as u64;
            if front_end <= floor {
                self.base = front_end;
                self.blocks.pop_front();
            } else {
                if floor > self.base {
                    let cut = (floor - self.base) as usize;
                    front.advance(cut);
                    self.base = floor;
                }
                break;
            }
        }
        if self.blocks.is_empty() {
            self.base = self.end;
        }
    }
}

/// Shared append-only buffer. Cloning the handle shares the same storage.
#[derive(Debug, Clone, Default)]
pub struct IoBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy `data` into the buffer, returning the number of bytes written
    pub fn write(&self, data: &[u8]) -> usize {
        self.lock().push(Bytes::copy_from_slice(data))
    }

    /// Append a block by reference
    pub fn append(&self, block: Bytes) -> usize {
        self.lock().push(block)
    }

    /// Append, by reference, up to `n` bytes visible to `reader`.
    ///
    /// The reader is not advanced; callers consume separately once the bytes
    /// have been accounted for.
    pub fn write_from(&self, reader: &IoBufferReader, n: i64) -> i64 {
        if n <= 0 {
            return 0;
        }
        let slices = reader.peek(n as u64);
        let mut inner = self.lock();
        slices.into_iter().map(|s| inner.push(s) as i64).sum()
    }

    /// Allocate a cursor at the oldest retained byte
    pub fn alloc_reader(&self) -> IoBufferReader {
        let mut inner = self.lock();
        let id = inner.next_reader_id;
        inner.next_reader_id += 1;
        let base = inner.base;
        inner.readers.insert(id, base);
        IoBufferReader {
            buffer: self.clone(),
            id,
        }
    }

    /// Total bytes ever written to the buffer
    pub fn total_written(&self) -> u64 {
        self.lock().end
    }

    /// Bytes still retained for at least one reader
    pub fn retained(&self) -> u64 {
        let inner = self.lock();
        inner.end - inner.base
    }

    pub fn reader_count(&self) -> usize {
        self.lock().readers.len()
    }

    pub fn same_buffer(&self, other: &IoBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A read cursor into an [`IoBuffer`].
///
/// Cloning the handle shares the cursor; [`IoBufferReader::clone_reader`]
/// allocates a second, independent cursor at the same position.
#[derive(Debug, Clone)]
pub struct IoBufferReader {
    buffer: IoBuffer,
    id: u64,
}

impl IoBufferReader {
    pub fn buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    fn position(&self, inner: &BufferInner) -> Option<u64> {
        inner.readers.get(&self.id).copied()
    }

    pub fn is_allocated(&self) -> bool {
        let inner = self.buffer.lock();
        self.position(&inner).is_some()
    }

    /// Bytes available to this cursor. A deallocated cursor sees nothing.
    pub fn read_avail(&self) -> i64 {
        let inner = self.buffer.lock();
        match self.position(&inner) {
            Some(pos) => (inner.end - pos) as i64,
            None => 0,
        }
    }

    pub fn is_read_avail_more_than(&self, n: i64) -> bool {
        self.read_avail() > n
    }

    /// Bytes available in the block under the cursor
    pub fn block_read_avail(&self) -> i64 {
        self.peek_block().map(|b| b.len() as i64).unwrap_or(0)
    }

    /// The contiguous block under the cursor, without consuming it
    pub fn peek_block(&self) -> Option<Bytes> {
        let inner = self.buffer.lock();
        let pos = self.position(&inner)?;
        inner.contiguous_from(pos)
    }

    /// Up to `max` bytes under the cursor as block references
    pub fn peek(&self, max: u64) -> Vec<Bytes> {
        let inner = self.buffer.lock();
        match self.position(&inner) {
            Some(pos) => inner.slices_from(pos, max),
            None => Vec::new(),
        }
    }

    /// Advance the cursor, clamped to the available bytes
    pub fn consume(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let mut inner = self.buffer.lock();
        let end = inner.end;
        if let Some(pos) = inner.readers.get_mut(&self.id) {
            *pos = (*pos + n as u64).min(end);
            inner.trim();
        }
    }

    /// Take up to `max` bytes and advance past them
    pub fn read(&self, max: usize) -> Bytes {
        let slices = self.peek(max as u64);
        let out = match slices.len() {
            0 => Bytes::new(),
            1 => slices.into_iter().next().unwrap_or_default(),
            _ => {
                let mut joined = BytesMut::new();
                for s in &slices {
                    joined.extend_from_slice(s);
                }
                joined.freeze()
            }
        };
        self.consume(out.len() as i64);
        out
    }

    /// Allocate an independent cursor at this cursor's position
    pub fn clone_reader(&self) -> IoBufferReader {
        let mut inner = self.buffer.lock();
        let id = inner.next_reader_id;
        inner.next_reader_id += 1;
        let pos = self.position(&inner).unwrap_or(inner.end);
        inner.readers.insert(id, pos);
        IoBufferReader {
            buffer: self.buffer.clone(),
            id,
        }
    }

    /// Release the cursor so it no longer holds data in the buffer
    pub fn dealloc(&self) {
        let mut inner = self.buffer.lock();
        if inner.readers.remove(&self.id).is_some() {
            inner.trim();
        }
    }

    pub fn same_cursor(&self, other: &IoBufferReader) -> bool {
        self.id == other.id && self.buffer.same_buffer(&other.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_are_independent() {
        let buf = IoBuffer::new();
        let a = buf.alloc_reader();
        buf.write(b"hello ");
        buf.write(b"world");
        let b = a.clone_reader();

        assert_eq!(a.read_avail(), 11);
        assert_eq!(a.read(6), Bytes::from_static(b"hello "));
        assert_eq!(a.read_avail(), 5);
        assert_eq!(b.read_avail(), 11);
        assert_eq!(b.read(100), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_data_retained_until_slowest_reader_passes() {
        let buf = IoBuffer::new();
        let fast = buf.alloc_reader();
        let slow = fast.clone_reader();
        buf.write(b"0123456789");

        fast.consume(10);
        assert_eq!(buf.retained(), 10);
        slow.consume(4);
        assert_eq!(buf.retained(), 6);
        slow.dealloc();
        assert_eq!(buf.retained(), 0);
        assert_eq!(slow.read_avail(), 0);
    }

    #[test]
    fn test_write_from_references_without_consuming() {
        let src = IoBuffer::new();
        let r = src.alloc_reader();
        src.write(b"abc");
        src.write(b"defg");

        let dst = IoBuffer::new();
        let dr = dst.alloc_reader();
        assert_eq!(dst.write_from(&r, 5), 5);
        assert_eq!(r.read_avail(), 7);
        assert_eq!(dr.read(10), Bytes::from_static(b"abcde"));
    }

    #[test]
    fn test_block_read_avail_tracks_front_block() {
        let buf = IoBuffer::new();
        let r = buf.alloc_reader();
        buf.write(b"abc");
        buf.write(b"de");
        assert_eq!(r.block_read_avail(), 3);
        r.consume(2);
        assert_eq!(r.block_read_avail(), 1);
        r.consume(1);
        assert_eq!(r.block_read_avail(), 2);
    }

    #[test]
    fn test_consume_is_clamped() {
        let buf = IoBuffer::new();
        let r = buf.alloc_reader();
        buf.write(b"xy");
        r.consume(50);
        assert_eq!(r.read_avail(), 0);
        buf.write(b"z");
        assert_eq!(r.read(1), Bytes::from_static(b"z"));
    }
}
