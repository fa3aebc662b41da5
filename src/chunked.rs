//! Chunked Transfer Coding Module
//!
//! Incremental transcoder between HTTP chunked wire format and plain body
//! bytes. Decoding parses `<hex-size>[;ext]\r\n<data>\r\n ... 0\r\n<trailers>\r\n`
//! from a reader into a dechunked buffer; encoding frames whatever is
//! available on a body reader into a chunked buffer. Pass-through mode only
//! tracks framing so the tunnel knows where the message ends, optionally
//! rewriting the stream without its trailer section.
//!
//! Neither direction ever waits: each call consumes what is currently
//! available and returns.

use crate::event::TunnelEvent;
use crate::io_buffer::{IoBuffer, IoBufferReader};
use crate::{Result, TunnelError};
use tracing::debug;

/// Largest chunk emitted when encoding unless configured otherwise
pub const DEFAULT_MAX_CHUNK_SIZE: i64 = 4096;

/// Below this many contiguous bytes chunk data is copied instead of
/// referenced, so tiny slices do not pin large blocks.
const MIN_BLOCK_TRANSFER_BYTES: i64 = 256;

const FINAL_CRLF: &[u8] = b"\r\n";
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    ReadSizeStart,
    ReadSize,
    ReadSizeCrlf,
    ReadChunk,
    ReadTrailerBlank,
    ReadTrailerCr,
    ReadTrailerLine,
    ReadDone,
    ReadError,
    WriteChunk,
    WriteDone,
}

/// Direction of the transcoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedMode {
    /// Plain body in, chunked out
    Encode,
    /// Chunked in, plain body out
    Decode,
    /// Chunked in, chunked out
    Passthru,
}

#[derive(Debug)]
pub struct ChunkedHandler {
    pub(crate) mode: Option<ChunkedMode>,
    pub(crate) state: ChunkedState,

    /// Wire input when decoding or passing through
    pub(crate) chunked_reader: Option<IoBufferReader>,
    pub(crate) dechunked_buffer: Option<IoBuffer>,
    pub(crate) dechunked_size: i64,

    /// Body input when encoding
    pub(crate) dechunked_reader: Option<IoBufferReader>,
    /// Encoded output, or the trailer-free rewrite in pass-through
    pub(crate) chunked_buffer: Option<IoBuffer>,
    pub(crate) chunked_size: i64,

    pub(crate) truncation: bool,
    /// Header bytes held in front of the body
    pub(crate) skip_bytes: i64,
    pub(crate) last_server_event: Option<TunnelEvent>,

    running_sum: i64,
    num_digits: u32,
    num_cr: u32,
    prev_is_cr: bool,
    cur_chunk_size: i64,
    cur_chunk_bytes_left: i64,

    max_chunk_size: i64,
    max_chunk_header: String,
    strict: bool,
    drop_trailers: bool,
}

impl Default for ChunkedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedHandler {
    pub fn new() -> Self {
        Self {
            mode: None,
            state: ChunkedState::ReadSize,
            chunked_reader: None,
            dechunked_buffer: None,
            dechunked_size: 0,
            dechunked_reader: None,
            chunked_buffer: None,
            chunked_size: 0,
            truncation: false,
            skip_bytes: 0,
            last_server_event: None,
            running_sum: 0,
            num_digits: 0,
            num_cr: 0,
            prev_is_cr: false,
            cur_chunk_size: 0,
            cur_chunk_bytes_left: 0,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_chunk_header: chunk_header(DEFAULT_MAX_CHUNK_SIZE),
            strict: false,
            drop_trailers: false,
        }
    }

    /// Prepare the codec to transcode data visible through `buffer_in`.
    ///
    /// `drop_trailers` only applies when chunked input is forwarded: a
    /// rewritten copy of the wire stream without its trailer section is then
    /// produced in the chunked buffer.
    pub fn init(
        &mut self,
        buffer_in: &IoBufferReader,
        mode: ChunkedMode,
        drop_trailers: bool,
        strict: bool,
    ) {
        self.running_sum = 0;
        self.num_digits = 0;
        self.num_cr = 0;
        self.prev_is_cr = false;
        self.cur_chunk_size = 0;
        self.cur_chunk_bytes_left = 0;
        self.truncation = false;
        self.mode = Some(mode);
        self.strict = strict;
        self.drop_trailers = false;

        match mode {
            ChunkedMode::Encode => {
                self.state = ChunkedState::WriteChunk;
                self.dechunked_reader = Some(buffer_in.clone_reader());
                self.chunked_buffer = Some(IoBuffer::new());
                self.chunked_size = 0;
            }
            ChunkedMode::Decode | ChunkedMode::Passthru => {
                self.state = ChunkedState::ReadSize;
                self.chunked_reader = Some(buffer_in.clone_reader());
                if mode == ChunkedMode::Decode {
                    self.dechunked_buffer = Some(IoBuffer::new());
                    self.dechunked_size = 0;
                }
                if drop_trailers {
                    self.drop_trailers = true;
                    self.chunked_buffer = Some(IoBuffer::new());
                    self.chunked_size = 0;
                }
            }
        }
    }

    /// Release intermediate buffers and readers
    pub fn clear(&mut self) -> usize {
        let mut released = 0;
        for reader in [self.chunked_reader.take(), self.dechunked_reader.take()]
            .into_iter()
            .flatten()
        {
            reader.dealloc();
        }
        if self.dechunked_buffer.take().is_some() {
            released += 1;
        }
        if self.chunked_buffer.take().is_some() {
            released += 1;
        }
        released
    }

    /// Set the largest chunk emitted when encoding; 0 restores the default
    pub fn set_max_chunk_size(&mut self, size: i64) {
        self.max_chunk_size = if size > 0 { size } else { DEFAULT_MAX_CHUNK_SIZE };
        self.max_chunk_header = chunk_header(self.max_chunk_size);
    }

    pub fn max_chunk_size(&self) -> i64 {
        self.max_chunk_size
    }

    pub fn state(&self) -> ChunkedState {
        self.state
    }

    pub fn mode(&self) -> Option<ChunkedMode> {
        self.mode
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkedState::ReadDone | ChunkedState::WriteDone)
    }

    pub fn is_error(&self) -> bool {
        self.state == ChunkedState::ReadError
    }

    pub fn dechunked_size(&self) -> i64 {
        self.dechunked_size
    }

    pub fn chunked_size(&self) -> i64 {
        self.chunked_size
    }

    pub fn truncated(&self) -> bool {
        self.truncation
    }

    pub fn drops_trailers(&self) -> bool {
        self.drop_trailers
    }

    pub fn dechunked_buffer(&self) -> Option<&IoBuffer> {
        self.dechunked_buffer.as_ref()
    }

    pub fn chunked_buffer(&self) -> Option<&IoBuffer> {
        self.chunked_buffer.as_ref()
    }

    fn fail(&mut self) -> bool {
        self.state = ChunkedState::ReadError;
        true
    }

    fn finish_size_line(&mut self) -> bool {
        debug!("read chunk size of {} bytes", self.running_sum);
        self.cur_chunk_size = self.running_sum;
        self.cur_chunk_bytes_left = self.running_sum;
        self.state = if self.running_sum == 0 {
            ChunkedState::ReadTrailerBlank
        } else {
            ChunkedState::ReadChunk
        };
        self.num_cr = 0;
        true
    }

    /// Feed one byte of a size line. Returns true when the line is finished
    /// or parsing failed.
    fn size_byte(&mut self, ch: u8) -> bool {
        match self.state {
            ChunkedState::ReadSize => {
                if let Some(digit) = (ch as char).to_digit(16) {
                    if self.running_sum > (i64::MAX >> 4) {
                        return self.fail();
                    }
                    self.num_digits += 1;
                    self.running_sum = (self.running_sum << 4) + digit as i64;
                    return false;
                }
                let rfc_compliant = matches!(ch, b' ' | b'\t' | b'\r' | b';');
                let acceptable_lf = ch == b'\n' && !self.strict;
                if self.num_digits == 0 || !(rfc_compliant || acceptable_lf) {
                    return self.fail();
                }
                if ch == b'\n' {
                    debug!("Found an LF without a preceding CR (protocol violation)");
                    return self.finish_size_line();
                }
                self.prev_is_cr = ch == b'\r';
                if self.prev_is_cr {
                    self.num_cr += 1;
                }
                self.state = ChunkedState::ReadSizeCrlf;
                false
            }
            ChunkedState::ReadSizeCrlf => {
                if ch == b'\n' {
                    if !self.prev_is_cr {
                        debug!("Found an LF without a preceding CR (protocol violation)");
                        if self.strict {
                            return self.fail();
                        }
                    }
                    return self.finish_size_line();
                }
                self.prev_is_cr = ch == b'\r';
                if self.prev_is_cr {
                    if self.num_cr != 0 {
                        return self.fail();
                    }
                    self.num_cr += 1;
                }
                false
            }
            ChunkedState::ReadSizeStart => {
                if ch == b'\n' {
                    if !self.prev_is_cr {
                        debug!("Found an LF without a preceding CR (protocol violation) before chunk size");
                        if self.strict {
                            return self.fail();
                        }
                    }
                    self.running_sum = 0;
                    self.num_digits = 0;
                    self.num_cr = 0;
                    self.state = ChunkedState::ReadSize;
                    false
                } else if ch == b'\r' {
                    if self.num_cr != 0 {
                        debug!("Found multiple CRs before chunk size");
                        return self.fail();
                    }
                    self.prev_is_cr = true;
                    self.num_cr += 1;
                    false
                } else {
                    self.fail()
                }
            }
            _ => true,
        }
    }

    fn read_size(&mut self) -> i64 {
        let Some(reader) = self.chunked_reader.clone() else {
            return 0;
        };
        let mut bytes_consumed = 0;
        let mut done = false;

        while !done {
            let Some(block) = reader.peek_block() else {
                break;
            };
            let mut bytes_used = 0i64;
            for &ch in block.iter() {
                bytes_used += 1;
                if self.size_byte(ch) {
                    done = true;
                    break;
                }
            }
            if self.drop_trailers {
                if let Some(out) = &self.chunked_buffer {
                    self.chunked_size += out.write_from(&reader, bytes_used);
                }
            }
            reader.consume(bytes_used);
            bytes_consumed += bytes_used;
        }
        bytes_consumed
    }

    fn transfer_bytes(&mut self) -> i64 {
        let Some(reader) = self.chunked_reader.clone() else {
            return 0;
        };
        let mut total_moved = 0;

        while self.cur_chunk_bytes_left > 0 {
            let to_move = self.cur_chunk_bytes_left.min(reader.block_read_avail());
            if to_move <= 0 {
                break;
            }
            if let Some(out) = &self.dechunked_buffer {
                if to_move >= MIN_BLOCK_TRANSFER_BYTES {
                    out.write_from(&reader, to_move);
                } else if let Some(block) = reader.peek_block() {
                    out.write(&block[..to_move as usize]);
                }
                self.dechunked_size += to_move;
            }
            if self.drop_trailers {
                if let Some(pass) = &self.chunked_buffer {
                    self.chunked_size += pass.write_from(&reader, to_move);
                }
            }
            reader.consume(to_move);
            self.cur_chunk_bytes_left -= to_move;
            total_moved += to_move;
        }
        total_moved
    }

    fn read_chunk(&mut self) -> i64 {
        let transferred = self.transfer_bytes();
        if self.cur_chunk_bytes_left == 0 {
            debug!("completed read of chunk of {} bytes", self.cur_chunk_size);
            self.prev_is_cr = false;
            self.state = ChunkedState::ReadSizeStart;
        } else {
            debug!(
                "read {} bytes of an {} chunk",
                transferred, self.cur_chunk_size
            );
        }
        transferred
    }

    fn read_trailer(&mut self) -> i64 {
        let Some(reader) = self.chunked_reader.clone() else {
            return 0;
        };
        let mut bytes_consumed = 0;
        let mut done = false;

        while !done {
            let Some(block) = reader.peek_block() else {
                break;
            };
            let mut bytes_used = 0i64;
            for &ch in block.iter() {
                bytes_used += 1;
                match ch {
                    b'\r' => {
                        self.state = if self.state == ChunkedState::ReadTrailerBlank {
                            ChunkedState::ReadTrailerCr
                        } else {
                            ChunkedState::ReadTrailerLine
                        };
                    }
                    b'\n' => {
                        if matches!(
                            self.state,
                            ChunkedState::ReadTrailerCr | ChunkedState::ReadTrailerBlank
                        ) {
                            self.state = ChunkedState::ReadDone;
                            debug!("completed read of trailers");
                            if self.drop_trailers {
                                if let Some(out) = &self.chunked_buffer {
                                    self.chunked_size += out.write(FINAL_CRLF) as i64;
                                }
                            }
                            done = true;
                            break;
                        }
                        self.state = ChunkedState::ReadTrailerBlank;
                    }
                    _ => self.state = ChunkedState::ReadTrailerLine,
                }
            }
            reader.consume(bytes_used);
            bytes_consumed += bytes_used;
        }
        bytes_consumed
    }

    /// Consume everything currently readable from the wire reader.
    ///
    /// Returns the bytes consumed and whether parsing reached `ReadDone` or
    /// `ReadError`.
    pub fn process_chunked_content(&mut self) -> (i64, bool) {
        let Some(reader) = self.chunked_reader.clone() else {
            return (0, false);
        };
        let mut bytes_read = 0;

        while reader.is_read_avail_more_than(0)
            && !matches!(self.state, ChunkedState::ReadDone | ChunkedState::ReadError)
        {
            bytes_read += match self.state {
                ChunkedState::ReadSize | ChunkedState::ReadSizeCrlf | ChunkedState::ReadSizeStart => {
                    self.read_size()
                }
                ChunkedState::ReadChunk => self.read_chunk(),
                ChunkedState::ReadTrailerBlank
                | ChunkedState::ReadTrailerCr
                | ChunkedState::ReadTrailerLine => self.read_trailer(),
                _ => break,
            };
        }
        let done = matches!(self.state, ChunkedState::ReadDone | ChunkedState::ReadError);
        (bytes_read, done)
    }

    /// Frame every body byte currently available into chunks.
    ///
    /// The terminal `0\r\n\r\n` is written once the last source event says
    /// the body is complete. Returns the body bytes consumed and whether the
    /// terminal chunk has been written.
    pub fn generate_chunked_content(&mut self) -> (i64, bool) {
        if self.state == ChunkedState::WriteDone {
            return (0, true);
        }
        let (Some(reader), Some(out)) = (self.dechunked_reader.clone(), self.chunked_buffer.clone())
        else {
            return (0, false);
        };
        let server_done = self
            .last_server_event
            .is_some_and(TunnelEvent::is_read_completion);
        let mut consumed_bytes = 0;

        loop {
            let r_avail = reader.read_avail();
            if r_avail <= 0 {
                break;
            }
            let write_val = self.max_chunk_size.min(r_avail);
            self.state = ChunkedState::WriteChunk;
            debug!("creating a chunk of size {} bytes", write_val);

            let written = if write_val == self.max_chunk_size {
                out.write(self.max_chunk_header.as_bytes())
            } else {
                out.write(chunk_header(write_val).as_bytes())
            };
            self.chunked_size += written as i64;

            self.chunked_size += out.write_from(&reader, write_val);
            reader.consume(write_val);
            consumed_bytes += write_val;

            self.chunked_size += out.write(FINAL_CRLF) as i64;
        }

        if server_done {
            self.state = ChunkedState::WriteDone;
            self.chunked_size += out.write(LAST_CHUNK) as i64;
            return (consumed_bytes, true);
        }
        (consumed_bytes, false)
    }
}

fn chunk_header(size: i64) -> String {
    format!("{:x}\r\n", size)
}

/// Decode a complete chunked message body in one call.
///
/// Fails if the framing is malformed or the input ends before the last chunk
/// and trailer section.
pub fn decode_chunked(wire: &[u8], strict: bool) -> Result<Vec<u8>> {
    let input = IoBuffer::new();
    let start = input.alloc_reader();
    input.write(wire);

    let mut handler = ChunkedHandler::new();
    handler.init(&start, ChunkedMode::Decode, false, strict);
    start.dealloc();
    let output = match handler.dechunked_buffer() {
        Some(buffer) => buffer.alloc_reader(),
        None => return Err(TunnelError::InternalError("decoder has no output".to_string())),
    };

    handler.process_chunked_content();
    let result = match handler.state() {
        ChunkedState::ReadDone => Ok(output.read(output.read_avail() as usize).to_vec()),
        ChunkedState::ReadError => Err(TunnelError::ChunkedError(format!(
            "malformed chunked body after {} decoded bytes",
            handler.dechunked_size()
        ))),
        state => Err(TunnelError::ChunkedError(format!(
            "truncated chunked body (stopped in {:?})",
            state
        ))),
    };
    handler.clear();
    result
}

/// Encode `body` as a complete chunked message with chunks of at most
/// `max_chunk_size` bytes.
pub fn encode_chunked(body: &[u8], max_chunk_size: i64) -> Vec<u8> {
    let input = IoBuffer::new();
    let start = input.alloc_reader();
    input.write(body);

    let mut handler = ChunkedHandler::new();
    handler.set_max_chunk_size(max_chunk_size);
    handler.init(&start, ChunkedMode::Encode, false, false);
    start.dealloc();
    let output = match handler.chunked_buffer() {
        Some(buffer) => buffer.alloc_reader(),
        None => return Vec::new(),
    };

    handler.last_server_event = Some(TunnelEvent::ReadComplete);
    handler.generate_chunked_content();
    let encoded = output.read(output.read_avail() as usize).to_vec();
    handler.clear();
    encoded
}
