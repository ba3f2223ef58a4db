use crate::chunkqueue::ChunkQueue;
use crate::error::{EngineError, Result};

/// Standalone chunked-transfer codec sitting on a stream edge, independent
/// of header parsing (spec §4.6).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum DecodeState {
    Size,
    SizeCrLf,
    Data(u64),
    DataCrLf,
    Trailer,
    Done,
}

pub struct ChunkedDecoder {
    state: DecodeState,
    max_chunk_size: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Size,
            max_chunk_size: 1024 * 1024 * 1024,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Decodes as much of `input` as is fully buffered, appending decoded
    /// body bytes to `out`. Leaves any unconsumed trailing bytes in `input`.
    pub fn decode(&mut self, input: &mut ChunkQueue, out: &mut ChunkQueue) -> Result<()> {
        loop {
            match self.state {
                DecodeState::Done => return Ok(()),
                DecodeState::Size => {
                    let Some(line) = take_line(input, 64)? else {
                        return Ok(());
                    };
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_str, 16)
                        .map_err(|_| EngineError::Parse("invalid chunk size".into()))?;
                    if size > self.max_chunk_size {
                        return Err(EngineError::ResourceExhausted(
                            "chunk size exceeds maximum".into(),
                        ));
                    }
                    self.state = if size == 0 {
                        DecodeState::Trailer
                    } else {
                        DecodeState::Data(size)
                    };
                }
                DecodeState::Data(remaining) => {
                    let avail = input.length.min(remaining);
                    if avail == 0 {
                        return Ok(());
                    }
                    ChunkQueue::steal_len(out, input, avail);
                    let left = remaining - avail;
                    self.state = if left == 0 {
                        DecodeState::DataCrLf
                    } else {
                        DecodeState::Data(left)
                    };
                }
                DecodeState::DataCrLf => {
                    if input.length < 2 {
                        return Ok(());
                    }
                    let crlf = input.extract_to(2)?;
                    if crlf != b"\r\n" {
                        return Err(EngineError::Parse("malformed chunk terminator".into()));
                    }
                    input.skip(2);
                    self.state = DecodeState::Size;
                }
                DecodeState::SizeCrLf => unreachable!("unused intermediate state"),
                DecodeState::Trailer => {
                    let Some(line) = take_line(input, 16 * 1024)? else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        self.state = DecodeState::Done;
                        return Ok(());
                    }
                    // trailer headers are read and discarded (spec §4.6 Non-goal).
                }
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::vr::Filter for ChunkedDecoder {
    fn process(&mut self, input: &mut ChunkQueue, output: &mut ChunkQueue) -> Result<()> {
        self.decode(input, output)
    }

    fn is_complete(&self) -> bool {
        self.is_done()
    }
}

/// Wraps `encode_available` as an output filter so a response whose
/// framing resolves to chunked (spec §4.6) gets chunk-encoded on the
/// same stream-edge path as every other body transform.
#[derive(Default)]
pub struct ChunkedEncoder {
    done: bool,
}

impl crate::vr::Filter for ChunkedEncoder {
    fn process(&mut self, input: &mut ChunkQueue, output: &mut ChunkQueue) -> Result<()> {
        let was_closed = input.is_closed;
        encode_available(input, output);
        if was_closed && !input.is_closed {
            self.done = true;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.done
    }
}

/// Encodes whatever is buffered in `input` as one chunk (or, if `input` is
/// closed and empty, the terminating `0\r\n\r\n`), appending to `out`.
pub fn encode_available(input: &mut ChunkQueue, out: &mut ChunkQueue) {
    let len = input.length;
    if len > 0 {
        out.append_string(format!("{:x}\r\n", len));
        ChunkQueue::steal_all(out, input);
        out.append_string("\r\n".to_string());
    }
    if input.is_closed && input.is_empty() {
        out.append_string("0\r\n\r\n".to_string());
        input.is_closed = false;
    }
}

fn take_line(cq: &mut ChunkQueue, max_len: usize) -> Result<Option<String>> {
    let peek_len = cq.length.min((max_len + 2) as u64);
    let peek = cq.extract_to(peek_len)?;
    let Some(pos) = peek.windows(2).position(|w| w == b"\r\n") else {
        if peek.len() as u64 > max_len as u64 {
            return Err(EngineError::Parse("chunk header line too long".into()));
        }
        return Ok(None);
    };
    cq.skip((pos + 2) as u64);
    Ok(Some(String::from_utf8_lossy(&peek[..pos]).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_chunk_and_terminator() {
        let mut input = ChunkQueue::new();
        input.append_mem(b"5\r\nhello\r\n0\r\n\r\n");
        let mut out = ChunkQueue::new();
        let mut dec = ChunkedDecoder::new();
        dec.decode(&mut input, &mut out).unwrap();
        assert!(dec.is_done());
        let body = out.extract_to(out.length).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn decodes_across_partial_feeds() {
        let mut input = ChunkQueue::new();
        input.append_mem(b"3\r\nfo");
        let mut out = ChunkQueue::new();
        let mut dec = ChunkedDecoder::new();
        dec.decode(&mut input, &mut out).unwrap();
        assert!(!dec.is_done());
        input.append_mem(b"o\r\n0\r\n\r\n");
        dec.decode(&mut input, &mut out).unwrap();
        assert!(dec.is_done());
        let body = out.extract_to(out.length).unwrap();
        assert_eq!(body, b"foo");
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let mut input = ChunkQueue::new();
        input.append_mem(b"zz\r\n");
        let mut out = ChunkQueue::new();
        let mut dec = ChunkedDecoder::new();
        assert!(dec.decode(&mut input, &mut out).is_err());
    }

    #[test]
    fn encode_then_decode_round_trip() {
        let mut src = ChunkQueue::new();
        src.append_string("payload".to_string());
        src.is_closed = true;

        let mut wire = ChunkQueue::new();
        encode_available(&mut src, &mut wire);

        let mut decoded = ChunkQueue::new();
        let mut dec = ChunkedDecoder::new();
        dec.decode(&mut wire, &mut decoded).unwrap();
        assert!(dec.is_done());
        let body = decoded.extract_to(decoded.length).unwrap();
        assert_eq!(body, b"payload");
    }
}
