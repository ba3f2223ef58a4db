use std::io::{self, ErrorKind, Read, Write};

use crate::chunkqueue::ChunkQueue;
use crate::error::{EngineError, Result};
use crate::stream::{StreamEvent, StreamRef, notify};

/// Token-bucket rate limit optionally attached to an IOStream's read or
/// write side (spec §4.4).
pub struct ThrottleState {
    pub bytes_per_sec: usize,
    available: usize,
}

impl ThrottleState {
    pub fn new(bytes_per_sec: usize) -> Self {
        Self {
            bytes_per_sec,
            available: bytes_per_sec,
        }
    }

    pub fn tick(&mut self) {
        self.available = self.bytes_per_sec;
    }

    fn cap(&mut self, want: usize) -> usize {
        let allowed = want.min(self.available);
        self.available -= allowed;
        allowed
    }
}

/// Read up to 16 KiB x 4 per spec §4.4.
const READ_CHUNK: usize = 16 * 1024 * 4;

pub enum ReadOutcome {
    WouldBlock,
    Eof,
    Read(usize),
}

pub enum WriteOutcome {
    WouldBlock,
    Wrote(usize),
    Aborted,
}

/// Pumps bytes between a non-blocking `fd` and the stream graph. `out` is
/// filled from socket reads; `source.out` (if connected) is drained to the
/// socket on writes.
pub struct IoStream<S: Read + Write> {
    pub node: StreamRef,
    pub sock: S,
    pub throttle_in: Option<ThrottleState>,
    pub throttle_out: Option<ThrottleState>,
    write_closed: bool,
}

impl<S: Read + Write> IoStream<S> {
    pub fn new(node: StreamRef, sock: S) -> Self {
        Self {
            node,
            sock,
            throttle_in: None,
            throttle_out: None,
            write_closed: false,
        }
    }

    /// Socket became readable: fill `node.out` respecting its CQLimit.
    pub fn do_read(&mut self) -> Result<ReadOutcome> {
        if let Some(limit) = self.node.borrow().out.limit()
            && limit.locked()
        {
            return Ok(ReadOutcome::WouldBlock);
        }

        let mut budget = READ_CHUNK;
        if let Some(t) = &mut self.throttle_in {
            budget = t.cap(budget);
            if budget == 0 {
                return Ok(ReadOutcome::WouldBlock);
            }
        }

        let mut buf = vec![0u8; budget];
        loop {
            match self.sock.read(&mut buf) {
                Ok(0) => {
                    self.node.borrow_mut().out.is_closed = true;
                    notify(&self.node);
                    return Ok(ReadOutcome::Eof);
                }
                Ok(n) => {
                    self.node.borrow_mut().out.append_mem(&buf[..n]);
                    notify(&self.node);
                    return Ok(ReadOutcome::Read(n));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
    }

    /// Socket became writable: drain the connected source's `out`.
    pub fn do_write(&mut self) -> Result<WriteOutcome> {
        let Some(source) = self.node.borrow().source.clone() else {
            return Ok(WriteOutcome::WouldBlock);
        };

        let mut total = 0usize;
        loop {
            let extracted = {
                let mut src = source.borrow_mut();
                let take = src.out.length.min(64 * 1024) as usize;
                if take == 0 {
                    None
                } else {
                    Some(src.out.extract_to(take as u64)?)
                }
            };

            let Some(buf) = extracted else { break };
            let mut budget = buf.len();
            if let Some(t) = &mut self.throttle_out {
                budget = t.cap(budget);
            }
            if budget == 0 {
                break;
            }

            match self.sock.write(&buf[..budget]) {
                Ok(0) => break,
                Ok(n) => {
                    source.borrow_mut().out.skip(n as u64);
                    total += n;
                    if n < budget {
                        return Ok(WriteOutcome::Wrote(total));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if total > 0 {
                        return Ok(WriteOutcome::Wrote(total));
                    }
                    return Ok(WriteOutcome::WouldBlock);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
                    ) =>
                {
                    return Ok(WriteOutcome::Aborted);
                }
                Err(e) => return Err(EngineError::Io(e)),
            }
        }

        let should_shutdown = {
            let src = source.borrow();
            src.out.is_closed && src.out.is_empty()
        };
        if should_shutdown && !self.write_closed {
            self.write_closed = true;
            let _ = self.sock.flush();
        }

        Ok(WriteOutcome::Wrote(total))
    }

    pub fn write_closed(&self) -> bool {
        self.write_closed
    }
}

pub fn io_error_is_fatal(kind: io::ErrorKind) -> bool {
    !matches!(kind, ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// `StreamEvent::NewData` handler shared by sockets that just relay bytes
/// without transforming them (used by the plug-backed raw connection path
/// before a parser is installed).
pub fn passthrough_cb(node: &StreamRef, event: StreamEvent) {
    if event != StreamEvent::NewData {
        return;
    }
    let dest = node.borrow().dest();
    if let Some(dest) = dest {
        notify(&dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_caps_to_available_tokens() {
        let mut t = ThrottleState::new(100);
        assert_eq!(t.cap(150), 100);
        assert_eq!(t.cap(50), 0);
        t.tick();
        assert_eq!(t.cap(50), 50);
    }
}
