use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::chunk::{Chunk, ChunkFile, invariant};
use crate::error::Result;

/// Reference-counted memory budget shared by one or more chunkqueues
/// (spec §4.2). `notify` fires exactly once per lock-state flip.
pub struct CQLimit {
    inner: Mutex<CQLimitInner>,
}

struct CQLimitInner {
    limit: i64,
    current: i64,
    locked: bool,
    notify: Option<Box<dyn FnMut(bool) + Send>>,
}

impl CQLimit {
    pub fn new(limit: i64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CQLimitInner {
                limit,
                current: 0,
                locked: false,
                notify: None,
            }),
        })
    }

    pub fn set_notify(&self, cb: impl FnMut(bool) + Send + 'static) {
        self.inner.lock().unwrap().notify = Some(Box::new(cb));
    }

    pub fn current(&self) -> i64 {
        self.inner.lock().unwrap().current
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().unwrap().locked
    }

    pub fn set_limit(&self, limit: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.limit = limit;
        Self::reevaluate(&mut inner);
    }

    fn adjust(&self, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.current += delta;
        Self::reevaluate(&mut inner);
    }

    fn reevaluate(inner: &mut CQLimitInner) {
        let should_lock = inner.limit > 0 && inner.current >= inner.limit;
        if should_lock != inner.locked {
            inner.locked = should_lock;
            if let Some(cb) = inner.notify.as_mut() {
                cb(should_lock);
            }
        }
    }
}

/// An ordered FIFO of chunks with byte accounting (spec §3/§4.1).
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    pub is_closed: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub length: u64,
    pub mem_usage: i64,
    limit: Option<Arc<CQLimit>>,
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            is_closed: false,
            bytes_in: 0,
            bytes_out: 0,
            length: 0,
            mem_usage: 0,
            limit: None,
        }
    }

    pub fn with_limit(limit: Arc<CQLimit>) -> Self {
        let mut cq = Self::new();
        cq.limit = Some(limit);
        cq
    }

    pub fn set_limit(&mut self, limit: Option<Arc<CQLimit>>) {
        self.limit = limit;
    }

    pub fn limit(&self) -> Option<&Arc<CQLimit>> {
        self.limit.as_ref()
    }

    fn push_back(&mut self, chunk: Chunk) {
        let len = chunk.len();
        let mem = chunk.mem_usage() as i64;
        self.chunks.push_back(chunk);
        self.length += len;
        self.bytes_in += len;
        self.mem_usage += mem;
        if mem != 0
            && let Some(limit) = &self.limit
        {
            limit.adjust(mem);
        }
    }

    pub fn append_string(&mut self, s: String) {
        if let Some(c) = Chunk::inline(s) {
            self.push_back(c);
        }
    }

    pub fn append_bytes(&mut self, b: Bytes) {
        if let Some(c) = Chunk::bytes(b) {
            self.push_back(c);
        }
    }

    pub fn append_mem(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.append_bytes(Bytes::copy_from_slice(data));
        }
    }

    pub fn append_file(&mut self, file: Arc<ChunkFile>, start: u64, length: u64) {
        if let Some(c) = Chunk::file(file, start, length) {
            self.push_back(c);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn front_mut(&mut self) -> Option<&mut Chunk> {
        self.chunks.front_mut()
    }

    pub fn front(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    /// Discard up to `n` bytes from the head.
    pub fn skip(&mut self, n: u64) -> u64 {
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let avail = front.len();
            if avail == 0 {
                self.chunks.pop_front();
                continue;
            }
            let take = avail.min(remaining);
            let mem_before = front.mem_usage() as i64;
            front.skip(take);
            let mem_after = front.mem_usage() as i64;
            if front.is_empty() {
                self.chunks.pop_front();
            }
            let mem_delta = mem_after - mem_before;
            self.mem_usage += mem_delta;
            if mem_delta != 0
                && let Some(limit) = &self.limit
            {
                limit.adjust(mem_delta);
            }
            self.length -= take;
            self.bytes_out += take;
            remaining -= take;
        }
        n - remaining
    }

    pub fn skip_all(&mut self) -> u64 {
        self.skip(self.length)
    }

    /// Move up to `n` bytes from `src` to `dst`, splitting the leading chunk
    /// of `src` if necessary. Returns bytes moved.
    pub fn steal_len(dst: &mut ChunkQueue, src: &mut ChunkQueue, n: u64) -> u64 {
        let mut remaining = n;
        let same_limit = match (&dst.limit, &src.limit) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };

        while remaining > 0 {
            let Some(front) = src.chunks.front_mut() else {
                break;
            };
            let avail = front.len();
            if avail == 0 {
                src.chunks.pop_front();
                continue;
            }
            let take = avail.min(remaining);
            let moved = if take == avail {
                src.chunks.pop_front().unwrap()
            } else {
                front.split_front(take)
            };

            let mem = moved.mem_usage() as i64;
            src.length -= take;
            src.bytes_out += take;
            src.mem_usage -= mem;

            dst.length += take;
            dst.bytes_in += take;
            dst.mem_usage += mem;
            dst.chunks.push_back(moved);

            if !same_limit {
                if let Some(limit) = &src.limit {
                    limit.adjust(-mem);
                }
                if let Some(limit) = &dst.limit {
                    limit.adjust(mem);
                }
            }
            remaining -= take;
        }
        n - remaining
    }

    /// Concatenate the whole of `src` onto the tail of `dst`, leaving `src`
    /// empty. O(number of chunks), not O(bytes).
    pub fn steal_all(dst: &mut ChunkQueue, src: &mut ChunkQueue) {
        let same_limit = match (&dst.limit, &src.limit) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        let moved_mem = src.mem_usage;
        dst.length += src.length;
        dst.bytes_in += src.length;
        dst.mem_usage += moved_mem;
        dst.chunks.append(&mut src.chunks);

        src.bytes_out += src.length;
        src.mem_usage = 0;
        src.length = 0;

        if !same_limit && moved_mem != 0 {
            if let Some(limit) = &src.limit {
                limit.adjust(-moved_mem);
            }
            if let Some(limit) = &dst.limit {
                limit.adjust(moved_mem);
            }
        }
    }

    pub fn steal_chunk(dst: &mut ChunkQueue, src: &mut ChunkQueue) -> bool {
        let Some(chunk) = src.chunks.pop_front() else {
            return false;
        };
        let len = chunk.len();
        let mem = chunk.mem_usage() as i64;
        src.length -= len;
        src.bytes_out += len;
        src.mem_usage -= mem;

        dst.length += len;
        dst.bytes_in += len;
        dst.mem_usage += mem;
        dst.chunks.push_back(chunk);

        let same_limit = match (&dst.limit, &src.limit) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if !same_limit && mem != 0 {
            if let Some(limit) = &src.limit {
                limit.adjust(-mem);
            }
            if let Some(limit) = &dst.limit {
                limit.adjust(mem);
            }
        }
        true
    }

    /// Copy up to `n` bytes from the head into a byte buffer, without
    /// consuming them. Errors if `n` exceeds the queue's length.
    pub fn extract_to(&mut self, n: u64) -> Result<Vec<u8>> {
        invariant(n <= self.length, "extract_to: n exceeds queue length")?;
        let mut out = Vec::with_capacity(n as usize);
        let mut remaining = n;
        for chunk in self.chunks.iter_mut() {
            if remaining == 0 {
                break;
            }
            let take = chunk.len().min(remaining) as usize;
            let data = chunk.read(take)?;
            out.extend_from_slice(&data[..take.min(data.len())]);
            remaining -= take as u64;
        }
        Ok(out)
    }

    pub fn check_invariants(&self) -> Result<()> {
        let computed: u64 = self.chunks.iter().map(|c| c.len()).sum();
        invariant(
            computed == self.length,
            "chunkqueue length diverged from chunk sum",
        )?;
        invariant(self.mem_usage >= 0, "chunkqueue mem_usage went negative")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_empty_is_noop() {
        let mut cq = ChunkQueue::new();
        cq.append_string(String::new());
        cq.append_mem(&[]);
        assert_eq!(cq.length, 0);
        assert!(cq.is_empty());
    }

    #[test]
    fn steal_len_conserves_bytes() {
        let mut src = ChunkQueue::new();
        src.append_string("hello world".to_string());
        let mut dst = ChunkQueue::new();

        let moved = ChunkQueue::steal_len(&mut dst, &mut src, 5);
        assert_eq!(moved, 5);
        assert_eq!(dst.length, 5);
        assert_eq!(src.length, 6);
        assert_eq!(src.bytes_out, 5);
        assert_eq!(dst.bytes_in, 5);
    }

    #[test]
    fn skip_all_is_idempotent() {
        let mut cq = ChunkQueue::new();
        cq.append_string("payload".to_string());
        let first = cq.skip_all();
        let second = cq.skip_all();
        assert_eq!(first, 7);
        assert_eq!(second, 0);
    }

    #[test]
    fn cqlimit_mirrors_mem_usage() {
        let limit = CQLimit::new(10);
        let mut cq = ChunkQueue::with_limit(Arc::clone(&limit));
        cq.append_string("12345".to_string());
        assert_eq!(limit.current(), 5);
        assert!(!limit.locked());
        cq.append_string("67890".to_string());
        assert_eq!(limit.current(), 10);
        assert!(limit.locked());
        cq.skip(10);
        assert_eq!(limit.current(), 0);
        assert!(!limit.locked());
    }

    #[test]
    fn steal_all_splices_in_o1_and_clears_src() {
        let mut src = ChunkQueue::new();
        src.append_string("a".to_string());
        src.append_string("b".to_string());
        let mut dst = ChunkQueue::new();
        dst.append_string("z".to_string());

        ChunkQueue::steal_all(&mut dst, &mut src);
        assert_eq!(dst.length, 3);
        assert_eq!(src.length, 0);
        assert!(src.is_empty());
    }

    #[test]
    fn extract_to_does_not_consume() {
        let mut cq = ChunkQueue::new();
        cq.append_string("hello".to_string());
        let extracted = cq.extract_to(5).unwrap();
        assert_eq!(extracted, b"hello");
        assert_eq!(cq.length, 5);
    }
}
