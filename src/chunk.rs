use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use memmap2::{Advice, Mmap};

use crate::error::{EngineError, Result};

/// 2 MiB windows aligned to 4 KiB, per spec §4.1.
const MMAP_WINDOW: usize = 2 * 1024 * 1024;
/// After this many bytes read out of a window, advise the kernel we'll keep
/// reading sequentially.
const MADVISE_THRESHOLD: usize = 64 * 1024;
/// Hard cap on bytes handed back from a single `ChunkIter::read`.
pub const MAX_READ_LEN: usize = 2 * 1024 * 1024;

/// A file shared by every chunk that was split off the same `append_file*`
/// call. Opens lazily on first read; unlinks on drop when `is_temp`.
pub struct ChunkFile {
    path: PathBuf,
    is_temp: bool,
    fd: std::sync::Mutex<Option<File>>,
    refcount: AtomicUsize,
}

impl ChunkFile {
    pub fn new(path: impl Into<PathBuf>, is_temp: bool) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            is_temp,
            fd: std::sync::Mutex::new(None),
            refcount: AtomicUsize::new(1),
        })
    }

    pub fn from_fd(path: impl Into<PathBuf>, is_temp: bool, fd: File) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            is_temp,
            fd: std::sync::Mutex::new(Some(fd)),
            refcount: AtomicUsize::new(1),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::Relaxed);
        Arc::clone(self)
    }

    fn with_file<R>(&self, f: impl FnOnce(&File) -> std::io::Result<R>) -> std::io::Result<R> {
        let mut guard = self.fd.lock().unwrap();
        if guard.is_none() {
            let opened = File::open(&self.path)?;
            #[cfg(target_os = "linux")]
            {
                unsafe {
                    libc_fadvise_sequential(opened.as_raw_fd());
                }
            }
            *guard = Some(opened);
        }
        f(guard.as_ref().unwrap())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
unsafe fn libc_fadvise_sequential(_fd: i32) {
    // POSIX_FADV_SEQUENTIAL = 2; avoid a libc dependency for one syscall hint.
    #[cfg(target_os = "linux")]
    unsafe {
        extern "C" {
            fn posix_fadvise(fd: i32, offset: i64, len: i64, advice: i32) -> i32;
        }
        posix_fadvise(_fd, 0, 0, 2);
    }
}

impl Drop for ChunkFile {
    fn drop(&mut self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 && self.is_temp {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A window of a file chunk mapped (or read) into memory. Exactly one of
/// `mmap` / `fallback` is populated at steady state (spec §3 invariant);
/// both may exist only transiently while re-windowing.
enum FileCache {
    Mmap { map: Mmap, file_offset: u64 },
    Fallback { buf: Vec<u8>, file_offset: u64 },
    None,
}

pub struct FileChunk {
    pub file: Arc<ChunkFile>,
    pub start: u64,
    pub length: u64,
    cache: FileCache,
    bytes_since_advise: usize,
}

impl FileChunk {
    fn chunk_len(&self, offset: u64) -> u64 {
        self.length.saturating_sub(offset)
    }

    /// Read up to `max_len` bytes starting at `offset` (relative to the
    /// chunk, i.e. file position `start+offset`). Returns a borrow valid
    /// until the next mutation of this chunk.
    fn read(&mut self, offset: u64, max_len: usize) -> Result<&[u8]> {
        let remaining = self.chunk_len(offset);
        let want = (max_len as u64).min(remaining).min(MAX_READ_LEN as u64) as usize;
        if want == 0 {
            return Ok(&[]);
        }
        let file_pos = self.start + offset;

        let window_base = (file_pos / 4096) * 4096;
        let need_remap = match &self.cache {
            FileCache::Mmap { file_offset, map } => {
                file_pos < *file_offset || file_pos + want as u64 > *file_offset + map.len() as u64
            }
            FileCache::Fallback { file_offset, buf } => {
                file_pos < *file_offset || file_pos + want as u64 > *file_offset + buf.len() as u64
            }
            FileCache::None => true,
        };

        if need_remap {
            self.remap(window_base)?;
            self.bytes_since_advise = 0;
        }

        self.bytes_since_advise += want;
        if self.bytes_since_advise >= MADVISE_THRESHOLD {
            if let FileCache::Mmap { map, .. } = &self.cache {
                let _ = map.advise(Advice::WillNeed);
            }
            self.bytes_since_advise = 0;
        }

        match &self.cache {
            FileCache::Mmap { map, file_offset } => {
                let start = (file_pos - *file_offset) as usize;
                Ok(&map[start..start + want])
            }
            FileCache::Fallback { buf, file_offset } => {
                let start = (file_pos - *file_offset) as usize;
                Ok(&buf[start..start + want])
            }
            FileCache::None => unreachable!("remap always populates a cache"),
        }
    }

    fn remap(&mut self, window_base: u64) -> Result<()> {
        let window_len = MMAP_WINDOW.min(
            (self.start + self.length)
                .saturating_sub(window_base)
                .max(4096) as usize,
        );

        let mmap_result = self.file.with_file(|f| -> std::io::Result<Mmap> {
            unsafe {
                memmap2::MmapOptions::new()
                    .offset(window_base)
                    .len(window_len)
                    .map(f)
            }
        });

        match mmap_result {
            Ok(map) => {
                self.cache = FileCache::Mmap {
                    map,
                    file_offset: window_base,
                };
            }
            Err(_) => {
                let buf = self.file.with_file(|f| -> std::io::Result<Vec<u8>> {
                    let mut f = f.try_clone()?;
                    f.seek(SeekFrom::Start(window_base))?;
                    let mut buf = vec![0u8; window_len];
                    let mut total = 0;
                    loop {
                        match f.read(&mut buf[total..]) {
                            Ok(0) => break,
                            Ok(n) => total += n,
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    buf.truncate(total);
                    Ok(buf)
                })?;
                self.cache = FileCache::Fallback {
                    buf,
                    file_offset: window_base,
                };
            }
        }
        Ok(())
    }
}

/// A segment in a `ChunkQueue`. `offset` is how many leading bytes have
/// already been consumed.
pub enum Chunk {
    Bytes { data: Bytes, offset: usize },
    File { inner: FileChunk, offset: u64 },
}

impl Chunk {
    pub fn inline(s: String) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        Some(Chunk::Bytes {
            data: Bytes::from(s.into_bytes()),
            offset: 0,
        })
    }

    pub fn bytes(b: Bytes) -> Option<Self> {
        if b.is_empty() {
            return None;
        }
        Some(Chunk::Bytes { data: b, offset: 0 })
    }

    pub fn file(file: Arc<ChunkFile>, start: u64, length: u64) -> Option<Self> {
        if length == 0 {
            return None;
        }
        Some(Chunk::File {
            inner: FileChunk {
                file,
                start,
                length,
                cache: FileCache::None,
                bytes_since_advise: 0,
            },
            offset: 0,
        })
    }

    pub fn len(&self) -> u64 {
        match self {
            Chunk::Bytes { data, offset } => (data.len() - offset) as u64,
            Chunk::File { inner, offset } => inner.chunk_len(*offset),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// "Memory usage" for `CQLimit` purposes: file-region bytes don't count.
    pub fn mem_usage(&self) -> usize {
        match self {
            Chunk::Bytes { data, offset } => data.len() - offset,
            Chunk::File { .. } => 0,
        }
    }

    pub fn skip(&mut self, n: u64) {
        match self {
            Chunk::Bytes { data, offset } => {
                *offset = (*offset + n as usize).min(data.len());
            }
            Chunk::File { inner, offset } => {
                *offset = (*offset + n).min(inner.length);
            }
        }
    }

    /// Splits off the leading `n` bytes as a new chunk, advancing `self` to
    /// start after them. `n` must be `< self.len()`.
    pub fn split_front(&mut self, n: u64) -> Chunk {
        match self {
            Chunk::Bytes { data, offset } => {
                let n = n as usize;
                let head = data.slice(*offset..*offset + n);
                *offset += n;
                Chunk::Bytes {
                    data: head,
                    offset: 0,
                }
            }
            Chunk::File { inner, offset } => {
                let head = Chunk::file(inner.file.acquire(), inner.start + *offset, n)
                    .expect("n > 0 checked by caller");
                *offset += n;
                head
            }
        }
    }

    /// Reads up to `max_len` bytes from the front without consuming them.
    pub fn read(&mut self, max_len: usize) -> Result<&[u8]> {
        match self {
            Chunk::Bytes { data, offset } => {
                let end = (*offset + max_len).min(data.len());
                Ok(&data[*offset..end])
            }
            Chunk::File { inner, offset } => inner.read(*offset, max_len),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Chunk::File { .. })
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chunk::Bytes { data, offset } => f
                .debug_struct("Chunk::Bytes")
                .field("len", &(data.len() - offset))
                .finish(),
            Chunk::File { inner, offset } => f
                .debug_struct("Chunk::File")
                .field("path", &inner.file.path())
                .field("remaining", &inner.chunk_len(*offset))
                .finish(),
        }
    }
}

pub fn invariant(cond: bool, msg: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(EngineError::Invariant(msg.to_string()))
    }
}
