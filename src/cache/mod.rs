//! Ordered staging buffer for client bytes that arrive before the upstream
//! tunnel can carry them.
//!
//! Chunks stay in memory until `memory_limit` would be exceeded; from then on
//! every chunk goes to a [`DiskCache`] until the cache is drained. Memory
//! always holds the oldest bytes and disk the newest, so flushing memory
//! first and disk second replays the arrival order.

mod disk;

pub use disk::DiskCache;

use crate::error::ProxyError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;

const DISK_READ_BLOCK: usize = 16 * 1024;

pub struct Cache {
    memory: VecDeque<Bytes>,
    memory_bytes: usize,
    memory_limit: usize,
    disk: DiskCache,
}

impl Cache {
    pub fn new(memory_limit: usize, spill_dir: Option<PathBuf>) -> Self {
        Self {
            memory: VecDeque::new(),
            memory_bytes: 0,
            memory_limit,
            disk: DiskCache::new(spill_dir),
        }
    }

    pub fn cache(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        if data.is_empty() {
            return Ok(());
        }

        if self.disk.peeksize() == 0 && self.memory_bytes + data.len() <= self.memory_limit {
            self.memory.push_back(Bytes::copy_from_slice(data));
            self.memory_bytes += data.len();
            return Ok(());
        }

        self.disk
            .write(data)
            .map_err(|e| ProxyError::Cache(format!("spill of {} bytes failed: {}", data.len(), e)))?;
        Ok(())
    }

    /// Pushes staged bytes through `sink` in arrival order and returns how
    /// many were delivered. `sink` may accept a prefix of what it is given;
    /// the remainder is offered again. When `sink` accepts nothing the flush
    /// stops early and the rest stays staged for a later call, as it does
    /// when `sink` fails.
    pub fn flush_all<F>(&mut self, mut sink: F) -> Result<usize, ProxyError>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut delivered = 0;

        while let Some(chunk) = self.memory.front_mut() {
            let (taken, failure) = offer(&mut sink, &chunk[..]);
            let stalled = taken < chunk.len();
            delivered += taken;
            self.memory_bytes -= taken;
            if !stalled {
                self.memory.pop_front();
            } else {
                let _ = chunk.split_to(taken);
            }
            if let Some(e) = failure {
                return Err(e);
            }
            if stalled {
                return Ok(delivered);
            }
        }

        let mut block = vec![0u8; DISK_READ_BLOCK];
        while self.disk.peeksize() > 0 {
            let len = self
                .disk
                .read(&mut block)
                .map_err(|e| ProxyError::Cache(format!("spill read failed: {}", e)))?;

            let (taken, failure) = offer(&mut sink, &block[..len]);
            delivered += taken;
            if taken < len {
                self.disk.rollback(len - taken);
                return match failure {
                    Some(e) => Err(e),
                    None => Ok(delivered),
                };
            }
        }

        self.disk.clear();
        Ok(delivered)
    }

    pub fn clear(&mut self) {
        self.memory.clear();
        self.memory_bytes = 0;
        self.disk.clear();
    }

    pub fn len(&self) -> usize {
        self.memory_bytes + self.disk.peeksize()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spilled_bytes(&self) -> usize {
        self.disk.peeksize()
    }
}

/// Feeds `data` to `sink` until it is fully taken, the sink stops accepting,
/// or it fails. Returns how much was taken in every case.
fn offer<F>(sink: &mut F, data: &[u8]) -> (usize, Option<ProxyError>)
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    let mut taken = 0;
    while taken < data.len() {
        match sink(&data[taken..]) {
            Ok(0) => return (taken, None),
            Ok(n) => taken += n.min(data.len() - taken),
            Err(e) => return (taken, Some(ProxyError::Io(e))),
        }
    }
    (taken, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collect(cache: &mut Cache) -> Vec<u8> {
        let mut out = Vec::new();
        cache
            .flush_all(|data| {
                out.extend_from_slice(data);
                Ok(data.len())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_memory_only_flush_keeps_order() {
        let mut cache = Cache::new(1024, None);
        cache.cache(b"one ").unwrap();
        cache.cache(b"two ").unwrap();
        cache.cache(b"three").unwrap();

        assert_eq!(cache.len(), 13);
        assert_eq!(cache.spilled_bytes(), 0);
        assert_eq!(collect(&mut cache), b"one two three");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_spill_to_disk_keeps_order() {
        let dir = TempDir::new().unwrap();
        let mut cache = Cache::new(8, Some(dir.path().to_path_buf()));

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![i; (i as usize % 7) + 1];
            expected.extend_from_slice(&chunk);
            cache.cache(&chunk).unwrap();
        }
        assert!(cache.spilled_bytes() > 0);
        assert_eq!(cache.len(), expected.len());

        assert_eq!(collect(&mut cache), expected);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_once_spilled_small_chunks_follow_to_disk() {
        let mut cache = Cache::new(4, None);
        cache.cache(b"abcdef").unwrap();
        cache.cache(b"g").unwrap();
        assert_eq!(cache.spilled_bytes(), 7);
        assert_eq!(collect(&mut cache), b"abcdefg");
    }

    #[test]
    fn test_partial_sink_is_offered_remainder() {
        let mut cache = Cache::new(4, None);
        cache.cache(b"abc").unwrap();
        cache.cache(b"defghij").unwrap();

        let mut out = Vec::new();
        let delivered = cache
            .flush_all(|data| {
                out.push(data[0]);
                Ok(1)
            })
            .unwrap();
        assert_eq!(delivered, 10);
        assert_eq!(out, b"abcdefghij");
    }

    #[test]
    fn test_failing_sink_leaves_rest_staged() {
        let mut cache = Cache::new(2, None);
        cache.cache(b"ab").unwrap();
        cache.cache(b"cdef").unwrap();

        let mut calls = 0;
        let result = cache.flush_all(|data| {
            calls += 1;
            if calls == 1 {
                Ok(data.len())
            } else {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }
        });
        assert!(result.is_err());
        assert_eq!(cache.len(), 4);
        assert_eq!(collect(&mut cache), b"cdef");
    }

    #[test]
    fn test_full_sink_pauses_flush_in_order() {
        let dir = TempDir::new().unwrap();
        let mut cache = Cache::new(4, Some(dir.path().to_path_buf()));
        cache.cache(b"abc").unwrap();
        cache.cache(b"defghij").unwrap();

        let mut out = Vec::new();
        let mut budget = 5;
        let delivered = cache
            .flush_all(|data| {
                let n = data.len().min(budget);
                budget -= n;
                out.extend_from_slice(&data[..n]);
                Ok(n)
            })
            .unwrap();
        assert_eq!(delivered, 5);
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.spilled_bytes(), 5);

        cache.cache(b"kl").unwrap();
        out.extend_from_slice(&collect(&mut cache));
        assert_eq!(out, b"abcdefghijkl");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_never_invokes_sink() {
        let mut cache = Cache::new(2, None);
        cache.cache(b"a").unwrap();
        cache.cache(b"bcd").unwrap();
        cache.clear();

        assert!(cache.is_empty());
        let delivered = cache
            .flush_all(|_| panic!("sink called after clear"))
            .unwrap();
        assert_eq!(delivered, 0);
    }
}
