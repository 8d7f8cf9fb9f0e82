//! Bounded in-memory cache for decoded article segments.
//!
//! Decouples decode throughput from disk throughput: downloaders allocate
//! segment buffers here, and a flush task writes the file with the largest
//! cached footprint when the budget runs low. `alloc` blocks (async) while
//! the budget is exhausted and fails only on shutdown.
//!
//! Lock order when both are held: `content` before `alloc`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::types::FileId;

/// Fraction of the budget above which the flusher starts writing out
const FLUSH_WATERMARK: f64 = 0.9;

/// A segment buffer charged against the cache budget.
///
/// The charge follows the buffer: dropping a segment without going through
/// [`ArticleCache::free`] would leak budget, so segments are always freed
/// explicitly by the writer or the discard paths.
pub struct CachedSegment {
    data: Vec<u8>,
    charged: u64,
}

impl CachedSegment {
    /// Decoded bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer for the decoder to append into
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Bytes charged against the cache budget
    pub fn charged(&self) -> u64 {
        self.charged
    }
}

/// Process-wide bounded article cache.
pub struct ArticleCache {
    max_size: u64,
    /// the alloc lock: bytes currently charged
    allocated: Mutex<u64>,
    alloc_notify: Notify,
    /// the content lock: cached bytes per file
    content: Mutex<HashMap<FileId, u64>>,
    /// one flush at a time
    flush_lock: tokio::sync::Mutex<()>,
    busy_file: Mutex<Option<FileId>>,
    flushing: AtomicBool,
    stopped: AtomicBool,
    /// allocators currently blocked on a full cache
    waiters: AtomicUsize,
}

impl ArticleCache {
    /// Create a cache with a byte budget. A budget of 0 disables caching:
    /// every `alloc` returns `None` and callers write through to disk.
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            allocated: Mutex::new(0),
            alloc_notify: Notify::new(),
            content: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            busy_file: Mutex::new(None),
            flushing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Configured budget in bytes
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes currently charged
    pub fn allocated(&self) -> u64 {
        *self.allocated.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a segment buffer of `size` bytes.
    ///
    /// Blocks while the budget is exhausted; wakes on `free`. Returns
    /// `None` when caching is disabled, the request can never fit, or the
    /// cache was stopped.
    pub async fn alloc(&self, size: u64) -> Option<CachedSegment> {
        if self.max_size == 0 || size > self.max_size {
            return None;
        }

        loop {
            let notified = self.alloc_notify.notified();

            if self.stopped.load(Ordering::Acquire) {
                return None;
            }

            {
                let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
                if *allocated + size <= self.max_size {
                    *allocated += size;
                    return Some(CachedSegment {
                        data: Vec::with_capacity(size as usize),
                        charged: size,
                    });
                }
            }

            self.waiters.fetch_add(1, Ordering::AcqRel);
            notified.await;
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Adjust a segment's charge to `new_size` (actual decoded size may
    /// differ from the declared one). Growing never blocks; a transient
    /// overshoot is preferable to deadlocking a decoder mid-article.
    pub fn realloc(&self, segment: &mut CachedSegment, new_size: u64) {
        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        *allocated = allocated.saturating_sub(segment.charged) + new_size;
        let shrunk = new_size < segment.charged;
        segment.charged = new_size;
        drop(allocated);
        if shrunk {
            self.alloc_notify.notify_waiters();
        }
    }

    /// Return a segment's bytes to the budget and wake blocked allocators.
    pub fn free(&self, segment: CachedSegment) {
        {
            let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
            *allocated = allocated.saturating_sub(segment.charged);
        }
        self.alloc_notify.notify_waiters();
    }

    /// Record `bytes` of cached content for a file
    pub fn register(&self, file: FileId, bytes: u64) {
        let mut content = self.content.lock().unwrap_or_else(|e| e.into_inner());
        *content.entry(file).or_insert(0) += bytes;
    }

    /// Remove `bytes` of cached content for a file
    pub fn unregister(&self, file: FileId, bytes: u64) {
        let mut content = self.content.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = content.get_mut(&file) {
            *count = count.saturating_sub(bytes);
            if *count == 0 {
                content.remove(&file);
            }
        }
    }

    /// Cached bytes recorded for a file
    pub fn file_cached_bytes(&self, file: FileId) -> u64 {
        self.content
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&file)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a flush currently holds this file (the file must not be
    /// destroyed while busy)
    pub fn file_busy(&self, file: FileId) -> bool {
        *self.busy_file.lock().unwrap_or_else(|e| e.into_inner()) == Some(file)
    }

    /// Whether a flush is running
    pub fn flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// The file the flusher should write next: the largest cached
    /// footprint, once usage passes the watermark or an allocator is
    /// blocked waiting for room (or unconditionally with
    /// `flush_everything`, used on shutdown and file completion).
    pub fn flush_candidate(&self, flush_everything: bool) -> Option<FileId> {
        let allocated = self.allocated();
        if allocated == 0 {
            return None;
        }
        let starved = self.waiters.load(Ordering::Acquire) > 0;
        if !flush_everything
            && !starved
            && (allocated as f64) < self.max_size as f64 * FLUSH_WATERMARK
        {
            return None;
        }
        let content = self.content.lock().unwrap_or_else(|e| e.into_inner());
        content
            .iter()
            .max_by_key(|(_, bytes)| **bytes)
            .map(|(file, _)| *file)
    }

    /// Enter a flush for `file`. Only one flush runs at a time; the file
    /// stays busy until the guard drops.
    pub async fn guard_flush(&self, file: FileId) -> FlushGuard<'_> {
        let guard = self.flush_lock.lock().await;
        *self.busy_file.lock().unwrap_or_else(|e| e.into_inner()) = Some(file);
        self.flushing.store(true, Ordering::Release);
        FlushGuard { cache: self, _guard: guard }
    }

    /// Fail pending and future allocations; wakes every blocked `alloc`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.alloc_notify.notify_waiters();
    }
}

/// Scoped flush exclusivity; clears the busy file on drop.
pub struct FlushGuard<'a> {
    cache: &'a ArticleCache,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        *self
            .cache
            .busy_file
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.cache.flushing.store(false, Ordering::Release);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn alloc_within_budget_never_suspends() {
        let cache = ArticleCache::new(64);
        let segment = tokio_test::block_on(cache.alloc(32)).unwrap();
        assert_eq!(segment.charged(), 32);
        cache.free(segment);
    }

    #[tokio::test]
    async fn alloc_charges_and_free_releases() {
        let cache = ArticleCache::new(1024);
        let segment = cache.alloc(512).await.unwrap();
        assert_eq!(cache.allocated(), 512);

        cache.free(segment);
        assert_eq!(cache.allocated(), 0);
    }

    #[tokio::test]
    async fn zero_budget_disables_caching() {
        let cache = ArticleCache::new(0);
        assert!(cache.alloc(1).await.is_none());
    }

    #[tokio::test]
    async fn oversized_request_fails_instead_of_blocking_forever() {
        let cache = ArticleCache::new(100);
        assert!(cache.alloc(101).await.is_none());
    }

    #[tokio::test]
    async fn alloc_blocks_until_a_segment_is_freed() {
        let cache = Arc::new(ArticleCache::new(1024));
        let first = cache.alloc(1024).await.unwrap();

        let cache2 = Arc::clone(&cache);
        let blocked = tokio::spawn(async move { cache2.alloc(512).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "alloc must block while full");

        cache.free(first);
        let segment = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(segment.charged(), 512);
    }

    #[tokio::test]
    async fn stop_fails_blocked_allocations() {
        let cache = Arc::new(ArticleCache::new(64));
        let held = cache.alloc(64).await.unwrap();

        let cache2 = Arc::clone(&cache);
        let blocked = tokio::spawn(async move { cache2.alloc(64).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none(), "alloc must fail on shutdown");
        cache.free(held);
    }

    #[tokio::test]
    async fn allocated_never_exceeds_the_budget_under_contention() {
        let cache = Arc::new(ArticleCache::new(4096));
        let mut tasks = Vec::new();

        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let segment = cache.alloc(512).await.unwrap();
                    assert!(
                        cache.allocated() <= 4096,
                        "budget exceeded: {}",
                        cache.allocated()
                    );
                    tokio::task::yield_now().await;
                    cache.free(segment);
                }
            }));
        }

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(cache.allocated(), 0);
    }

    #[tokio::test]
    async fn realloc_adjusts_the_charge() {
        let cache = ArticleCache::new(1024);
        let mut segment = cache.alloc(512).await.unwrap();

        cache.realloc(&mut segment, 700);
        assert_eq!(cache.allocated(), 700);

        cache.realloc(&mut segment, 100);
        assert_eq!(cache.allocated(), 100);

        cache.free(segment);
        assert_eq!(cache.allocated(), 0);
    }

    #[tokio::test]
    async fn flush_candidate_is_the_largest_footprint_past_watermark() {
        let cache = ArticleCache::new(1000);
        let big = cache.alloc(600).await.unwrap();
        let small = cache.alloc(350).await.unwrap();

        cache.register(FileId::new(1), 600);
        cache.register(FileId::new(2), 350);

        assert_eq!(cache.flush_candidate(false), Some(FileId::new(1)));

        cache.unregister(FileId::new(1), 600);
        cache.free(big);
        // usage below watermark: only flush_everything picks a file
        assert_eq!(cache.flush_candidate(false), None);
        assert_eq!(cache.flush_candidate(true), Some(FileId::new(2)));

        cache.unregister(FileId::new(2), 350);
        cache.free(small);
        assert_eq!(cache.flush_candidate(true), None);
    }

    #[tokio::test]
    async fn flush_guard_marks_the_file_busy() {
        let cache = ArticleCache::new(1000);
        let file = FileId::new(9);

        {
            let _guard = cache.guard_flush(file).await;
            assert!(cache.file_busy(file));
            assert!(cache.flushing());
            assert!(!cache.file_busy(FileId::new(10)));
        }

        assert!(!cache.file_busy(file));
        assert!(!cache.flushing());
    }
}
