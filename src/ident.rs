use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out process-wide unique 32-bit identifiers for collections,
/// documents and indices. Ids are monotonic and never reused; the counter is
/// read from the catalog at start and written back at shutdown.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new(next: u32) -> IdAllocator {
        IdAllocator { next: AtomicU32::new(next) }
    }

    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next call to `next()` would return; persisted as `next_id`.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}
