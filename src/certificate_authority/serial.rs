use std::sync::atomic::{AtomicU64, Ordering};

/// Source of certificate serial numbers.
///
/// Every call to [`SerialAllocator::next`] returns a value strictly greater than any value
/// returned before it, regardless of how many threads share the allocator. Share it between
/// authorities with an `Arc` if their serial numbers must not collide.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    last: AtomicU64,
}

impl SerialAllocator {
    /// Creates an allocator whose first serial number is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator whose first serial number is `last + 1`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Allocates the next serial number.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently allocated serial number, or the starting point if none was allocated.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
