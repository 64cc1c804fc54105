//! Soft RAM accounting for the construction algorithm. One module-scoped
//! counter tracks live node bytes; the builder compares it against the
//! configured quota to toggle release mode. The surfel and index stores are
//! disk backed and intentionally not counted.

use std::sync::atomic::{AtomicU64, Ordering};

static ALLOCATED: AtomicU64 = AtomicU64::new(0);

pub fn notify_alloc(bytes: u64) {
    ALLOCATED.fetch_add(bytes, Ordering::Relaxed);
}

pub fn notify_dealloc(bytes: u64) {
    ALLOCATED.fetch_sub(bytes, Ordering::Relaxed);
}

pub fn total_allocated() -> u64 {
    ALLOCATED.load(Ordering::Relaxed)
}
