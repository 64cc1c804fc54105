//! GPU-resident surfel data and the module-scoped GPU byte accounting the
//! load budget is enforced with.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::data_structures::surfel::SURFEL_SIZE;

static ALLOCATED: AtomicU64 = AtomicU64::new(0);
static QUOTA: AtomicU64 = AtomicU64::new(1024 * 1024 * 1024);

pub fn set_gpu_quota(bytes: u64) {
    QUOTA.store(bytes, Ordering::Relaxed);
}

pub fn total_allocated() -> u64 {
    ALLOCATED.load(Ordering::Relaxed)
}

pub fn point_bytes() -> u64 {
    SURFEL_SIZE as u64
}

/// Whether a cloud of `num_points` still fits the budget.
pub fn has_memory_for(num_points: u32) -> bool {
    total_allocated() + num_points as u64 * point_bytes() <= QUOTA.load(Ordering::Relaxed)
}

/// The front stops keeping redundant child clouds resident once usage gets
/// close to the quota.
pub fn reached_gpu_quota() -> bool {
    total_allocated() as f64 > 0.95 * QUOTA.load(Ordering::Relaxed) as f64
}

/// Serializes tests that assert on the process-global byte counter.
#[cfg(test)]
pub(crate) static GPU_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Loading,
    Loaded,
}

impl LoadStatus {
    pub fn is_loaded(self) -> bool {
        self == LoadStatus::Loaded
    }
}

/// Vertex data of one node on the GPU. While a copy task is still filling
/// the staging mapping, the cloud is `Loading` and holds the channel the
/// finished buffer arrives on; the first successful poll completes the
/// transition. Dropping the cloud releases the buffer and returns its bytes
/// to the budget.
pub struct SurfelCloud {
    buffer: Option<wgpu::Buffer>,
    pending: Option<Receiver<wgpu::Buffer>>,
    num_points: u32,
    bytes: u64,
}

impl SurfelCloud {
    fn reserve(num_points: u32) -> u64 {
        let bytes = num_points as u64 * point_bytes();
        ALLOCATED.fetch_add(bytes, Ordering::Relaxed);
        bytes
    }

    /// A cloud whose buffer is still being produced by a copy task.
    pub fn loading(num_points: u32, pending: Receiver<wgpu::Buffer>) -> Self {
        debug_assert!(num_points > 0, "empty clouds are never uploaded");
        Self {
            buffer: None,
            pending: Some(pending),
            num_points,
            bytes: Self::reserve(num_points),
        }
    }

    /// A cloud that is immediately complete. Used by the headless loader
    /// backend, which has no device to upload to.
    pub fn resident(num_points: u32) -> Self {
        Self {
            buffer: None,
            pending: None,
            num_points,
            bytes: Self::reserve(num_points),
        }
    }

    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffer.as_ref()
    }

    /// Drives `Loading` to `Loaded` once the copy task has handed the filled
    /// buffer over.
    pub fn poll(&mut self) -> LoadStatus {
        let Some(pending) = &self.pending else {
            return LoadStatus::Loaded;
        };
        match pending.try_recv() {
            Ok(buffer) => {
                self.buffer = Some(buffer);
                self.pending = None;
                LoadStatus::Loaded
            }
            Err(TryRecvError::Empty) => LoadStatus::Loading,
            Err(TryRecvError::Disconnected) => {
                // The copy task died; stay Loading forever rather than
                // render garbage. The front will retry the load after an
                // unload.
                LoadStatus::Loading
            }
        }
    }
}

impl Drop for SurfelCloud {
    fn drop(&mut self) {
        ALLOCATED.fetch_sub(self.bytes, Ordering::Relaxed);
        if let Some(buffer) = self.buffer.take() {
            buffer.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resident_cloud_is_loaded() {
        let mut cloud = SurfelCloud::resident(16);
        assert_eq!(cloud.poll(), LoadStatus::Loaded);
        assert_eq!(cloud.num_points(), 16);
    }

    #[test]
    fn budget_follows_cloud_lifetime() {
        let _guard = GPU_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = total_allocated();
        {
            let _cloud = SurfelCloud::resident(100);
            assert_eq!(total_allocated(), before + 100 * point_bytes());
        }
        assert_eq!(total_allocated(), before);
    }

    #[test]
    fn pending_cloud_loads_on_poll() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut cloud = SurfelCloud::loading(4, rx);
        assert_eq!(cloud.poll(), LoadStatus::Loading);
        drop(tx);
        assert_eq!(cloud.poll(), LoadStatus::Loading);
    }
}
