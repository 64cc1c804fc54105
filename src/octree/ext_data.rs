//! Disk-backed stores shared by every octree node. Surfels are an
//! append-only sequence written by the producer thread; the index store maps
//! per-node sample ranges to surfel ids and supports parallel writers
//! through an atomic-style reserve-then-fill protocol.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::data_structures::morton::Morton;
use crate::data_structures::surfel::{tangent_multiplier, Surfel, SURFEL_SIZE};
use crate::error::{Error, Result};
use crate::octree::dims::OctreeDimensions;

/// Appends are buffered; readers see the unflushed tail through the buffer
/// itself, so a surfel is visible from the moment `push` returns.
pub struct SurfelStore {
    file: File,
    /// Number of surfels made durable with `write_at` so far.
    flushed: AtomicU64,
    tail: Mutex<Vec<Surfel>>,
}

const TAIL_CAPACITY: usize = 4096;

impl SurfelStore {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            flushed: AtomicU64::new(0),
            tail: Mutex::new(Vec::with_capacity(TAIL_CAPACITY)),
        })
    }

    /// Appends one surfel. Single writer: the producer thread during
    /// construction, or the octree file reader when loading a prebuilt tree.
    pub fn push(&self, surfel: Surfel) -> Result<u64> {
        let mut tail = self.tail.lock().unwrap();
        let index = self.flushed.load(Ordering::Acquire) + tail.len() as u64;
        tail.push(surfel);
        if tail.len() >= TAIL_CAPACITY {
            self.flush_locked(&mut tail)?;
        }
        Ok(index)
    }

    pub fn flush(&self) -> Result<()> {
        let mut tail = self.tail.lock().unwrap();
        self.flush_locked(&mut tail)
    }

    fn flush_locked(&self, tail: &mut Vec<Surfel>) -> Result<()> {
        if tail.is_empty() {
            return Ok(());
        }
        let offset = self.flushed.load(Ordering::Acquire) * SURFEL_SIZE as u64;
        self.file
            .write_all_at(bytemuck::cast_slice(tail.as_slice()), offset)?;
        self.flushed
            .fetch_add(tail.len() as u64, Ordering::Release);
        tail.clear();
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.flushed.load(Ordering::Acquire) + self.tail.lock().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u64) -> Result<Surfel> {
        let flushed = self.flushed.load(Ordering::Acquire);
        if index >= flushed {
            let tail = self.tail.lock().unwrap();
            // Re-check under the lock, a flush may have raced us.
            let flushed = self.flushed.load(Ordering::Acquire);
            if index >= flushed {
                return tail
                    .get((index - flushed) as usize)
                    .copied()
                    .ok_or_else(|| {
                        Error::Invariant(format!("surfel index {index} out of bounds"))
                    });
            }
        }
        let mut buf = [0u8; SURFEL_SIZE];
        self.file.read_exact_at(&mut buf, index * SURFEL_SIZE as u64)?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }
}

/// Growing sequence of `u64` surfel ids. Writers reserve a contiguous range
/// under the length mutex and fill it afterwards without further
/// coordination; no element is ever rewritten.
pub struct IndexStore {
    file: File,
    len: Mutex<u64>,
}

impl IndexStore {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            len: Mutex::new(0),
        })
    }

    /// Reserves `count` slots and returns the starting offset.
    pub fn reserve(&self, count: u32) -> u64 {
        let mut len = self.len.lock().unwrap();
        let offset = *len;
        *len += count as u64;
        offset
    }

    /// Fills a previously reserved range. Lock free: one positioned write
    /// entirely inside the reservation.
    pub fn fill(&self, offset: u64, indices: &[u64]) -> Result<()> {
        self.file
            .write_all_at(bytemuck::cast_slice(indices), offset * 8)?;
        Ok(())
    }

    pub fn read_range(&self, offset: u64, count: u32) -> Result<Vec<u64>> {
        let mut buf = vec![0u8; count as usize * 8];
        self.file.read_exact_at(&mut buf, offset * 8)?;
        // The byte buffer is not necessarily u64 aligned.
        Ok(bytemuck::pod_collect_to_vec(buf.as_slice()))
    }

    pub fn len(&self) -> u64 {
        *self.len.lock().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The external data of one octree: every node references its sample as a
/// range into `indices`, which in turn points into `surfels`.
pub struct OctreeData {
    pub surfels: SurfelStore,
    pub indices: IndexStore,
}

impl OctreeData {
    /// Creates both stores inside `dir`. They are scratch state, regenerated
    /// from scratch each run.
    pub fn create(dir: &Path) -> Result<Self> {
        Ok(Self {
            surfels: SurfelStore::create(&dir.join("surfels.bin"))?,
            indices: IndexStore::create(&dir.join("indices.bin"))?,
        })
    }

    pub fn calc_morton(&self, surfel_id: u64, dim: &OctreeDimensions) -> Result<Morton> {
        Ok(dim.calc_morton(self.surfels.get(surfel_id)?.center))
    }

    /// Resolves a node's index range to surfels as stored, without any
    /// tangent scaling. Used by persistence.
    pub fn raw_sample(&self, index_offset: u64, index_size: u32) -> Result<Vec<Surfel>> {
        let ids = self.indices.read_range(index_offset, index_size)?;
        ids.into_iter().map(|id| self.surfels.get(id)).collect()
    }

    /// Resolves a node's index range to surfels, applying the level's
    /// tangent multiplier. This is what GPU copy tasks consume.
    pub fn gather(
        &self,
        index_offset: u64,
        index_size: u32,
        level: u8,
        leaf_level: u8,
    ) -> Result<Vec<Surfel>> {
        let ids = self.indices.read_range(index_offset, index_size)?;
        let multiplier = tangent_multiplier(level, leaf_level);
        let mut surfels = Vec::with_capacity(ids.len());
        for id in ids {
            let mut surfel = self.surfels.get(id)?;
            surfel.multiply_tangents(multiplier);
            surfels.push(surfel);
        }
        Ok(surfels)
    }
}
