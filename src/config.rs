use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data_structures::morton::{Morton, MortonCode};
use crate::data_structures::vector::{vec3f, Vec3f32};
use crate::error::{Error, Result};
use crate::octree::dims::OctreeDimensions;

/// How the point stream gets into Morton order before construction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortingMode {
    /// In-memory binary heap pop-stream.
    Heap,
    /// In-memory chunkwise selection, bounded sorting spikes.
    PartialSort,
    /// In-memory radix sort of the whole set.
    FullSort,
    /// Two-phase k-way merge for sets bigger than memory.
    #[default]
    External,
}

/// Construction-time knobs, passed once at octree creation.
#[derive(Copy, Clone, Debug)]
pub struct RuntimeConfig {
    /// Hierarchy worker count.
    pub n_threads: usize,
    /// Nodes per work item handed to one worker.
    pub load_per_thread: u64,
    /// Soft RAM limit for the construction algorithm, in bytes.
    pub ram_quota: u64,
    /// GPU memory budget for resident surfel clouds, in bytes.
    pub gpu_quota: u64,
    pub sorting: SortingMode,
    /// Leaf level the hierarchy is built from, bottom-up.
    pub max_level: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8),
            load_per_thread: 1024,
            ram_quota: 6 * 1024 * 1024 * 1024,
            gpu_quota: 1024 * 1024 * 1024,
            sorting: SortingMode::External,
            max_level: Morton::MAX_LEVEL,
        }
    }
}

impl RuntimeConfig {
    pub fn validated(mut self) -> Result<Self> {
        if self.max_level > Morton::MAX_LEVEL {
            return Err(Error::Input(format!(
                "max_level {} exceeds the morton code capacity of {}",
                self.max_level,
                Morton::MAX_LEVEL
            )));
        }
        self.n_threads = self.n_threads.max(1);
        self.load_per_thread = self.load_per_thread.max(1);
        Ok(self)
    }
}

#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct DescriptorVec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<Vec3f32> for DescriptorVec3 {
    fn from(v: Vec3f32) -> Self {
        Self {
            x: v.0,
            y: v.1,
            z: v.2,
        }
    }
}

impl From<DescriptorVec3> for Vec3f32 {
    fn from(v: DescriptorVec3) -> Self {
        vec3f(v.x, v.y, v.z)
    }
}

/// On-disk octree description, the alternative entry point to a raw point
/// file. Produced by the sorter alongside the sorted points.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OctreeDescriptor {
    pub size: DescriptorVec3,
    #[serde(default)]
    pub origin: DescriptorVec3,
    pub depth: u8,
    /// Path to the Morton-sorted point file.
    pub points: PathBuf,
    /// Directory for the on-disk node stores, regenerated each run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    /// Path to a pre-built binary octree, rendered without construction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<PathBuf>,
}

impl OctreeDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Input(format!("cannot open octree descriptor {path:?}: {e}")))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Input(format!("malformed octree descriptor {path:?}: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| Error::Input(format!("cannot write octree descriptor {path:?}: {e}")))?;
        Ok(())
    }

    pub fn dimensions(&self) -> OctreeDimensions {
        OctreeDimensions::new(self.origin.into(), self.size.into(), self.depth)
    }
}
