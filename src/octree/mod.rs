//! Fast parallel octree over an out-of-core surfel store. Provides
//! visualization while the hierarchy is constructed bottom-up in the
//! background.

pub mod builder;
pub mod dims;
pub mod ext_data;
pub mod front;
pub mod mem;
pub mod node;

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::config::{OctreeDescriptor, RuntimeConfig};
use crate::disk::octree_file::OctreeFile;
use crate::disk::point_sorter::make_reader;
use crate::disk::sort_reader::PresortedReader;
use crate::error::{Error, Result};
use crate::gpu_handles::GpuHandles;
use crate::renderer::loader::NodeLoader;
use crate::renderer::CutRenderer;
use crate::tools::FrameStats;
use builder::{BuildResult, HierarchyBuilder};
use dims::OctreeDimensions;
use ext_data::OctreeData;
use front::Front;
use node::Node;

pub struct Octree {
    front: Arc<Front>,
    data: Arc<OctreeData>,
    dim: OctreeDimensions,
    loader: NodeLoader,
    creation: Option<Receiver<Result<BuildResult>>>,
    result: Option<BuildResult>,
}

impl Octree {
    /// Creates the octree from an unsorted point file, sorting per the
    /// configured mode and constructing asynchronously while the front is
    /// already usable for rendering.
    pub fn from_point_file(
        path: &Path,
        gpu: Option<Arc<GpuHandles>>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let config = config.validated()?;
        let reader = make_reader(path, config.max_level, config.sorting)?;
        let dim = *reader.dimensions();
        let database = path.with_extension("db");
        Self::start(reader, dim, &database, gpu, config)
    }

    /// Creates the octree from a descriptor document: either constructing
    /// from its sorted point file, or loading its prebuilt binary hierarchy.
    pub fn from_descriptor(
        descriptor: &OctreeDescriptor,
        gpu: Option<Arc<GpuHandles>>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let config = config.validated()?;
        let dim = descriptor.dimensions();
        let database = descriptor
            .database
            .clone()
            .unwrap_or_else(|| descriptor.points.with_extension("db"));

        if let Some(nodes) = &descriptor.nodes {
            let data = Arc::new(Self::create_data(&database)?);
            let front = Arc::new(Front::new(dim, config.n_threads, config.ram_quota));
            let loader = Self::create_loader(&gpu, &data, dim.level(), config.gpu_quota);

            let root = OctreeFile::read(nodes, &dim, &data)?;
            front.insert_root(&root, &loader);
            let (point_count, _) = root.subtree_statistics();
            return Ok(Self {
                front,
                data,
                dim,
                loader,
                creation: None,
                result: Some(BuildResult {
                    root,
                    duration_ms: 0,
                    point_count,
                    skipped_points: 0,
                    producer_parks: 0,
                    boundary_merges: 0,
                }),
            });
        }

        let reader = Box::new(PresortedReader::new(&descriptor.points, dim)?);
        Self::start(reader, dim, &database, gpu, config)
    }

    fn start(
        reader: Box<dyn crate::disk::sort_reader::SortedPointReader>,
        dim: OctreeDimensions,
        database: &Path,
        gpu: Option<Arc<GpuHandles>>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let data = Arc::new(Self::create_data(database)?);
        let front = Arc::new(Front::new(dim, config.n_threads, config.ram_quota));
        let loader = Self::create_loader(&gpu, &data, dim.level(), config.gpu_quota);

        let builder =
            HierarchyBuilder::new(Arc::clone(&data), Arc::clone(&front), dim, config);
        let creation = builder.create_async(reader);

        Ok(Self {
            front,
            data,
            dim,
            loader,
            creation: Some(creation),
            result: None,
        })
    }

    fn create_data(database: &Path) -> Result<OctreeData> {
        std::fs::create_dir_all(database)?;
        OctreeData::create(database)
    }

    fn create_loader(
        gpu: &Option<Arc<GpuHandles>>,
        data: &Arc<OctreeData>,
        leaf_level: u8,
        gpu_quota: u64,
    ) -> NodeLoader {
        match gpu {
            Some(gpu) => {
                NodeLoader::with_gpu(Arc::clone(gpu), Arc::clone(data), leaf_level, gpu_quota)
            }
            None => NodeLoader::headless(leaf_level, gpu_quota),
        }
    }

    /// Tracks the rendering front for one frame and flushes the loader's
    /// request batch.
    pub fn track_front(&mut self, renderer: &mut dyn CutRenderer, proj_thresh: f32) -> FrameStats {
        let stats = self.front.track_front(renderer, &self.loader, proj_thresh);
        self.loader.flush();
        stats
    }

    /// Polls the asynchronous construction without blocking.
    pub fn is_creation_finished(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        let Some(creation) = &self.creation else {
            return true;
        };
        match creation.try_recv() {
            Ok(Ok(result)) => {
                self.result = Some(result);
                self.creation = None;
                true
            }
            Ok(Err(e)) => {
                // Rendering continues with whatever made it into the front.
                log::error!("construction failed, rendering the partial hierarchy: {e}");
                self.creation = None;
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.creation = None;
                true
            }
        }
    }

    /// Blocks until construction has finished.
    pub fn wait_creation(&mut self) -> Result<()> {
        if let Some(creation) = self.creation.take() {
            match creation.recv() {
                Ok(Ok(result)) => self.result = Some(result),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::Invariant(
                        "construction thread vanished without a result".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn dim(&self) -> &OctreeDimensions {
        &self.dim
    }

    pub fn data(&self) -> &Arc<OctreeData> {
        &self.data
    }

    pub fn front(&self) -> &Arc<Front> {
        &self.front
    }

    /// The root node, once construction has finished.
    pub fn root(&self) -> Option<&Node> {
        self.result.as_ref().map(|r| &*r.root)
    }

    pub fn build_stats(&self) -> Option<&BuildResult> {
        self.result.as_ref()
    }

    /// Number of nodes and node contents in the finished hierarchy.
    pub fn node_statistics(&self) -> Option<(u64, u64)> {
        self.root().map(|root| root.subtree_statistics())
    }

    /// Persists the finished hierarchy.
    pub fn write_octree_file(&self, path: &Path, breadth_first: bool) -> Result<()> {
        let root = self
            .root()
            .ok_or_else(|| Error::Invariant("cannot persist an unfinished hierarchy".into()))?;
        if breadth_first {
            OctreeFile::write_breadth(path, root, &self.data)
        } else {
            OctreeFile::write_depth(path, root, &self.data)
        }
    }
}
