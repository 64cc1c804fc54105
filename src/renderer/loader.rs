//! Asynchronous loader and unloader for surfel clouds. Requests are buffered
//! in iterations to keep locking out of the per-node hot path: the front
//! files `load`, `unload` and `release_siblings` requests while it walks its
//! segment, then `flush` applies them at the frame boundary. Loads travel to
//! a dedicated loader thread which farms the store reads and buffer fills
//! out to the rayon pool; unload and release are applied eagerly.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Sender};

use crate::data_structures::surfel::SURFEL_SIZE;
use crate::gpu_handles::GpuHandles;
use crate::octree::ext_data::OctreeData;
use crate::octree::node::Node;
use crate::renderer::cloud::{self, SurfelCloud};

/// A node pointer crossing the loader's intake buffer. The pointee is owned
/// by the octree and outlives every request referencing it.
#[derive(Copy, Clone)]
struct NodeRef(NonNull<Node>);

// Safety: requests are filed and flushed on the render thread only; the
// wrapper exists so the intake buffer can sit behind a mutex.
unsafe impl Send for NodeRef {}

struct CopyJob {
    index_offset: u64,
    index_size: u32,
    level: u8,
    reply: Sender<wgpu::Buffer>,
}

enum Backend {
    /// No device: loads complete synchronously without buffers. Used by
    /// tests and offline tools.
    Headless,
    Gpu {
        jobs: Sender<CopyJob>,
    },
}

#[derive(Default)]
struct Intake {
    load: Vec<CopyJob>,
    unload: Vec<NodeRef>,
    release: Vec<NodeRef>,
}

pub struct NodeLoader {
    intake: Mutex<Intake>,
    backend: Backend,
    releasing: AtomicBool,
    leaf_level: u8,
}

impl NodeLoader {
    pub fn headless(leaf_level: u8, gpu_quota: u64) -> Self {
        cloud::set_gpu_quota(gpu_quota);
        Self {
            intake: Mutex::new(Intake::default()),
            backend: Backend::Headless,
            releasing: AtomicBool::new(false),
            leaf_level,
        }
    }

    /// Spawns the loader thread. It owns the job queue for its lifetime;
    /// dropping the loader closes the queue and the thread winds down on its
    /// own, with any inflight copies finishing on the rayon pool.
    pub fn with_gpu(
        gpu: Arc<GpuHandles>,
        data: Arc<OctreeData>,
        leaf_level: u8,
        gpu_quota: u64,
    ) -> Self {
        cloud::set_gpu_quota(gpu_quota);
        let (jobs, job_rx) = unbounded::<CopyJob>();

        std::thread::Builder::new()
            .name("cloud loader".into())
            .spawn(move || {
                for job in job_rx.iter() {
                    let gpu = Arc::clone(&gpu);
                    let data = Arc::clone(&data);
                    rayon::spawn(move || run_copy_job(gpu, data, leaf_level, job));
                }
            })
            .expect("failed to spawn the cloud loader thread");

        Self {
            intake: Mutex::new(Intake::default()),
            backend: Backend::Gpu { jobs },
            releasing: AtomicBool::new(false),
            leaf_level,
        }
    }

    pub fn leaf_level(&self) -> u8 {
        self.leaf_level
    }

    /// Requests a GPU load. Denied without error when the budget would be
    /// exceeded; the caller simply retries on a later frame. A `Loading`
    /// cloud is installed immediately so repeated requests are no-ops.
    pub fn request_load(&self, node: &Node) {
        if node.has_cloud() {
            return;
        }
        if !cloud::has_memory_for(node.index_size()) {
            log::trace!("gpu budget exhausted, deferring load of {}", node.morton());
            return;
        }
        match &self.backend {
            Backend::Headless => node.install_cloud(SurfelCloud::resident(node.index_size())),
            Backend::Gpu { .. } => {
                if node.index_size() == 0 {
                    node.install_cloud(SurfelCloud::resident(0));
                    return;
                }
                let (reply, pending) = crossbeam_channel::bounded(1);
                node.install_cloud(SurfelCloud::loading(node.index_size(), pending));
                self.intake.lock().unwrap().load.push(CopyJob {
                    index_offset: node.index_offset(),
                    index_size: node.index_size(),
                    level: node.level(),
                    reply,
                });
            }
        }
    }

    /// Requests dropping a node's cloud. Applied at the next flush.
    pub fn request_unload(&self, node: &Node) {
        if node.has_cloud() {
            self.intake
                .lock()
                .unwrap()
                .unload
                .push(NodeRef(NonNull::from(node)));
        }
    }

    /// Requests dropping a node's owned child array, recursively dropping
    /// any clouds within. Applied at the next flush.
    pub fn request_release_children(&self, parent: &Node) {
        self.releasing.store(true, Ordering::Release);
        self.intake
            .lock()
            .unwrap()
            .release
            .push(NodeRef(NonNull::from(parent)));
    }

    /// True while sibling groups are still waiting to be released. The
    /// builder keeps release mode on until this drains.
    pub fn is_releasing(&self) -> bool {
        self.releasing.load(Ordering::Acquire)
    }

    /// Applies the iteration's requests. Called once per frame, on the
    /// thread that owns front tracking.
    pub fn flush(&self) {
        let batch = std::mem::take(&mut *self.intake.lock().unwrap());

        if let Backend::Gpu { jobs } = &self.backend {
            for job in batch.load {
                if jobs.send(job).is_err() {
                    log::error!("cloud loader thread is gone, dropping load request");
                }
            }
        }

        for node in &batch.unload {
            // Safety: the pointee is alive (owned by the octree) and cloud
            // state is behind its own lock.
            unsafe { node.0.as_ref() }.unload_cloud();
        }

        for node in &batch.release {
            // Safety: release requests originate from prune, which has
            // already removed every child from the front; nothing else
            // borrows the child array at flush time.
            unsafe { &mut *node.0.as_ptr() }.release_children();
        }

        self.releasing.store(false, Ordering::Release);
    }
}

fn run_copy_job(gpu: Arc<GpuHandles>, data: Arc<OctreeData>, leaf_level: u8, job: CopyJob) {
    let surfels = match data.gather(job.index_offset, job.index_size, job.level, leaf_level) {
        Ok(surfels) => surfels,
        Err(e) => {
            log::error!("cloud copy failed reading the external stores: {e}");
            return;
        }
    };

    let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("surfel cloud"),
        size: (surfels.len() * SURFEL_SIZE) as u64,
        usage: wgpu::BufferUsages::VERTEX,
        mapped_at_creation: true,
    });
    buffer
        .slice(..)
        .get_mapped_range_mut()
        .copy_from_slice(bytemuck::cast_slice(surfels.as_slice()));
    buffer.unmap();

    // The receiver may have been unloaded while we copied; the buffer is
    // then dropped right here.
    let _ = job.reply.send(buffer);
}
