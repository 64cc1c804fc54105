//! Multithreaded bottom-up hierarchy construction. A producer thread turns
//! the Morton-sorted point stream into leaf nodes and work items for the
//! deepest level; worker threads drain one level's queue in parallel
//! iterations, grouping siblings into inner nodes and feeding the next
//! shallower level. The algorithm runs in passes from the leaf level towards
//! the root until the producer is done and every queue above the root has
//! drained.
//!
//! Work items are processed by disjoint workers whose outputs can both touch
//! children of the same parent; a reconciliation step after every parallel
//! phase merges such boundary duplicates and rebalances undersized outputs.
//! A node is "finalized" exactly once, when merging can no longer rebuild
//! its child array: its displayable sample is drawn, its children receive
//! their parent back reference, and its leaf children enter the front.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam_channel::Receiver;
use rayon::prelude::*;

use crate::config::RuntimeConfig;
use crate::data_structures::morton::{Morton, MortonCode};
use crate::data_structures::surfel::Surfel;
use crate::disk::sort_reader::SortedPointReader;
use crate::error::{Error, Result};
use crate::octree::dims::OctreeDimensions;
use crate::octree::ext_data::OctreeData;
use crate::octree::front::Front;
use crate::octree::mem as mem_stats;
use crate::octree::node::Node;

pub type NodeList = VecDeque<Node>;
type WorkQueue = VecDeque<NodeList>;

pub struct BuildResult {
    pub root: Box<Node>,
    pub duration_ms: u128,
    /// Accepted input points, after invalid ones were skipped.
    pub point_count: u64,
    /// Points dropped for degenerate normals or non-finite coordinates.
    pub skipped_points: u64,
    /// How often the producer parked on the release handshake.
    pub producer_parks: u64,
    /// Boundary duplicates merged during reconciliation.
    pub boundary_merges: u64,
}

/// The release handshake between the construction loop and the producer. An
/// atomic alone is not enough because the producer has to sleep.
struct ReleaseGate {
    releasing: Mutex<bool>,
    resume: Condvar,
    producer_parked: AtomicBool,
    parks: AtomicU64,
}

impl ReleaseGate {
    fn new() -> Self {
        Self {
            releasing: Mutex::new(false),
            resume: Condvar::new(),
            producer_parked: AtomicBool::new(false),
            parks: AtomicU64::new(0),
        }
    }

    fn turn_on(&self) {
        let mut releasing = self.releasing.lock().unwrap();
        if !*releasing {
            log::debug!(
                "release mode on, {} bytes over the soft limit",
                mem_stats::total_allocated()
            );
            *releasing = true;
        }
    }

    fn turn_off(&self) {
        {
            let mut releasing = self.releasing.lock().unwrap();
            if !*releasing {
                return;
            }
            *releasing = false;
        }
        log::debug!("release mode off");
        self.resume.notify_all();
    }

    fn is_releasing(&self) -> bool {
        *self.releasing.lock().unwrap()
    }

    fn is_producer_parked(&self) -> bool {
        self.producer_parked.load(Ordering::Acquire)
    }

    /// Called by the producer between work items; blocks while release mode
    /// is on.
    fn producer_checkpoint(&self) {
        let mut releasing = self.releasing.lock().unwrap();
        if !*releasing {
            return;
        }
        self.parks.fetch_add(1, Ordering::Relaxed);
        self.producer_parked.store(true, Ordering::Release);
        while *releasing {
            releasing = self.resume.wait(releasing).unwrap();
        }
        self.producer_parked.store(false, Ordering::Release);
    }
}

struct Shared {
    leaf_queue: Mutex<WorkQueue>,
    leaf_loaded: AtomicBool,
    producer_error: Mutex<Option<Error>>,
    release: ReleaseGate,
}

/// Where finalization sends freshly completed leaves.
enum Sink<'a> {
    /// Append to a worker's buffer.
    End(usize),
    /// Insert into the first worker's buffer at a caller-tracked position;
    /// boundary reconciliation produces nodes that sort before everything
    /// that worker inserted this iteration.
    At(&'a mut usize),
}

impl Sink<'_> {
    fn insert(&mut self, front: &Front, node: &Node) {
        match self {
            Sink::End(thread_idx) => front.insert_into_buffer_end(*thread_idx, node),
            Sink::At(at) => {
                front.insert_into_buffer_at(0, **at, node);
                **at += 1;
            }
        }
    }
}

struct WorkerOutput {
    list: NodeList,
    /// The last sibling group handed back to the level queue because the
    /// producer may still append members to it.
    push_back: Option<NodeList>,
}

pub struct HierarchyBuilder {
    data: Arc<OctreeData>,
    front: Arc<Front>,
    leaf_dim: OctreeDimensions,
    config: RuntimeConfig,
}

impl HierarchyBuilder {
    pub fn new(
        data: Arc<OctreeData>,
        front: Arc<Front>,
        leaf_dim: OctreeDimensions,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            data,
            front,
            leaf_dim,
            config,
        }
    }

    /// Creates the hierarchy asynchronously. The receiver resolves with the
    /// root when construction finishes; dropping it does not cancel the
    /// build.
    pub fn create_async(self, reader: Box<dyn SortedPointReader>) -> Receiver<Result<BuildResult>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name("hierarchy builder".into())
            .spawn(move || {
                let result = self.create(reader);
                if let Err(e) = &result {
                    log::error!("hierarchy construction failed: {e}");
                }
                let _ = tx.send(result);
            })
            .expect("failed to spawn the hierarchy builder thread");
        rx
    }

    /// Synchronous variant, used by tests and offline tools.
    pub fn create_sync(self, reader: Box<dyn SortedPointReader>) -> Result<BuildResult> {
        self.create(reader)
    }

    fn create(self, reader: Box<dyn SortedPointReader>) -> Result<BuildResult> {
        let start = Instant::now();
        let leaf_level = self.leaf_dim.level();

        let shared = Arc::new(Shared {
            leaf_queue: Mutex::new(WorkQueue::new()),
            leaf_loaded: AtomicBool::new(false),
            producer_error: Mutex::new(None),
            release: ReleaseGate::new(),
        });

        let counts = Arc::new(Mutex::new((0u64, 0u64)));
        {
            let shared = Arc::clone(&shared);
            let data = Arc::clone(&self.data);
            let front = Arc::clone(&self.front);
            let leaf_dim = self.leaf_dim;
            let load_per_thread = self.config.load_per_thread as usize;
            let counts = Arc::clone(&counts);
            std::thread::Builder::new()
                .name("point producer".into())
                .spawn(move || {
                    match produce(reader, &data, leaf_dim, load_per_thread, &shared) {
                        Ok((points, skipped)) => {
                            *counts.lock().unwrap() = (points, skipped);
                            log::info!("leaf level loaded: {points} points, {skipped} skipped");
                        }
                        Err(e) => {
                            *shared.producer_error.lock().unwrap() = Some(e);
                        }
                    }
                    shared.leaf_loaded.store(true, Ordering::Release);
                    front.notify_leaf_lvl_loaded();
                })
                .expect("failed to spawn the point producer thread");
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_threads)
            .thread_name(|i| format!("hierarchy worker {i}"))
            .build()
            .map_err(|e| Error::Invariant(format!("cannot build the worker pool: {e}")))?;

        let mut run = BuildRun {
            data: &self.data,
            front: &self.front,
            shared: &shared,
            inner_queues: (0..leaf_level).map(|_| WorkQueue::new()).collect(),
            leaf_level,
            n_threads: self.config.n_threads,
            load_per_thread: self.config.load_per_thread as usize,
            mem_limit: self.config.ram_quota,
            pool,
            boundary_merges: 0,
        };

        let build = run.run_passes();
        // Never leave the producer parked behind a failed build.
        shared.release.turn_off();
        if let Some(e) = shared.producer_error.lock().unwrap().take() {
            return Err(e);
        }
        let mut root = build?;

        // The root and its children are the only nodes the pass loop never
        // finalized.
        {
            let mut sink = Sink::End(0);
            for child in root.children_mut() {
                finalize_node(child, &self.data, &self.front, &mut sink)?;
            }
            self.front.notify_insertion_end(1);
            finalize_node(&mut root, &self.data, &self.front, &mut sink)?;
            self.front.notify_insertion_end(1);
            if root.is_leaf() {
                self.front.insert_into_buffer_end(0, &root);
                self.front.notify_insertion_end(1);
            }
        }

        let (point_count, skipped_points) = *counts.lock().unwrap();
        let result = BuildResult {
            root,
            duration_ms: start.elapsed().as_millis(),
            point_count,
            skipped_points,
            producer_parks: shared.release.parks.load(Ordering::Relaxed),
            boundary_merges: run.boundary_merges,
        };
        log::info!(
            "hierarchy complete in {} ms ({} boundary merges)",
            result.duration_ms,
            result.boundary_merges
        );
        Ok(result)
    }
}

/// Reads the sorted stream, cuts it into one leaf node per occupied leaf
/// cell, and ships work items of `load_per_thread` nodes.
fn produce(
    mut reader: Box<dyn SortedPointReader>,
    data: &OctreeData,
    leaf_dim: OctreeDimensions,
    load_per_thread: usize,
    shared: &Shared,
) -> Result<(u64, u64)> {
    let mut node_list = NodeList::new();
    let mut group: Vec<u64> = Vec::new();
    let mut group_code: Option<Morton> = None;
    let mut accepted = 0u64;
    let mut skipped = 0u64;
    let mut deferred: Option<Error> = None;

    reader.read(&mut |raw| {
        if deferred.is_some() {
            return;
        }
        let Some(surfel) = Surfel::from_point(raw.pos, raw.normal) else {
            skipped += 1;
            return;
        };

        let cell = leaf_dim.calc_morton(surfel.center);
        if group_code != Some(cell) {
            if let Some(code) = group_code.take() {
                debug_assert!(code < cell, "point stream is not morton sorted");
                match Node::new_leaf(code, &group, data) {
                    Ok(node) => {
                        group.clear();
                        node_list.push_back(node);
                        if node_list.len() == load_per_thread {
                            push_leaf_work(shared, std::mem::take(&mut node_list));
                            shared.release.producer_checkpoint();
                        }
                    }
                    Err(e) => {
                        deferred = Some(e);
                        return;
                    }
                }
            }
            group_code = Some(cell);
        }

        match data.surfels.push(surfel) {
            Ok(id) => {
                group.push(id);
                accepted += 1;
            }
            Err(e) => deferred = Some(e),
        }
    })?;

    if let Some(e) = deferred {
        return Err(e);
    }

    if let Some(code) = group_code {
        node_list.push_back(Node::new_leaf(code, &group, data)?);
    }
    if !node_list.is_empty() {
        push_leaf_work(shared, node_list);
    }
    data.surfels.flush()?;

    Ok((accepted, skipped))
}

fn push_leaf_work(shared: &Shared, item: NodeList) {
    shared.leaf_queue.lock().unwrap().push_back(item);
}

struct BuildRun<'a> {
    data: &'a Arc<OctreeData>,
    front: &'a Arc<Front>,
    shared: &'a Shared,
    /// Queues for the levels above the leaves, only touched between
    /// parallel phases. Index equals level.
    inner_queues: Vec<WorkQueue>,
    leaf_level: u8,
    n_threads: usize,
    load_per_thread: usize,
    mem_limit: u64,
    pool: rayon::ThreadPool,
    boundary_merges: u64,
}

impl BuildRun<'_> {
    fn work_len(&self, lvl: u8) -> usize {
        if lvl == self.leaf_level {
            // The lock also keeps the length read from being reordered.
            self.shared.leaf_queue.lock().unwrap().len()
        } else {
            self.inner_queues[lvl as usize].len()
        }
    }

    fn pop_work(&mut self, lvl: u8) -> Option<NodeList> {
        if lvl == self.leaf_level {
            self.shared.leaf_queue.lock().unwrap().pop_front()
        } else {
            self.inner_queues[lvl as usize].pop_front()
        }
    }

    fn push_work(&mut self, lvl: u8, item: NodeList) {
        if lvl == self.leaf_level {
            push_leaf_work(self.shared, item);
        } else {
            self.inner_queues[lvl as usize].push_back(item);
        }
    }

    fn all_work_finished(&self) -> bool {
        (1..=self.leaf_level).all(|lvl| self.work_len(lvl) == 0)
    }

    fn run_passes(&mut self) -> Result<Box<Node>> {
        while !self.shared.leaf_loaded.load(Ordering::Acquire) || !self.all_work_finished() {
            if let Some(e) = self.shared.producer_error.lock().unwrap().take() {
                return Err(e);
            }

            let is_last_pass = self.shared.leaf_loaded.load(Ordering::Acquire);
            log::debug!("construction pass begins (last: {is_last_pass})");

            // The soft limit is best effort: whatever release could not
            // relieve in one pass is accepted.
            self.shared.release.turn_off();

            let mut lvl = self.leaf_level;
            while lvl > 0 {
                match self.process_level(lvl, is_last_pass)? {
                    LevelOutcome::NextPass => break,
                    LevelOutcome::Ascend => {
                        if is_last_pass {
                            self.finalize_level_tail(lvl)?;
                        }
                        lvl -= 1;
                    }
                }
            }
        }

        let mut root_item = self
            .pop_work(0)
            .ok_or_else(|| Error::Input("point stream was empty".into()))?;
        let root_node = root_item
            .pop_front()
            .ok_or_else(|| Error::Invariant("empty work item at the root level".into()))?;
        if !root_item.is_empty() || self.work_len(0) != 0 {
            return Err(Error::Invariant(
                "construction finished with more than one root".into(),
            ));
        }
        debug_assert_eq!(root_node.morton(), Morton::ROOT);
        Ok(Box::new(root_node))
    }

    fn process_level(&mut self, lvl: u8, is_last_pass: bool) -> Result<LevelOutcome> {
        let mut work_list_size = self.work_len(lvl);
        log::trace!("processing level {lvl}, {work_list_size} work items");

        while work_list_size > 0 {
            let mut ascend = false;
            let dispatched = if work_list_size > self.n_threads {
                self.n_threads
            } else {
                ascend = true;
                if lvl != self.leaf_level
                    || is_last_pass
                    || self.shared.release.is_producer_parked()
                {
                    work_list_size
                } else {
                    // The producer may still be extending the last leaf
                    // item's trailing sibling group.
                    work_list_size - 1
                }
            };

            if dispatched == 0 {
                // Only the spared tail item remains; wait for the producer
                // to extend it.
                std::thread::yield_now();
                return Ok(LevelOutcome::Ascend);
            }

            let no_more_work = work_list_size == dispatched;
            let inputs: Vec<NodeList> = (0..dispatched)
                .map(|_| self.pop_work(lvl).expect("dispatch counted the items"))
                .collect();

            let data = Arc::clone(self.data);
            let front = Arc::clone(self.front);
            let may_push_back = no_more_work && !is_last_pass;
            let worker_results: Vec<Result<WorkerOutput>> = self.pool.install(|| {
                inputs
                    .into_par_iter()
                    .enumerate()
                    .map(|(idx, input)| {
                        process_work_item(
                            input,
                            idx,
                            may_push_back && idx == dispatched - 1,
                            &data,
                            &front,
                        )
                    })
                    .collect()
            });

            let mut outputs = Vec::with_capacity(dispatched);
            for result in worker_results {
                let output = result?;
                if let Some(push_back) = output.push_back {
                    self.push_work(lvl, push_back);
                }
                outputs.push(output.list);
            }

            self.reconcile_outputs(lvl, outputs)?;
            self.front.notify_insertion_end(dispatched);

            if self.shared.release.is_releasing() {
                if mem_stats::total_allocated() < self.mem_limit {
                    self.shared.release.turn_off();
                }
            } else if mem_stats::total_allocated() > self.mem_limit {
                self.shared.release.turn_on();
            }

            work_list_size = self.work_len(lvl);
            let leaf_work = if lvl == self.leaf_level {
                work_list_size
            } else {
                self.work_len(self.leaf_level)
            };

            if !is_last_pass
                && work_list_size < self.n_threads
                && self.work_len(lvl - 1) < leaf_work
            {
                // More work is available in the deeper levels; restart from
                // the leaves.
                return Ok(LevelOutcome::NextPass);
            }

            if ascend {
                break;
            }
        }

        if work_list_size == 0 && !is_last_pass && lvl == self.leaf_level {
            // Nothing to do until the producer delivers more.
            std::thread::yield_now();
            return Ok(LevelOutcome::NextPass);
        }

        Ok(LevelOutcome::Ascend)
    }

    /// Stitches the worker outputs together left to right, resolving
    /// boundary duplicates and load balancing undersized lists, then feeds
    /// the next shallower level.
    fn reconcile_outputs(&mut self, lvl: u8, mut outputs: Vec<NodeList>) -> Result<()> {
        let next_lvl = lvl - 1;
        if outputs.is_empty() {
            return Ok(());
        }

        let mut prepend_at = 0usize;

        if !outputs[0].is_empty() {
            if let Some(mut queue_back) = self.pop_queue_back(next_lvl) {
                // The previous iteration's trailing list and this
                // iteration's first output can share a parent.
                self.merge_or_push_work(
                    &mut queue_back,
                    &mut outputs[0],
                    next_lvl,
                    &mut Sink::At(&mut prepend_at),
                )?;
            } else if outputs[0].len() > 1 {
                // No previous list to merge with: the first node's children
                // are final now.
                let first = outputs[0].front_mut().expect("checked non-empty");
                finalize_children_of(
                    first,
                    self.data,
                    self.front,
                    &mut Sink::At(&mut prepend_at),
                )?;
            }
        }

        let n_outputs = outputs.len();
        for i in 0..n_outputs.saturating_sub(1) {
            let mut prev = std::mem::take(&mut outputs[i]);
            self.merge_or_push_work(&mut prev, &mut outputs[i + 1], next_lvl, &mut Sink::End(i))?;
        }

        // The last output is never collapsed: its trailing node can belong
        // to a sibling group that continues in the next iteration.
        let mut last = outputs.pop().expect("checked non-empty");
        if !last.is_empty() {
            let last_idx = n_outputs - 1;
            if let Some(mut queue_back) = self.pop_queue_back(next_lvl) {
                self.remove_boundary_duplicate(
                    &mut queue_back,
                    &mut last,
                    &mut Sink::End(last_idx),
                )?;
                if !queue_back.is_empty() {
                    self.push_work(next_lvl, queue_back);
                }
            }
            self.push_work(next_lvl, last);
        }

        Ok(())
    }

    fn pop_queue_back(&mut self, lvl: u8) -> Option<NodeList> {
        debug_assert!(lvl < self.leaf_level);
        self.inner_queues[lvl as usize].pop_back()
    }

    /// Merges `prev` into `next` when it is too small to be worth its own
    /// work item, otherwise pushes it to the level queue.
    fn merge_or_push_work(
        &mut self,
        prev: &mut NodeList,
        next: &mut NodeList,
        next_lvl: u8,
        sink: &mut Sink,
    ) -> Result<()> {
        self.remove_boundary_duplicate(prev, next, sink)?;

        if prev.len() < self.load_per_thread {
            while let Some(node) = prev.pop_back() {
                next.push_front(node);
            }
        } else {
            if let Some(mut queue_back) = self.pop_queue_back(next_lvl) {
                self.remove_boundary_duplicate(&mut queue_back, prev, sink)?;
                if !queue_back.is_empty() {
                    self.push_work(next_lvl, queue_back);
                }
            }
            self.push_work(next_lvl, std::mem::take(prev));
        }
        Ok(())
    }

    /// Adjacent lists can end and begin with the same parent when one
    /// sibling group was split across two workers. The duplicate pair is
    /// collapsed into one node owning the union of the children.
    fn remove_boundary_duplicate(
        &mut self,
        prev: &mut NodeList,
        next: &mut NodeList,
        sink: &mut Sink,
    ) -> Result<()> {
        let (Some(prev_last), Some(next_first)) = (prev.back_mut(), next.front_mut()) else {
            return Ok(());
        };

        if prev_last.morton() == next_first.morton() {
            log::trace!("merging boundary duplicate {}", next_first.morton());
            self.boundary_merges += 1;

            let mut duplicate = prev.pop_back().expect("back_mut saw it");
            let next_first = next.front_mut().expect("front_mut saw it");
            let mut merged = duplicate.take_children();
            merged.append(&mut next_first.take_children());
            next_first.set_children(merged);

            for child in next_first.children_mut() {
                // The merge relocated the children; restore the back
                // references of any already finalized child before the
                // guard below skips it.
                child.rebind_children();
                finalize_node(child, self.data, self.front, sink)?;
            }
        } else {
            // Both boundary nodes keep their children; those child arrays
            // are final now, on both sides.
            finalize_children_of(prev_last, self.data, self.front, sink)?;
            let next_first = next.front_mut().expect("front_mut saw it");
            finalize_children_of(next_first, self.data, self.front, sink)?;
        }
        Ok(())
    }

    /// On the last pass the trailing work item of the level below holds an
    /// uncollapsed node whose children are final but not yet finalized.
    fn finalize_level_tail(&mut self, lvl: u8) -> Result<()> {
        let next_lvl = (lvl - 1) as usize;
        let data = self.data;
        let front = self.front;
        let Some(last_list) = self.inner_queues[next_lvl].back_mut() else {
            return Ok(());
        };
        let Some(last_node) = last_list.back_mut() else {
            return Ok(());
        };
        let mut sink = Sink::End(0);
        finalize_children_of(last_node, data, front, &mut sink)?;
        front.notify_insertion_end(1);
        Ok(())
    }
}

enum LevelOutcome {
    /// Move one level up.
    Ascend,
    /// Restart the pass from the leaf level.
    NextPass,
}

/// One worker's share of a level iteration: collapse every complete sibling
/// group of the input into an inner node of the level above.
fn process_work_item(
    mut input: NodeList,
    item_idx: usize,
    may_push_back_tail: bool,
    data: &OctreeData,
    front: &Front,
) -> Result<WorkerOutput> {
    let mut output = NodeList::new();
    let mut push_back = None;
    let mut is_boundary_group = true;

    while let Some(head) = input.pop_front() {
        let parent_code = head.morton().traverse_up();
        let mut siblings = vec![head];
        while input
            .front()
            .is_some_and(|node| node.morton().traverse_up() == parent_code)
        {
            siblings.push(input.pop_front().expect("front saw it"));
        }

        let is_last_group = input.is_empty();
        if is_last_group && may_push_back_tail {
            // Hand the group back: members may still arrive next pass.
            push_back = Some(NodeList::from(siblings));
            break;
        }

        if is_last_group {
            is_boundary_group = true;
        }

        let mut sink = Sink::End(item_idx);
        let mut node = Node::new_inner(parent_code, siblings);
        if !is_boundary_group {
            // Interior sibling groups can no longer be rebuilt by boundary
            // merging, so their members' child arrays are final.
            finalize_children_of(&mut node, data, front, &mut sink)?;
        }
        output.push_back(node);
        is_boundary_group = false;
    }

    Ok(WorkerOutput { list: output, push_back })
}

/// Finalizes a node in its final heap home: draws its sample, wires its
/// children's back references, and hands finished leaves to the front.
/// Guarded to run at most once per node.
fn finalize_node(node: &mut Node, data: &OctreeData, front: &Front, sink: &mut Sink) -> Result<()> {
    if node.children().is_empty() || node.children()[0].has_parent() {
        return Ok(());
    }

    node.assign_sample(data)?;

    let node_ptr: *mut Node = node;
    for child in node.children_mut() {
        child.set_parent(node_ptr);
        if child.is_leaf() {
            sink.insert(front, child);
        }
    }
    Ok(())
}

fn finalize_children_of(
    parent: &mut Node,
    data: &OctreeData,
    front: &Front,
    sink: &mut Sink,
) -> Result<()> {
    for child in parent.children_mut() {
        finalize_node(child, data, front, sink)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortingMode;
    use crate::data_structures::vector::{vec3f, Vec3f32};
    use crate::disk::point_file::{PointFileWriter, RawPoint};
    use crate::disk::sort_reader::SortPointReader;
    use std::path::Path;

    struct Built {
        result: BuildResult,
        data: Arc<OctreeData>,
        front: Arc<Front>,
        dim: OctreeDimensions,
        _dir: tempfile::TempDir,
    }

    fn write_points(path: &Path, positions: &[Vec3f32]) {
        let mut writer = PointFileWriter::create(path).unwrap();
        for &pos in positions {
            writer
                .write(&RawPoint {
                    pos,
                    normal: vec3f(1.0, 0.0, 0.0),
                })
                .unwrap();
        }
        writer.finish().unwrap();
    }

    fn build(positions: &[Vec3f32], max_level: u8, config: RuntimeConfig) -> Built {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("points.bin");
        write_points(&input, positions);

        let reader = SortPointReader::new(&input, max_level, SortingMode::FullSort).unwrap();
        let dim = *reader.dimensions();

        let data = Arc::new(OctreeData::create(dir.path()).unwrap());
        let front = Arc::new(Front::new(dim, config.n_threads, config.ram_quota));
        let builder = HierarchyBuilder::new(Arc::clone(&data), Arc::clone(&front), dim, config);
        let result = builder.create_sync(Box::new(reader)).unwrap();

        Built {
            result,
            data,
            front,
            dim,
            _dir: dir,
        }
    }

    fn small_config() -> RuntimeConfig {
        RuntimeConfig {
            n_threads: 4,
            load_per_thread: 4,
            ..Default::default()
        }
    }

    /// Walks the finished hierarchy checking the structural invariants:
    /// parent back references, sorted distinct children one level deeper,
    /// and sample containment in the node's cell.
    fn check_invariants(built: &Built, node: &Node, expected_parent: Option<*const Node>) -> u64 {
        match expected_parent {
            None => assert!(node.parent().is_none(), "root must have no parent"),
            Some(parent) => {
                assert!(std::ptr::eq(node.parent_ptr(), parent as *mut Node));
            }
        }

        let node_box = built.dim.at_level(node.level()).morton_box(&node.morton());
        let ids = built
            .data
            .indices
            .read_range(node.index_offset(), node.index_size())
            .unwrap();
        for id in ids {
            let surfel = built.data.surfels.get(id).unwrap();
            assert!(
                node_box.contains(surfel.center),
                "surfel escapes its node box at level {}",
                node.level()
            );
        }

        let mut leaf_points = if node.is_leaf() {
            assert!(node.children().is_empty());
            node.index_size() as u64
        } else {
            0
        };

        for pair in node.children().windows(2) {
            assert!(pair[0].morton() < pair[1].morton());
        }
        for child in node.children() {
            assert_eq!(child.morton().traverse_up(), node.morton());
            assert_eq!(child.level(), node.level() + 1);
            leaf_points += check_invariants(built, child, Some(node as *const Node));
        }
        leaf_points
    }

    #[test]
    fn single_point_yields_single_leaf_chain() {
        let built = build(&[vec3f(0.4, 0.4, 0.4)], 3, small_config());
        let root = &built.result.root;
        assert_eq!(root.morton(), Morton::ROOT);

        // No branching anywhere: a chain down to the single leaf.
        let mut node: &Node = root;
        while !node.is_leaf() {
            assert_eq!(node.children().len(), 1);
            node = &node.children()[0];
        }
        assert_eq!(node.index_size(), 1);
        assert_eq!(node.level(), 3);

        let leaf_points = check_invariants(&built, root, None);
        assert_eq!(leaf_points, 1);
    }

    #[test]
    fn coinciding_points_share_one_leaf() {
        let positions = vec![vec3f(0.25, 0.5, 0.75); 7];
        let built = build(&positions, 4, small_config());
        let leaf_points = check_invariants(&built, &built.result.root, None);
        assert_eq!(leaf_points, 7);

        // Exactly one leaf carries the full count.
        let mut node: &Node = &built.result.root;
        while !node.is_leaf() {
            assert_eq!(node.children().len(), 1);
            node = &node.children()[0];
        }
        assert_eq!(node.index_size(), 7);
        assert_eq!(built.front.inserted_leaves(), 1);
    }

    #[test]
    fn eight_octants_fill_every_child_slot() {
        // One point per level-1 octant: the root ends up with eight leaf
        // children.
        let mut positions = Vec::new();
        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    positions.push(vec3f(
                        0.25 + 0.5 * x as f32,
                        0.25 + 0.5 * y as f32,
                        0.25 + 0.5 * z as f32,
                    ));
                }
            }
        }
        let built = build(&positions, 1, small_config());
        let root = &built.result.root;
        assert_eq!(root.children().len(), 8);
        assert!(root.children().iter().all(|c| c.is_leaf()));
        check_invariants(&built, root, None);
    }

    #[test]
    fn shared_octant_splits_one_level_down() {
        // All points in the level-1 octant at the origin, spread across its
        // eight level-2 children. With the anchor below, the cloud
        // normalizes with scale 1 and origin 0.05, putting the cluster at
        // the normalized coordinates 0.0 and 0.3.
        let mut positions = Vec::new();
        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    positions.push(vec3f(
                        0.05 + 0.3 * x as f32,
                        0.05 + 0.3 * y as f32,
                        0.05 + 0.3 * z as f32,
                    ));
                }
            }
        }
        // An anchor point in the far corner keeps the normalization from
        // collapsing the cluster onto the whole cube.
        positions.push(vec3f(1.05, 1.05, 1.05));

        let built = build(&positions, 2, small_config());
        let root = &built.result.root;
        check_invariants(&built, root, None);

        let first_octant = &root.children()[0];
        assert_eq!(first_octant.children().len(), 8);
        assert!(first_octant.children().iter().all(|c| c.is_leaf()));
    }

    #[test]
    fn lattice_exercises_parallel_merging() {
        // A 16x16x16 lattice: 4096 points, every leaf distinct at level 4.
        let mut positions = Vec::new();
        for x in 0..16 {
            for y in 0..16 {
                for z in 0..16 {
                    positions.push(vec3f(
                        (x as f32 + 0.5) / 16.0,
                        (y as f32 + 0.5) / 16.0,
                        (z as f32 + 0.5) / 16.0,
                    ));
                }
            }
        }

        // A work item size that does not divide the sibling group size, so
        // groups straddle worker boundaries and the merge path runs.
        let config = RuntimeConfig {
            n_threads: 4,
            load_per_thread: 10,
            ..Default::default()
        };
        let built = build(&positions, 4, config);
        let root = &built.result.root;

        let leaf_points = check_invariants(&built, root, None);
        assert_eq!(leaf_points, 4096);
        assert_eq!(built.result.point_count, 4096);

        // A full lattice: every inner node has exactly eight children.
        fn check_full(node: &Node) {
            if !node.is_leaf() {
                assert_eq!(node.children().len(), 8);
                for child in node.children() {
                    check_full(child);
                }
            }
        }
        check_full(root);

        assert!(built.result.boundary_merges > 0);

        let (nodes, _) = root.subtree_statistics();
        // 1 + 8 + 64 + 512 + 4096
        assert_eq!(nodes, 4681);
    }

    #[test]
    fn front_receives_all_leaves_in_morton_order() {
        let mut positions = Vec::new();
        for i in 0..64 {
            let f = (i as f32 + 0.5) / 64.0;
            positions.push(vec3f(f, (f * 7.0).fract(), (f * 3.0).fract()));
        }
        let built = build(&positions, 5, small_config());
        check_invariants(&built, &built.result.root, None);

        // Every leaf was announced to the front exactly once.
        fn count_leaves(node: &Node) -> u64 {
            if node.is_leaf() {
                1
            } else {
                node.children().iter().map(count_leaves).sum()
            }
        }
        assert_eq!(built.front.inserted_leaves(), count_leaves(&built.result.root));
    }

    #[test]
    fn release_mode_parks_the_producer() {
        // Thousands of one-node work items against a zero quota: the
        // builder enters release mode on its first iteration, long before
        // the producer has pushed its last item.
        let mut positions = Vec::new();
        for i in 0..4096 {
            let f = (i as f32 + 0.5) / 4096.0;
            positions.push(vec3f(f, (f * 13.0).fract(), (f * 5.0).fract()));
        }

        let config = RuntimeConfig {
            n_threads: 1,
            load_per_thread: 1,
            ram_quota: 0,
            ..Default::default()
        };
        let built = build(&positions, 7, config);
        check_invariants(&built, &built.result.root, None);
        assert_eq!(built.result.point_count, 4096);
        assert!(
            built.result.producer_parks > 0,
            "producer never blocked on the release handshake"
        );
    }

    #[test]
    fn empty_input_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("points.bin");
        write_points(&input, &[]);

        let reader = SortPointReader::new(&input, 3, SortingMode::FullSort).unwrap();
        let dim = *reader.dimensions();
        let data = Arc::new(OctreeData::create(dir.path()).unwrap());
        let front = Arc::new(Front::new(dim, 2, u64::MAX));
        let builder =
            HierarchyBuilder::new(data, front, dim, RuntimeConfig::default());
        assert!(matches!(
            builder.create_sync(Box::new(reader)),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn zero_normal_points_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("points.bin");
        {
            let mut writer = PointFileWriter::create(&input).unwrap();
            for i in 0..8 {
                let f = (i as f32 + 0.5) / 8.0;
                writer
                    .write(&RawPoint {
                        pos: vec3f(f, f, f),
                        normal: if i % 2 == 0 {
                            vec3f(0.0, 1.0, 0.0)
                        } else {
                            vec3f(0.0, 0.0, 0.0)
                        },
                    })
                    .unwrap();
            }
            writer.finish().unwrap();
        }

        let reader = SortPointReader::new(&input, 3, SortingMode::FullSort).unwrap();
        let dim = *reader.dimensions();
        let data = Arc::new(OctreeData::create(dir.path()).unwrap());
        let front = Arc::new(Front::new(dim, 2, u64::MAX));
        let builder = HierarchyBuilder::new(
            Arc::clone(&data),
            front,
            dim,
            RuntimeConfig {
                n_threads: 2,
                ..Default::default()
            },
        );
        let result = builder.create_sync(Box::new(reader)).unwrap();
        assert_eq!(result.point_count, 4);
        assert_eq!(result.skipped_points, 4);
        let (_, surfels) = result.root.subtree_statistics();
        assert!(surfels >= 4);
    }
}
