//! Visualization front of a hierarchy under construction. The front keeps
//! its nodes sorted in hierarchy width order (depth-first, left to right)
//! at all times. Construction workers insert finished leaves through
//! per-thread buffers which are spliced into a pending list at the end of
//! each creation iteration, in worker index order; the tracking method
//! splices the pending list at the cut's tail, which preserves the global
//! Morton order because construction proceeds in Morton order within the
//! leaf level.
//!
//! Tracking walks one segment of the cut per frame, pruning sibling groups
//! whose parent projects small enough, branching nodes that project too
//! large, and rendering everything that survives frustum culling.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::octree::dims::OctreeDimensions;
use crate::octree::mem as mem_stats;
use crate::octree::node::Node;
use crate::renderer::loader::NodeLoader;
use crate::renderer::CutRenderer;
use crate::tools::FrameStats;

/// The fraction of the front processed per frame is one over this.
pub const SEGMENTS_PER_FRONT: usize = 30;

/// A node pointer stored in the front. Nodes enter the front only after
/// their owning child array reached its final heap address, so the pointer
/// stays valid until the octree is dropped.
#[derive(Copy, Clone, PartialEq, Eq)]
struct FrontRef(NonNull<Node>);

impl FrontRef {
    fn node<'a>(&self) -> &'a Node {
        // Safety: see the type invariant above; the front never outlives the
        // octree that owns the nodes.
        unsafe { self.0.as_ref() }
    }
}

// Safety: FrontRef crosses threads only through the insertion buffers, and
// dereferences happen on the tracking thread against finalized nodes.
unsafe impl Send for FrontRef {}

#[derive(Default)]
struct Pending {
    list: Vec<FrontRef>,
    inserted_leaves: u64,
}

struct TrackState {
    nodes: Vec<FrontRef>,
    cursor: usize,
}

pub struct Front {
    /// Per construction thread insertion buffers, lock free from the
    /// worker's point of view (each worker only touches its own index).
    buffers: Vec<Mutex<Vec<FrontRef>>>,
    /// Nodes waiting to be spliced into the cut at the next frame.
    pending: Mutex<Pending>,
    /// Set once the producer has read the whole leaf level.
    leaf_lvl_loaded: AtomicBool,
    track: Mutex<TrackState>,
    leaf_dim: OctreeDimensions,
    ram_limit: u64,
}

impl Front {
    pub fn new(leaf_dim: OctreeDimensions, n_threads: usize, ram_limit: u64) -> Self {
        Self {
            buffers: (0..n_threads.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            pending: Mutex::new(Pending::default()),
            leaf_lvl_loaded: AtomicBool::new(false),
            track: Mutex::new(TrackState {
                nodes: Vec::new(),
                cursor: 0,
            }),
            leaf_dim,
            ram_limit,
        }
    }

    pub fn leaf_dim(&self) -> &OctreeDimensions {
        &self.leaf_dim
    }

    /// Appends a node to the calling worker's buffer.
    pub fn insert_into_buffer_end(&self, thread_idx: usize, node: &Node) {
        debug_assert!(node.has_parent() || node.level() == 0);
        self.buffers[thread_idx]
            .lock()
            .unwrap()
            .push(FrontRef(NonNull::from(node)));
    }

    /// Inserts into a worker's buffer at a caller-managed position. Used by
    /// the boundary reconciliation step, whose nodes sort before everything
    /// the first worker inserted this iteration.
    pub fn insert_into_buffer_at(&self, thread_idx: usize, at: usize, node: &Node) {
        debug_assert!(node.has_parent());
        self.buffers[thread_idx]
            .lock()
            .unwrap()
            .insert(at, FrontRef(NonNull::from(node)));
    }

    /// Moves every thread buffer into the pending list, in worker index
    /// order. Called once per creation iteration after the workers joined.
    pub fn notify_insertion_end(&self, dispatched_threads: usize) {
        if dispatched_threads == 0 {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        for buffer in &self.buffers {
            let mut buffer = buffer.lock().unwrap();
            pending.inserted_leaves += buffer.len() as u64;
            pending.list.append(&mut buffer);
        }
    }

    pub fn notify_leaf_lvl_loaded(&self) {
        self.leaf_lvl_loaded.store(true, Ordering::Release);
        log::debug!("leaf level fully loaded");
    }

    pub fn is_leaf_lvl_loaded(&self) -> bool {
        self.leaf_lvl_loaded.load(Ordering::Acquire)
    }

    pub fn inserted_leaves(&self) -> u64 {
        self.pending.lock().unwrap().inserted_leaves
    }

    pub fn len(&self) -> usize {
        self.track.lock().unwrap().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classic front initialization for an already constructed hierarchy:
    /// the cut starts as just the root.
    pub fn insert_root(&self, root: &Node, loader: &NodeLoader) {
        let mut state = self.track.lock().unwrap();
        debug_assert!(state.nodes.is_empty());
        state.nodes.push(FrontRef(NonNull::from(root)));
        loader.request_load(root);
        self.leaf_lvl_loaded.store(true, Ordering::Release);
    }

    /// Processes one frame: splices pending leaves, walks one segment of the
    /// cut applying prune/branch/cull decisions, and brackets the renderer's
    /// frame.
    pub fn track_front(
        &self,
        renderer: &mut dyn CutRenderer,
        loader: &NodeLoader,
        proj_thresh: f32,
    ) -> FrameStats {
        let start = Instant::now();
        renderer.begin_frame();

        let mut state = self.track.lock().unwrap();
        {
            let mut pending = self.pending.lock().unwrap();
            state.nodes.append(&mut pending.list);
        }

        let mut processed = 0usize;
        if !state.nodes.is_empty() {
            if state.cursor >= state.nodes.len() {
                state.cursor = 0;
            }
            let per_frame = state.nodes.len().div_ceil(SEGMENTS_PER_FRONT);
            let mut last_parent: *mut Node = std::ptr::null_mut();
            while processed < per_frame && state.cursor < state.nodes.len() {
                self.track_node(&mut state, &mut last_parent, renderer, loader, proj_thresh);
                processed += 1;
            }
        }

        let traversal = start.elapsed();
        let render_start = Instant::now();
        let rendered_points = renderer.end_frame();

        FrameStats {
            traversal_ms: traversal.as_secs_f64() * 1e3,
            render_ms: render_start.elapsed().as_secs_f64() * 1e3,
            rendered_points,
            front_size: state.nodes.len(),
            segment_size: processed,
        }
    }

    fn track_node(
        &self,
        state: &mut TrackState,
        last_parent: &mut *mut Node,
        renderer: &mut dyn CutRenderer,
        loader: &NodeLoader,
        proj_thresh: f32,
    ) {
        let node = state.nodes[state.cursor].node();

        // A failed prune check for one sibling covers the whole group, so
        // the check is skipped while the parent stays the same.
        let parent_ptr = node.parent_ptr();
        if !parent_ptr.is_null() && parent_ptr != *last_parent {
            // Safety: a non-null parent pointer targets a finalized node in
            // the same tree.
            let parent = unsafe { &*parent_ptr };
            let (prune, parent_cullable) =
                self.check_prune(state, parent, parent_ptr, renderer, loader, proj_thresh);
            *last_parent = parent_ptr;
            if prune {
                self.prune(state, parent, parent_ptr, parent_cullable, renderer, loader);
                return;
            }
        }

        let node_dim = self.leaf_dim.at_level(node.level());
        let node_box = node_dim.morton_box(&node.morton());
        let cullable = renderer.is_cullable(&node_box);

        if self.check_branch(node, &node_box, cullable, renderer, loader, proj_thresh) {
            self.branch(state, renderer);
            return;
        }

        if !cullable && node.is_loaded() {
            renderer.render(node);
        }
        state.cursor += 1;
    }

    /// A parent is worth pruning to when it is culled away entirely or
    /// projects below the threshold, all of its children sit contiguously in
    /// the front at the cursor, the group is provably complete, and its own
    /// cloud is resident.
    fn check_prune(
        &self,
        state: &TrackState,
        parent: &Node,
        parent_ptr: *mut Node,
        renderer: &mut dyn CutRenderer,
        loader: &NodeLoader,
        proj_thresh: f32,
    ) -> (bool, bool) {
        let parent_dim = self.leaf_dim.at_level(parent.level());
        let parent_box = parent_dim.morton_box(&parent.morton());

        let cullable = renderer.is_cullable(&parent_box);
        let mut prune = cullable || renderer.is_renderable(&parent_box, proj_thresh);

        if prune {
            let mut scan = state.cursor;
            while scan < state.nodes.len() && state.nodes[scan].node().parent_ptr() == parent_ptr
            {
                scan += 1;
            }
            let n_siblings = scan - state.cursor;
            let group_at_tail = scan == state.nodes.len();

            // The cut's tail can be an incomplete sibling group while the
            // leaf level is still streaming in.
            if (!self.is_leaf_lvl_loaded() && group_at_tail)
                || n_siblings != parent.children().len()
            {
                prune = false;
            }
        }

        if prune && !parent.is_loaded() {
            loader.request_load(parent);
            prune = false;
        }

        (prune, cullable)
    }

    fn prune(
        &self,
        state: &mut TrackState,
        parent: &Node,
        parent_ptr: *mut Node,
        parent_cullable: bool,
        renderer: &mut dyn CutRenderer,
        loader: &NodeLoader,
    ) {
        log::trace!("prune to {}", parent.morton());
        let cursor = state.cursor;
        let n_siblings = parent.children().len();
        debug_assert!(state.nodes[cursor].node().parent_ptr() == parent_ptr);

        for removed in state.nodes.drain(cursor..cursor + n_siblings) {
            loader.request_unload(removed.node());
        }

        // Under memory pressure a pruned group of leaves is evicted from RAM
        // entirely; the front then cannot branch back into this subtree.
        if mem_stats::total_allocated() > self.ram_limit
            && parent.children().first().is_some_and(|c| c.is_leaf())
        {
            loader.request_release_children(parent);
        }

        state.nodes.insert(cursor, FrontRef(NonNull::from(parent)));
        state.cursor = cursor + 1;

        if !parent_cullable && parent.is_loaded() {
            renderer.render(parent);
        }
    }

    /// A node branches when it projects too large, is not culled, has a
    /// resident child array, and every child cloud is already loaded. Loads
    /// for missing children are requested and the branch retried on a later
    /// frame.
    fn check_branch(
        &self,
        node: &Node,
        node_box: &crate::data_structures::bbox::Bbox,
        cullable: bool,
        renderer: &mut dyn CutRenderer,
        loader: &NodeLoader,
        proj_thresh: f32,
    ) -> bool {
        if node.is_leaf() || node.children().is_empty() {
            return false;
        }

        let mut children_loaded = true;
        for child in node.children() {
            if !child.is_loaded() {
                loader.request_load(child);
                children_loaded = false;
            }
        }

        children_loaded && !renderer.is_renderable(node_box, proj_thresh) && !cullable
    }

    fn branch(&self, state: &mut TrackState, renderer: &mut dyn CutRenderer) {
        let cursor = state.cursor;
        let node = state.nodes[cursor].node();
        log::trace!("branch {}", node.morton());

        let child_dim = self.leaf_dim.at_level(node.level() + 1);
        let children = node.children();

        state.nodes.splice(
            cursor..cursor + 1,
            children.iter().map(|child| FrontRef(NonNull::from(child))),
        );

        for child in children {
            let child_box = child_dim.morton_box(&child.morton());
            if !renderer.is_cullable(&child_box) && child.is_loaded() {
                renderer.render(child);
            }
        }

        state.cursor = cursor + children.len();
    }

    /// Debug helper: the mortons of the current cut, in front order.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<crate::data_structures::morton::Morton> {
        self.track
            .lock()
            .unwrap()
            .nodes
            .iter()
            .map(|r| r.node().morton())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::bbox::Bbox;
    use crate::data_structures::morton::{Morton, MortonCode};
    use crate::data_structures::surfel::Surfel;
    use crate::data_structures::vector::vec3f;
    use crate::octree::ext_data::OctreeData;

    /// Scripted renderer: marks boxes renderable once they are at or above
    /// a configured level, and culls nothing unless asked.
    struct MockRenderer {
        renderable_above_extent: f32,
        cull_everything: bool,
        rendered: Vec<Morton>,
    }

    impl MockRenderer {
        fn new(renderable_above_extent: f32) -> Self {
            Self {
                renderable_above_extent,
                cull_everything: false,
                rendered: Vec::new(),
            }
        }
    }

    impl CutRenderer for MockRenderer {
        fn begin_frame(&mut self) {
            self.rendered.clear();
        }

        fn end_frame(&mut self) -> u64 {
            self.rendered.len() as u64
        }

        fn render(&mut self, node: &Node) {
            self.rendered.push(node.morton());
        }

        fn is_cullable(&self, _bbox: &Bbox) -> bool {
            self.cull_everything
        }

        fn is_renderable(&self, bbox: &Bbox, _proj_thresh: f32) -> bool {
            bbox.extent().max_element() <= self.renderable_above_extent
        }
    }

    /// A three level test hierarchy over the unit cube: a root at level 0
    /// with two level 1 children, the first of which has two leaf children
    /// at level 2.
    struct TestTree {
        root: Box<Node>,
        _data: OctreeData,
        _dir: tempfile::TempDir,
    }

    fn push_surfels(data: &OctreeData, n: u32) -> Vec<u64> {
        (0..n)
            .map(|_| {
                data.surfels
                    .push(Surfel::new(
                        vec3f(0.1, 0.1, 0.1),
                        vec3f(0.001, 0.0, 0.0),
                        vec3f(0.0, 0.001, 0.0),
                    ))
                    .unwrap()
            })
            .collect()
    }

    fn build_tree() -> TestTree {
        let dir = tempfile::tempdir().unwrap();
        let data = OctreeData::create(dir.path()).unwrap();

        let leaf_a =
            Node::new_leaf(Morton::build(0, 0, 0, 2), &push_surfels(&data, 5), &data).unwrap();
        let leaf_b =
            Node::new_leaf(Morton::build(1, 0, 0, 2), &push_surfels(&data, 5), &data).unwrap();
        let mut inner_a = Node::new_inner(Morton::build(0, 0, 0, 1), vec![leaf_a, leaf_b]);
        inner_a.assign_sample(&data).unwrap();

        let leaf_c =
            Node::new_leaf(Morton::build(2, 2, 2, 2), &push_surfels(&data, 5), &data).unwrap();
        let mut inner_b = Node::new_inner(Morton::build(1, 1, 1, 1), vec![leaf_c]);
        inner_b.assign_sample(&data).unwrap();

        let mut root = Box::new(Node::new_inner(Morton::ROOT, vec![inner_a, inner_b]));
        root.assign_sample(&data).unwrap();

        // Wire the back references the way finalization does.
        let root_ptr: *mut Node = &mut *root;
        for child in root.children_mut() {
            child.set_parent(root_ptr);
            let child_ptr: *mut Node = child;
            for grandchild in child.children_mut() {
                grandchild.set_parent(child_ptr);
            }
        }

        TestTree {
            root,
            _data: data,
            _dir: dir,
        }
    }

    fn leaf_dim() -> OctreeDimensions {
        OctreeDimensions::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), 2)
    }

    fn front_with_leaves(tree: &TestTree) -> Front {
        let front = Front::new(leaf_dim(), 1, u64::MAX);
        let inner_a = &tree.root.children()[0];
        let inner_b = &tree.root.children()[1];
        for leaf in inner_a.children() {
            front.insert_into_buffer_end(0, leaf);
        }
        front.insert_into_buffer_end(0, &inner_b.children()[0]);
        front.notify_insertion_end(1);
        front.notify_leaf_lvl_loaded();
        front
    }

    #[test]
    fn pending_leaves_splice_at_tail() {
        let _guard = crate::renderer::cloud::GPU_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tree = build_tree();
        let front = front_with_leaves(&tree);
        let mut renderer = MockRenderer::new(0.0);
        let loader = NodeLoader::headless(2, u64::MAX);

        front.track_front(&mut renderer, &loader, 1.0);
        assert_eq!(front.len(), 3);
        assert_eq!(front.inserted_leaves(), 3);

        // Front order is the insertion (morton) order.
        let cut = front.snapshot();
        assert!(cut.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn prune_collapses_sibling_group_to_parent() {
        let _guard = crate::renderer::cloud::GPU_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tree = build_tree();
        let front = front_with_leaves(&tree);
        // Everything projects small: the whole cut wants to prune.
        let mut renderer = MockRenderer::new(10.0);
        let loader = NodeLoader::headless(2, u64::MAX);

        // Frame 1: the parents are not loaded yet, so prune defers and
        // issues loads. With a headless loader, loads are instant.
        front.track_front(&mut renderer, &loader, 1.0);
        // Subsequent frames collapse both sibling groups, then the pair of
        // level 1 siblings into the root.
        for _ in 0..8 {
            front.track_front(&mut renderer, &loader, 1.0);
        }
        let cut = front.snapshot();
        assert_eq!(cut, vec![Morton::ROOT]);
    }

    #[test]
    fn branch_replaces_node_with_children_in_order() {
        let _guard = crate::renderer::cloud::GPU_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tree = build_tree();
        let front = Front::new(leaf_dim(), 1, u64::MAX);
        let loader = NodeLoader::headless(2, u64::MAX);
        front.insert_root(&tree.root, &loader);

        // Nothing is ever small enough to stop descending.
        let mut renderer = MockRenderer::new(0.0);
        for _ in 0..6 {
            front.track_front(&mut renderer, &loader, 1.0);
        }

        let cut = front.snapshot();
        assert_eq!(cut.len(), 3);
        assert!(cut.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(cut[0], Morton::build(0, 0, 0, 2));
    }

    #[test]
    fn culled_nodes_are_kept_but_not_rendered() {
        let _guard = crate::renderer::cloud::GPU_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tree = build_tree();
        let front = front_with_leaves(&tree);
        let mut renderer = MockRenderer::new(0.0);
        renderer.cull_everything = true;
        let loader = NodeLoader::headless(2, u64::MAX);

        let stats = front.track_front(&mut renderer, &loader, 1.0);
        assert_eq!(stats.rendered_points, 0);
        assert_eq!(front.len(), 3);
    }

    #[test]
    fn tail_group_not_pruned_before_leaf_level_done() {
        let _guard = crate::renderer::cloud::GPU_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tree = build_tree();
        let front = Front::new(leaf_dim(), 1, u64::MAX);
        let inner_a = &tree.root.children()[0];
        for leaf in inner_a.children() {
            front.insert_into_buffer_end(0, leaf);
        }
        front.notify_insertion_end(1);
        // Leaf level still streaming: the pair at the tail may be
        // incomplete, so it must survive.
        let mut renderer = MockRenderer::new(10.0);
        let loader = NodeLoader::headless(2, u64::MAX);
        for _ in 0..4 {
            front.track_front(&mut renderer, &loader, 1.0);
        }
        assert_eq!(front.len(), 2);

        front.notify_leaf_lvl_loaded();
        for _ in 0..4 {
            front.track_front(&mut renderer, &loader, 1.0);
        }
        assert_eq!(front.snapshot(), vec![Morton::build(0, 0, 0, 1)]);
    }

    #[test]
    fn stable_cut_is_idempotent() {
        let _guard = crate::renderer::cloud::GPU_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tree = build_tree();
        let front = front_with_leaves(&tree);
        let mut renderer = MockRenderer::new(10.0);
        let loader = NodeLoader::headless(2, u64::MAX);

        for _ in 0..12 {
            front.track_front(&mut renderer, &loader, 1.0);
        }
        let converged = front.snapshot();
        for _ in 0..6 {
            front.track_front(&mut renderer, &loader, 1.0);
        }
        assert_eq!(front.snapshot(), converged);
    }
}
