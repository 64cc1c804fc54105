use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use crate::data_structures::morton::{Morton, MortonCode};
use crate::error::Result;
use crate::octree::ext_data::OctreeData;
use crate::octree::mem as mem_stats;
use crate::renderer::cloud::SurfelCloud;

/// Fraction of each child's sample an inner node keeps for its own level of
/// detail.
pub const PARENT_POINTS_RATIO: f32 = 0.2;

/// Out-of-core octree node. Point data is a range into the shared external
/// index store; the actual surfels live in the external surfel store.
///
/// Ownership: a node exclusively owns its child array and its GPU cloud.
/// `parent` is a non-owning back reference into the same tree, set exactly
/// once when the parent's child array reaches its final heap address, and
/// valid until the root is dropped. Nodes are never moved after their parent
/// pointer is handed out: the child slice is a separate heap allocation, so
/// moving the owning node does not move its children.
pub struct Node {
    morton: Morton,
    parent: AtomicPtr<Node>,
    children: Box<[Node]>,
    index_offset: u64,
    index_size: u32,
    is_leaf: bool,
    cloud: Mutex<Option<SurfelCloud>>,
}

// Safety: the raw parent pointer always targets a node inside the same
// ownership tree. Construction hands nodes between threads only before any
// pointer to them exists; afterwards the set-once atomic parent field and
// the mutex around the cloud are the only cross-thread entry points.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    fn bare(morton: Morton) -> Self {
        mem_stats::notify_alloc(mem::size_of::<Node>() as u64);
        Self {
            morton,
            parent: AtomicPtr::new(ptr::null_mut()),
            children: Box::new([]),
            index_offset: 0,
            index_size: 0,
            is_leaf: false,
            cloud: Mutex::new(None),
        }
    }

    /// Leaf node over an already collected group of surfel ids. Reserves and
    /// fills its index range immediately.
    pub fn new_leaf(morton: Morton, indices: &[u64], data: &OctreeData) -> Result<Self> {
        let mut node = Self::bare(morton);
        node.is_leaf = true;
        node.index_size = indices.len() as u32;
        node.index_offset = data.indices.reserve(node.index_size);
        data.indices.fill(node.index_offset, indices)?;
        Ok(node)
    }

    /// Inner node owning its children. The displayable sample is assigned
    /// later, at finalization time, once merging can no longer rebuild the
    /// child array.
    pub fn new_inner(morton: Morton, children: Vec<Node>) -> Self {
        debug_assert!(!children.is_empty() && children.len() <= 8);
        debug_assert!(children.windows(2).all(|p| p[0].morton < p[1].morton));
        let mut node = Self::bare(morton);
        node.children = children.into_boxed_slice();
        node
    }

    /// Node rebuilt from persisted data, children attached afterwards.
    pub fn from_storage(morton: Morton, index_offset: u64, index_size: u32, is_leaf: bool) -> Self {
        let mut node = Self::bare(morton);
        node.index_offset = index_offset;
        node.index_size = index_size;
        node.is_leaf = is_leaf;
        node
    }

    pub fn morton(&self) -> Morton {
        self.morton
    }

    pub fn level(&self) -> u8 {
        self.morton.level()
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn index_offset(&self) -> u64 {
        self.index_offset
    }

    pub fn index_size(&self) -> u32 {
        self.index_size
    }

    pub fn is_empty(&self) -> bool {
        self.index_size == 0
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Node] {
        &mut self.children
    }

    pub fn take_children(&mut self) -> Vec<Node> {
        mem::take(&mut self.children).into_vec()
    }

    pub fn set_children(&mut self, children: Vec<Node>) {
        debug_assert!(self.children.is_empty());
        self.children = children.into_boxed_slice();
    }

    /// Drops the owned child array to relieve memory pressure. The node does
    /// not become a leaf; the front simply cannot branch into it anymore.
    pub fn release_children(&mut self) {
        self.children = Box::new([]);
    }

    pub fn parent(&self) -> Option<&Node> {
        // Acquire pairs with the Release in set_parent, so a reader that
        // sees the pointer also sees the fully finalized parent.
        unsafe { self.parent.load(Ordering::Acquire).as_ref() }
    }

    pub fn parent_ptr(&self) -> *mut Node {
        self.parent.load(Ordering::Acquire)
    }

    pub(crate) fn has_parent(&self) -> bool {
        !self.parent.load(Ordering::Acquire).is_null()
    }

    /// Transitions the parent pointer from null to `parent`, exactly once.
    pub(crate) fn set_parent(&self, parent: *mut Node) {
        let previous =
            self.parent
                .compare_exchange(ptr::null_mut(), parent, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(previous.is_ok(), "parent pointer set twice");
    }

    /// Repairs the children's back references after this node was relocated
    /// by a boundary merge. Address repair only, the logical parent never
    /// changes; a no-op when the children have not been finalized yet.
    pub(crate) fn rebind_children(&mut self) {
        let me: *mut Node = self;
        for child in self.children.iter() {
            if !child.has_parent() {
                break;
            }
            child.parent.store(me, Ordering::Release);
        }
    }

    /// Draws this node's displayable sample: a uniform sub-sample of each
    /// child's index range, in child order, a `PARENT_POINTS_RATIO` share of
    /// each. Deterministic per node, keyed by the morton code.
    pub(crate) fn assign_sample(&mut self, data: &OctreeData) -> Result<()> {
        debug_assert!(!self.children.is_empty());
        debug_assert!(self.index_size == 0, "sample assigned twice");

        let mut rng = Pcg32::seed_from_u64(self.morton.bits());
        let mut sample = Vec::new();
        for child in self.children.iter() {
            if child.index_size == 0 {
                continue;
            }
            let child_ids = data.indices.read_range(child.index_offset, child.index_size)?;
            let count = ((child.index_size as f32 * PARENT_POINTS_RATIO).ceil() as usize).max(1);
            for _ in 0..count {
                sample.push(child_ids[rng.gen_range(0..child_ids.len())]);
            }
        }

        self.index_size = sample.len() as u32;
        self.index_offset = data.indices.reserve(self.index_size);
        data.indices.fill(self.index_offset, &sample)?;
        Ok(())
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.lock().unwrap().is_some()
    }

    /// Polls the cloud state, driving the Loading to Loaded transition.
    pub fn is_loaded(&self) -> bool {
        match self.cloud.lock().unwrap().as_mut() {
            Some(cloud) => cloud.poll().is_loaded(),
            None => false,
        }
    }

    pub(crate) fn install_cloud(&self, cloud: SurfelCloud) {
        let mut slot = self.cloud.lock().unwrap();
        debug_assert!(slot.is_none(), "cloud installed twice");
        *slot = Some(cloud);
    }

    pub(crate) fn unload_cloud(&self) {
        self.cloud.lock().unwrap().take();
    }

    /// Runs `f` with the resident cloud, if any. Used by the renderer while
    /// recording draw commands.
    pub fn with_cloud<R>(&self, f: impl FnOnce(&SurfelCloud) -> R) -> Option<R> {
        self.cloud.lock().unwrap().as_ref().map(f)
    }

    /// Locks the cloud slot for the duration of command recording.
    pub(crate) fn cloud_slot(&self) -> std::sync::MutexGuard<'_, Option<SurfelCloud>> {
        self.cloud.lock().unwrap()
    }

    /// Node and surfel counts of the subtree rooted here.
    pub fn subtree_statistics(&self) -> (u64, u64) {
        let mut nodes = 1;
        let mut surfels = self.index_size as u64;
        for child in self.children.iter() {
            let (n, s) = child.subtree_statistics();
            nodes += n;
            surfels += s;
        }
        (nodes, surfels)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        mem_stats::notify_dealloc(mem::size_of::<Node>() as u64);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("morton", &format_args!("{}", self.morton))
            .field("level", &self.level())
            .field("is_leaf", &self.is_leaf)
            .field("children", &self.children.len())
            .field("index_offset", &self.index_offset)
            .field("index_size", &self.index_size)
            .field("has_parent", &self.has_parent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::surfel::Surfel;
    use crate::data_structures::vector::vec3f;

    fn test_data(dir: &tempfile::TempDir, count: u32) -> OctreeData {
        let data = OctreeData::create(dir.path()).unwrap();
        for i in 0..count {
            let f = i as f32 / count as f32;
            data.surfels
                .push(Surfel::new(
                    vec3f(f, f, f),
                    vec3f(0.01, 0.0, 0.0),
                    vec3f(0.0, 0.01, 0.0),
                ))
                .unwrap();
        }
        data
    }

    #[test]
    fn leaf_reserves_and_fills_range() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_data(&dir, 8);
        let morton = Morton::build(1, 2, 3, 5);
        let node = Node::new_leaf(morton, &[0, 1, 2, 5], &data).unwrap();
        assert!(node.is_leaf());
        assert_eq!(node.index_size(), 4);
        assert_eq!(
            data.indices.read_range(node.index_offset(), 4).unwrap(),
            vec![0, 1, 2, 5]
        );
    }

    #[test]
    fn parent_pointer_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_data(&dir, 4);
        let leaf = Node::new_leaf(Morton::build(0, 0, 0, 1), &[0], &data).unwrap();
        let mut parent = Node::new_inner(Morton::ROOT, vec![leaf]);
        let parent_ptr = &mut parent as *mut Node;
        parent.children()[0].set_parent(parent_ptr);
        assert!(parent.children()[0].has_parent());
        assert!(std::ptr::eq(
            parent.children()[0].parent().unwrap(),
            &parent
        ));
    }

    #[test]
    fn sample_draws_from_children_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_data(&dir, 32);
        let ids: Vec<u64> = (0..20).collect();
        let child_a = Node::new_leaf(Morton::build(0, 0, 0, 1), &ids[..10], &data).unwrap();
        let child_b = Node::new_leaf(Morton::build(1, 0, 0, 1), &ids[10..], &data).unwrap();
        let mut parent = Node::new_inner(Morton::ROOT, vec![child_a, child_b]);
        parent.assign_sample(&data).unwrap();

        // One fifth of ten per child, so two each.
        assert_eq!(parent.index_size(), 4);
        let sample = data
            .indices
            .read_range(parent.index_offset(), parent.index_size())
            .unwrap();
        assert!(sample[..2].iter().all(|id| *id < 10));
        assert!(sample[2..].iter().all(|id| (10..20).contains(id)));
    }

    #[test]
    fn release_children_keeps_inner_status() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_data(&dir, 4);
        let leaf = Node::new_leaf(Morton::build(0, 0, 0, 1), &[0, 1], &data).unwrap();
        let mut parent = Node::new_inner(Morton::ROOT, vec![leaf]);
        parent.release_children();
        assert!(!parent.is_leaf());
        assert!(parent.children().is_empty());
    }

    #[test]
    fn subtree_statistics_counts_everything() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_data(&dir, 16);
        let a = Node::new_leaf(Morton::build(0, 0, 0, 1), &[0, 1, 2], &data).unwrap();
        let b = Node::new_leaf(Morton::build(1, 1, 1, 1), &[3, 4], &data).unwrap();
        let mut root = Node::new_inner(Morton::ROOT, vec![a, b]);
        root.assign_sample(&data).unwrap();
        let (nodes, surfels) = root.subtree_statistics();
        assert_eq!(nodes, 3);
        assert_eq!(surfels, 5 + root.index_size() as u64);
    }
}
