//! Binary octree persistence. A file starts with one ordering byte (1 for
//! depth-first, 0 for breadth-first), followed by the node records:
//! `is_leaf: u8 | surfel_count: u32 | surfels | child_count: u32 (inner
//! only)`, children recursing in the chosen order. Surfels are nine
//! little-endian floats each. Breadth-first files are streamable: the
//! remainder of the file can be parsed on a background thread, with a
//! callback fired after every completed BFS frontier.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::data_structures::morton::{Morton, MortonCode};
use crate::data_structures::surfel::Surfel;
use crate::error::{Error, Result};
use crate::octree::dims::OctreeDimensions;
use crate::octree::ext_data::OctreeData;
use crate::octree::node::Node;

const ORDER_DEPTH: u8 = 1;
const ORDER_BREADTH: u8 = 0;

pub struct OctreeFile;

impl OctreeFile {
    /// Writes the hierarchy in depth-first order.
    pub fn write_depth(path: &Path, root: &Node, data: &OctreeData) -> Result<()> {
        log::info!("saving binary octree in depth-first order to {path:?}");
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&[ORDER_DEPTH])?;
        write_depth_rec(&mut writer, root, data)?;
        writer.flush()?;
        Ok(())
    }

    /// Writes the hierarchy in breadth-first order.
    pub fn write_breadth(path: &Path, root: &Node, data: &OctreeData) -> Result<()> {
        log::info!("saving binary octree in breadth-first order to {path:?}");
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&[ORDER_BREADTH])?;

        let mut queue: VecDeque<&Node> = VecDeque::new();
        queue.push_back(root);
        while let Some(node) = queue.pop_front() {
            write_node_record(&mut writer, node, data)?;
            if !node.is_leaf() {
                write_u32(&mut writer, node.children().len() as u32)?;
            }
            for child in node.children() {
                queue.push_back(child);
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a file written by either writer. The node samples are appended
    /// to `data` so the loaded hierarchy renders through the normal path.
    pub fn read(path: &Path, dims: &OctreeDimensions, data: &OctreeData) -> Result<Box<Node>> {
        let mut reader = open(path)?;
        let parsed = match read_header(&mut reader)? {
            Ordering::Depth => {
                log::info!("depth-first order format detected in {path:?}");
                let mut parsed = ParsedTree::default();
                parse_depth_rec(&mut reader, data, &mut parsed, 0)?;
                parsed
            }
            Ordering::Breadth => {
                log::info!("breadth-first order format detected in {path:?}");
                parse_breadth(&mut reader, data, |_| {})?
            }
        };
        materialize(&parsed, dims, data)
    }

    /// Reads a breadth-first file on a background thread. The returned
    /// receiver resolves with the complete hierarchy; `on_level` fires after
    /// every finished BFS frontier with the level that completed.
    pub fn read_breadth_async<F>(
        path: &Path,
        dims: OctreeDimensions,
        data: Arc<OctreeData>,
        on_level: F,
    ) -> Result<Receiver<Result<Box<Node>>>>
    where
        F: Fn(u8) + Send + 'static,
    {
        let mut reader = open(path)?;
        if read_header(&mut reader)? != Ordering::Breadth {
            return Err(Error::Input(
                "octree file must be breadth-first ordered to be read asynchronously".into(),
            ));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name("octree file reader".into())
            .spawn(move || {
                let result = parse_breadth(&mut reader, &data, on_level)
                    .and_then(|parsed| materialize(&parsed, &dims, &data));
                let _ = tx.send(result);
            })
            .expect("failed to spawn the octree file reader thread");
        Ok(rx)
    }
}

#[derive(PartialEq)]
enum Ordering {
    Depth,
    Breadth,
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Error::Input(format!("cannot open octree file {path:?}: {e}")))?;
    Ok(BufReader::new(file))
}

fn read_header(reader: &mut BufReader<File>) -> Result<Ordering> {
    let mut header = [0u8; 1];
    reader.read_exact(&mut header)?;
    match header[0] {
        ORDER_DEPTH => Ok(Ordering::Depth),
        ORDER_BREADTH => Ok(Ordering::Breadth),
        other => Err(Error::Input(format!(
            "unknown octree file ordering byte {other}"
        ))),
    }
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_node_record<W: Write>(writer: &mut W, node: &Node, data: &OctreeData) -> Result<()> {
    writer.write_all(&[node.is_leaf() as u8])?;
    let surfels = data.raw_sample(node.index_offset(), node.index_size())?;
    write_u32(writer, surfels.len() as u32)?;
    for surfel in &surfels {
        surfel.persist(writer)?;
    }
    Ok(())
}

fn write_depth_rec<W: Write>(writer: &mut W, node: &Node, data: &OctreeData) -> Result<()> {
    write_node_record(writer, node, data)?;
    if !node.is_leaf() {
        write_u32(writer, node.children().len() as u32)?;
        for child in node.children() {
            write_depth_rec(writer, child, data)?;
        }
    }
    Ok(())
}

/// One parsed node record, its sample already appended to the stores.
struct ParsedNode {
    is_leaf: bool,
    index_offset: u64,
    index_size: u32,
    first_id: u64,
    children: Vec<usize>,
}

#[derive(Default)]
struct ParsedTree {
    nodes: Vec<ParsedNode>,
}

fn parse_record<R: Read>(reader: &mut R, data: &OctreeData) -> Result<(ParsedNode, bool)> {
    let mut flag = [0u8; 1];
    reader.read_exact(&mut flag)?;
    let is_leaf = flag[0] != 0;

    let count = read_u32(reader)?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let surfel = Surfel::restore(reader)?;
        ids.push(data.surfels.push(surfel)?);
    }
    let first_id = ids.first().copied().ok_or_else(|| {
        Error::Input("octree file contains a node without surfels".into())
    })?;

    let index_offset = data.indices.reserve(count);
    data.indices.fill(index_offset, &ids)?;

    Ok((
        ParsedNode {
            is_leaf,
            index_offset,
            index_size: count,
            first_id,
            children: Vec::new(),
        },
        is_leaf,
    ))
}

fn parse_depth_rec<R: Read>(
    reader: &mut R,
    data: &OctreeData,
    parsed: &mut ParsedTree,
    depth: usize,
) -> Result<usize> {
    if depth > Morton::MAX_LEVEL as usize {
        return Err(Error::Input("octree file deeper than the morton capacity".into()));
    }
    let (node, is_leaf) = parse_record(reader, data)?;
    let index = parsed.nodes.len();
    parsed.nodes.push(node);

    if !is_leaf {
        let child_count = read_u32(reader)?;
        for _ in 0..child_count {
            let child = parse_depth_rec(reader, data, parsed, depth + 1)?;
            parsed.nodes[index].children.push(child);
        }
    }
    Ok(index)
}

fn parse_breadth<R: Read, F: Fn(u8)>(
    reader: &mut R,
    data: &OctreeData,
    on_level: F,
) -> Result<ParsedTree> {
    let mut parsed = ParsedTree::default();

    let (root, root_is_leaf) = parse_record(reader, data)?;
    parsed.nodes.push(root);

    // Pending parents in BFS order, each with its yet unread child count and
    // depth.
    let mut pending: VecDeque<(usize, u32, u8)> = VecDeque::new();
    let mut current_level = 0u8;
    if !root_is_leaf {
        let child_count = read_u32(reader)?;
        pending.push_back((0, child_count, 0));
    }

    while let Some((parent, child_count, depth)) = pending.pop_front() {
        if depth > current_level {
            on_level(current_level);
            current_level = depth;
        }
        for _ in 0..child_count {
            let (node, is_leaf) = parse_record(reader, data)?;
            let index = parsed.nodes.len();
            parsed.nodes.push(node);
            parsed.nodes[parent].children.push(index);
            if !is_leaf {
                let grandchildren = read_u32(reader)?;
                if depth + 1 > Morton::MAX_LEVEL {
                    return Err(Error::Input(
                        "octree file deeper than the morton capacity".into(),
                    ));
                }
                pending.push_back((index, grandchildren, depth + 1));
            }
        }
    }
    on_level(current_level);

    Ok(parsed)
}

/// Builds the owned hierarchy out of the parsed records and wires the
/// parent back references.
fn materialize(
    parsed: &ParsedTree,
    dims: &OctreeDimensions,
    data: &OctreeData,
) -> Result<Box<Node>> {
    if parsed.nodes.is_empty() {
        return Err(Error::Input("octree file holds no nodes".into()));
    }
    let mut root = Box::new(materialize_rec(parsed, 0, 0, dims, data)?);
    wire_parents(&mut root);
    Ok(root)
}

fn materialize_rec(
    parsed: &ParsedTree,
    index: usize,
    depth: u8,
    dims: &OctreeDimensions,
    data: &OctreeData,
) -> Result<Node> {
    let record = &parsed.nodes[index];
    let anchor = data.surfels.get(record.first_id)?;
    let morton = dims.at_level(depth).calc_morton(anchor.center);

    let mut node = Node::from_storage(morton, record.index_offset, record.index_size, record.is_leaf);
    if !record.children.is_empty() {
        let mut children = Vec::with_capacity(record.children.len());
        for &child in &record.children {
            children.push(materialize_rec(parsed, child, depth + 1, dims, data)?);
        }
        node.set_children(children);
    }
    Ok(node)
}

fn wire_parents(node: &mut Node) {
    let ptr: *mut Node = node;
    for child in node.children_mut() {
        child.set_parent(ptr);
        wire_parents(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::vector::vec3f;

    /// Builds a small hierarchy directly against fresh stores: a root with
    /// two children, the first of which has two leaves.
    fn sample_tree(data: &OctreeData) -> Box<Node> {
        let dims = dims();
        let mut push = |pos: crate::data_structures::vector::Vec3f32, n: u32| -> Vec<u64> {
            (0..n)
                .map(|i| {
                    data.surfels
                        .push(Surfel::new(
                            vec3f(pos.0 + i as f32 * 1e-4, pos.1, pos.2),
                            vec3f(0.001, 0.0, 0.0),
                            vec3f(0.0, 0.001, 0.0),
                        ))
                        .unwrap()
                })
                .collect()
        };

        let leaf_a = Node::new_leaf(
            dims.calc_morton(vec3f(0.1, 0.1, 0.1)),
            &push(vec3f(0.1, 0.1, 0.1), 3),
            data,
        )
        .unwrap();
        let leaf_b = Node::new_leaf(
            dims.calc_morton(vec3f(0.3, 0.1, 0.1)),
            &push(vec3f(0.3, 0.1, 0.1), 2),
            data,
        )
        .unwrap();
        let mut inner_a = Node::new_inner(leaf_a.morton().traverse_up(), vec![leaf_a, leaf_b]);
        inner_a.assign_sample(data).unwrap();

        let leaf_c = Node::new_leaf(
            dims.at_level(1).calc_morton(vec3f(0.8, 0.8, 0.8)),
            &push(vec3f(0.8, 0.8, 0.8), 4),
            data,
        )
        .unwrap();

        let mut root = Box::new(Node::new_inner(Morton::ROOT, vec![inner_a, leaf_c]));
        root.assign_sample(data).unwrap();
        wire_parents(&mut root);
        root
    }

    fn dims() -> OctreeDimensions {
        OctreeDimensions::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), 2)
    }

    /// Structural equality: shape, mortons and per-node surfel sequences.
    fn assert_same_tree(a: &Node, b: &Node, data_a: &OctreeData, data_b: &OctreeData) {
        assert_eq!(a.morton(), b.morton());
        assert_eq!(a.is_leaf(), b.is_leaf());
        assert_eq!(a.index_size(), b.index_size());
        let sa = data_a.raw_sample(a.index_offset(), a.index_size()).unwrap();
        let sb = data_b.raw_sample(b.index_offset(), b.index_size()).unwrap();
        assert_eq!(sa, sb);
        assert_eq!(a.children().len(), b.children().len());
        for (ca, cb) in a.children().iter().zip(b.children()) {
            assert_same_tree(ca, cb, data_a, data_b);
        }
    }

    #[test]
    fn depth_first_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = OctreeData::create(dir.path()).unwrap();
        let tree = sample_tree(&data);

        let path = dir.path().join("tree.oct.bin");
        OctreeFile::write_depth(&path, &tree, &data).unwrap();

        let read_dir = tempfile::tempdir().unwrap();
        let read_data = OctreeData::create(read_dir.path()).unwrap();
        let read = OctreeFile::read(&path, &dims(), &read_data).unwrap();

        assert_same_tree(&tree, &read, &data, &read_data);
        assert!(read.parent().is_none());
        assert!(read.children().iter().all(|c| c.has_parent()));
    }

    #[test]
    fn breadth_first_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = OctreeData::create(dir.path()).unwrap();
        let tree = sample_tree(&data);

        let path = dir.path().join("tree.oct.bin");
        OctreeFile::write_breadth(&path, &tree, &data).unwrap();

        let read_dir = tempfile::tempdir().unwrap();
        let read_data = OctreeData::create(read_dir.path()).unwrap();
        let read = OctreeFile::read(&path, &dims(), &read_data).unwrap();

        assert_same_tree(&tree, &read, &data, &read_data);
    }

    #[test]
    fn async_breadth_read_reports_levels() {
        let dir = tempfile::tempdir().unwrap();
        let data = OctreeData::create(dir.path()).unwrap();
        let tree = sample_tree(&data);

        let path = dir.path().join("tree.oct.bin");
        OctreeFile::write_breadth(&path, &tree, &data).unwrap();

        let read_dir = tempfile::tempdir().unwrap();
        let read_data = Arc::new(OctreeData::create(read_dir.path()).unwrap());
        let (level_tx, level_rx) = crossbeam_channel::unbounded();
        let rx = OctreeFile::read_breadth_async(&path, dims(), Arc::clone(&read_data), move |lvl| {
            let _ = level_tx.send(lvl);
        })
        .unwrap();

        let read = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert_same_tree(&tree, &read, &data, &read_data);

        let levels: Vec<u8> = level_rx.try_iter().collect();
        assert!(levels.contains(&0));
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn depth_first_file_rejected_for_async_read() {
        let dir = tempfile::tempdir().unwrap();
        let data = OctreeData::create(dir.path()).unwrap();
        let tree = sample_tree(&data);
        let path = dir.path().join("tree.oct.bin");
        OctreeFile::write_depth(&path, &tree, &data).unwrap();

        let read_dir = tempfile::tempdir().unwrap();
        let read_data = Arc::new(OctreeData::create(read_dir.path()).unwrap());
        assert!(matches!(
            OctreeFile::read_breadth_async(&path, dims(), read_data, |_| {}),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn garbage_header_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [7u8, 0, 0]).unwrap();
        let data = OctreeData::create(dir.path()).unwrap();
        assert!(matches!(
            OctreeFile::read(&path, &dims(), &data),
            Err(Error::Input(_))
        ));
    }
}
