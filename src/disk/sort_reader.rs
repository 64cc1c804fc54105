//! In-memory sorting readers. All of them emit the point stream scaled into
//! the unit cube and keyed by the leaf-level Morton code, in non-decreasing
//! key order with ties kept in input order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;

use rdst::{RadixKey, RadixSort};

use crate::config::SortingMode;
use crate::disk::point_file::{PointFileReader, RawPoint};
use crate::error::Result;
use crate::octree::dims::{DimCalculator, OctreeDimensions};

/// A point annotated with its leaf-level Morton key and input rank. The rank
/// participates in the sort so ties stay stable.
#[derive(Copy, Clone, Debug)]
pub(crate) struct KeyedPoint {
    pub key: u64,
    pub rank: u64,
    pub point: RawPoint,
}

impl RadixKey for KeyedPoint {
    const LEVELS: usize = 16;

    #[inline]
    fn get_level(&self, level: usize) -> u8 {
        // Low eight radix levels are the rank, high eight the Morton key, so
        // the radix passes order by (key, rank).
        if level < 8 {
            (self.rank >> (level * 8)) as u8
        } else {
            (self.key >> ((level - 8) * 8)) as u8
        }
    }
}

impl PartialEq for KeyedPoint {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.rank == other.rank
    }
}

impl Eq for KeyedPoint {}

impl Ord for KeyedPoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key, self.rank).cmp(&(other.key, other.rank))
    }
}

impl PartialOrd for KeyedPoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) fn sort_keyed(points: &mut Vec<KeyedPoint>) {
    if cfg!(debug_assertions) {
        points.sort_unstable();
    } else {
        // The radix crate relies on wrapping unsigned arithmetic that panics
        // in debug builds, so it is release-only, same as the comparison
        // sort is debug-only.
        points.radix_sort_unstable();
    }
}

/// A producer of Morton-sorted scaled points. `read` invokes the callback
/// once per surviving point in non-decreasing leaf-Morton order.
pub trait SortedPointReader: Send {
    fn dimensions(&self) -> &OctreeDimensions;

    fn num_points(&self) -> u64;

    fn read(&mut self, on_point: &mut dyn FnMut(RawPoint)) -> Result<()>;
}

/// Streams an already sorted point file under known dimensions, skipping
/// the scan and sort phases entirely. Used for the descriptor entry point,
/// whose points were normalized when the sorted file was written.
pub struct PresortedReader {
    dim: OctreeDimensions,
    path: std::path::PathBuf,
    num_points: u64,
}

impl PresortedReader {
    pub fn new(path: &Path, dim: OctreeDimensions) -> Result<Self> {
        let num_points = PointFileReader::open(path)?.num_points();
        Ok(Self {
            dim,
            path: path.to_path_buf(),
            num_points,
        })
    }
}

impl SortedPointReader for PresortedReader {
    fn dimensions(&self) -> &OctreeDimensions {
        &self.dim
    }

    fn num_points(&self) -> u64 {
        self.num_points
    }

    fn read(&mut self, on_point: &mut dyn FnMut(RawPoint)) -> Result<()> {
        PointFileReader::open(&self.path)?.read(on_point)
    }
}

/// Reader covering the three in-memory sorting modes.
pub struct SortPointReader {
    dim: OctreeDimensions,
    points: Vec<KeyedPoint>,
    mode: SortingMode,
}

impl SortPointReader {
    pub fn new(path: &Path, max_level: u8, mode: SortingMode) -> Result<Self> {
        debug_assert!(mode != SortingMode::External);

        let mut reader = PointFileReader::open(path)?;
        log::info!(
            "reading {} points from {path:?} for in-memory sort",
            reader.num_points()
        );

        let mut calc = DimCalculator::new();
        let mut points = Vec::with_capacity(reader.num_points() as usize);
        reader.read(|p| {
            calc.insert(p.pos);
            points.push(KeyedPoint {
                key: 0,
                rank: points.len() as u64,
                point: p,
            });
        })?;

        let dos = calc.dimensions(max_level);
        let dim = dos.dimensions();

        use rayon::prelude::*;
        points.par_iter_mut().for_each(|kp| {
            kp.point.pos = dos.scale_point(kp.point.pos);
            kp.key = dim.calc_morton(kp.point.pos).bits();
        });

        Ok(Self { dim, points, mode })
    }
}

impl SortedPointReader for SortPointReader {
    fn dimensions(&self) -> &OctreeDimensions {
        &self.dim
    }

    fn num_points(&self) -> u64 {
        self.points.len() as u64
    }

    fn read(&mut self, on_point: &mut dyn FnMut(RawPoint)) -> Result<()> {
        let mut points = std::mem::take(&mut self.points);
        match self.mode {
            SortingMode::FullSort => {
                sort_keyed(&mut points);
                for kp in &points {
                    on_point(kp.point);
                }
            }
            SortingMode::Heap => {
                let mut heap: BinaryHeap<Reverse<KeyedPoint>> =
                    points.drain(..).map(Reverse).collect();
                while let Some(Reverse(kp)) = heap.pop() {
                    on_point(kp.point);
                }
            }
            SortingMode::PartialSort => {
                // Emit chunkwise: partition the next chunk of smallest keys,
                // sort only that chunk, stream it out. Keeps the sorting
                // spikes bounded on huge inputs.
                const CHUNK: usize = 4096;
                let mut rest = points.as_mut_slice();
                while !rest.is_empty() {
                    let take = CHUNK.min(rest.len());
                    if take < rest.len() {
                        rest.select_nth_unstable(take - 1);
                    }
                    let (chunk, tail) = rest.split_at_mut(take);
                    chunk.sort_unstable();
                    for kp in chunk.iter() {
                        on_point(kp.point);
                    }
                    rest = tail;
                }
            }
            SortingMode::External => unreachable!("external sorting has its own reader"),
        }
        Ok(())
    }
}
