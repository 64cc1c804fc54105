//! Two-phase external sorting reader for datasets bigger than memory. The
//! input phase scans for dimensions, then cuts the scaled keyed stream into
//! bounded-memory runs, each sorted and spilled to a temporary file. The
//! output phase is a lazy k-way heap merge over the runs; the first merged
//! point is available as soon as `read` starts.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::disk::point_file::{PointFileReader, RawPoint};
use crate::disk::sort_reader::{sort_keyed, KeyedPoint, SortedPointReader};
use crate::error::Result;
use crate::octree::dims::{DimCalculator, OctreeDimensions};

/// Default in-memory run size. Each buffered record is 40 bytes.
const DEFAULT_RUN_BYTES: usize = 256 * 1024 * 1024;

const RECORD_SIZE: usize = 40;

pub struct ExternalSortReader {
    dim: OctreeDimensions,
    runs: Vec<File>,
    num_points: u64,
}

impl ExternalSortReader {
    pub fn new(path: &Path, max_level: u8) -> Result<Self> {
        Self::with_run_capacity(path, max_level, DEFAULT_RUN_BYTES)
    }

    /// Performs the input phase: dimension scan, then run creation.
    pub fn with_run_capacity(path: &Path, max_level: u8, run_bytes: usize) -> Result<Self> {
        let run_capacity = (run_bytes / RECORD_SIZE).max(1);

        let mut calc = DimCalculator::new();
        {
            let mut scan = PointFileReader::open(path)?;
            scan.read(|p| calc.insert(p.pos))?;
        }
        let dos = calc.dimensions(max_level);
        let dim = dos.dimensions();

        let mut reader = PointFileReader::open(path)?;
        let num_points = reader.num_points();
        log::info!(
            "external sort of {num_points} points from {path:?}, run capacity {run_capacity}"
        );

        let mut runs = Vec::new();
        let mut buffer: Vec<KeyedPoint> = Vec::with_capacity(run_capacity);
        let mut rank = 0u64;
        let mut spill_error = None;

        reader.read(|raw| {
            if spill_error.is_some() {
                return;
            }
            let mut point = raw;
            point.pos = dos.scale_point(point.pos);
            buffer.push(KeyedPoint {
                key: dim.calc_morton(point.pos).bits(),
                rank,
                point,
            });
            rank += 1;
            if buffer.len() == run_capacity {
                match spill_run(&mut buffer) {
                    Ok(run) => runs.push(run),
                    Err(e) => spill_error = Some(e),
                }
            }
        })?;
        if let Some(e) = spill_error {
            return Err(e);
        }
        if !buffer.is_empty() {
            runs.push(spill_run(&mut buffer)?);
        }

        log::debug!("created {} sorted runs", runs.len());

        Ok(Self {
            dim,
            runs,
            num_points,
        })
    }
}

fn spill_run(buffer: &mut Vec<KeyedPoint>) -> Result<File> {
    sort_keyed(buffer);
    let mut writer = BufWriter::new(tempfile::tempfile()?);
    for kp in buffer.iter() {
        writer.write_all(&kp.key.to_le_bytes())?;
        writer.write_all(&kp.rank.to_le_bytes())?;
        writer.write_all(bytemuck::bytes_of(&kp.point))?;
    }
    buffer.clear();
    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

struct RunCursor {
    reader: BufReader<File>,
}

impl RunCursor {
    fn next(&mut self) -> Result<Option<KeyedPoint>> {
        let mut record = [0u8; RECORD_SIZE];
        match self.reader.read_exact(&mut record) {
            Ok(()) => {
                let key = u64::from_le_bytes(record[0..8].try_into().unwrap());
                let rank = u64::from_le_bytes(record[8..16].try_into().unwrap());
                let point = bytemuck::pod_read_unaligned(&record[16..]);
                Ok(Some(KeyedPoint { key, rank, point }))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl SortedPointReader for ExternalSortReader {
    fn dimensions(&self) -> &OctreeDimensions {
        &self.dim
    }

    fn num_points(&self) -> u64 {
        self.num_points
    }

    /// Output phase: streaming k-way merge of the runs.
    fn read(&mut self, on_point: &mut dyn FnMut(RawPoint)) -> Result<()> {
        let mut cursors: Vec<RunCursor> = std::mem::take(&mut self.runs)
            .into_iter()
            .map(|file| RunCursor {
                reader: BufReader::new(file),
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<(KeyedPoint, usize)>> = BinaryHeap::new();
        for (idx, cursor) in cursors.iter_mut().enumerate() {
            if let Some(kp) = cursor.next()? {
                heap.push(Reverse((kp, idx)));
            }
        }

        while let Some(Reverse((kp, idx))) = heap.pop() {
            on_point(kp.point);
            if let Some(next) = cursors[idx].next()? {
                heap.push(Reverse((next, idx)));
            }
        }

        Ok(())
    }
}
