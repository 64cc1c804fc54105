//! Raw binary point format: six little-endian `f32` per vertex, position
//! then normal, in arbitrary order. The sorted output file uses the same
//! layout.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::data_structures::vector::Vec3f32;
use crate::error::{Error, Result};

pub const POINT_SIZE: usize = 24;

#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct RawPoint {
    pub pos: Vec3f32,
    pub normal: Vec3f32,
}

static_assertions::assert_eq_size!(RawPoint, [f32; 6]);

pub struct PointFileReader {
    reader: BufReader<File>,
    num_points: u64,
}

impl PointFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Input(format!("cannot open point file {path:?}: {e}")))?;
        let len = file.metadata()?.len();
        if len % POINT_SIZE as u64 != 0 {
            return Err(Error::Input(format!(
                "point file {path:?} is not a multiple of the {POINT_SIZE} byte record size"
            )));
        }
        Ok(Self {
            reader: BufReader::new(file),
            num_points: len / POINT_SIZE as u64,
        })
    }

    pub fn num_points(&self) -> u64 {
        self.num_points
    }

    /// Invokes the callback once per point in file order.
    pub fn read<F: FnMut(RawPoint)>(&mut self, mut on_point: F) -> Result<()> {
        let mut buf = [0u8; POINT_SIZE];
        loop {
            match self.reader.read_exact(&mut buf) {
                Ok(()) => on_point(bytemuck::pod_read_unaligned(&buf)),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

pub struct PointFileWriter {
    writer: BufWriter<File>,
    written: u64,
}

impl PointFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write(&mut self, point: &RawPoint) -> Result<()> {
        self.writer.write_all(bytemuck::bytes_of(point))?;
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::vector::vec3f;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.bin");

        let points = vec![
            RawPoint {
                pos: vec3f(0.1, 0.2, 0.3),
                normal: vec3f(1.0, 0.0, 0.0),
            },
            RawPoint {
                pos: vec3f(-1.0, 2.0, 0.5),
                normal: vec3f(0.0, 1.0, 0.0),
            },
        ];

        let mut writer = PointFileWriter::create(&path).unwrap();
        for p in &points {
            writer.write(p).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 2);

        let mut reader = PointFileReader::open(&path).unwrap();
        assert_eq!(reader.num_points(), 2);
        let mut out = Vec::new();
        reader.read(|p| out.push(p)).unwrap();
        assert_eq!(out, points);
    }

    #[test]
    fn truncated_file_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            PointFileReader::open(&path),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn empty_file_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, []).unwrap();
        let mut reader = PointFileReader::open(&path).unwrap();
        let mut count = 0;
        reader.read(|_| count += 1).unwrap();
        assert_eq!(count, 0);
    }
}
