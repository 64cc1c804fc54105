//! Offline sorting: turns an unsorted point file into a Morton-sorted one
//! plus the octree descriptor that later runs construct from.

use std::path::Path;
use std::time::Instant;

use crate::config::{OctreeDescriptor, SortingMode};
use crate::disk::external_sort::ExternalSortReader;
use crate::disk::point_file::PointFileWriter;
use crate::disk::sort_reader::{SortPointReader, SortedPointReader};
use crate::error::Result;

pub fn make_reader(
    input: &Path,
    max_level: u8,
    mode: SortingMode,
) -> Result<Box<dyn SortedPointReader>> {
    Ok(match mode {
        SortingMode::External => Box::new(ExternalSortReader::new(input, max_level)?),
        _ => Box::new(SortPointReader::new(input, max_level, mode)?),
    })
}

pub struct PointSorter {
    reader: Box<dyn SortedPointReader>,
}

impl PointSorter {
    pub fn new(input: &Path, max_level: u8, mode: SortingMode) -> Result<Self> {
        Ok(Self {
            reader: make_reader(input, max_level, mode)?,
        })
    }

    /// Writes the sorted point file and its descriptor (same stem, `.oct`
    /// extension). Returns the descriptor.
    pub fn sort_to_file(mut self, output: &Path) -> Result<OctreeDescriptor> {
        let start = Instant::now();

        let mut writer = PointFileWriter::create(output)?;
        let mut write_error = None;
        self.reader.read(&mut |point| {
            if write_error.is_none() {
                if let Err(e) = writer.write(&point) {
                    write_error = Some(e);
                }
            }
        })?;
        if let Some(e) = write_error {
            return Err(e);
        }
        let written = writer.finish()?;

        log::info!(
            "sorted {written} points into {output:?} in {} ms",
            start.elapsed().as_millis()
        );

        let dim = self.reader.dimensions();
        let descriptor = OctreeDescriptor {
            size: dim.size().into(),
            origin: dim.origin().into(),
            depth: dim.level(),
            points: output.to_path_buf(),
            database: Some(output.with_extension("db")),
            nodes: None,
        };
        descriptor.save(&output.with_extension("oct"))?;

        Ok(descriptor)
    }
}
