use std::path::PathBuf;

use anyhow::{bail, Context};

use splatview_lib::config::SortingMode;
use splatview_lib::disk::point_sorter::PointSorter;

/// Offline sorter: rewrites a raw point file in Morton order and emits the
/// octree descriptor next to it.

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(input), Some(output), Some(level)) = (args.next(), args.next(), args.next()) else {
        bail!("usage: pointsort <input.bin> <output.bin> <leaf level> [heap|partial|full|external]");
    };
    let level: u8 = level.parse().context("leaf level must be a small integer")?;

    let mode = match args.next().as_deref() {
        Some("heap") => SortingMode::Heap,
        Some("partial") => SortingMode::PartialSort,
        Some("full") => SortingMode::FullSort,
        Some("external") | None => SortingMode::External,
        Some(other) => bail!("unknown sorting mode {other:?}"),
    };

    let start = std::time::Instant::now();
    let sorter = PointSorter::new(&PathBuf::from(input), level, mode)
        .context("cannot set up the sorter")?;
    let descriptor = sorter
        .sort_to_file(&PathBuf::from(&output))
        .context("sorting failed")?;

    println!(
        "Sorted into {output} (depth {}) in {} ms.",
        descriptor.depth,
        start.elapsed().as_millis()
    );
    Ok(())
}
