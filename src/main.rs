use std::path::PathBuf;

use splatview_lib::config::RuntimeConfig;

/// Viewer entry point. Takes the path to a raw point file or to an `.oct`
/// descriptor document, and optionally the leaf level to build at.
fn main() {
    let mut args = std::env::args().skip(1);
    let Some(input) = args.next() else {
        eprintln!("usage: splatview <points.bin | model.oct> [leaf level]");
        std::process::exit(2);
    };

    let mut config = RuntimeConfig::default();
    if let Some(level) = args.next() {
        config.max_level = level.parse().expect("leaf level must be a small integer");
    }

    splatview_lib::run(PathBuf::from(input), config);
}
