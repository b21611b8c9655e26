use anyhow::Result;
use std::path::PathBuf;

use lidar2dems::geometric::mosaic::MosaicBuilder;
use lidar2dems::ProcessingConfig;

/// Example: one VRT per product (DEM type, radius, statistic) found in a directory
///
/// cargo run --example mosaic_tiles -- ./output
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let dir = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./output"));
    let builder = MosaicBuilder::new(&ProcessingConfig::default());
    let mosaics = builder.create_vrts(&dir, None, true)?;

    println!("=== {} mosaics in {:?} ===", mosaics.len(), dir);
    for m in mosaics {
        println!("  - {:?}", m);
    }
    Ok(())
}
