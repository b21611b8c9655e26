use anyhow::{ensure, Result};
use std::path::{Path, PathBuf};

use lidar2dems::geometric::gap_fill::{gap_fill, Interpolation};
use lidar2dems::geometric::hillshade::create_hillshade;

/// Example: composite DTMs of increasing radius and shade the result
///
/// cargo run --example gap_fill_dtm -- DTM.tif DTM_r0.56.idw_warp.tif DTM_r1.41.idw_warp.tif ...
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    ensure!(args.len() >= 2, "usage: gap_fill_dtm <output> <input>...");
    let inputs: Vec<PathBuf> = args[1..].iter().map(PathBuf::from).collect();

    let dtm = gap_fill(&inputs, Path::new(&args[0]), None, Some(Interpolation::Linear))?;
    let shade = create_hillshade(&dtm)?;

    println!("DTM: {:?}", dtm);
    println!("Hillshade: {:?}", shade);
    Ok(())
}
