use anyhow::{Context, Result};
use std::path::PathBuf;

use lidar2dems::pipeline::FilterOptions;
use lidar2dems::{Dem, ProcessingConfig, SiteGeometry};

/// Example: DSM, DTM and CHM for one site
///
/// cargo run --example dems_from_las -- site.shp ./output tile1.laz tile2.laz ...
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let site_file = args.next().context("missing site vector file")?;
    let output = args.next().context("missing output directory")?;
    let tiles: Vec<PathBuf> = args.map(PathBuf::from).collect();

    let site = SiteGeometry::from_vector_file(&site_file, 0)?;
    let config = match std::env::var("L2D_CONFIG") {
        Ok(path) => ProcessingConfig::from_file(path)?,
        Err(_) => ProcessingConfig::default(),
    };

    let mut dem = Dem::new(&output, site).with_config(config);
    dem.set_filters(FilterOptions {
        outlier_threshold: Some(3.0),
        max_scan_angle: Some(10.0),
        ..Default::default()
    });
    dem.set_clip(true);

    let products = dem.run(&tiles, &[0.56], &[0.56, 1.41, 2.5])?;

    println!("=== {} tiles used ===", products.tiles.len());
    for p in &products.batch.products {
        println!("  - {} r{}: {:?}", p.demtype, p.radius, p.warped);
    }
    for f in &products.batch.failures {
        println!("  - {} r{} failed: {:#}", f.demtype, f.radius, f.error);
    }
    println!("DTM: {:?}", products.dtm);
    if let Some(chm) = &products.chm {
        println!("CHM: {:?}", chm);
    }
    Ok(())
}
