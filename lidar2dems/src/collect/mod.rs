pub mod tiles;

pub use tiles::{
    check_boundaries, check_overlap, filter_by_intersection, filter_by_tile_index,
    PointCloudMetadata, TileEntry, TileIndex,
};
