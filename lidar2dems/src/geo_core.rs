use anyhow::{Context, Result};
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{LayerAccess, LayerOptions, OGRwkbGeometryType};
use gdal::{Dataset, DriverManager};
use geo::{BoundingRect, Coord, Geometry as GeoGeometry, Intersects, LineString, MultiPolygon, Point, Polygon};
use geos::{Geom, Geometry as GeosGeometry};
use std::path::{Path, PathBuf};

use crate::error::L2dError;

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Smallest box on the integer grid that contains this one
    pub fn snap_outward(&self) -> Self {
        BoundingBox::new(
            self.min_x.floor(),
            self.min_y.floor(),
            self.max_x.ceil(),
            self.max_y.ceil(),
        )
    }

    /// Closed rectangular ring, counter-clockwise from (min_x, min_y)
    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                Coord {
                    x: self.min_x,
                    y: self.min_y,
                },
                Coord {
                    x: self.max_x,
                    y: self.min_y,
                },
                Coord {
                    x: self.max_x,
                    y: self.max_y,
                },
                Coord {
                    x: self.min_x,
                    y: self.max_y,
                },
                Coord {
                    x: self.min_x,
                    y: self.min_y,
                },
            ]),
            vec![],
        )
    }

    /// Values for a GDAL `-te` argument: xmin ymin xmax ymax
    pub fn to_extent_args(&self) -> [String; 4] {
        [
            self.min_x.to_string(),
            self.min_y.to_string(),
            self.max_x.to_string(),
            self.max_y.to_string(),
        ]
    }
}

/// Site boundary: a polygon or multipolygon with its spatial reference.
///
/// Used both to align derived rasters to a common integer grid and to decide
/// which point-cloud tiles take part in a run. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct SiteGeometry {
    geometry: MultiPolygon<f64>,
    /// Any definition GDAL understands (WKT, `EPSG:n`, PROJ string)
    srs: String,
    /// Vector file the site was read from, if any
    source: Option<PathBuf>,
}

impl SiteGeometry {
    pub fn new(geometry: impl Into<MultiPolygon<f64>>, srs: impl Into<String>) -> Result<Self> {
        let geometry = geometry.into();
        if geometry.0.is_empty() {
            return Err(L2dError::contract("site geometry has no polygon").into());
        }
        Ok(SiteGeometry {
            geometry,
            srs: srs.into(),
            source: None,
        })
    }

    /// Build from any polygonal `geo` geometry
    pub fn from_geometry(geometry: GeoGeometry<f64>, srs: impl Into<String>) -> Result<Self> {
        match geometry {
            GeoGeometry::Polygon(p) => Self::new(p, srs),
            GeoGeometry::MultiPolygon(mp) => Self::new(mp, srs),
            GeoGeometry::Rect(r) => Self::new(r.to_polygon(), srs),
            other => Err(L2dError::contract(format!(
                "site geometry must be polygonal, got {:?}",
                geo_kind(&other)
            ))
            .into()),
        }
    }

    /// Parse a WKT polygon or multipolygon
    pub fn from_wkt(wkt: &str, srs: impl Into<String>) -> Result<Self> {
        let geos_geom = GeosGeometry::new_from_wkt(wkt).context("Failed to parse WKT with GEOS")?;
        let geo_geom: GeoGeometry<f64> = geos_geom
            .try_into()
            .context("Failed to convert GEOS geometry to geo")?;
        Self::from_geometry(geo_geom, srs)
    }

    /// Parse a GeoJSON geometry, feature or the first feature of a collection
    pub fn from_geojson(text: &str, srs: impl Into<String>) -> Result<Self> {
        use geojson::GeoJson;

        let geojson: GeoJson = text.parse().context("Failed to parse GeoJSON")?;
        let geometry = match geojson {
            GeoJson::Geometry(g) => Some(g),
            GeoJson::Feature(f) => f.geometry,
            GeoJson::FeatureCollection(fc) => fc.features.into_iter().next().and_then(|f| f.geometry),
        }
        .context("GeoJSON contains no geometry")?;

        let geo_geom: GeoGeometry<f64> = geometry
            .try_into()
            .context("Failed to convert GeoJSON geometry to geo::Geometry")?;
        Self::from_geometry(geo_geom, srs)
    }

    /// Read one feature of the first layer of a vector file (shapefile, GPKG, GeoJSON ...)
    pub fn from_vector_file(path: impl AsRef<Path>, feature_index: usize) -> Result<Self> {
        let path = path.as_ref();
        let dataset =
            Dataset::open(path).with_context(|| format!("Failed to open vector file {:?}", path))?;
        let mut layer = dataset
            .layer(0)
            .with_context(|| format!("No layer in vector file {:?}", path))?;

        let srs = layer
            .spatial_ref()
            .with_context(|| format!("Vector file {:?} has no spatial reference", path))?
            .to_wkt()
            .context("Failed to export spatial reference as WKT")?;

        let feature = layer
            .features()
            .nth(feature_index)
            .with_context(|| format!("Vector file {:?} has no feature #{}", path, feature_index))?;
        let wkt = feature
            .geometry()
            .with_context(|| format!("Feature #{} of {:?} has no geometry", feature_index, path))?
            .wkt()
            .context("Failed to get WKT from GDAL geometry")?;

        let mut site = Self::from_wkt(&wkt, srs)?;
        site.source = Some(path.to_path_buf());
        Ok(site)
    }

    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }

    pub fn srs(&self) -> &str {
        &self.srs
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Raw (unsnapped) extent of the site
    pub fn envelope(&self) -> Result<BoundingBox> {
        let rect = self
            .geometry
            .bounding_rect()
            .context("site geometry has an empty extent")?;
        Ok(BoundingBox::new(
            rect.min().x,
            rect.min().y,
            rect.max().x,
            rect.max().y,
        ))
    }

    /// True when the point lies inside the site or on its boundary
    pub fn covers_point(&self, x: f64, y: f64) -> bool {
        self.geometry.intersects(&Point::new(x, y))
    }

    pub fn to_geos(&self) -> Result<GeosGeometry> {
        self.geometry
            .clone()
            .try_into()
            .context("Failed to convert site geometry to GEOS")
    }

    pub fn to_wkt(&self) -> Result<String> {
        self.to_geos()?
            .to_wkt()
            .context("Failed to export site geometry as WKT")
    }

    /// Write the site as a single-feature GeoPackage carrying the site SRS,
    /// suitable for a `-cutline` argument. The caller owns `dir` and its cleanup.
    pub fn write_cutline(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("site.gpkg");

        let driver = DriverManager::get_driver_by_name("GPKG").context("Failed to get GPKG driver")?;
        let mut dataset = driver
            .create_vector_only(&path)
            .with_context(|| format!("Failed to create cutline file {:?}", path))?;

        let srs = SpatialRef::from_definition(&self.srs)
            .with_context(|| format!("Invalid site spatial reference: {}", self.srs))?;
        let mut layer = dataset
            .create_layer(LayerOptions {
                name: "site",
                srs: Some(&srs),
                ty: OGRwkbGeometryType::wkbMultiPolygon,
                ..Default::default()
            })
            .context("Failed to create cutline layer")?;

        let geometry = gdal::vector::Geometry::from_wkt(&self.to_wkt()?)
            .context("Failed to build GDAL geometry from site WKT")?;
        layer
            .create_feature(geometry)
            .context("Failed to write cutline feature")?;

        Ok(path)
    }
}

fn geo_kind(geometry: &GeoGeometry<f64>) -> &'static str {
    match geometry {
        GeoGeometry::Point(_) => "Point",
        GeoGeometry::Line(_) => "Line",
        GeoGeometry::LineString(_) => "LineString",
        GeoGeometry::Polygon(_) => "Polygon",
        GeoGeometry::MultiPoint(_) => "MultiPoint",
        GeoGeometry::MultiLineString(_) => "MultiLineString",
        GeoGeometry::MultiPolygon(_) => "MultiPolygon",
        GeoGeometry::GeometryCollection(_) => "GeometryCollection",
        GeoGeometry::Rect(_) => "Rect",
        GeoGeometry::Triangle(_) => "Triangle",
    }
}

/// Integer-snapped extent of a site.
///
/// Every raster warped onto this box shares one 1 m grid, so rasters of the
/// same site can be combined cell for cell.
pub fn align_bounds(site: &SiteGeometry) -> Result<BoundingBox> {
    Ok(site.envelope()?.snap_outward())
}
