//! Filling of nodata cells from their valid neighbours.
//!
//! Cells are addressed in pixel space (x = column, y = row) so the fill is
//! independent of the raster georeference.

use rstar::primitives::GeomWithData;
use rstar::RTree;
use std::collections::{HashSet, VecDeque};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::raster::Raster;
use super::triangulation::{Point2, Triangle, Triangulation};

type Sample = GeomWithData<Point2, f64>;

const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

fn pixel(raster: &Raster, idx: usize) -> Point2 {
    [(idx % raster.width) as f64, (idx / raster.width) as f64]
}

fn neighbours(raster: &Raster, idx: usize) -> impl Iterator<Item = usize> + '_ {
    let row = (idx / raster.width) as isize;
    let col = (idx % raster.width) as isize;
    NEIGHBOURS.iter().filter_map(move |(dr, dc)| {
        let r = row + dr;
        let c = col + dc;
        if r < 0 || c < 0 || r >= raster.height as isize || c >= raster.width as isize {
            None
        } else {
            Some(raster.index(r as usize, c as usize))
        }
    })
}

/// Give every nodata cell the value of the nearest valid cell.
/// Returns the number of cells filled.
pub fn fill_nearest(raster: &mut Raster) -> usize {
    let mut samples = Vec::new();
    let mut gaps = Vec::new();
    for (idx, &v) in raster.data.iter().enumerate() {
        if raster.is_nodata(v) {
            gaps.push(idx);
        } else {
            samples.push(Sample::new(pixel(raster, idx), v));
        }
    }
    if samples.is_empty() || gaps.is_empty() {
        return 0;
    }

    let tree = RTree::bulk_load(samples);
    let lookup = |idx: &usize| {
        tree.nearest_neighbor(&pixel(raster, *idx))
            .map(|s| (*idx, s.data))
    };

    #[cfg(feature = "rayon")]
    let fills: Vec<(usize, f64)> = gaps.par_iter().filter_map(lookup).collect();
    #[cfg(not(feature = "rayon"))]
    let fills: Vec<(usize, f64)> = gaps.iter().filter_map(lookup).collect();

    let filled = fills.len();
    for (idx, v) in fills {
        raster.data[idx] = v;
    }
    filled
}

/// Connected (8-neighbour) groups of nodata cells
fn gap_components(raster: &Raster) -> Vec<Vec<usize>> {
    let mut seen = vec![false; raster.data.len()];
    let mut components = Vec::new();
    for start in 0..raster.data.len() {
        if seen[start] || !raster.is_nodata(raster.data[start]) {
            continue;
        }
        seen[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut cells = Vec::new();
        while let Some(idx) = queue.pop_front() {
            cells.push(idx);
            for n in neighbours(raster, idx) {
                if !seen[n] && raster.is_nodata(raster.data[n]) {
                    seen[n] = true;
                    queue.push_back(n);
                }
            }
        }
        components.push(cells);
    }
    components
}

/// Central difference where both sides are valid, one-sided otherwise
fn gradient(raster: &Raster, row: usize, col: usize) -> [f64; 2] {
    let value = |r: isize, c: isize| -> Option<f64> {
        if r < 0 || c < 0 || r >= raster.height as isize || c >= raster.width as isize {
            return None;
        }
        let v = raster.get(r as usize, c as usize);
        (!raster.is_nodata(v)).then_some(v)
    };
    let (r, c) = (row as isize, col as isize);
    let here = raster.get(row, col);
    let slope = |before: Option<f64>, after: Option<f64>| match (before, after) {
        (Some(b), Some(a)) => (a - b) / 2.0,
        (Some(b), None) => here - b,
        (None, Some(a)) => a - here,
        (None, None) => 0.0,
    };
    [
        slope(value(r, c - 1), value(r, c + 1)),
        slope(value(r - 1, c), value(r + 1, c)),
    ]
}

struct Node {
    point: Point2,
    value: f64,
    gradient: [f64; 2],
}

fn linear(nodes: [&Node; 3], w: [f64; 3]) -> f64 {
    w[0] * nodes[0].value + w[1] * nodes[1].value + w[2] * nodes[2].value
}

/// Cubic Bezier triangle whose edge control points follow the vertex
/// gradients; reproduces planes exactly and is C1 at the vertices.
fn cubic(nodes: [&Node; 3], w: [f64; 3]) -> f64 {
    let directional = |from: &Node, to: &Node| {
        let dx = to.point[0] - from.point[0];
        let dy = to.point[1] - from.point[1];
        from.value + (from.gradient[0] * dx + from.gradient[1] * dy) / 3.0
    };
    let [a, b, c] = nodes;
    let b300 = a.value;
    let b030 = b.value;
    let b003 = c.value;
    let b210 = directional(a, b);
    let b201 = directional(a, c);
    let b120 = directional(b, a);
    let b021 = directional(b, c);
    let b102 = directional(c, a);
    let b012 = directional(c, b);
    let edges = (b210 + b201 + b120 + b021 + b102 + b012) / 6.0;
    let vertices = (b300 + b030 + b003) / 3.0;
    let b111 = edges + (edges - vertices) / 2.0;

    let [u, v, t] = w;
    b300 * u.powi(3)
        + b030 * v.powi(3)
        + b003 * t.powi(3)
        + 3.0 * b210 * u * u * v
        + 3.0 * b201 * u * u * t
        + 3.0 * b120 * u * v * v
        + 3.0 * b021 * v * v * t
        + 3.0 * b102 * u * t * t
        + 3.0 * b012 * v * t * t
        + 6.0 * b111 * u * v * t
}

/// Fill each gap from a triangulation of the valid cells bordering it.
/// Cells outside the hull of those samples stay nodata.
/// Returns the number of cells filled.
pub fn fill_triangulated(raster: &mut Raster, smooth: bool) -> usize {
    let mut filled = Vec::new();

    for component in gap_components(raster) {
        let mut border: HashSet<usize> = HashSet::new();
        for &idx in &component {
            border.extend(neighbours(raster, idx).filter(|&n| !raster.is_nodata(raster.data[n])));
        }
        let mut border: Vec<usize> = border.into_iter().collect();
        border.sort_unstable();

        let nodes: Vec<Node> = border
            .iter()
            .map(|&idx| {
                let (row, col) = (idx / raster.width, idx % raster.width);
                Node {
                    point: pixel(raster, idx),
                    value: raster.data[idx],
                    gradient: if smooth { gradient(raster, row, col) } else { [0.0, 0.0] },
                }
            })
            .collect();

        let mesh = Triangulation::new(nodes.iter().map(|n| n.point).collect());
        if mesh.is_empty() {
            continue;
        }

        for idx in component {
            if let Some((Triangle(a, b, c), w)) = mesh.locate(pixel(raster, idx)) {
                let corners = [&nodes[a], &nodes[b], &nodes[c]];
                let value = if smooth { cubic(corners, w) } else { linear(corners, w) };
                filled.push((idx, value));
            }
        }
    }

    let count = filled.len();
    for (idx, value) in filled {
        raster.data[idx] = value;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const NODATA: f64 = -9999.0;

    fn plane(width: usize, height: usize, holes: &[(usize, usize)]) -> Raster {
        let mut data = Vec::new();
        for r in 0..height {
            for c in 0..width {
                data.push(2.0 * c as f64 + 3.0 * r as f64 + 1.0);
            }
        }
        for &(r, c) in holes {
            data[r * width + c] = NODATA;
        }
        Raster::new(width, height, [0.0, 1.0, 0.0, 0.0, 0.0, -1.0], "", NODATA, data).unwrap()
    }

    #[test]
    fn test_nearest() {
        let data = vec![1.0, NODATA, NODATA, NODATA, NODATA, 5.0];
        let mut r = Raster::new(6, 1, [0.0, 1.0, 0.0, 0.0, 0.0, -1.0], "", NODATA, data).unwrap();
        assert_eq!(fill_nearest(&mut r), 4);
        assert_eq!(r.data, vec![1.0, 1.0, 1.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_nearest_without_samples() {
        let mut r = Raster::new(2, 1, [0.0, 1.0, 0.0, 0.0, 0.0, -1.0], "", NODATA, vec![NODATA; 2]).unwrap();
        assert_eq!(fill_nearest(&mut r), 0);
        assert_eq!(r.nodata_count(), 2);
    }

    #[test]
    fn test_linear_plane() {
        let holes = [(2, 2), (2, 3), (3, 2), (3, 3)];
        let expected = plane(6, 6, &[]);
        let mut r = plane(6, 6, &holes);
        assert_eq!(fill_triangulated(&mut r, false), 4);
        for (a, b) in r.data.iter().zip(expected.data.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_cubic_plane() {
        let holes = [(2, 2), (2, 3), (3, 2)];
        let expected = plane(6, 6, &[]);
        let mut r = plane(6, 6, &holes);
        assert_eq!(fill_triangulated(&mut r, true), 3);
        for (a, b) in r.data.iter().zip(expected.data.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_outside_hull_stays_nodata() {
        // gap on the raster corner has no samples on two sides
        let mut r = plane(4, 4, &[(0, 0)]);
        fill_triangulated(&mut r, false);
        assert!(r.is_nodata(r.get(0, 0)));
    }

    #[test]
    fn test_components() {
        let r = plane(5, 5, &[(0, 0), (1, 1), (4, 4)]);
        let components = gap_components(&r);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![0, 6]);
        assert_eq!(components[1], vec![24]);
    }
}
