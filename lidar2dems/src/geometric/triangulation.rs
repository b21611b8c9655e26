//! Delaunay triangulation of scattered samples (Bowyer-Watson), with a
//! triangle locator for barycentric lookups.

use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use std::collections::HashMap;

pub type Point2 = [f64; 2];

/// Vertex indices into the point list, counter-clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triangle(pub usize, pub usize, pub usize);

#[derive(Debug, Clone, Copy)]
struct Circle {
    center: Point2,
    radius2: f64,
}

impl Circle {
    fn contains(&self, p: Point2) -> bool {
        if !self.radius2.is_finite() {
            return true;
        }
        let dx = p[0] - self.center[0];
        let dy = p[1] - self.center[1];
        dx * dx + dy * dy < self.radius2
    }
}

fn circumcircle(a: Point2, b: Point2, c: Point2) -> Circle {
    let d = 2.0 * (a[0] * (b[1] - c[1]) + b[0] * (c[1] - a[1]) + c[0] * (a[1] - b[1]));
    if d.abs() < f64::EPSILON {
        return Circle {
            center: [f64::NAN, f64::NAN],
            radius2: f64::INFINITY,
        };
    }
    let a2 = a[0] * a[0] + a[1] * a[1];
    let b2 = b[0] * b[0] + b[1] * b[1];
    let c2 = c[0] * c[0] + c[1] * c[1];
    let ux = (a2 * (b[1] - c[1]) + b2 * (c[1] - a[1]) + c2 * (a[1] - b[1])) / d;
    let uy = (a2 * (c[0] - b[0]) + b2 * (a[0] - c[0]) + c2 * (b[0] - a[0])) / d;
    let dx = a[0] - ux;
    let dy = a[1] - uy;
    Circle {
        center: [ux, uy],
        radius2: dx * dx + dy * dy,
    }
}

fn orient(a: Point2, b: Point2, c: Point2) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// Barycentric weights of `p` in triangle (a, b, c); `None` for a degenerate triangle
pub fn barycentric(p: Point2, a: Point2, b: Point2, c: Point2) -> Option<[f64; 3]> {
    let det = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
    if det.abs() < 1e-12 {
        return None;
    }
    let l1 = ((b[1] - c[1]) * (p[0] - c[0]) + (c[0] - b[0]) * (p[1] - c[1])) / det;
    let l2 = ((c[1] - a[1]) * (p[0] - c[0]) + (a[0] - c[0]) * (p[1] - c[1])) / det;
    Some([l1, l2, 1.0 - l1 - l2])
}

type TriangleEnvelope = GeomWithData<Rectangle<Point2>, usize>;

pub struct Triangulation {
    points: Vec<Point2>,
    triangles: Vec<Triangle>,
    index: RTree<TriangleEnvelope>,
}

impl Triangulation {
    /// Triangulate `points`. Fewer than three points, or all points on one
    /// line, give an empty triangulation.
    pub fn new(points: Vec<Point2>) -> Self {
        let triangles = bowyer_watson(&points);
        let envelopes = triangles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let (a, b, c) = (points[t.0], points[t.1], points[t.2]);
                let lower = [a[0].min(b[0]).min(c[0]), a[1].min(b[1]).min(c[1])];
                let upper = [a[0].max(b[0]).max(c[0]), a[1].max(b[1]).max(c[1])];
                GeomWithData::new(Rectangle::from_corners(lower, upper), i)
            })
            .collect();
        Triangulation {
            points,
            triangles,
            index: RTree::bulk_load(envelopes),
        }
    }

    pub fn points(&self) -> &[Point2] {
        &self.points
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Triangle containing `p` (boundary included) and the barycentric weights of `p` in it
    pub fn locate(&self, p: Point2) -> Option<(Triangle, [f64; 3])> {
        const TOLERANCE: f64 = -1e-9;
        self.index.locate_all_at_point(&p).find_map(|candidate| {
            let t = self.triangles[candidate.data];
            let w = barycentric(p, self.points[t.0], self.points[t.1], self.points[t.2])?;
            if w.iter().all(|&x| x >= TOLERANCE) {
                Some((t, w))
            } else {
                None
            }
        })
    }
}

fn bowyer_watson(points: &[Point2]) -> Vec<Triangle> {
    let n = points.len();
    if n < 3 {
        return Vec::new();
    }

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in points {
        min_x = min_x.min(p[0]);
        min_y = min_y.min(p[1]);
        max_x = max_x.max(p[0]);
        max_y = max_y.max(p[1]);
    }
    let span = (max_x - min_x).max(max_y - min_y).max(1.0);
    let mid = [(min_x + max_x) / 2.0, (min_y + max_y) / 2.0];

    // super triangle enclosing every sample, stored after the real points
    let mut all: Vec<Point2> = points.to_vec();
    all.push([mid[0] - 100.0 * span, mid[1] - 100.0 * span]);
    all.push([mid[0] + 100.0 * span, mid[1] - 100.0 * span]);
    all.push([mid[0], mid[1] + 100.0 * span]);

    let mut triangles: Vec<(Triangle, Circle)> = vec![(
        Triangle(n, n + 1, n + 2),
        circumcircle(all[n], all[n + 1], all[n + 2]),
    )];

    for i in 0..n {
        let p = all[i];
        let mut edges: HashMap<(usize, usize), (usize, usize, u32)> = HashMap::new();
        triangles.retain(|(t, circle)| {
            if !circle.contains(p) {
                return true;
            }
            for (a, b) in [(t.0, t.1), (t.1, t.2), (t.2, t.0)] {
                let key = (a.min(b), a.max(b));
                edges.entry(key).or_insert((a, b, 0)).2 += 1;
            }
            false
        });

        for (a, b, count) in edges.into_values() {
            if count != 1 {
                continue;
            }
            let tri = if orient(all[a], all[b], p) >= 0.0 {
                Triangle(a, b, i)
            } else {
                Triangle(b, a, i)
            };
            triangles.push((tri, circumcircle(all[tri.0], all[tri.1], all[tri.2])));
        }
    }

    triangles
        .into_iter()
        .map(|(t, _)| t)
        .filter(|t| t.0 < n && t.1 < n && t.2 < n)
        .filter(|t| orient(points[t.0], points[t.1], points[t.2]).abs() > f64::EPSILON)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn area(t: &Triangulation) -> f64 {
        t.triangles()
            .iter()
            .map(|tri| orient(t.points()[tri.0], t.points()[tri.1], t.points()[tri.2]).abs() / 2.0)
            .sum()
    }

    #[test]
    fn test_square() {
        let t = Triangulation::new(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]);
        assert_eq!(t.triangles().len(), 2);
        assert_relative_eq!(area(&t), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_grid_covers_hull() {
        let mut pts = Vec::new();
        for r in 0..5 {
            for c in 0..5 {
                pts.push([c as f64, r as f64]);
            }
        }
        let t = Triangulation::new(pts);
        assert_eq!(t.triangles().len(), 32);
        assert_relative_eq!(area(&t), 16.0, epsilon = 1e-9);
    }

    #[test]
    fn test_collinear_is_empty() {
        let t = Triangulation::new(vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]);
        assert!(t.is_empty());
        assert!(t.locate([1.0, 1.0]).is_none());
        assert!(Triangulation::new(vec![[0.0, 0.0], [1.0, 0.0]]).is_empty());
    }

    #[test]
    fn test_locate() {
        let t = Triangulation::new(vec![[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]]);
        let (_, w) = t.locate([1.0, 1.0]).unwrap();
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(w.iter().all(|&x| x > 0.0));
        assert!(t.locate([3.0, 3.0]).is_none());
        // on an edge
        assert!(t.locate([2.0, 0.0]).is_some());
    }

    #[test]
    fn test_barycentric_vertices() {
        let w = barycentric([0.0, 0.0], [0.0, 0.0], [1.0, 0.0], [0.0, 1.0]).unwrap();
        assert_relative_eq!(w[0], 1.0);
        assert_relative_eq!(w[1], 0.0);
        assert_relative_eq!(w[2], 0.0);
        assert!(barycentric([0.0, 0.0], [0.0, 0.0], [1.0, 1.0], [2.0, 2.0]).is_none());
    }
}
