#![allow(missing_docs)]
use crate::mesh_core::math::metric_circumcircle;
use crate::mesh_core::triangulation::link_batch;
use crate::{MetricTransform, Point2, Point3, Triangulation, Vertex, VertexOwner};

use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;

pub const SEED: &[u8; 32] = b"kmSri71vSbdY6j0TsoGq34BMpXGHVdcE";

pub fn random_points_in_range(range: f64, size: usize, seed: &[u8; 32]) -> Vec<Point2<f64>> {
    let mut rng = rand::rngs::StdRng::from_seed(*seed);
    let range = Uniform::new(-range, range);
    let mut points = Vec::with_capacity(size);
    for _ in 0..size {
        let x = range.sample(&mut rng);
        let y = range.sample(&mut rng);
        points.push(Point2::new(x, y));
    }
    points
}

pub fn random_points_with_seed(size: usize, seed: &[u8; 32]) -> Vec<Point2<f64>> {
    random_points_in_range(1.0, size, seed)
}

pub fn test_vertex(x: f64, y: f64) -> Vertex {
    Vertex::new(
        Point2::new(x, y),
        Point3::new(x, y, 0.0),
        VertexOwner::Surface,
    )
}

/// Two triangles covering the unit square, sharing the diagonal from
/// (0, 0) to (1, 1).
pub fn unit_square_mesh() -> Triangulation {
    let mut triangulation = Triangulation::new();
    let v0 = triangulation.add_vertex(test_vertex(0.0, 0.0));
    let v1 = triangulation.add_vertex(test_vertex(1.0, 0.0));
    let v2 = triangulation.add_vertex(test_vertex(1.0, 1.0));
    let v3 = triangulation.add_vertex(test_vertex(0.0, 1.0));

    let transform = MetricTransform::identity();
    let lower = triangulation.add_triangle(
        [v0, v1, v2],
        metric_circumcircle(
            [
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 0.0),
                Point2::new(1.0, 1.0),
            ],
            &transform,
        ),
        transform,
    );
    let upper = triangulation.add_triangle(
        [v0, v2, v3],
        metric_circumcircle(
            [
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 1.0),
                Point2::new(0.0, 1.0),
            ],
            &transform,
        ),
        transform,
    );
    link_batch(&mut triangulation, &[lower, upper]);
    triangulation
}
