use crate::{Point2, Point3, VertexOwner};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The axis aligned parametric rectangle of a surface domain.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde")
)]
pub struct ParametricBounds {
    /// The lower left corner.
    pub min: Point2<f64>,
    /// The upper right corner.
    pub max: Point2<f64>,
}

impl ParametricBounds {
    /// Creates bounds from two corners.
    pub fn new(min: Point2<f64>, max: Point2<f64>) -> Self {
        ParametricBounds { min, max }
    }

    /// Returns `true` if the bounds span a non-empty rectangle.
    pub fn is_valid(&self) -> bool {
        self.min.x < self.max.x && self.min.y < self.max.y
    }

    /// Returns `true` if the point lies inside the rectangle, boundary
    /// included.
    pub fn contains(&self, point: Point2<f64>) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
    }

    /// The diagonal length of the rectangle.
    pub fn diameter(&self) -> f64 {
        self.max.distance_2(self.min).sqrt()
    }
}

/// One sampled point of a boundary loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryPoint {
    /// The parametric position of the point.
    pub uv: Point2<f64>,
    /// The boundary entity owning the point.
    pub owner: VertexOwner,
}

/// A closed, ordered loop of boundary points.
///
/// The loop is implicitly closed - the last point connects back to the
/// first. The first loop of a domain is its outer boundary; any further
/// loops are holes. Orientation does not matter, it is normalized during
/// seeding.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryLoop {
    /// The points of the loop, in traversal order.
    pub points: Vec<BoundaryPoint>,
}

/// The surface being meshed, seen purely through its parametrization.
///
/// This is the seam to the CAD geometry kernel: the engine only ever asks
/// for point evaluations, curvature samples and the boundary loops, and
/// never learns anything about the representation behind them.
pub trait SurfaceDomain {
    /// Evaluates the surface position at a parametric point.
    fn evaluate(&self, uv: Point2<f64>) -> Point3;

    /// A scalar curvature measure at a parametric point, used to derive
    /// curvature adapted element sizes.
    fn curvature(&self, uv: Point2<f64>) -> f64;

    /// The boundary loops of the domain. The first loop is the outer
    /// boundary, all others are holes.
    fn boundary_loops(&self) -> Vec<BoundaryLoop>;

    /// The parametric rectangle enclosing the domain.
    fn parametric_bounds(&self) -> ParametricBounds;
}

/// A flat rectangular domain, mainly useful for tests and simple meshes.
///
/// The parametrization is the identity into the z = 0 plane; boundary
/// edges can be pre-subdivided so that boundary spacing matches the target
/// element size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarRectangle {
    bounds: ParametricBounds,
    edge_subdivisions: usize,
}

impl PlanarRectangle {
    /// Creates a rectangle between the two corners.
    pub fn new(min: Point2<f64>, max: Point2<f64>) -> Self {
        PlanarRectangle {
            bounds: ParametricBounds::new(min, max),
            edge_subdivisions: 0,
        }
    }

    /// The unit square with corners (0, 0) and (1, 1).
    pub fn unit() -> Self {
        Self::new(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0))
    }

    /// Inserts `count` additional evenly spaced points on every boundary
    /// edge.
    pub fn with_edge_subdivisions(mut self, count: usize) -> Self {
        self.edge_subdivisions = count;
        self
    }
}

impl SurfaceDomain for PlanarRectangle {
    fn evaluate(&self, uv: Point2<f64>) -> Point3 {
        Point3::new(uv.x, uv.y, 0.0)
    }

    fn curvature(&self, _uv: Point2<f64>) -> f64 {
        0.0
    }

    fn boundary_loops(&self) -> Vec<BoundaryLoop> {
        let corners = [
            self.bounds.min,
            Point2::new(self.bounds.max.x, self.bounds.min.y),
            self.bounds.max,
            Point2::new(self.bounds.min.x, self.bounds.max.y),
        ];

        let mut points = Vec::new();
        for corner in 0..4 {
            let from = corners[corner];
            let to = corners[(corner + 1) % 4];
            points.push(BoundaryPoint {
                uv: from,
                owner: VertexOwner::Corner { id: corner as u32 },
            });
            for step in 1..=self.edge_subdivisions {
                let factor = step as f64 / (self.edge_subdivisions + 1) as f64;
                points.push(BoundaryPoint {
                    uv: from.add(to.sub(from).mul(factor)),
                    owner: VertexOwner::Curve {
                        id: corner as u32,
                        parameter: factor,
                    },
                });
            }
        }

        vec![BoundaryLoop { points }]
    }

    fn parametric_bounds(&self) -> ParametricBounds {
        self.bounds
    }
}
