use std::cell::Cell;
use std::{error::Error, fmt::Display};

use rstar::primitives::PointWithData;
use rstar::RTree;

use crate::domain::SurfaceDomain;
use crate::mesh_core::math;
use crate::mesh_core::{FixedTriangleHandle, PointLocation, Triangulation};
use crate::{
    interpolate_cross_angle, normalize_cross_angle, FieldStatistics, Metric, MetricSource, Point2,
};

/// A minimal nearest-neighbor index over a fixed point set.
///
/// The metric field only ever needs two operations from its spatial index,
/// so any implementation - an r-tree, a k-d tree, a grid - can be swapped
/// in without touching the field itself.
pub trait SpatialIndex {
    /// Builds the index over the given points. The reported ids are the
    /// indices into this slice.
    fn build(points: &[Point2<f64>]) -> Self;

    /// Returns the id of a point close to the query point, or `None` if
    /// the index is empty.
    fn nearest(&self, point: Point2<f64>) -> Option<usize>;
}

/// The default [SpatialIndex], backed by an r-tree.
#[derive(Debug, Clone)]
pub struct RStarIndex {
    tree: RTree<PointWithData<usize, [f64; 2]>>,
}

impl SpatialIndex for RStarIndex {
    fn build(points: &[Point2<f64>]) -> Self {
        let entries = points
            .iter()
            .enumerate()
            .map(|(id, point)| PointWithData::new(id, [point.x, point.y]))
            .collect();
        RStarIndex {
            tree: RTree::bulk_load(entries),
        }
    }

    fn nearest(&self, point: Point2<f64>) -> Option<usize> {
        self.tree
            .nearest_neighbor(&[point.x, point.y])
            .map(|entry| entry.data)
    }
}

/// How the per-node element sizes of a metric field are derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSpec {
    /// The same target size everywhere.
    Uniform(f64),
    /// Size proportional to the inverse surface curvature, clamped into
    /// `[min, max]`. Flat regions receive `max`.
    FromCurvature {
        /// Target size is `scale / |curvature|`.
        scale: f64,
        /// Lower size clamp.
        min: f64,
        /// Upper size clamp.
        max: f64,
    },
}

/// The orientation part of an anisotropic metric field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossFieldSpec {
    /// The cross direction, in radians from the u-axis. Stored normalized
    /// to the quarter turn range.
    pub angle: f64,
    /// The stretch ratio between the major and minor element size. Must be
    /// >= 1; a ratio of 1 keeps the field isotropic.
    pub anisotropy: f64,
}

/// The error type for metric field construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFieldError {
    /// The background triangulation has no live triangles.
    EmptyBackground,
}

impl Display for MetricFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Debug>::fmt(self, f)
    }
}

impl Error for MetricFieldError {}

/// Interpolates desired element size and orientation over a parametric
/// domain.
///
/// The field owns a coarse, immutable background triangulation whose nodes
/// carry a scalar size and a quarter-turn normalized cross angle. Queries
/// locate the containing background triangle through the spatial index and
/// a neighbor walk, then interpolate the nodal attributes barycentrically.
/// Precomputing the field once decouples the (expensive) curvature queries
/// of the CAD kernel from the refinement loop, which performs millions of
/// metric lookups.
///
/// A field is built once per domain and may be reused by any number of
/// meshing passes; it is always passed explicitly, there is no ambient
/// field state.
#[derive(Debug)]
pub struct MetricField<I: SpatialIndex = RStarIndex> {
    background: Triangulation,
    node_sizes: Vec<f64>,
    node_angles: Vec<f64>,
    anisotropy: f64,
    index: I,
    clamp_threshold: f64,
    clamped_queries: Cell<u64>,
    excessive_clamps: Cell<u64>,
    max_clamp_distance: Cell<f64>,
}

impl<I: SpatialIndex> MetricField<I> {
    /// Builds a field over an existing background triangulation.
    ///
    /// The background is compacted and must contain at least one triangle.
    /// Node attributes are sampled from the domain once, here; the main
    /// refinement loop never queries the domain for curvature again.
    pub fn new(
        mut background: Triangulation,
        domain: &dyn SurfaceDomain,
        size_spec: &SizeSpec,
        cross_field: Option<&CrossFieldSpec>,
    ) -> Result<Self, MetricFieldError> {
        background.compact();
        if background.num_triangles() == 0 {
            return Err(MetricFieldError::EmptyBackground);
        }

        let node_sizes = background
            .vertices()
            .iter()
            .map(|vertex| match *size_spec {
                SizeSpec::Uniform(size) => size,
                SizeSpec::FromCurvature { scale, min, max } => {
                    let curvature = domain.curvature(vertex.position()).abs();
                    if curvature > 0.0 {
                        (scale / curvature).clamp(min, max)
                    } else {
                        max
                    }
                }
            })
            .collect();

        let angle = cross_field.map_or(0.0, |spec| normalize_cross_angle(spec.angle));
        let node_angles = vec![angle; background.num_vertices()];
        let anisotropy = cross_field.map_or(1.0, |spec| spec.anisotropy.max(1.0));

        let centroids: Vec<_> = background
            .live_triangles()
            .map(|handle| centroid(background.triangle_positions(handle)))
            .collect();
        let index = I::build(&centroids);

        let clamp_threshold = domain.parametric_bounds().diameter() * 0.01;

        Ok(MetricField {
            background,
            node_sizes,
            node_angles,
            anisotropy,
            index,
            clamp_threshold,
            clamped_queries: Cell::new(0),
            excessive_clamps: Cell::new(0),
            max_clamp_distance: Cell::new(0.0),
        })
    }

    /// Overrides the distance above which a clamped query is counted as
    /// excessive. Defaults to 1 % of the parametric diameter.
    pub fn with_clamp_threshold(mut self, threshold: f64) -> Self {
        self.clamp_threshold = threshold;
        self
    }

    /// The background triangulation of the field.
    pub fn background(&self) -> &Triangulation {
        &self.background
    }

    /// The desired element size at a parametric point.
    pub fn size(&self, position: Point2<f64>) -> f64 {
        let (handle, weights) = self.locate_or_clamp(position);
        let vertices = self.background.triangle_vertices(handle);
        let mut size = 0.0;
        for (vertex, weight) in vertices.iter().zip(weights) {
            size += self.node_sizes[vertex.index()] * weight;
        }
        size
    }

    /// The cross field angle at a parametric point, in `[0, PI / 2)`.
    pub fn angle(&self, position: Point2<f64>) -> f64 {
        let (handle, weights) = self.locate_or_clamp(position);
        let vertices = self.background.triangle_vertices(handle);
        interpolate_cross_angle(
            vertices.map(|vertex| self.node_angles[vertex.index()]),
            weights,
        )
    }

    /// The interpolated metric tensor at a parametric point.
    pub fn metric(&self, position: Point2<f64>) -> Metric {
        let size = self.size(position);
        if self.anisotropy <= 1.0 {
            Metric::from_size(size)
        } else {
            Metric::from_sizes_and_angle(size, size / self.anisotropy, self.angle(position))
        }
    }

    /// Returns `true` if the point lies inside the background mesh.
    pub fn contains(&self, position: Point2<f64>) -> bool {
        matches!(
            self.background.locate(position),
            PointLocation::InTriangle(_) | PointLocation::OnEdge(_, _) | PointLocation::OnVertex(_)
        )
    }

    /// The largest clamp distance seen so far.
    pub fn max_clamp_distance(&self) -> f64 {
        self.max_clamp_distance.get()
    }

    fn locate_or_clamp(&self, position: Point2<f64>) -> (FixedTriangleHandle, [f64; 3]) {
        match self.background.locate(position) {
            PointLocation::InTriangle(handle) | PointLocation::OnEdge(handle, _) => {
                let weights = math::barycentric_coordinates(
                    self.background.triangle_positions(handle),
                    position,
                )
                .unwrap_or([1.0 / 3.0; 3]);
                (handle, weights)
            }
            PointLocation::OnVertex(vertex) => {
                let handle = self.nearest_triangle(position);
                let vertices = self.background.triangle_vertices(handle);
                let mut weights = [0.0; 3];
                match vertices.iter().position(|&other| other == vertex) {
                    Some(slot) => weights[slot] = 1.0,
                    None => weights = [1.0 / 3.0; 3],
                }
                (handle, weights)
            }
            PointLocation::OutsideDomain | PointLocation::NoTriangulation => {
                let handle = self.nearest_triangle(position);
                let positions = self.background.triangle_positions(handle);

                // Clamp the extrapolated barycentric weights back into the
                // triangle and renormalize.
                let raw = math::barycentric_coordinates(positions, position)
                    .unwrap_or([1.0 / 3.0; 3]);
                let mut weights = raw.map(|weight| weight.max(0.0));
                let total: f64 = weights.iter().sum();
                if total > 0.0 {
                    for weight in &mut weights {
                        *weight /= total;
                    }
                } else {
                    weights = [1.0 / 3.0; 3];
                }

                let distance = (0..3)
                    .map(|edge| {
                        math::distance_2(positions[edge], positions[(edge + 1) % 3], position)
                    })
                    .fold(f64::INFINITY, f64::min)
                    .sqrt();
                self.clamped_queries.set(self.clamped_queries.get() + 1);
                if distance > self.clamp_threshold {
                    self.excessive_clamps.set(self.excessive_clamps.get() + 1);
                }
                if distance > self.max_clamp_distance.get() {
                    self.max_clamp_distance.set(distance);
                }

                (handle, weights)
            }
        }
    }

    fn nearest_triangle(&self, position: Point2<f64>) -> FixedTriangleHandle {
        let id = self
            .index
            .nearest(position)
            .expect("the background mesh is never empty");
        FixedTriangleHandle::new(id)
    }
}

impl<I: SpatialIndex> MetricSource for MetricField<I> {
    fn metric_at(&self, position: Point2<f64>) -> Metric {
        self.metric(position)
    }

    fn in_domain(&self, position: Point2<f64>) -> bool {
        self.contains(position)
    }

    fn field_statistics(&self) -> Option<FieldStatistics> {
        Some(FieldStatistics {
            clamped_queries: self.clamped_queries.get(),
            excessive_clamps: self.excessive_clamps.get(),
        })
    }
}

fn centroid(positions: [Point2<f64>; 3]) -> Point2<f64> {
    Point2::new(
        (positions[0].x + positions[1].x + positions[2].x) / 3.0,
        (positions[0].y + positions[1].y + positions[2].y) / 3.0,
    )
}
