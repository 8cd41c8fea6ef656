//! # anisomesh
//!
//! Anisotropic surface mesh generation over parametric domains.
//!
//! Given a [SurfaceDomain] and a metric describing the desired local element
//! size and orientation, the generator produces a boundary-conforming
//! triangulation that satisfies a metric-weighted Delaunay property:
//!
//! * Robust geometric predicates (exact orientation tests, tolerance-banded
//!   in-circle classification under an anisotropic metric)
//! * Incremental Bowyer-Watson cavity retriangulation with undo support
//! * Priority-driven insertion with Bowyer-Watson, frontal, frontal-layered
//!   and parallelogram policies
//! * A precomputed [MetricField] (background mesh plus spatial index)
//!   interpolating sizes and cross field directions
//! * Cooperative cancellation and a single aggregated diagnostics summary
//!   per meshing pass
//!
//! # Example
//!
//! ```
//! use anisomesh::{triangulate, MeshingParameters, PlanarRectangle, UniformMetric};
//!
//! let domain = PlanarRectangle::unit().with_edge_subdivisions(3);
//! let metric = UniformMetric::from_size(0.25);
//!
//! let result = triangulate(&domain, &metric, &MeshingParameters::new(), None, None).unwrap();
//!
//! assert!(result.triangulation.num_triangles() > 0);
//! for triangle in result.triangle_indices() {
//!     // three counterclockwise vertex indices per triangle
//!     assert_eq!(triangle.len(), 3);
//! }
//! ```
//!
//! Anisotropic meshes are driven by a metric field built once per domain:
//!
//! ```
//! use anisomesh::{build_metric_field, triangulate, CrossFieldSpec, MeshingParameters,
//!                 PlanarRectangle, SizeSpec};
//!
//! let domain = PlanarRectangle::unit().with_edge_subdivisions(3);
//! let field = build_metric_field(
//!     &domain,
//!     &SizeSpec::Uniform(0.2),
//!     Some(&CrossFieldSpec { angle: 0.0, anisotropy: 2.0 }),
//! )
//! .unwrap();
//!
//! let result = triangulate(&domain, &field, &MeshingParameters::new(), None, None).unwrap();
//! assert!(result.diagnostics.is_clean());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod domain;
mod mesh_core;
mod mesh_generation;
mod metric;
mod metric_field;
mod point;

#[cfg(test)]
pub(crate) mod test_utilities;

pub use mesh_core::cavity;
pub use mesh_core::math;

pub use domain::{BoundaryLoop, BoundaryPoint, ParametricBounds, PlanarRectangle, SurfaceDomain};
pub use mesh_core::{
    FixedTriangleHandle, FixedVertexHandle, InsertionPolicy, PointLocation, TieBreak,
    Triangulation, Vertex, VertexOwner,
};
pub use mesh_generation::{
    build_metric_field, triangulate, triangulate_cancellable, triangulate_frontal,
    triangulate_frontal_layered, triangulate_parallelogram, BoundaryVertexRef, CompletionStatus,
    FixedParametricCoords, MeshingDiagnostics, MeshingError, MeshingParameters, MeshingResult,
    SeamEquivalence,
};
pub use metric::{
    interpolate_cross_angle, normalize_cross_angle, FieldStatistics, Metric, MetricSource,
    MetricTransform, UniformMetric,
};
pub use metric_field::{
    CrossFieldSpec, MetricField, MetricFieldError, RStarIndex, SizeSpec, SpatialIndex,
};
pub use point::{MeshNum, Point2, Point3};
