use std::sync::atomic::{AtomicBool, Ordering};
use std::{error::Error, fmt::Display};

use hashbrown::HashSet;

use crate::domain::SurfaceDomain;
use crate::mesh_core::cavity::{self, CavityParameters, InsertionOutcome, PostponeReason};
use crate::mesh_core::math::{self, CoordinateError};
use crate::mesh_core::seeding::{self, LoopVertex, SeedingError};
use crate::mesh_core::{
    FixedTriangleHandle, FixedVertexHandle, InsertionPolicy, InsertionScheduler, TieBreak,
    Triangulation, Vertex, VertexOwner,
};
use crate::metric_field::{CrossFieldSpec, MetricField, SizeSpec};
use crate::{MetricSource, Point2, UniformMetric};

/// Controls how a meshing pass is performed.
///
/// The following values are used by `Self::default`:
/// * `max_points`: unlimited
/// * `size_bound`: 1.0 - split every triangle whose metric circumradius
///   exceeds one metric unit
/// * `boundary_tolerance`: 1.0e-10
/// * `short_edge_guard`: 0.5 metric units
/// * `tie_break`: [TieBreak::OldestFirst]
/// * `max_consecutive_rejections`: 64
#[derive(Debug, Clone, PartialEq)]
pub struct MeshingParameters {
    max_points: Option<usize>,
    size_bound: f64,
    boundary_tolerance: f64,
    short_edge_guard: f64,
    tie_break: TieBreak,
    max_consecutive_rejections: usize,
}

impl Default for MeshingParameters {
    fn default() -> Self {
        MeshingParameters {
            max_points: None,
            size_bound: 1.0,
            boundary_tolerance: 1.0e-10,
            short_edge_guard: 0.5,
            tie_break: TieBreak::OldestFirst,
            max_consecutive_rejections: 64,
        }
    }
}

impl MeshingParameters {
    /// Creates a new set of `MeshingParameters`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the number of points inserted on top of the boundary points.
    ///
    /// Reaching the budget is a normal termination mode, reported as
    /// [CompletionStatus::PointBudgetReached] together with the best
    /// triangulation achieved so far. A budget of zero meshes the boundary
    /// and refines nothing.
    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = Some(max_points);
        self
    }

    /// Sets the largest tolerated metric circumradius.
    ///
    /// Triangles above the bound are queued for refinement. Lower values
    /// produce denser meshes relative to the metric field.
    pub fn with_size_bound(mut self, size_bound: f64) -> Self {
        self.size_bound = size_bound;
        self
    }

    /// Sets the relative tolerance of in-circumcircle classifications.
    ///
    /// Near-cocircular configurations within the tolerance band are treated
    /// as boundary cases instead of flickering between inside and outside.
    pub fn with_boundary_tolerance(mut self, boundary_tolerance: f64) -> Self {
        self.boundary_tolerance = boundary_tolerance;
        self
    }

    /// Sets the minimum metric distance kept between a new candidate and
    /// the vertices of its cavity. Zero disables the guard.
    pub fn with_short_edge_guard(mut self, short_edge_guard: f64) -> Self {
        self.short_edge_guard = short_edge_guard;
        self
    }

    /// Sets the tie-break rule between queue entries of equal priority.
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Sets how many rejected insertions in a row stop the pass.
    pub fn with_max_consecutive_rejections(mut self, limit: usize) -> Self {
        self.max_consecutive_rejections = limit;
        self
    }
}

/// A reference to one point of one boundary loop, as reported by
/// [SurfaceDomain::boundary_loops].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundaryVertexRef {
    /// Index of the loop within the domain's loops.
    pub loop_index: usize,
    /// Index of the point within the loop.
    pub point_index: usize,
}

/// Pairs of boundary points that are the same geometric point across a
/// parametric seam.
///
/// The engine unifies the surface positions of each pair and records the
/// vertices as seam partners in the resulting triangulation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeamEquivalence {
    /// The seam pairs.
    pub pairs: Vec<(BoundaryVertexRef, BoundaryVertexRef)>,
}

/// Pins the parametric coordinates of selected boundary points instead of
/// using the coordinates reported by the domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedParametricCoords {
    /// Pairs of a boundary point reference and its pinned (u, v).
    pub coords: Vec<(BoundaryVertexRef, Point2<f64>)>,
}

/// The error type of a meshing pass.
///
/// Every variant is a contract violation; recoverable conditions never
/// surface here but are aggregated into [MeshingDiagnostics] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshingError {
    /// The domain reported an empty or inverted parametric rectangle.
    InvertedParametricBounds,
    /// The domain reported no boundary loops.
    EmptyBoundary,
    /// A boundary loop has fewer than three points.
    BoundaryLoopTooSmall {
        /// Index of the offending loop.
        loop_index: usize,
    },
    /// A boundary loop could not be triangulated.
    DegenerateBoundaryLoop {
        /// Index of the offending loop.
        loop_index: usize,
    },
    /// A hole loop vertex could not be inserted into the triangulation.
    HoleInsertionFailed {
        /// Index of the offending loop.
        loop_index: usize,
    },
    /// A boundary coordinate was NaN or outside the representable range.
    InvalidCoordinate(CoordinateError),
    /// A seam or pinned-coordinate reference points outside the boundary
    /// loops.
    BoundaryReferenceOutOfRange,
    /// The coarse background pass produced no triangles.
    EmptyBackgroundMesh,
}

impl Display for MeshingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshingError::InvertedParametricBounds => {
                write!(f, "the parametric bounds are empty or inverted")
            }
            MeshingError::EmptyBoundary => write!(f, "the domain has no boundary loops"),
            MeshingError::BoundaryLoopTooSmall { loop_index } => {
                write!(f, "boundary loop {loop_index} has fewer than three points")
            }
            MeshingError::DegenerateBoundaryLoop { loop_index } => {
                write!(f, "boundary loop {loop_index} could not be triangulated")
            }
            MeshingError::HoleInsertionFailed { loop_index } => {
                write!(f, "a vertex of hole loop {loop_index} could not be inserted")
            }
            MeshingError::InvalidCoordinate(error) => {
                write!(f, "invalid boundary coordinate: {error}")
            }
            MeshingError::BoundaryReferenceOutOfRange => {
                write!(f, "a boundary point reference is out of range")
            }
            MeshingError::EmptyBackgroundMesh => {
                write!(f, "the background mesh pass produced no triangles")
            }
        }
    }
}

impl Error for MeshingError {}

/// How a meshing pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// No triangle violates the size criterion.
    Converged,
    /// The point budget was exhausted before convergence. The result is
    /// the best triangulation achieved so far.
    PointBudgetReached,
    /// Too many consecutive insertions were rejected; the unmeshed
    /// constraint edges are listed in the diagnostics.
    RejectionLimitReached,
    /// The external cancellation flag was raised. The result is the last
    /// valid triangulation.
    Cancelled,
}

/// Aggregated non-fatal conditions of a meshing pass.
///
/// The engine never prints; everything a caller might want to warn about
/// is collected here and attached to the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshingDiagnostics {
    /// Candidates dropped for transient reasons (degenerate positions,
    /// metric failures, short edges, duplicates).
    pub postponed_candidates: u64,
    /// Candidates rejected due to constraint conflicts.
    pub rejected_candidates: u64,
    /// Candidates outside the domain, dropped without insertion.
    pub out_of_domain_candidates: u64,
    /// Metric field queries clamped back into the background mesh.
    pub clamped_field_queries: u64,
    /// Clamped queries whose distance exceeded the sanity threshold.
    pub excessive_field_clamps: u64,
    /// Constraint edges that remained adjacent to unrefinable or
    /// unrecovered regions.
    pub unmeshed_constraint_edges: Vec<(FixedVertexHandle, FixedVertexHandle)>,
}

impl MeshingDiagnostics {
    /// Returns `true` if nothing noteworthy happened.
    pub fn is_clean(&self) -> bool {
        self.rejected_candidates == 0
            && self.excessive_field_clamps == 0
            && self.unmeshed_constraint_edges.is_empty()
    }
}

impl Display for MeshingDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} postponed, {} rejected, {} out of domain, {} clamped field queries \
             ({} excessive), {} unmeshed constraint edges",
            self.postponed_candidates,
            self.rejected_candidates,
            self.out_of_domain_candidates,
            self.clamped_field_queries,
            self.excessive_field_clamps,
            self.unmeshed_constraint_edges.len(),
        )
    }
}

/// The result of a meshing pass.
#[derive(Debug)]
pub struct MeshingResult {
    /// The compacted triangulation.
    pub triangulation: Triangulation,
    /// How the pass ended.
    pub completion: CompletionStatus,
    /// Aggregated non-fatal conditions.
    pub diagnostics: MeshingDiagnostics,
}

impl MeshingResult {
    /// The vertices of the mesh, in insertion order.
    pub fn vertices(&self) -> &[Vertex] {
        self.triangulation.vertices()
    }

    /// The vertex index triple of every triangle.
    pub fn triangle_indices(&self) -> Vec<[u32; 3]> {
        self.triangulation.triangle_vertex_indices()
    }
}

/// Triangulates a domain with the default Bowyer-Watson policy.
///
/// The metric source decides the local element size and orientation; pass a
/// [UniformMetric] for isotropic meshes or a prebuilt
/// [MetricField](crate::MetricField) for adaptive ones.
pub fn triangulate(
    domain: &dyn SurfaceDomain,
    metric_source: &dyn MetricSource,
    parameters: &MeshingParameters,
    seam_equivalence: Option<&SeamEquivalence>,
    fixed_coords: Option<&FixedParametricCoords>,
) -> Result<MeshingResult, MeshingError> {
    run(
        domain,
        metric_source,
        parameters,
        seam_equivalence,
        fixed_coords,
        InsertionPolicy::BowyerWatson,
        None,
    )
}

/// Like [triangulate], but polls the given flag after every insertion and
/// stops cleanly when it is raised.
///
/// The result of a cancelled pass is the last valid triangulation - the
/// engine never stops mid-mutation.
pub fn triangulate_cancellable(
    domain: &dyn SurfaceDomain,
    metric_source: &dyn MetricSource,
    parameters: &MeshingParameters,
    seam_equivalence: Option<&SeamEquivalence>,
    fixed_coords: Option<&FixedParametricCoords>,
    cancel: &AtomicBool,
) -> Result<MeshingResult, MeshingError> {
    run(
        domain,
        metric_source,
        parameters,
        seam_equivalence,
        fixed_coords,
        InsertionPolicy::BowyerWatson,
        Some(cancel),
    )
}

/// Triangulates a domain by advancing a front from the boundary inward.
///
/// Candidates are placed at the locally desired size over the front edges
/// instead of at circumcenters; the insertion itself runs through the same
/// cavity machinery as the default policy.
pub fn triangulate_frontal(
    domain: &dyn SurfaceDomain,
    metric_source: &dyn MetricSource,
    parameters: &MeshingParameters,
    seam_equivalence: Option<&SeamEquivalence>,
    fixed_coords: Option<&FixedParametricCoords>,
) -> Result<MeshingResult, MeshingError> {
    run(
        domain,
        metric_source,
        parameters,
        seam_equivalence,
        fixed_coords,
        InsertionPolicy::Frontal,
        None,
    )
}

/// Frontal triangulation biased toward right-angled, quad-pairable
/// triangle pairs.
///
/// `quad_bias` is clamped into `[0, 1]`; 0 behaves like
/// [triangulate_frontal], 1 places every candidate perpendicularly over the
/// front edge midpoint.
pub fn triangulate_frontal_layered(
    domain: &dyn SurfaceDomain,
    metric_source: &dyn MetricSource,
    quad_bias: f64,
    parameters: &MeshingParameters,
    seam_equivalence: Option<&SeamEquivalence>,
    fixed_coords: Option<&FixedParametricCoords>,
) -> Result<MeshingResult, MeshingError> {
    run(
        domain,
        metric_source,
        parameters,
        seam_equivalence,
        fixed_coords,
        InsertionPolicy::FrontalLayered {
            quad_bias: quad_bias.clamp(0.0, 1.0),
        },
        None,
    )
}

/// Triangulates a domain by first seeding a structured, metric-aligned
/// point lattice and then filling the irregular remainder.
pub fn triangulate_parallelogram(
    domain: &dyn SurfaceDomain,
    metric_source: &dyn MetricSource,
    parameters: &MeshingParameters,
    seam_equivalence: Option<&SeamEquivalence>,
    fixed_coords: Option<&FixedParametricCoords>,
) -> Result<MeshingResult, MeshingError> {
    run(
        domain,
        metric_source,
        parameters,
        seam_equivalence,
        fixed_coords,
        InsertionPolicy::Parallelogram,
        None,
    )
}

/// Builds a metric field for a domain.
///
/// A coarse isotropic pass over the same machinery produces the background
/// triangulation; its nodes are then attributed from the size and cross
/// field specifications. The field is reusable across any number of
/// `triangulate*` calls on the same domain.
pub fn build_metric_field(
    domain: &dyn SurfaceDomain,
    size_spec: &SizeSpec,
    cross_field: Option<&CrossFieldSpec>,
) -> Result<MetricField, MeshingError> {
    let bounds = domain.parametric_bounds();
    if !bounds.is_valid() {
        return Err(MeshingError::InvertedParametricBounds);
    }

    let coarse = UniformMetric::from_size(bounds.diameter() / 4.0);
    let parameters = MeshingParameters::new().with_max_points(32);
    let result = run(
        domain,
        &coarse,
        &parameters,
        None,
        None,
        InsertionPolicy::BowyerWatson,
        None,
    )?;

    MetricField::new(result.triangulation, domain, size_spec, cross_field)
        .map_err(|_| MeshingError::EmptyBackgroundMesh)
}

fn run(
    domain: &dyn SurfaceDomain,
    metric_source: &dyn MetricSource,
    parameters: &MeshingParameters,
    seam_equivalence: Option<&SeamEquivalence>,
    fixed_coords: Option<&FixedParametricCoords>,
    policy: InsertionPolicy,
    cancel: Option<&AtomicBool>,
) -> Result<MeshingResult, MeshingError> {
    let bounds = domain.parametric_bounds();
    if !bounds.is_valid() {
        return Err(MeshingError::InvertedParametricBounds);
    }
    let loops = domain.boundary_loops();
    if loops.is_empty() {
        return Err(MeshingError::EmptyBoundary);
    }

    let mut seed_loops: Vec<Vec<LoopVertex>> = Vec::with_capacity(loops.len());
    for (loop_index, boundary_loop) in loops.iter().enumerate() {
        if boundary_loop.points.len() < 3 {
            return Err(MeshingError::BoundaryLoopTooSmall { loop_index });
        }
        seed_loops.push(
            boundary_loop
                .points
                .iter()
                .map(|point| LoopVertex {
                    position: point.uv,
                    position_3d: Default::default(),
                    owner: point.owner,
                })
                .collect(),
        );
    }

    if let Some(fixed) = fixed_coords {
        for (reference, uv) in &fixed.coords {
            let point = seed_loops
                .get_mut(reference.loop_index)
                .and_then(|loop_points| loop_points.get_mut(reference.point_index))
                .ok_or(MeshingError::BoundaryReferenceOutOfRange)?;
            point.position = *uv;
        }
    }
    if let Some(seam) = seam_equivalence {
        for (first, second) in &seam.pairs {
            for reference in [first, second] {
                let in_range = seed_loops
                    .get(reference.loop_index)
                    .is_some_and(|loop_points| reference.point_index < loop_points.len());
                if !in_range {
                    return Err(MeshingError::BoundaryReferenceOutOfRange);
                }
            }
        }
    }

    for loop_points in &mut seed_loops {
        for point in loop_points.iter_mut() {
            math::validate_position(point.position).map_err(MeshingError::InvalidCoordinate)?;
            point.position_3d = domain.evaluate(point.position);
        }
    }

    let initial_field_statistics = metric_source.field_statistics().unwrap_or_default();

    let mut triangulation = Triangulation::new();
    let seeding_parameters = CavityParameters {
        boundary_tolerance: parameters.boundary_tolerance,
        short_edge_guard: 0.0,
    };
    let seeded = seeding::seed_boundary(
        &mut triangulation,
        &seed_loops,
        metric_source,
        &seeding_parameters,
    )
    .map_err(|error| match error {
        SeedingError::DegenerateLoop(loop_index) => {
            MeshingError::DegenerateBoundaryLoop { loop_index }
        }
        SeedingError::HoleInsertionFailed(loop_index) => {
            MeshingError::HoleInsertionFailed { loop_index }
        }
    })?;

    let mut diagnostics = MeshingDiagnostics::default();
    diagnostics
        .unmeshed_constraint_edges
        .extend(seeded.unrecovered_edges.iter().copied());

    if let Some(seam) = seam_equivalence {
        for (first, second) in &seam.pairs {
            let first = seeded.loop_vertices[first.loop_index][first.point_index];
            let second = seeded.loop_vertices[second.loop_index][second.point_index];
            triangulation.unify_seam_positions(first, second);
        }
    }

    // Graph distance from the boundary, maintained per vertex; only the
    // frontal policies read it.
    let mut front_distance: Vec<u32> = vec![0; triangulation.num_vertices()];

    let insertion_parameters = CavityParameters {
        boundary_tolerance: parameters.boundary_tolerance,
        short_edge_guard: parameters.short_edge_guard,
    };

    let mut inserted_points = 0;
    if matches!(policy, InsertionPolicy::Parallelogram) {
        inserted_points += seed_lattice(
            domain,
            metric_source,
            &mut triangulation,
            &insertion_parameters,
            parameters,
            &mut diagnostics,
            &mut front_distance,
        );
    }

    let mut scheduler = InsertionScheduler::new(parameters.tie_break);
    let size_bound2 = parameters.size_bound * parameters.size_bound;
    for handle in triangulation.live_triangles() {
        schedule_if_oversized(
            &mut scheduler,
            &triangulation,
            handle,
            size_bound2,
            policy,
            &front_distance,
        );
    }

    let mut completion = CompletionStatus::Converged;
    let mut consecutive_rejections = 0;

    while let Some(worst) = scheduler.pop_worst(&triangulation) {
        // The natural checkpoint: the previous insertion is complete, the
        // triangulation is in a valid state.
        if let Some(cancel) = cancel {
            if cancel.load(Ordering::Relaxed) {
                completion = CompletionStatus::Cancelled;
                break;
            }
        }
        if let Some(max_points) = parameters.max_points {
            if inserted_points >= max_points {
                completion = CompletionStatus::PointBudgetReached;
                break;
            }
        }

        let primary = match candidate_position(policy, &triangulation, worst, &front_distance) {
            Some(candidate) => candidate,
            None => {
                diagnostics.postponed_candidates += 1;
                continue;
            }
        };
        // A candidate escaping the domain falls back to splitting the
        // triangle's longest metric edge, whose midpoint always lies in
        // the triangulated region.
        let candidate = if metric_source.in_domain(primary) {
            primary
        } else {
            diagnostics.out_of_domain_candidates += 1;
            longest_edge_midpoint(&triangulation, worst)
        };

        let outcome = cavity::insert_point(
            &mut triangulation,
            candidate,
            domain.evaluate(candidate),
            VertexOwner::Surface,
            metric_source,
            &insertion_parameters,
        );
        let outcome = match outcome {
            InsertionOutcome::Postponed(PostponeReason::OutsideDomain) if candidate == primary => {
                diagnostics.out_of_domain_candidates += 1;
                let fallback = longest_edge_midpoint(&triangulation, worst);
                cavity::insert_point(
                    &mut triangulation,
                    fallback,
                    domain.evaluate(fallback),
                    VertexOwner::Surface,
                    metric_source,
                    &insertion_parameters,
                )
            }
            other => other,
        };

        match outcome {
            InsertionOutcome::Inserted(record) => {
                inserted_points += 1;
                consecutive_rejections = 0;

                let depth = record
                    .polygon_vertices()
                    .map(|vertex| front_distance[vertex.index()])
                    .min()
                    .unwrap_or(0)
                    + 1;
                front_distance.push(depth);
                debug_assert_eq!(front_distance.len(), triangulation.num_vertices());

                for &created in record.created() {
                    schedule_if_oversized(
                        &mut scheduler,
                        &triangulation,
                        created,
                        size_bound2,
                        policy,
                        &front_distance,
                    );
                }
            }
            InsertionOutcome::Postponed(PostponeReason::OutsideDomain) => {
                diagnostics.out_of_domain_candidates += 1;
            }
            InsertionOutcome::Postponed(_) => {
                diagnostics.postponed_candidates += 1;
            }
            InsertionOutcome::Rejected(_) => {
                diagnostics.rejected_candidates += 1;
                consecutive_rejections += 1;
                if consecutive_rejections > parameters.max_consecutive_rejections {
                    completion = CompletionStatus::RejectionLimitReached;
                    collect_unmeshed_edges(&triangulation, size_bound2, &mut diagnostics);
                    break;
                }
            }
        }
    }

    if let Some(statistics) = metric_source.field_statistics() {
        diagnostics.clamped_field_queries =
            statistics.clamped_queries - initial_field_statistics.clamped_queries;
        diagnostics.excessive_field_clamps =
            statistics.excessive_clamps - initial_field_statistics.excessive_clamps;
    }

    triangulation.compact();
    tracing::debug!(
        vertices = triangulation.num_vertices(),
        triangles = triangulation.num_triangles(),
        inserted = inserted_points,
        completion = ?completion,
        "meshing pass finished"
    );
    if !diagnostics.is_clean() {
        tracing::debug!(%diagnostics, "meshing pass reported anomalies");
    }

    Ok(MeshingResult {
        triangulation,
        completion,
        diagnostics,
    })
}

fn schedule_if_oversized(
    scheduler: &mut InsertionScheduler,
    triangulation: &Triangulation,
    handle: FixedTriangleHandle,
    size_bound2: f64,
    policy: InsertionPolicy,
    front_distance: &[u32],
) {
    let radius2 = match triangulation.circumcircle(handle).radius2() {
        Some(radius2) => radius2,
        None => return,
    };
    if radius2 <= size_bound2 {
        return;
    }

    let key = match policy {
        InsertionPolicy::BowyerWatson | InsertionPolicy::Parallelogram => radius2,
        InsertionPolicy::Frontal | InsertionPolicy::FrontalLayered { .. } => {
            let depth = triangulation
                .triangle_vertices(handle)
                .iter()
                .map(|vertex| front_distance[vertex.index()])
                .min()
                .unwrap_or(0);
            -(depth as f64)
        }
    };
    scheduler.push(handle, key);
}

/// The parametric midpoint of a triangle's longest metric edge.
///
/// Used as the fallback split position when a circumcenter or frontal
/// candidate leaves the domain. A midpoint on a boundary edge triggers the
/// boundary split path of the cavity engine.
fn longest_edge_midpoint(
    triangulation: &Triangulation,
    handle: FixedTriangleHandle,
) -> Point2<f64> {
    let transform = triangulation.metric_transform(handle);
    let positions = triangulation.triangle_positions(handle);

    let mut longest_edge = 0;
    let mut longest_length2 = -1.0;
    for edge in 0..3 {
        let from = transform.apply(positions[(edge + 1) % 3]);
        let to = transform.apply(positions[(edge + 2) % 3]);
        let length2 = from.distance_2(to);
        if length2 > longest_length2 {
            longest_length2 = length2;
            longest_edge = edge;
        }
    }

    let from = positions[(longest_edge + 1) % 3];
    let to = positions[(longest_edge + 2) % 3];
    from.add(to).mul(0.5)
}

fn candidate_position(
    policy: InsertionPolicy,
    triangulation: &Triangulation,
    handle: FixedTriangleHandle,
    front_distance: &[u32],
) -> Option<Point2<f64>> {
    let transform = triangulation.metric_transform(handle);
    let center = triangulation.circumcircle(handle).center()?;

    let quad_bias = match policy {
        InsertionPolicy::BowyerWatson | InsertionPolicy::Parallelogram => {
            return Some(transform.apply_inverse(center));
        }
        InsertionPolicy::Frontal => 0.0,
        InsertionPolicy::FrontalLayered { quad_bias } => quad_bias,
    };

    // The front edge is the triangle edge closest to the advancing front.
    let mut front_edge = 0;
    let mut best_depth = u64::MAX;
    for edge in 0..3 {
        let (from, to) = triangulation.edge_vertices(handle, edge);
        let depth = front_distance[from.index()] as u64 + front_distance[to.index()] as u64;
        if depth < best_depth {
            best_depth = depth;
            front_edge = edge;
        }
    }

    let (from, to) = triangulation.edge_vertices(handle, front_edge);
    let from_metric = transform.apply(triangulation.vertex(from).position());
    let to_metric = transform.apply(triangulation.vertex(to).position());
    let midpoint = from_metric.add(to_metric).mul(0.5);

    // The circumcenter lies on the perpendicular bisector of the edge, so
    // this direction is the edge normal pointing into the triangle.
    let toward_center = center.sub(midpoint);
    let center_distance = toward_center.length2().sqrt();
    if center_distance < 1.0e-12 {
        return Some(transform.apply_inverse(center));
    }
    let normal = toward_center.mul(1.0 / center_distance);

    // Rebay's frontal placement puts the candidate at unit metric distance
    // from the edge endpoints; the layered variant at unit height over the
    // midpoint. Neither may overshoot the circumcenter, or the candidate
    // could leave the conflict region of this triangle.
    let edge_half2 = from_metric.distance_2(to_metric) * 0.25;
    let frontal_offset = (1.0 - edge_half2).max(0.0).sqrt();
    let offset = (frontal_offset * (1.0 - quad_bias) + quad_bias).min(center_distance);

    Some(transform.apply_inverse(midpoint.add(normal.mul(offset))))
}

/// Inserts a metric-aligned point lattice, marching rows of locally sized
/// steps across the parametric rectangle.
fn seed_lattice(
    domain: &dyn SurfaceDomain,
    metric_source: &dyn MetricSource,
    triangulation: &mut Triangulation,
    insertion_parameters: &CavityParameters,
    parameters: &MeshingParameters,
    diagnostics: &mut MeshingDiagnostics,
    front_distance: &mut Vec<u32>,
) -> usize {
    const MAX_STEPS: usize = 4096;

    let bounds = domain.parametric_bounds();
    let mut inserted = 0;

    let mut row_origin = match metric_source.metric_at(bounds.min).factor() {
        Some(transform) => bounds
            .min
            .add(transform.apply_inverse(Point2::new(0.5, 0.5))),
        None => return 0,
    };

    let mut rows = 0;
    while bounds.contains(row_origin) && rows < MAX_STEPS {
        rows += 1;

        let mut current = row_origin;
        let mut columns = 0;
        while bounds.contains(current) && columns < MAX_STEPS {
            columns += 1;
            if let Some(max_points) = parameters.max_points {
                if inserted >= max_points {
                    return inserted;
                }
            }

            if metric_source.in_domain(current) {
                match cavity::insert_point(
                    triangulation,
                    current,
                    domain.evaluate(current),
                    VertexOwner::Surface,
                    metric_source,
                    insertion_parameters,
                ) {
                    InsertionOutcome::Inserted(record) => {
                        inserted += 1;
                        let depth = record
                            .polygon_vertices()
                            .map(|vertex| front_distance[vertex.index()])
                            .min()
                            .unwrap_or(0)
                            + 1;
                        front_distance.push(depth);
                    }
                    InsertionOutcome::Postponed(PostponeReason::OutsideDomain) => {
                        diagnostics.out_of_domain_candidates += 1;
                    }
                    InsertionOutcome::Postponed(_) => {
                        diagnostics.postponed_candidates += 1;
                    }
                    InsertionOutcome::Rejected(_) => {
                        diagnostics.rejected_candidates += 1;
                    }
                }
            }

            match metric_source.metric_at(current).factor() {
                Some(transform) => {
                    current = current.add(transform.apply_inverse(Point2::new(1.0, 0.0)));
                }
                None => break,
            }
        }

        match metric_source.metric_at(row_origin).factor() {
            Some(transform) => {
                row_origin = row_origin.add(transform.apply_inverse(Point2::new(0.0, 1.0)));
            }
            None => break,
        }
    }

    inserted
}

fn collect_unmeshed_edges(
    triangulation: &Triangulation,
    size_bound2: f64,
    diagnostics: &mut MeshingDiagnostics,
) {
    let mut seen: HashSet<(FixedVertexHandle, FixedVertexHandle)> =
        diagnostics.unmeshed_constraint_edges.iter().copied().collect();

    for handle in triangulation.live_triangles() {
        let oversized = triangulation
            .circumcircle(handle)
            .radius2()
            .is_some_and(|radius2| radius2 > size_bound2);
        if !oversized {
            continue;
        }
        for edge in 0..3 {
            let (from, to) = triangulation.edge_vertices(handle, edge);
            if !triangulation.is_constraint_edge(from, to) {
                continue;
            }
            let pair = if from <= to { (from, to) } else { (to, from) };
            if seen.insert(pair) {
                diagnostics.unmeshed_constraint_edges.push(pair);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use super::{
        build_metric_field, triangulate, triangulate_cancellable, triangulate_frontal,
        triangulate_frontal_layered, triangulate_parallelogram, BoundaryVertexRef,
        CompletionStatus, FixedParametricCoords, MeshingError, MeshingParameters, SeamEquivalence,
    };
    use crate::domain::{BoundaryLoop, BoundaryPoint, ParametricBounds, SurfaceDomain};
    use crate::metric_field::{CrossFieldSpec, SizeSpec};
    use crate::mesh_core::math::CircleLocation;
    use crate::mesh_core::{FixedVertexHandle, Triangulation, VertexOwner};
    use crate::{MeshingResult, Metric, Point2, Point3, PlanarRectangle, UniformMetric};

    /// Checks the metric Delaunay property of every live triangle against
    /// every vertex it does not contain.
    fn assert_delaunay(triangulation: &Triangulation, tolerance: f64) {
        for handle in triangulation.live_triangles() {
            let vertices = triangulation.triangle_vertices(handle);
            let circle = triangulation.circumcircle(handle);
            let transform = triangulation.metric_transform(handle);
            for index in 0..triangulation.num_vertices() {
                let vertex = FixedVertexHandle::new(index);
                if vertices.contains(&vertex) {
                    continue;
                }
                let transformed = transform.apply(triangulation.vertex(vertex).position());
                assert_ne!(
                    circle.classify(transformed, tolerance),
                    Some(CircleLocation::Inside),
                    "{vertex:?} violates the circumcircle of {handle:?}"
                );
            }
        }
    }

    fn interior_edge_lengths(result: &MeshingResult) -> Vec<f64> {
        let triangulation = &result.triangulation;
        let mut seen = std::collections::BTreeSet::new();
        let mut lengths = Vec::new();
        for handle in triangulation.live_triangles() {
            for edge in 0..3 {
                let (from, to) = triangulation.edge_vertices(handle, edge);
                let pair = if from <= to { (from, to) } else { (to, from) };
                if !seen.insert(pair) || triangulation.is_constraint_edge(from, to) {
                    continue;
                }
                let length = triangulation
                    .vertex(from)
                    .position()
                    .distance_2(triangulation.vertex(to).position())
                    .sqrt();
                lengths.push(length);
            }
        }
        lengths
    }

    #[test]
    fn test_boundary_only_square() {
        // Unit square, identity metric, no refinement budget: exactly the
        // two boundary triangles sharing one diagonal.
        let result = triangulate(
            &PlanarRectangle::unit(),
            &UniformMetric::default(),
            &MeshingParameters::new().with_max_points(0),
            None,
            None,
        )
        .unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        assert_eq!(result.triangulation.num_vertices(), 4);
        assert_eq!(result.triangulation.num_triangles(), 2);
        result.triangulation.sanity_check();

        let handles: Vec<_> = result.triangulation.live_triangles().collect();
        assert!(result
            .triangulation
            .neighbor_index(handles[0], handles[1])
            .is_some());
    }

    #[test]
    fn test_single_interior_insertion() {
        // Forcing one refinement step of the unit square inserts the
        // circumcenter (0.5, 0.5) and yields the star of four triangles.
        let result = triangulate(
            &PlanarRectangle::unit(),
            &UniformMetric::default(),
            &MeshingParameters::new()
                .with_max_points(1)
                .with_size_bound(0.5)
                .with_short_edge_guard(0.0),
            None,
            None,
        )
        .unwrap();

        assert_eq!(result.triangulation.num_triangles(), 4);
        assert_eq!(result.triangulation.num_vertices(), 5);
        result.triangulation.sanity_check();

        let center = result.triangulation.vertex(FixedVertexHandle::new(4));
        assert_eq!(center.position(), Point2::new(0.5, 0.5));
        for handle in result.triangulation.live_triangles() {
            assert!(result
                .triangulation
                .triangle_vertices(handle)
                .contains(&FixedVertexHandle::new(4)));
        }
    }

    #[test]
    fn test_uniform_refinement_converges() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(4);
        let metric = UniformMetric::from_size(0.2);
        let result = triangulate(&domain, &metric, &MeshingParameters::new(), None, None).unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        result.triangulation.sanity_check();
        assert!(result.triangulation.num_vertices() > 20);

        // Nearly every surviving triangle satisfies the size criterion; a
        // few may remain where candidates had to be dropped.
        let total = result.triangulation.num_triangles();
        let conforming = result
            .triangulation
            .live_triangles()
            .filter(|&handle| {
                result
                    .triangulation
                    .circumcircle(handle)
                    .radius2()
                    .is_some_and(|radius2| radius2 <= 1.0 + 1.0e-9)
            })
            .count();
        assert!(
            conforming as f64 >= total as f64 * 0.95,
            "{conforming} of {total} triangles satisfy the size bound"
        );
    }

    #[test]
    fn test_delaunay_property() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(2);
        let metric = UniformMetric::from_size(0.3);
        let parameters = MeshingParameters::new();
        let result = triangulate(&domain, &metric, &parameters, None, None).unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        assert_delaunay(&result.triangulation, 1.0e-10);
    }

    #[test]
    fn test_size_conformity() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(5);
        let size = 0.15;
        let metric = UniformMetric::from_size(size);
        let result = triangulate(&domain, &metric, &MeshingParameters::new(), None, None).unwrap();

        let lengths = interior_edge_lengths(&result);
        assert!(!lengths.is_empty());
        let in_band = lengths
            .iter()
            .filter(|&&length| {
                let metric_length = length / size;
                (0.5..=2.0 + 1.0e-9).contains(&metric_length)
            })
            .count();
        let fraction = in_band as f64 / lengths.len() as f64;
        assert!(
            fraction >= 0.95,
            "only {:.1}% of interior edges lie in the metric band",
            fraction * 100.0
        );
    }

    #[test]
    fn test_determinism() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(3);
        let metric = UniformMetric::from_size(0.2);
        let parameters = MeshingParameters::new();

        let first = triangulate(&domain, &metric, &parameters, None, None).unwrap();
        let second = triangulate(&domain, &metric, &parameters, None, None).unwrap();

        assert_eq!(first.triangle_indices(), second.triangle_indices());
        let first_positions: Vec<_> = first.vertices().iter().map(|v| v.position()).collect();
        let second_positions: Vec<_> = second.vertices().iter().map(|v| v.position()).collect();
        assert_eq!(first_positions, second_positions);
    }

    #[test]
    fn test_point_budget_is_normal_termination() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(3);
        let metric = UniformMetric::from_size(0.05);
        let result = triangulate(
            &domain,
            &metric,
            &MeshingParameters::new().with_max_points(10),
            None,
            None,
        )
        .unwrap();

        assert_eq!(result.completion, CompletionStatus::PointBudgetReached);
        assert_eq!(result.triangulation.num_vertices(), 16 + 10);
        result.triangulation.sanity_check();
    }

    #[test]
    fn test_frontal_policy() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(4);
        let metric = UniformMetric::from_size(0.2);
        let result =
            triangulate_frontal(&domain, &metric, &MeshingParameters::new(), None, None).unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        result.triangulation.sanity_check();
        assert!(result.triangulation.num_vertices() > 20);
    }

    #[test]
    fn test_frontal_layered_policy() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(4);
        let metric = UniformMetric::from_size(0.25);
        let result = triangulate_frontal_layered(
            &domain,
            &metric,
            0.8,
            &MeshingParameters::new(),
            None,
            None,
        )
        .unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        result.triangulation.sanity_check();
    }

    #[test]
    fn test_parallelogram_policy() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(4);
        let metric = UniformMetric::from_size(0.25);
        let result =
            triangulate_parallelogram(&domain, &metric, &MeshingParameters::new(), None, None)
                .unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        result.triangulation.sanity_check();
        // The lattice pre-pass must have contributed interior points.
        assert!(result.triangulation.num_vertices() > 20);
    }

    #[test]
    fn test_cancellation_leaves_valid_mesh() {
        let domain = PlanarRectangle::unit().with_edge_subdivisions(4);
        let metric = UniformMetric::from_size(0.05);
        let cancel = AtomicBool::new(true);

        let result = triangulate_cancellable(
            &domain,
            &metric,
            &MeshingParameters::new(),
            None,
            None,
            &cancel,
        )
        .unwrap();

        assert_eq!(result.completion, CompletionStatus::Cancelled);
        result.triangulation.sanity_check();
        assert!(result.triangulation.num_triangles() >= 2);
    }

    struct HoledSquare;

    impl SurfaceDomain for HoledSquare {
        fn evaluate(&self, uv: Point2<f64>) -> Point3 {
            Point3::new(uv.x, uv.y, 0.0)
        }

        fn curvature(&self, _uv: Point2<f64>) -> f64 {
            0.0
        }

        fn boundary_loops(&self) -> Vec<BoundaryLoop> {
            let outer = [(0.0, 0.0), (3.0, 0.0), (3.0, 3.0), (0.0, 3.0)];
            let hole = [(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 2.0)];
            let as_loop = |points: &[(f64, f64)]| BoundaryLoop {
                points: points
                    .iter()
                    .enumerate()
                    .map(|(id, &(x, y))| BoundaryPoint {
                        uv: Point2::new(x, y),
                        owner: VertexOwner::Corner { id: id as u32 },
                    })
                    .collect(),
            };
            vec![as_loop(&outer), as_loop(&hole)]
        }

        fn parametric_bounds(&self) -> ParametricBounds {
            ParametricBounds::new(Point2::new(0.0, 0.0), Point2::new(3.0, 3.0))
        }
    }

    #[test]
    fn test_hole_is_carved_and_respected() {
        let metric = UniformMetric::from_size(0.5);
        let result = triangulate(&HoledSquare, &metric, &MeshingParameters::new(), None, None)
            .unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        result.triangulation.sanity_check();

        for handle in result.triangulation.live_triangles() {
            let positions = result.triangulation.triangle_positions(handle);
            let cx = (positions[0].x + positions[1].x + positions[2].x) / 3.0;
            let cy = (positions[0].y + positions[1].y + positions[2].y) / 3.0;
            assert!(
                !(cx > 1.0 && cx < 2.0 && cy > 1.0 && cy < 2.0),
                "triangle covers the hole"
            );
        }
    }

    struct CylinderPatch;

    impl SurfaceDomain for CylinderPatch {
        fn evaluate(&self, uv: Point2<f64>) -> Point3 {
            let angle = uv.x * std::f64::consts::TAU;
            Point3::new(angle.cos(), angle.sin(), uv.y)
        }

        fn curvature(&self, _uv: Point2<f64>) -> f64 {
            1.0
        }

        fn boundary_loops(&self) -> Vec<BoundaryLoop> {
            PlanarRectangle::unit().boundary_loops()
        }

        fn parametric_bounds(&self) -> ParametricBounds {
            ParametricBounds::new(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0))
        }
    }

    #[test]
    fn test_seam_equivalence_unifies_positions() {
        // Corners 0 and 1 of the unit loop map to the same point on the
        // cylinder; treat them as one geometric point.
        let seam = SeamEquivalence {
            pairs: vec![(
                BoundaryVertexRef {
                    loop_index: 0,
                    point_index: 0,
                },
                BoundaryVertexRef {
                    loop_index: 0,
                    point_index: 1,
                },
            )],
        };
        let result = triangulate(
            &CylinderPatch,
            &UniformMetric::default(),
            &MeshingParameters::new().with_max_points(0),
            Some(&seam),
            None,
        )
        .unwrap();

        let partners = result.triangulation.seam_partners();
        assert_eq!(partners.len(), 1);
        let (first, second) = partners[0];
        assert_eq!(
            result.triangulation.vertex(first).position_3d(),
            result.triangulation.vertex(second).position_3d()
        );
    }

    #[test]
    fn test_fixed_parametric_coords_pin_vertices() {
        let fixed = FixedParametricCoords {
            coords: vec![(
                BoundaryVertexRef {
                    loop_index: 0,
                    point_index: 2,
                },
                Point2::new(1.25, 1.25),
            )],
        };
        let result = triangulate(
            &PlanarRectangle::unit(),
            &UniformMetric::default(),
            &MeshingParameters::new().with_max_points(0),
            None,
            Some(&fixed),
        )
        .unwrap();

        let pinned = result.triangulation.vertex(FixedVertexHandle::new(2));
        assert_eq!(pinned.position(), Point2::new(1.25, 1.25));
        result.triangulation.sanity_check();
    }

    #[test]
    fn test_out_of_range_references_are_rejected() {
        let seam = SeamEquivalence {
            pairs: vec![(
                BoundaryVertexRef {
                    loop_index: 0,
                    point_index: 0,
                },
                BoundaryVertexRef {
                    loop_index: 5,
                    point_index: 0,
                },
            )],
        };
        let result = triangulate(
            &PlanarRectangle::unit(),
            &UniformMetric::default(),
            &MeshingParameters::new(),
            Some(&seam),
            None,
        );
        assert_eq!(result.unwrap_err(), MeshingError::BoundaryReferenceOutOfRange);
    }

    struct BrokenBounds;

    impl SurfaceDomain for BrokenBounds {
        fn evaluate(&self, uv: Point2<f64>) -> Point3 {
            Point3::new(uv.x, uv.y, 0.0)
        }

        fn curvature(&self, _uv: Point2<f64>) -> f64 {
            0.0
        }

        fn boundary_loops(&self) -> Vec<BoundaryLoop> {
            PlanarRectangle::unit().boundary_loops()
        }

        fn parametric_bounds(&self) -> ParametricBounds {
            ParametricBounds::new(Point2::new(1.0, 0.0), Point2::new(0.0, 1.0))
        }
    }

    #[test]
    fn test_inverted_bounds_are_fatal() {
        let result = triangulate(
            &BrokenBounds,
            &UniformMetric::default(),
            &MeshingParameters::new(),
            None,
            None,
        );
        assert_eq!(
            result.unwrap_err(),
            MeshingError::InvertedParametricBounds
        );
    }

    struct NoBoundary;

    impl SurfaceDomain for NoBoundary {
        fn evaluate(&self, uv: Point2<f64>) -> Point3 {
            Point3::new(uv.x, uv.y, 0.0)
        }

        fn curvature(&self, _uv: Point2<f64>) -> f64 {
            0.0
        }

        fn boundary_loops(&self) -> Vec<BoundaryLoop> {
            Vec::new()
        }

        fn parametric_bounds(&self) -> ParametricBounds {
            ParametricBounds::new(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0))
        }
    }

    #[test]
    fn test_empty_boundary_is_fatal() {
        let result = triangulate(
            &NoBoundary,
            &UniformMetric::default(),
            &MeshingParameters::new(),
            None,
            None,
        );
        assert_eq!(result.unwrap_err(), MeshingError::EmptyBoundary);
    }

    #[test]
    fn test_metric_field_driven_pass() {
        let field = build_metric_field(
            &CylinderPatch,
            &SizeSpec::FromCurvature {
                scale: 0.3,
                min: 0.1,
                max: 0.5,
            },
            Some(&CrossFieldSpec {
                angle: 0.0,
                anisotropy: 2.0,
            }),
        )
        .unwrap();

        // The field is reusable across passes on the same domain.
        let first = triangulate(
            &CylinderPatch,
            &field,
            &MeshingParameters::new(),
            None,
            None,
        )
        .unwrap();
        let second = triangulate(
            &CylinderPatch,
            &field,
            &MeshingParameters::new(),
            None,
            None,
        )
        .unwrap();

        assert_eq!(first.completion, CompletionStatus::Converged);
        first.triangulation.sanity_check();
        assert_eq!(first.triangle_indices(), second.triangle_indices());

        // Anisotropy 2 with angle 0 stretches elements along u.
        let metric = field.metric(Point2::new(0.5, 0.5));
        assert!(metric.m22 > metric.m11);
    }

    #[test]
    fn test_diagnostics_format() {
        let diagnostics = super::MeshingDiagnostics {
            postponed_candidates: 3,
            ..Default::default()
        };
        let formatted = format!("{diagnostics}");
        assert!(formatted.contains("3 postponed"));
        assert!(!diagnostics.is_clean() || diagnostics.rejected_candidates == 0);
    }

    #[test]
    fn test_metric_radius_drives_refinement() {
        // An anisotropic uniform metric refines along one axis only.
        let metric = UniformMetric::new(Metric::from_sizes_and_angle(1.0, 0.2, 0.0));
        let domain = PlanarRectangle::unit().with_edge_subdivisions(4);
        let result = triangulate(&domain, &metric, &MeshingParameters::new(), None, None).unwrap();

        assert_eq!(result.completion, CompletionStatus::Converged);
        result.triangulation.sanity_check();

        // Interior edges should be clearly longer in u than in v on
        // average: measure the mean absolute extents.
        let mut sum_du = 0.0;
        let mut sum_dv = 0.0;
        for handle in result.triangulation.live_triangles() {
            let positions = result.triangulation.triangle_positions(handle);
            for edge in 0..3 {
                let delta = positions[edge].sub(positions[(edge + 1) % 3]);
                sum_du += delta.x.abs();
                sum_dv += delta.y.abs();
            }
        }
        assert!(
            sum_du > sum_dv,
            "anisotropic metric should stretch elements along u"
        );
    }
}
