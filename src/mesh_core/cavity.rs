//! Point insertion by incremental cavity retriangulation.

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::mesh_core::handles::{FixedTriangleHandle, FixedVertexHandle};
use crate::mesh_core::math::{self, CircleLocation};
use crate::mesh_core::triangulation::{PointLocation, Triangulation, Vertex, VertexOwner};
use crate::{MetricSource, Point2, Point3};

/// Numeric knobs of the cavity engine.
///
/// Both values are deliberately configurable instead of hard-coded: the
/// right boundary tolerance depends on the conditioning of the metric field
/// and the right guard distance on how aggressively short edges should be
/// suppressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CavityParameters {
    /// Relative tolerance of the in-circumcircle classification, see
    /// [Circumcircle::classify](crate::math::Circumcircle::classify).
    pub boundary_tolerance: f64,
    /// Candidates closer than this metric distance to a cavity boundary
    /// vertex are postponed. Zero disables the guard.
    pub short_edge_guard: f64,
}

impl Default for CavityParameters {
    fn default() -> Self {
        CavityParameters {
            boundary_tolerance: 1.0e-10,
            short_edge_guard: 0.0,
        }
    }
}

/// Why an insertion was postponed. Postponed insertions are transient
/// failures - the same point may succeed later, or the driver simply drops
/// it and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostponeReason {
    /// The candidate position failed coordinate validation.
    InvalidCoordinate,
    /// The candidate coincides with an existing vertex.
    DuplicatePoint,
    /// The candidate lies outside the triangulated domain.
    OutsideDomain,
    /// Retriangulation would have created a zero-area triangle.
    DegenerateCavityElement,
    /// The metric tensor at a new element was not positive definite.
    MetricFailure,
    /// The candidate is too close to an existing cavity boundary vertex.
    ShortEdge,
}

/// Why an insertion was rejected. Rejections are permanent for the given
/// candidate - it conflicts with an immutable constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// The cavity would cross or absorb a constraint edge.
    ConstraintCrossing,
    /// The cavity boundary did not form a single closed polygon.
    NonManifoldCavity,
}

/// The outcome of one point insertion.
#[derive(Debug)]
pub enum InsertionOutcome {
    /// The point was inserted; the record describes the mutation and allows
    /// undoing it.
    Inserted(InsertionRecord),
    /// The point was dropped for a transient reason.
    Postponed(PostponeReason),
    /// The point conflicts with an immutable constraint.
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, Copy)]
struct BoundaryEdge {
    from: FixedVertexHandle,
    to: FixedVertexHandle,
    /// The neighbor outside the cavity and its edge index toward it.
    outer: Option<(FixedTriangleHandle, usize)>,
    /// The cavity triangle the edge was collected from.
    inner: FixedTriangleHandle,
}

/// Describes a successful insertion precisely enough to undo it.
#[derive(Debug)]
pub struct InsertionRecord {
    /// The newly created vertex.
    pub vertex: FixedVertexHandle,
    created: SmallVec<[FixedTriangleHandle; 8]>,
    removed: SmallVec<[FixedTriangleHandle; 8]>,
    boundary: Vec<BoundaryEdge>,
    split_constraint: Option<(FixedVertexHandle, FixedVertexHandle)>,
    triangles_len_before: usize,
}

impl InsertionRecord {
    /// The triangles created by the insertion, in cavity boundary order.
    pub fn created(&self) -> &[FixedTriangleHandle] {
        &self.created
    }

    /// The triangles consumed (soft-deleted) by the insertion.
    pub fn removed(&self) -> &[FixedTriangleHandle] {
        &self.removed
    }

    /// The vertices of the cavity boundary polygon.
    pub fn polygon_vertices(&self) -> impl Iterator<Item = FixedVertexHandle> + '_ {
        self.boundary.iter().map(|edge| edge.from)
    }
}

/// Inserts a point into the triangulation by cavity retriangulation.
///
/// This runs the state machine Locate -> GatherCavity -> ValidateCavity ->
/// Retriangulate -> Relink. Scheduling the created triangles is left to the
/// caller, which knows the active insertion policy.
///
/// The triangulation is never left in a half-mutated state: every failure
/// path rolls the arena back to exactly the state before the call.
pub fn insert_point(
    triangulation: &mut Triangulation,
    position: Point2<f64>,
    position_3d: Point3,
    owner: VertexOwner,
    metric_source: &dyn MetricSource,
    parameters: &CavityParameters,
) -> InsertionOutcome {
    if math::validate_position(position).is_err() {
        return InsertionOutcome::Postponed(PostponeReason::InvalidCoordinate);
    }

    // Locate
    let (seed, split_edge) = match triangulation.locate(position) {
        PointLocation::InTriangle(triangle) => (triangle, None),
        PointLocation::OnEdge(triangle, edge) => {
            let (from, to) = triangulation.edge_vertices(triangle, edge);
            match triangulation.triangle_neighbors(triangle)[edge] {
                None => {
                    // Splitting a domain boundary edge removes it from the
                    // cavity polygon and creates two new boundary edges.
                    (triangle, Some((from, to)))
                }
                Some(_) if triangulation.is_constraint_edge(from, to) => {
                    return InsertionOutcome::Rejected(RejectionReason::ConstraintCrossing);
                }
                Some(_) => (triangle, None),
            }
        }
        PointLocation::OnVertex(_) => {
            return InsertionOutcome::Postponed(PostponeReason::DuplicatePoint)
        }
        PointLocation::OutsideDomain | PointLocation::NoTriangulation => {
            return InsertionOutcome::Postponed(PostponeReason::OutsideDomain)
        }
    };

    // GatherCavity: breadth first expansion across neighbor links. A
    // neighbor joins the cavity if the point lies inside its cached
    // metric circumcircle; constraint edges are expansion barriers.
    let mut cavity: SmallVec<[FixedTriangleHandle; 8]> = SmallVec::new();
    let mut in_cavity: HashSet<FixedTriangleHandle> = HashSet::new();
    cavity.push(seed);
    in_cavity.insert(seed);

    let mut cursor = 0;
    while cursor < cavity.len() {
        let current = cavity[cursor];
        cursor += 1;

        for edge in 0..3 {
            let neighbor = match triangulation.triangle_neighbors(current)[edge] {
                Some(neighbor) => neighbor,
                None => continue,
            };
            if in_cavity.contains(&neighbor) {
                continue;
            }
            let (from, to) = triangulation.edge_vertices(current, edge);
            if triangulation.is_constraint_edge(from, to) {
                continue;
            }

            let transformed = triangulation.metric_transform(neighbor).apply(position);
            let location = triangulation
                .circumcircle(neighbor)
                .classify(transformed, parameters.boundary_tolerance);
            let conflicts = match location {
                Some(CircleLocation::Inside) => true,
                Some(CircleLocation::Outside) | Some(CircleLocation::Boundary) => false,
                // A degenerate element must never survive a conflicting
                // insertion next to it.
                None => true,
            };
            if conflicts {
                in_cavity.insert(neighbor);
                cavity.push(neighbor);
            }
        }
    }

    // Collect the cavity boundary. An interior cavity edge that is a
    // constraint means the cavity wrapped around the constraint.
    let mut boundary = Vec::with_capacity(cavity.len() + 2);
    for &triangle in &cavity {
        for edge in 0..3 {
            let neighbor = triangulation.triangle_neighbors(triangle)[edge];
            let (from, to) = triangulation.edge_vertices(triangle, edge);
            match neighbor {
                Some(neighbor) if in_cavity.contains(&neighbor) => {
                    if triangulation.is_constraint_edge(from, to) {
                        return InsertionOutcome::Rejected(RejectionReason::ConstraintCrossing);
                    }
                }
                Some(neighbor) => {
                    let outer_edge = triangulation
                        .edge_index(neighbor, from, to)
                        .expect("neighbor links out of sync");
                    boundary.push(BoundaryEdge {
                        from,
                        to,
                        outer: Some((neighbor, outer_edge)),
                        inner: triangle,
                    });
                }
                None => {
                    boundary.push(BoundaryEdge {
                        from,
                        to,
                        outer: None,
                        inner: triangle,
                    });
                }
            }
        }
    }

    // ValidateCavity: the boundary edges must chain into one closed loop.
    let mut outgoing: HashMap<FixedVertexHandle, usize> = HashMap::with_capacity(boundary.len());
    for (index, edge) in boundary.iter().enumerate() {
        if outgoing.insert(edge.from, index).is_some() {
            return InsertionOutcome::Rejected(RejectionReason::NonManifoldCavity);
        }
    }

    let mut ordered = Vec::with_capacity(boundary.len());
    let mut seen = vec![false; boundary.len()];
    let mut index = 0;
    for _ in 0..boundary.len() {
        if seen[index] {
            // The walk closed before covering every edge - the boundary
            // consists of more than one loop.
            return InsertionOutcome::Rejected(RejectionReason::NonManifoldCavity);
        }
        seen[index] = true;
        ordered.push(boundary[index]);
        index = match outgoing.get(&boundary[index].to) {
            Some(&next) => next,
            None => return InsertionOutcome::Rejected(RejectionReason::NonManifoldCavity),
        };
    }
    if index != 0 {
        return InsertionOutcome::Rejected(RejectionReason::NonManifoldCavity);
    }

    // Rotate a split edge to the end; the star is then built over the open
    // chain that remains.
    if let Some((split_from, split_to)) = split_edge {
        let split_index = ordered
            .iter()
            .position(|edge| edge.from == split_from && edge.to == split_to)
            .expect("split edge must lie on the cavity boundary");
        ordered.rotate_left(split_index + 1);
    }
    let num_star_edges = ordered.len() - usize::from(split_edge.is_some());
    if num_star_edges < 2 {
        return InsertionOutcome::Postponed(PostponeReason::DegenerateCavityElement);
    }

    // Short edge guard: keep the candidate away from the polygon vertices.
    if parameters.short_edge_guard > 0.0 {
        let guard2 = parameters.short_edge_guard * parameters.short_edge_guard;
        let transform = match metric_source.metric_at(position).factor() {
            Some(transform) => transform,
            None => return InsertionOutcome::Postponed(PostponeReason::MetricFailure),
        };
        let transformed = transform.apply(position);
        for edge in &ordered {
            let vertex_position = transform.apply(triangulation.vertex(edge.from).position());
            if transformed.distance_2(vertex_position) < guard2 {
                return InsertionOutcome::Postponed(PostponeReason::ShortEdge);
            }
        }
    }

    // Retriangulate: connect the new vertex to every remaining boundary
    // edge. Each new triangle caches the circumcircle under the metric at
    // its own centroid - this is what makes the refinement anisotropic.
    let triangles_len_before = triangulation.num_triangle_slots();
    let vertex = triangulation.add_vertex(Vertex::new(position, position_3d, owner));

    let mut created: SmallVec<[FixedTriangleHandle; 8]> = SmallVec::new();
    for edge in &ordered[..num_star_edges] {
        let from_position = triangulation.vertex(edge.from).position();
        let to_position = triangulation.vertex(edge.to).position();
        let centroid = Point2::new(
            (position.x + from_position.x + to_position.x) / 3.0,
            (position.y + from_position.y + to_position.y) / 3.0,
        );

        let transform = match metric_source.metric_at(centroid).factor() {
            Some(transform) => transform,
            None => {
                rollback(triangulation, triangles_len_before);
                return InsertionOutcome::Postponed(PostponeReason::MetricFailure);
            }
        };
        let circumcircle =
            math::metric_circumcircle([position, from_position, to_position], &transform);
        if circumcircle.is_degenerate() {
            rollback(triangulation, triangles_len_before);
            return InsertionOutcome::Postponed(PostponeReason::DegenerateCavityElement);
        }

        created.push(triangulation.add_triangle(
            [vertex, edge.from, edge.to],
            circumcircle,
            transform,
        ));
    }

    // Relink: chain the star triangles around the new vertex and connect
    // them to the outer cavity neighbors, then consume the cavity.
    for index in 0..created.len() {
        let next = (index + 1) % created.len();
        if split_edge.is_some() && next == 0 {
            // Open chain: the flank edges of the first and last star
            // triangle become domain boundary edges.
            break;
        }
        // Edge 1 of a star triangle runs (to, vertex); edge 2 of the next
        // runs (vertex, from) with next.from == to.
        triangulation.link_neighbors(created[index], 1, created[next], 2);
    }
    for (edge, &triangle) in ordered[..num_star_edges].iter().zip(&created) {
        if let Some((outer, outer_edge)) = edge.outer {
            triangulation.link_neighbors(triangle, 0, outer, outer_edge);
        }
    }

    for &triangle in &cavity {
        triangulation.mark_deleted(triangle);
    }

    // A split constraint edge is replaced by its two halves.
    let mut split_constraint = None;
    if let Some((split_from, split_to)) = split_edge {
        if triangulation.is_constraint_edge(split_from, split_to) {
            triangulation.remove_constraint_edge(split_from, split_to);
            triangulation.add_constraint_edge(split_from, vertex);
            triangulation.add_constraint_edge(vertex, split_to);
            split_constraint = Some((split_from, split_to));
        }
    }

    InsertionOutcome::Inserted(InsertionRecord {
        vertex,
        created,
        removed: cavity,
        boundary: ordered,
        split_constraint,
        triangles_len_before,
    })
}

fn rollback(triangulation: &mut Triangulation, triangles_len_before: usize) {
    triangulation.truncate_triangles(triangles_len_before);
    triangulation.pop_vertex();
}

/// Undoes an insertion, restoring the exact triangle set that existed
/// before it.
///
/// The record must be the most recent successful insertion - the created
/// triangles must still form the tail of the arena.
pub fn undo_insertion(triangulation: &mut Triangulation, record: InsertionRecord) {
    if let Some((split_from, split_to)) = record.split_constraint {
        triangulation.remove_constraint_edge(split_from, record.vertex);
        triangulation.remove_constraint_edge(record.vertex, split_to);
        triangulation.add_constraint_edge(split_from, split_to);
    }

    for &triangle in record.removed.iter() {
        triangulation.restore(triangle);
    }
    for edge in &record.boundary {
        if let Some((outer, outer_edge)) = edge.outer {
            triangulation.set_neighbor(outer, outer_edge, Some(edge.inner));
        }
    }

    triangulation.truncate_triangles(record.triangles_len_before);
    triangulation.pop_vertex();
}
