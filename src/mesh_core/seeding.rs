use crate::mesh_core::cavity::{self, CavityParameters, InsertionOutcome};
use crate::mesh_core::handles::{FixedTriangleHandle, FixedVertexHandle};
use crate::mesh_core::math::{self, CircleLocation, Orientation};
use crate::mesh_core::triangulation::{self, Triangulation, Vertex, VertexOwner};
use crate::{MetricSource, MetricTransform, Point2, Point3};

use hashbrown::HashSet;

/// One input point of a boundary loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopVertex {
    pub position: Point2<f64>,
    pub position_3d: Point3,
    pub owner: VertexOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeedingError {
    /// A loop could not be triangulated - it is self-intersecting,
    /// collinear or has duplicate points.
    DegenerateLoop(usize),
    /// A hole loop vertex could not be inserted.
    HoleInsertionFailed(usize),
}

pub(crate) struct SeedResult {
    /// Vertex handles per input loop, in input order.
    pub loop_vertices: Vec<Vec<FixedVertexHandle>>,
    /// Hole edges that could not be recovered by flipping. The adjacent
    /// holes are left untriangulated but uncarved.
    pub unrecovered_edges: Vec<(FixedVertexHandle, FixedVertexHandle)>,
}

/// Builds the initial boundary-conforming triangulation.
///
/// The first loop is the outer boundary and is triangulated directly by ear
/// clipping; every following loop is a hole whose vertices are inserted
/// through the cavity engine, whose edges are recovered by flipping and
/// whose interior is carved out by a flood fill bounded by the recovered
/// constraint edges.
pub(crate) fn seed_boundary(
    triangulation: &mut Triangulation,
    loops: &[Vec<LoopVertex>],
    metric_source: &dyn MetricSource,
    parameters: &CavityParameters,
) -> Result<SeedResult, SeedingError> {
    let mut loop_vertices = Vec::with_capacity(loops.len());
    let mut unrecovered_edges = Vec::new();

    // Outer loop: normalize to counterclockwise, ear clip, legalize.
    let (outer, outer_reversed) = normalized_loop(&loops[0], true);
    let outer_handles: Vec<_> = outer
        .iter()
        .map(|point| {
            triangulation.add_vertex(Vertex::new(point.position, point.position_3d, point.owner))
        })
        .collect();
    for index in 0..outer_handles.len() {
        let next = (index + 1) % outer_handles.len();
        triangulation.add_constraint_edge(outer_handles[index], outer_handles[next]);
    }

    let created = ear_clip(triangulation, &outer_handles, metric_source, 0)?;
    triangulation::link_batch(triangulation, &created);
    legalize(triangulation, &created, metric_source, parameters.boundary_tolerance);
    loop_vertices.push(input_order(outer_handles, outer_reversed));

    // Hole loops: insert, recover, carve.
    for (offset, hole) in loops[1..].iter().enumerate() {
        let loop_index = offset + 1;
        let (hole, hole_reversed) = normalized_loop(hole, false);

        let mut handles = Vec::with_capacity(hole.len());
        for point in &hole {
            let outcome = cavity::insert_point(
                triangulation,
                point.position,
                point.position_3d,
                point.owner,
                metric_source,
                &CavityParameters {
                    short_edge_guard: 0.0,
                    ..*parameters
                },
            );
            match outcome {
                InsertionOutcome::Inserted(record) => handles.push(record.vertex),
                _ => return Err(SeedingError::HoleInsertionFailed(loop_index)),
            }
        }

        let mut recovered = true;
        for index in 0..handles.len() {
            let from = handles[index];
            let to = handles[(index + 1) % handles.len()];
            if recover_edge(triangulation, from, to, metric_source) {
                triangulation.add_constraint_edge(from, to);
            } else {
                unrecovered_edges.push((from, to));
                recovered = false;
            }
        }

        if recovered {
            carve_hole(triangulation, &handles);
        }
        loop_vertices.push(input_order(handles, hole_reversed));
    }

    Ok(SeedResult {
        loop_vertices,
        unrecovered_edges,
    })
}

/// Reverses a loop if needed so that the outer boundary runs
/// counterclockwise and holes run clockwise. The flag reports whether the
/// input order was reversed.
fn normalized_loop(input: &[LoopVertex], counterclockwise: bool) -> (Vec<LoopVertex>, bool) {
    let mut area = 0.0;
    for index in 0..input.len() {
        let from = input[index].position;
        let to = input[(index + 1) % input.len()].position;
        area += from.x * to.y - to.x * from.y;
    }

    let mut result = input.to_vec();
    let reversed = (area > 0.0) != counterclockwise;
    if reversed {
        result.reverse();
    }
    (result, reversed)
}

/// Restores the caller's point order for a possibly reversed loop, so that
/// seam and pinned-coordinate references stay valid.
fn input_order(mut handles: Vec<FixedVertexHandle>, reversed: bool) -> Vec<FixedVertexHandle> {
    if reversed {
        handles.reverse();
    }
    handles
}

fn cached_transform(
    metric_source: &dyn MetricSource,
    centroid: Point2<f64>,
) -> MetricTransform {
    // A non-definite metric during seeding falls back to the identity; the
    // cached circle is then merely Euclidean, which only costs quality.
    metric_source
        .metric_at(centroid)
        .factor()
        .unwrap_or(MetricTransform::identity())
}

fn create_triangle(
    triangulation: &mut Triangulation,
    vertices: [FixedVertexHandle; 3],
    metric_source: &dyn MetricSource,
) -> FixedTriangleHandle {
    let positions = vertices.map(|vertex| triangulation.vertex(vertex).position());
    let centroid = Point2::new(
        (positions[0].x + positions[1].x + positions[2].x) / 3.0,
        (positions[0].y + positions[1].y + positions[2].y) / 3.0,
    );
    let transform = cached_transform(metric_source, centroid);
    let circumcircle = math::metric_circumcircle(positions, &transform);
    triangulation.add_triangle(vertices, circumcircle, transform)
}

fn refresh_circumcircle(
    triangulation: &mut Triangulation,
    handle: FixedTriangleHandle,
    metric_source: &dyn MetricSource,
) {
    let positions = triangulation.triangle_positions(handle);
    let centroid = Point2::new(
        (positions[0].x + positions[1].x + positions[2].x) / 3.0,
        (positions[0].y + positions[1].y + positions[2].y) / 3.0,
    );
    let transform = cached_transform(metric_source, centroid);
    let circumcircle = math::metric_circumcircle(positions, &transform);
    triangulation.set_circumcircle(handle, circumcircle, transform);
}

/// Triangulates a counterclockwise simple polygon by ear clipping.
fn ear_clip(
    triangulation: &mut Triangulation,
    handles: &[FixedVertexHandle],
    metric_source: &dyn MetricSource,
    loop_index: usize,
) -> Result<Vec<FixedTriangleHandle>, SeedingError> {
    if handles.len() < 3 {
        return Err(SeedingError::DegenerateLoop(loop_index));
    }

    let positions: Vec<_> = handles
        .iter()
        .map(|&handle| triangulation.vertex(handle).position())
        .collect();
    let mut polygon: Vec<usize> = (0..handles.len()).collect();
    let mut created = Vec::with_capacity(handles.len().saturating_sub(2));

    while polygon.len() >= 3 {
        let mut clipped = None;
        for index in 0..polygon.len() {
            let previous = polygon[(index + polygon.len() - 1) % polygon.len()];
            let current = polygon[index];
            let next = polygon[(index + 1) % polygon.len()];

            let corner = [positions[previous], positions[current], positions[next]];
            if math::orientation(corner[0], corner[1], corner[2]) != Orientation::Ccw {
                continue;
            }
            let blocked = polygon.iter().any(|&other| {
                other != previous
                    && other != current
                    && other != next
                    && math::triangle_contains_point(corner, positions[other])
            });
            if blocked {
                continue;
            }

            created.push(create_triangle(
                triangulation,
                [handles[previous], handles[current], handles[next]],
                metric_source,
            ));
            clipped = Some(index);
            break;
        }

        match clipped {
            Some(index) => {
                polygon.remove(index);
            }
            None => return Err(SeedingError::DegenerateLoop(loop_index)),
        }
    }

    Ok(created)
}

/// Restores the metric Delaunay property of a freshly created patch by
/// flipping edges whose opposite vertex conflicts with the cached
/// circumcircle.
///
/// Flips under an interpolated metric are not guaranteed to reach a global
/// fixed point, so the pass is budget bounded.
fn legalize(
    triangulation: &mut Triangulation,
    created: &[FixedTriangleHandle],
    metric_source: &dyn MetricSource,
    boundary_tolerance: f64,
) {
    let mut stack: Vec<(FixedTriangleHandle, usize)> = created
        .iter()
        .flat_map(|&handle| (0..3).map(move |edge| (handle, edge)))
        .collect();
    let mut budget = 16 * stack.len() + 64;

    while let Some((handle, edge)) = stack.pop() {
        if budget == 0 {
            tracing::debug!("legalization budget exhausted, leaving patch as is");
            return;
        }
        budget -= 1;

        let neighbor = match triangulation.triangle_neighbors(handle)[edge] {
            Some(neighbor) => neighbor,
            None => continue,
        };
        let (from, to) = triangulation.edge_vertices(handle, edge);
        if triangulation.is_constraint_edge(from, to) {
            continue;
        }

        let neighbor_edge = match triangulation.edge_index(neighbor, from, to) {
            Some(neighbor_edge) => neighbor_edge,
            None => continue,
        };
        let opposite = triangulation.triangle_vertices(neighbor)[neighbor_edge];
        let transformed = triangulation
            .metric_transform(handle)
            .apply(triangulation.vertex(opposite).position());
        let conflict = match triangulation
            .circumcircle(handle)
            .classify(transformed, boundary_tolerance)
        {
            Some(CircleLocation::Inside) => true,
            // Degenerate patch triangles are flipped away eagerly.
            None => true,
            _ => false,
        };
        if !conflict {
            continue;
        }

        if let Some((first, second)) = triangulation.flip_edge(handle, edge) {
            refresh_circumcircle(triangulation, first, metric_source);
            refresh_circumcircle(triangulation, second, metric_source);
            // The shared diagonal is edge 1 of both; only the outer edges
            // need to be revisited.
            stack.push((first, 0));
            stack.push((first, 2));
            stack.push((second, 0));
            stack.push((second, 2));
        }
    }
}

/// Makes the edge between two vertices an edge of the triangulation by
/// flipping the edges crossing it.
///
/// Returns `false` if the edge could not be recovered within the budget.
fn recover_edge(
    triangulation: &mut Triangulation,
    from: FixedVertexHandle,
    to: FixedVertexHandle,
    metric_source: &dyn MetricSource,
) -> bool {
    if triangulation.find_edge(from, to).is_some() {
        return true;
    }

    let from_position = triangulation.vertex(from).position();
    let to_position = triangulation.vertex(to).position();

    for _ in 0..32 {
        let crossings = collect_crossings(triangulation, from, to, from_position, to_position);
        if crossings.is_empty() {
            return triangulation.find_edge(from, to).is_some();
        }

        let mut flipped_any = false;
        for (handle, edge) in crossings {
            // Earlier flips this round may have replaced the edge.
            let (u, v) = triangulation.edge_vertices(handle, edge);
            if u == from || u == to || v == from || v == to {
                continue;
            }
            let u_position = triangulation.vertex(u).position();
            let v_position = triangulation.vertex(v).position();
            if math::orientation(from_position, to_position, u_position)
                == Orientation::Degenerate
                && math::orientation(from_position, to_position, v_position)
                    == Orientation::Degenerate
            {
                continue;
            }
            if !math::intersects_edge_non_collinear(
                from_position,
                to_position,
                u_position,
                v_position,
            ) {
                continue;
            }

            if let Some((first, second)) = triangulation.flip_edge(handle, edge) {
                refresh_circumcircle(triangulation, first, metric_source);
                refresh_circumcircle(triangulation, second, metric_source);
                flipped_any = true;
            }
        }

        if !flipped_any {
            return false;
        }
        if triangulation.find_edge(from, to).is_some() {
            return true;
        }
    }
    false
}

fn collect_crossings(
    triangulation: &Triangulation,
    from: FixedVertexHandle,
    to: FixedVertexHandle,
    from_position: Point2<f64>,
    to_position: Point2<f64>,
) -> Vec<(FixedTriangleHandle, usize)> {
    let mut crossings = Vec::new();
    for handle in triangulation.live_triangles() {
        for edge in 0..3 {
            let (u, v) = triangulation.edge_vertices(handle, edge);
            // Visit each undirected edge once.
            if u > v {
                continue;
            }
            if u == from || u == to || v == from || v == to {
                continue;
            }
            if triangulation.is_constraint_edge(u, v) {
                continue;
            }
            let u_position = triangulation.vertex(u).position();
            let v_position = triangulation.vertex(v).position();
            if math::orientation(from_position, to_position, u_position)
                == Orientation::Degenerate
                && math::orientation(from_position, to_position, v_position)
                    == Orientation::Degenerate
            {
                continue;
            }
            if math::intersects_edge_non_collinear(
                from_position,
                to_position,
                u_position,
                v_position,
            ) {
                crossings.push((handle, edge));
            }
        }
    }
    crossings
}

/// Soft-deletes every triangle inside a recovered hole loop.
///
/// The flood fill starts on the hole side of a recovered edge and is
/// bounded by constraint edges, so it can never leak into the surrounding
/// triangulation. Live neighbors across the hole boundary become boundary
/// (`None`) edges.
fn carve_hole(triangulation: &mut Triangulation, handles: &[FixedVertexHandle]) {
    // The hole loop is clockwise, so its interior lies left of (to, from).
    let mut seed = None;
    for index in 0..handles.len() {
        let from = handles[index];
        let to = handles[(index + 1) % handles.len()];
        if let Some((handle, edge)) = triangulation.find_edge(from, to) {
            let (edge_from, _) = triangulation.edge_vertices(handle, edge);
            let inside = if edge_from == to {
                // The triangle contains the directed edge (to, from).
                Some(handle)
            } else {
                triangulation.triangle_neighbors(handle)[edge]
            };
            if let Some(inside) = inside {
                seed = Some(inside);
                break;
            }
        }
    }
    let seed = match seed {
        Some(seed) => seed,
        // A zero-area hole has no interior triangle.
        None => return,
    };

    let mut interior: HashSet<FixedTriangleHandle> = HashSet::new();
    let mut stack = vec![seed];
    interior.insert(seed);
    while let Some(current) = stack.pop() {
        for edge in 0..3 {
            let (from, to) = triangulation.edge_vertices(current, edge);
            if triangulation.is_constraint_edge(from, to) {
                continue;
            }
            if let Some(neighbor) = triangulation.triangle_neighbors(current)[edge] {
                if interior.insert(neighbor) {
                    stack.push(neighbor);
                }
            }
        }
    }

    let carved: Vec<_> = {
        let mut carved: Vec<_> = interior.iter().copied().collect();
        carved.sort_unstable();
        carved
    };
    for &handle in &carved {
        for edge in 0..3 {
            if let Some(neighbor) = triangulation.triangle_neighbors(handle)[edge] {
                if !interior.contains(&neighbor) {
                    let (from, to) = triangulation.edge_vertices(handle, edge);
                    let back = triangulation
                        .edge_index(neighbor, from, to)
                        .expect("neighbor links out of sync");
                    triangulation.set_neighbor(neighbor, back, None);
                }
            }
        }
        triangulation.mark_deleted(handle);
    }
}
