use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};

use crate::mesh_core::handles::{undirected_edge, FixedTriangleHandle, FixedVertexHandle};
use crate::mesh_core::math::{self, Circumcircle, Orientation};
use crate::{MetricTransform, Point2, Point3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The geometric entity owning a vertex.
///
/// Classification decides whether a vertex belongs to the domain boundary
/// and may therefore never be merged away or relocated by later processing
/// stages.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde")
)]
pub enum VertexOwner {
    /// The vertex coincides with a model vertex (a boundary curve corner).
    Corner {
        /// Identifier of the model vertex within its domain.
        id: u32,
    },
    /// The vertex lies on a boundary curve.
    Curve {
        /// Identifier of the boundary curve within its domain.
        id: u32,
        /// Curve parameter of the vertex.
        parameter: f64,
    },
    /// The vertex lies in the interior of the surface.
    Surface,
    /// The vertex has not been classified.
    Unclassified,
}

impl VertexOwner {
    /// Returns `true` if the owner pins the vertex to the domain boundary.
    pub fn is_boundary(&self) -> bool {
        matches!(self, VertexOwner::Corner { .. } | VertexOwner::Curve { .. })
    }
}

/// A vertex of the triangulation.
///
/// Vertices are created once and never mutated afterwards; only their
/// classification and positions are queried. The single exception is seam
/// unification, which overwrites the 3-D position before any triangle
/// references the vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    position: Point2<f64>,
    position_3d: Point3,
    owner: VertexOwner,
}

impl Vertex {
    /// Creates a new vertex from its parametric position, surface position
    /// and classification.
    pub fn new(position: Point2<f64>, position_3d: Point3, owner: VertexOwner) -> Self {
        Vertex {
            position,
            position_3d,
            owner,
        }
    }

    /// The parametric (u, v) position.
    #[inline]
    pub fn position(&self) -> Point2<f64> {
        self.position
    }

    /// The corresponding position on the surface.
    #[inline]
    pub fn position_3d(&self) -> Point3 {
        self.position_3d
    }

    /// The owning geometric entity.
    #[inline]
    pub fn owner(&self) -> VertexOwner {
        self.owner
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TriangleData {
    vertices: [FixedVertexHandle; 3],
    neighbors: [Option<FixedTriangleHandle>; 3],
    circumcircle: Circumcircle,
    transform: MetricTransform,
    deleted: bool,
}

/// The result of locating a point in the triangulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointLocation {
    /// The point lies strictly inside the given triangle.
    InTriangle(FixedTriangleHandle),
    /// The point lies on edge `1` of the given triangle (the edge opposite
    /// vertex slot `1`).
    OnEdge(FixedTriangleHandle, usize),
    /// The point coincides with an existing vertex.
    OnVertex(FixedVertexHandle),
    /// The point lies outside of the triangulated domain.
    OutsideDomain,
    /// The triangulation has no live triangles.
    NoTriangulation,
}

/// The mutable mesh graph: vertex arena, triangle arena and connectivity.
///
/// Triangles store three vertex handles in counterclockwise order and three
/// neighbor handles, one per opposite edge (`None` on the domain boundary).
/// The neighbor relation is kept symmetric at all times. Triangles consumed
/// by a cavity are only *soft-deleted* so that handles held elsewhere stay
/// valid; [compact](Triangulation::compact) physically discards them and
/// renumbers the arena in a single pass.
#[derive(Debug)]
pub struct Triangulation {
    vertices: Vec<Vertex>,
    triangles: Vec<TriangleData>,
    constraints: HashSet<(FixedVertexHandle, FixedVertexHandle)>,
    seam_partners: Vec<(FixedVertexHandle, FixedVertexHandle)>,
    num_deleted: usize,
    walk_hint: AtomicUsize,
}

impl Default for Triangulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Triangulation {
    /// Creates an empty triangulation.
    pub fn new() -> Self {
        Triangulation {
            vertices: Vec::new(),
            triangles: Vec::new(),
            constraints: HashSet::new(),
            seam_partners: Vec::new(),
            num_deleted: 0,
            walk_hint: AtomicUsize::new(0),
        }
    }

    /// The number of vertices.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// The number of triangle slots, including soft-deleted ones.
    pub fn num_triangle_slots(&self) -> usize {
        self.triangles.len()
    }

    /// The number of live (non-deleted) triangles.
    pub fn num_triangles(&self) -> usize {
        self.triangles.len() - self.num_deleted
    }

    /// Appends a vertex and returns its handle.
    pub fn add_vertex(&mut self, vertex: Vertex) -> FixedVertexHandle {
        let handle = FixedVertexHandle::new(self.vertices.len());
        self.vertices.push(vertex);
        handle
    }

    pub(crate) fn pop_vertex(&mut self) {
        self.vertices.pop();
    }

    /// Returns a vertex by handle.
    pub fn vertex(&self, handle: FixedVertexHandle) -> &Vertex {
        &self.vertices[handle.index()]
    }

    /// All vertices in insertion order.
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub(crate) fn unify_seam_positions(
        &mut self,
        first: FixedVertexHandle,
        second: FixedVertexHandle,
    ) {
        let position = self.vertices[first.index()].position_3d;
        self.vertices[second.index()].position_3d = position;
        self.seam_partners.push((first, second));
    }

    /// Pairs of vertices that represent the same geometric point across a
    /// parametric seam.
    pub fn seam_partners(&self) -> &[(FixedVertexHandle, FixedVertexHandle)] {
        &self.seam_partners
    }

    /// Registers an immutable constraint edge between two vertices.
    pub(crate) fn add_constraint_edge(&mut self, from: FixedVertexHandle, to: FixedVertexHandle) {
        self.constraints.insert(undirected_edge(from, to));
    }

    pub(crate) fn remove_constraint_edge(
        &mut self,
        from: FixedVertexHandle,
        to: FixedVertexHandle,
    ) {
        self.constraints.remove(&undirected_edge(from, to));
    }

    /// Returns `true` if the edge between the two vertices is a constraint
    /// edge.
    pub fn is_constraint_edge(&self, from: FixedVertexHandle, to: FixedVertexHandle) -> bool {
        self.constraints.contains(&undirected_edge(from, to))
    }

    /// The number of registered constraint edges.
    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub(crate) fn add_triangle(
        &mut self,
        vertices: [FixedVertexHandle; 3],
        circumcircle: Circumcircle,
        transform: MetricTransform,
    ) -> FixedTriangleHandle {
        debug_assert_ne!(
            math::orientation(
                self.vertex(vertices[0]).position(),
                self.vertex(vertices[1]).position(),
                self.vertex(vertices[2]).position(),
            ),
            Orientation::Cw,
            "triangle vertices must be in counterclockwise order"
        );
        let handle = FixedTriangleHandle::new(self.triangles.len());
        self.triangles.push(TriangleData {
            vertices,
            neighbors: [None; 3],
            circumcircle,
            transform,
            deleted: false,
        });
        handle
    }

    pub(crate) fn truncate_triangles(&mut self, len: usize) {
        debug_assert!(self.triangles[len..].iter().all(|data| !data.deleted));
        self.triangles.truncate(len);
    }

    /// Returns `true` if the triangle is soft-deleted.
    pub fn is_deleted(&self, handle: FixedTriangleHandle) -> bool {
        self.triangles[handle.index()].deleted
    }

    pub(crate) fn mark_deleted(&mut self, handle: FixedTriangleHandle) {
        let data = &mut self.triangles[handle.index()];
        debug_assert!(!data.deleted);
        data.deleted = true;
        self.num_deleted += 1;
    }

    pub(crate) fn restore(&mut self, handle: FixedTriangleHandle) {
        let data = &mut self.triangles[handle.index()];
        debug_assert!(data.deleted);
        data.deleted = false;
        self.num_deleted -= 1;
    }

    /// The three vertices of a triangle, in counterclockwise order.
    pub fn triangle_vertices(&self, handle: FixedTriangleHandle) -> [FixedVertexHandle; 3] {
        self.triangles[handle.index()].vertices
    }

    /// The three neighbors of a triangle; entry `1` lies across the edge
    /// opposite vertex slot `1`. `None` marks a domain boundary edge.
    pub fn triangle_neighbors(
        &self,
        handle: FixedTriangleHandle,
    ) -> [Option<FixedTriangleHandle>; 3] {
        self.triangles[handle.index()].neighbors
    }

    /// The parametric corner positions of a triangle.
    pub fn triangle_positions(&self, handle: FixedTriangleHandle) -> [Point2<f64>; 3] {
        self.triangles[handle.index()]
            .vertices
            .map(|vertex| self.vertex(vertex).position())
    }

    /// The cached metric space circumcircle of a triangle.
    pub fn circumcircle(&self, handle: FixedTriangleHandle) -> Circumcircle {
        self.triangles[handle.index()].circumcircle
    }

    /// The metric transform the cached circumcircle was computed under.
    pub fn metric_transform(&self, handle: FixedTriangleHandle) -> MetricTransform {
        self.triangles[handle.index()].transform
    }

    pub(crate) fn set_circumcircle(
        &mut self,
        handle: FixedTriangleHandle,
        circumcircle: Circumcircle,
        transform: MetricTransform,
    ) {
        let data = &mut self.triangles[handle.index()];
        data.circumcircle = circumcircle;
        data.transform = transform;
    }

    pub(crate) fn set_neighbor(
        &mut self,
        handle: FixedTriangleHandle,
        edge: usize,
        neighbor: Option<FixedTriangleHandle>,
    ) {
        self.triangles[handle.index()].neighbors[edge] = neighbor;
    }

    pub(crate) fn link_neighbors(
        &mut self,
        first: FixedTriangleHandle,
        first_edge: usize,
        second: FixedTriangleHandle,
        second_edge: usize,
    ) {
        self.set_neighbor(first, first_edge, Some(second));
        self.set_neighbor(second, second_edge, Some(first));
    }

    /// The vertex endpoints of triangle edge `edge` (the edge opposite
    /// vertex slot `edge`), directed counterclockwise.
    pub fn edge_vertices(
        &self,
        handle: FixedTriangleHandle,
        edge: usize,
    ) -> (FixedVertexHandle, FixedVertexHandle) {
        let vertices = self.triangle_vertices(handle);
        (vertices[(edge + 1) % 3], vertices[(edge + 2) % 3])
    }

    /// Finds the edge index of `handle` whose endpoints are `from` and `to`
    /// in either direction.
    pub fn edge_index(
        &self,
        handle: FixedTriangleHandle,
        from: FixedVertexHandle,
        to: FixedVertexHandle,
    ) -> Option<usize> {
        (0..3).find(|&edge| {
            let (a, b) = self.edge_vertices(handle, edge);
            undirected_edge(a, b) == undirected_edge(from, to)
        })
    }

    /// Finds the edge index of `handle` across which `neighbor` lies.
    pub fn neighbor_index(
        &self,
        handle: FixedTriangleHandle,
        neighbor: FixedTriangleHandle,
    ) -> Option<usize> {
        self.triangle_neighbors(handle)
            .iter()
            .position(|entry| *entry == Some(neighbor))
    }

    /// Iterates over all live triangles.
    pub fn live_triangles(&self) -> impl Iterator<Item = FixedTriangleHandle> + '_ {
        self.triangles
            .iter()
            .enumerate()
            .filter(|(_, data)| !data.deleted)
            .map(|(index, _)| FixedTriangleHandle::new(index))
    }

    /// Returns the vertex index triple of every live triangle, in arena
    /// order. This is the export-friendly view of the connectivity.
    pub fn triangle_vertex_indices(&self) -> Vec<[u32; 3]> {
        self.live_triangles()
            .map(|handle| {
                self.triangle_vertices(handle)
                    .map(|vertex| vertex.index() as u32)
            })
            .collect()
    }

    /// Finds a live triangle containing the given edge, by linear scan.
    ///
    /// Only used by boundary seeding and recovery; the main refinement loop
    /// never calls this.
    pub(crate) fn find_edge(
        &self,
        from: FixedVertexHandle,
        to: FixedVertexHandle,
    ) -> Option<(FixedTriangleHandle, usize)> {
        self.live_triangles().find_map(|handle| {
            self.edge_index(handle, from, to)
                .map(|edge| (handle, edge))
        })
    }

    /// Locates the triangle containing a point by walking neighbor links
    /// from the last used triangle.
    ///
    /// The walk is O(1) amortized for spatially coherent query sequences.
    /// A bounded number of steps guards against cycles; on exhaustion the
    /// walk falls back to a linear scan over all live triangles.
    pub fn locate(&self, point: Point2<f64>) -> PointLocation {
        if self.num_triangles() == 0 {
            return PointLocation::NoTriangulation;
        }

        let mut current = self.walk_seed();
        let mut previous: Option<FixedTriangleHandle> = None;
        let max_steps = 4 * self.triangles.len() + 16;

        for _ in 0..max_steps {
            let mut next = None;
            for edge in 0..3 {
                let neighbor = self.triangle_neighbors(current)[edge];
                if neighbor == previous && previous.is_some() {
                    continue;
                }
                let (from, to) = self.edge_vertices(current, edge);
                let side = math::orientation(
                    self.vertex(from).position(),
                    self.vertex(to).position(),
                    point,
                );
                if side == Orientation::Cw {
                    match neighbor {
                        Some(neighbor) => {
                            next = Some(neighbor);
                            break;
                        }
                        None => {
                            self.store_walk_hint(current);
                            return PointLocation::OutsideDomain;
                        }
                    }
                }
            }

            match next {
                Some(neighbor) => {
                    previous = Some(current);
                    current = neighbor;
                }
                None => {
                    self.store_walk_hint(current);
                    return self.classify_in_triangle(current, point);
                }
            }
        }

        // The walk did not terminate - fall back to scanning. This only
        // happens for adversarial hint states after heavy mutation.
        tracing::debug!("point location walk exhausted, falling back to scan");
        for handle in self.live_triangles() {
            if math::triangle_contains_point(self.triangle_positions(handle), point) {
                self.store_walk_hint(handle);
                return self.classify_in_triangle(handle, point);
            }
        }
        PointLocation::OutsideDomain
    }

    fn classify_in_triangle(
        &self,
        handle: FixedTriangleHandle,
        point: Point2<f64>,
    ) -> PointLocation {
        let vertices = self.triangle_vertices(handle);
        for vertex in vertices {
            if self.vertex(vertex).position() == point {
                return PointLocation::OnVertex(vertex);
            }
        }
        for edge in 0..3 {
            let (from, to) = self.edge_vertices(handle, edge);
            let from_position = self.vertex(from).position();
            let to_position = self.vertex(to).position();
            if math::orientation(from_position, to_position, point) == Orientation::Degenerate {
                let factor = math::project_relative(from_position, to_position, point);
                if (0.0..=1.0).contains(&factor) {
                    return PointLocation::OnEdge(handle, edge);
                }
            }
        }
        PointLocation::InTriangle(handle)
    }

    fn walk_seed(&self) -> FixedTriangleHandle {
        let hint = self.walk_hint.load(Ordering::Relaxed);
        if hint < self.triangles.len() && !self.triangles[hint].deleted {
            return FixedTriangleHandle::new(hint);
        }
        self.live_triangles()
            .next()
            .expect("walk_seed requires a non-empty triangulation")
    }

    fn store_walk_hint(&self, handle: FixedTriangleHandle) {
        self.walk_hint.store(handle.index(), Ordering::Relaxed);
    }

    /// Flips the edge `edge` of triangle `handle` with its neighbor.
    ///
    /// Both triangle handles survive with new vertex sets; the cached
    /// circumcircles become stale and must be refreshed by the caller.
    /// Returns `None` if the edge has no neighbor, is a constraint edge, or
    /// the surrounding quadrilateral is not strictly convex.
    pub(crate) fn flip_edge(
        &mut self,
        handle: FixedTriangleHandle,
        edge: usize,
    ) -> Option<(FixedTriangleHandle, FixedTriangleHandle)> {
        let neighbor = self.triangle_neighbors(handle)[edge]?;
        let (p, q) = self.edge_vertices(handle, edge);
        if self.is_constraint_edge(p, q) {
            return None;
        }

        let apex = self.triangle_vertices(handle)[edge];
        let neighbor_edge = self
            .edge_index(neighbor, p, q)
            .expect("neighbor links out of sync");
        let opposite = self.triangle_vertices(neighbor)[neighbor_edge];

        let apex_position = self.vertex(apex).position();
        let opposite_position = self.vertex(opposite).position();
        let p_position = self.vertex(p).position();
        let q_position = self.vertex(q).position();

        // The flip is only legal if the shared quadrilateral is strictly
        // convex around the new diagonal.
        if math::orientation(apex_position, p_position, opposite_position) != Orientation::Ccw
            || math::orientation(opposite_position, q_position, apex_position) != Orientation::Ccw
        {
            return None;
        }

        let across_qa = self.neighbor_across(handle, q, apex);
        let across_ap = self.neighbor_across(handle, apex, p);
        let across_po = self.neighbor_across(neighbor, p, opposite);
        let across_oq = self.neighbor_across(neighbor, opposite, q);

        // handle becomes (apex, p, opposite), neighbor becomes (opposite, q, apex).
        {
            let data = &mut self.triangles[handle.index()];
            data.vertices = [apex, p, opposite];
        }
        {
            let data = &mut self.triangles[neighbor.index()];
            data.vertices = [opposite, q, apex];
        }

        self.set_neighbor(handle, 0, across_po);
        self.set_neighbor(handle, 1, Some(neighbor));
        self.set_neighbor(handle, 2, across_ap);

        self.set_neighbor(neighbor, 0, across_qa);
        self.set_neighbor(neighbor, 1, Some(handle));
        self.set_neighbor(neighbor, 2, across_oq);

        if let Some(other) = across_po {
            let other_edge = self
                .edge_index(other, p, opposite)
                .expect("neighbor links out of sync");
            self.set_neighbor(other, other_edge, Some(handle));
        }
        if let Some(other) = across_qa {
            let other_edge = self
                .edge_index(other, q, apex)
                .expect("neighbor links out of sync");
            self.set_neighbor(other, other_edge, Some(neighbor));
        }

        Some((handle, neighbor))
    }

    fn neighbor_across(
        &self,
        handle: FixedTriangleHandle,
        from: FixedVertexHandle,
        to: FixedVertexHandle,
    ) -> Option<FixedTriangleHandle> {
        let edge = self
            .edge_index(handle, from, to)
            .expect("edge must belong to triangle");
        self.triangle_neighbors(handle)[edge]
    }

    /// Physically discards all soft-deleted triangles.
    ///
    /// Surviving triangles are renumbered in arena order and every neighbor
    /// reference is remapped in the same pass; no caller can observe a
    /// half-updated state. All previously obtained triangle handles are
    /// invalidated.
    pub fn compact(&mut self) {
        if self.num_deleted == 0 {
            return;
        }

        let mut remap = vec![None; self.triangles.len()];
        let mut next_index = 0;
        for (index, data) in self.triangles.iter().enumerate() {
            if !data.deleted {
                remap[index] = Some(FixedTriangleHandle::new(next_index));
                next_index += 1;
            }
        }

        self.triangles.retain(|data| !data.deleted);
        for data in &mut self.triangles {
            for neighbor in &mut data.neighbors {
                *neighbor = neighbor.map(|handle| {
                    remap[handle.index()].expect("live triangle had a deleted neighbor")
                });
            }
        }

        self.num_deleted = 0;
        self.walk_hint.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn sanity_check(&self) {
        let mut edge_counts: HashMap<(FixedVertexHandle, FixedVertexHandle), usize> =
            HashMap::new();

        for handle in self.live_triangles() {
            let positions = self.triangle_positions(handle);
            assert_eq!(
                math::orientation(positions[0], positions[1], positions[2]),
                Orientation::Ccw,
                "{handle:?} is not counterclockwise"
            );

            for edge in 0..3 {
                let (from, to) = self.edge_vertices(handle, edge);
                *edge_counts.entry(undirected_edge(from, to)).or_default() += 1;

                match self.triangle_neighbors(handle)[edge] {
                    Some(neighbor) => {
                        assert!(!self.is_deleted(neighbor), "{handle:?} links a deleted neighbor");
                        let back = self
                            .edge_index(neighbor, from, to)
                            .expect("neighbor does not share the linking edge");
                        assert_eq!(
                            self.triangle_neighbors(neighbor)[back],
                            Some(handle),
                            "neighbor link of {handle:?} is not symmetric"
                        );
                    }
                    None => {}
                }
            }
        }

        for (edge, count) in edge_counts {
            assert!(
                count <= 2,
                "edge {edge:?} is shared by more than two live triangles"
            );
        }
    }
}

/// Builds the symmetric neighbor links of a batch of freshly created
/// triangles from their shared edges.
///
/// Intended for seeding passes that create many triangles at once; edges
/// that remain unmatched keep their `None` (boundary) marker.
pub(crate) fn link_batch(triangulation: &mut Triangulation, batch: &[FixedTriangleHandle]) {
    let mut half_edges: HashMap<(FixedVertexHandle, FixedVertexHandle), (FixedTriangleHandle, usize)> =
        HashMap::new();

    for &handle in batch {
        for edge in 0..3 {
            let (from, to) = triangulation.edge_vertices(handle, edge);
            half_edges.insert((from, to), (handle, edge));
        }
    }

    for &handle in batch {
        for edge in 0..3 {
            let (from, to) = triangulation.edge_vertices(handle, edge);
            // The matching half edge of the neighbor runs in reverse.
            if let Some(&(neighbor, neighbor_edge)) = half_edges.get(&(to, from)) {
                triangulation.set_neighbor(handle, edge, Some(neighbor));
                triangulation.set_neighbor(neighbor, neighbor_edge, Some(handle));
            }
        }
    }
}
