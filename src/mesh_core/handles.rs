/// An index into the vertex arena of a [Triangulation](crate::Triangulation).
///
/// Vertex handles stay valid for the whole lifetime of a meshing pass -
/// vertices are created once and never removed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedVertexHandle {
    index: u32,
}

/// An index into the triangle arena of a [Triangulation](crate::Triangulation).
///
/// A handle may refer to a soft-deleted triangle; deleted entries keep their
/// slot until [compact](crate::Triangulation::compact) renumbers the arena.
/// Handles obtained before a compaction must not be used afterwards.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedTriangleHandle {
    index: u32,
}

impl FixedVertexHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index: index
                .try_into()
                .expect("Index too big - at most 2^32 elements supported"),
        }
    }

    /// Returns the internal arena index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl FixedTriangleHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index: index
                .try_into()
                .expect("Index too big - at most 2^32 elements supported"),
        }
    }

    /// Returns the internal arena index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl std::fmt::Debug for FixedVertexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VertexHandle({})", self.index)
    }
}

impl std::fmt::Debug for FixedTriangleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TriangleHandle({})", self.index)
    }
}

/// Normalizes an undirected edge so that lookups are independent of edge
/// direction.
pub(crate) fn undirected_edge(
    from: FixedVertexHandle,
    to: FixedVertexHandle,
) -> (FixedVertexHandle, FixedVertexHandle) {
    if from <= to {
        (from, to)
    } else {
        (to, from)
    }
}
