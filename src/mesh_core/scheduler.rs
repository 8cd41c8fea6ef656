use std::collections::BinaryHeap;

use crate::mesh_core::handles::FixedTriangleHandle;
use crate::Triangulation;

/// Decides which of two queue entries with equal keys is processed first.
///
/// The tie-break is part of the deterministic behavior of a meshing pass:
/// the same input with the same tie-break always produces the same mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Entries pushed earlier win. Keeps frontal passes advancing in wave
    /// order.
    #[default]
    OldestFirst,
    /// Entries pushed later win.
    NewestFirst,
}

/// The insertion ordering policy of a meshing pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertionPolicy {
    /// Pull the triangle with the largest metric circumradius and insert
    /// its circumcenter. The default.
    BowyerWatson,
    /// Advance a front from the domain boundary inward, placing candidates
    /// at the locally desired size.
    Frontal,
    /// Frontal advancement biased toward right angled, quad-pairable
    /// triangle pairs. The bias must lie in `[0, 1]`.
    FrontalLayered {
        /// 0 behaves like [InsertionPolicy::Frontal]; 1 places candidates
        /// perpendicularly over the front edge midpoint.
        quad_bias: f64,
    },
    /// Seed a structured, metric-aligned point lattice first, then fill the
    /// irregular remainder like [InsertionPolicy::BowyerWatson].
    Parallelogram,
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    key: f64,
    secondary: u64,
    triangle: FixedTriangleHandle,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.secondary == other.secondary
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.secondary.cmp(&other.secondary))
    }
}

/// Orders pending refinement work by a priority key.
///
/// Keys are pushed together with the triangle they refer to; the scheduler
/// always pops the entry with the largest key. Entries whose triangle has
/// been soft-deleted by a later cavity are *not* removed eagerly - they are
/// discarded lazily when popped.
#[derive(Debug)]
pub struct InsertionScheduler {
    heap: BinaryHeap<QueueEntry>,
    sequence: u64,
    tie_break: TieBreak,
}

impl InsertionScheduler {
    /// Creates an empty scheduler with the given tie-break rule.
    pub fn new(tie_break: TieBreak) -> Self {
        InsertionScheduler {
            heap: BinaryHeap::new(),
            sequence: 0,
            tie_break,
        }
    }

    /// Queues a triangle under the given priority key.
    ///
    /// Non-finite keys are silently ignored; they can only arise from
    /// degenerate triangles which are never valid refinement targets.
    pub fn push(&mut self, triangle: FixedTriangleHandle, key: f64) {
        if !key.is_finite() {
            return;
        }
        let secondary = match self.tie_break {
            TieBreak::OldestFirst => u64::MAX - self.sequence,
            TieBreak::NewestFirst => self.sequence,
        };
        self.sequence += 1;
        self.heap.push(QueueEntry {
            key,
            secondary,
            triangle,
        });
    }

    /// Pops the live triangle with the largest key, discarding stale
    /// entries that refer to soft-deleted triangles.
    pub fn pop_worst(&mut self, triangulation: &Triangulation) -> Option<FixedTriangleHandle> {
        while let Some(entry) = self.heap.pop() {
            if !triangulation.is_deleted(entry.triangle) {
                return Some(entry.triangle);
            }
        }
        None
    }

    /// The number of queued entries, including stale ones.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
