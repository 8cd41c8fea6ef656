pub mod cavity;
mod handles;
pub(crate) mod seeding;

pub mod math;

mod scheduler;
pub(crate) mod triangulation;

pub use handles::{FixedTriangleHandle, FixedVertexHandle};
pub use scheduler::{InsertionPolicy, InsertionScheduler, TieBreak};
pub use triangulation::{PointLocation, Triangulation, Vertex, VertexOwner};
