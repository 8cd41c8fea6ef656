use num_traits::{Num, Signed};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A coordinate type that can be used with the mesh generator.
///
/// Internally, all geometric calculations are performed after converting the
/// type into a `f64`. This type should usually be either `f32` or `f64`;
/// parametric coordinates coming from a CAD kernel are `f64`.
pub trait MeshNum:
    Num + PartialOrd + Into<f64> + From<f32> + Copy + Signed + std::fmt::Debug
{
}

impl<T> MeshNum for T where
    T: Num + PartialOrd + Into<f64> + From<f32> + Copy + Signed + std::fmt::Debug
{
}

/// A two dimensional point.
///
/// This is the basic type used for defining positions in the parametric
/// domain of a surface.
#[derive(Debug, PartialEq, PartialOrd, Clone, Copy, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde")
)]
pub struct Point2<S> {
    /// The point's x coordinate
    pub x: S,
    /// The point's y coordinate
    pub y: S,
}

impl<S> Point2<S> {
    /// Creates a new point.
    #[inline]
    pub const fn new(x: S, y: S) -> Self {
        Point2 { x, y }
    }
}

impl<S: MeshNum> Point2<S> {
    /// Returns the squared distance of this point and another point.
    #[inline]
    pub fn distance_2(&self, other: Self) -> S {
        self.sub(other).length2()
    }

    #[allow(dead_code)]
    pub(crate) fn to_f64(self) -> Point2<f64> {
        Point2::new(self.x.into(), self.y.into())
    }

    pub(crate) fn mul(&self, factor: S) -> Self {
        Point2 {
            x: self.x * factor,
            y: self.y * factor,
        }
    }

    pub(crate) fn add(&self, other: Self) -> Self {
        Point2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    pub(crate) fn length2(&self) -> S {
        self.x * self.x + self.y * self.y
    }

    pub(crate) fn sub(&self, other: Self) -> Self {
        Point2 {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    pub(crate) fn dot(&self, other: Self) -> S {
        self.x * other.x + self.y * other.y
    }
}

impl<S: MeshNum> From<Point2<S>> for [S; 2] {
    #[inline]
    fn from(point: Point2<S>) -> Self {
        [point.x, point.y]
    }
}

impl<S: MeshNum> From<[S; 2]> for Point2<S> {
    #[inline]
    fn from(source: [S; 2]) -> Self {
        Self::new(source[0], source[1])
    }
}

impl<S: MeshNum> From<(S, S)> for Point2<S> {
    #[inline]
    fn from(source: (S, S)) -> Self {
        Self::new(source.0, source.1)
    }
}

/// A three dimensional point.
///
/// Used for the surface positions that correspond to parametric coordinates.
/// The mesh generator itself never computes with these - they are evaluated
/// by the surface domain and carried through to the output.
#[derive(Debug, PartialEq, PartialOrd, Clone, Copy, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde")
)]
pub struct Point3 {
    /// The point's x coordinate
    pub x: f64,
    /// The point's y coordinate
    pub y: f64,
    /// The point's z coordinate
    pub z: f64,
}

impl Point3 {
    /// Creates a new point.
    #[inline]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Point3 { x, y, z }
    }
}

impl From<Point3> for [f64; 3] {
    #[inline]
    fn from(point: Point3) -> Self {
        [point.x, point.y, point.z]
    }
}

impl From<[f64; 3]> for Point3 {
    #[inline]
    fn from(source: [f64; 3]) -> Self {
        Self::new(source[0], source[1], source[2])
    }
}
