//! Robust geometric predicates and the anisotropic circumcircle math.

use std::{error::Error, fmt::Display};

use crate::{MetricTransform, Point2};

/// The error type used for validating coordinates that enter a meshing pass.
///
/// Errors can only originate from an invalid position - either supplied as a
/// boundary point or produced by a degenerate candidate computation.
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Debug, Hash)]
pub enum CoordinateError {
    /// A coordinate value was too small.
    ///
    /// The absolute value of any coordinate must either be zero or greater
    /// than or equal to [MIN_ALLOWED_VALUE].
    TooSmall,

    /// A coordinate value was too large.
    ///
    /// The absolute value of any coordinate must be less than or equal to
    /// [MAX_ALLOWED_VALUE].
    TooLarge,

    /// A coordinate value was NaN.
    Nan,
}

impl Display for CoordinateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Debug>::fmt(self, f)
    }
}

impl Error for CoordinateError {}

// These bounds come from the paper of Jonathan Richard Shewchuk:
// "The four predicates implemented for this report will not overflow nor
// underflow if their inputs have exponents in the range -[142, 201] and
// IEEE-745 double precision arithmetic is used."
// Source: Adaptive Precision Floating-Point Arithmetic and Fast Robust
// Geometric Predicates

/// The smallest allowed coordinate value greater than zero, equal to
/// 2<sup>-142</sup>.
///
/// Smaller nonzero values could underflow the exact orientation predicate.
pub const MIN_ALLOWED_VALUE: f64 = 1.793662034335766e-43; // 1.0 * 2^-142

/// The largest allowed coordinate value, equal to 2<sup>201</sup>.
///
/// Larger values could overflow the exact orientation predicate.
pub const MAX_ALLOWED_VALUE: f64 = 3.2138760885179806e60; // 1.0 * 2^201

/// Checks if a coordinate value may enter the triangulation.
///
/// Will return an error if and only if
///  - the absolute value of the coordinate is too small (see [MIN_ALLOWED_VALUE])
///  - the absolute value of the coordinate is too large (see [MAX_ALLOWED_VALUE])
///  - the coordinate is NaN
///
/// Passing in any non-finite floating point number (e.g. `f64::NEG_INFINITY`)
/// will result in `Err(CoordinateError::TooLarge)`.
pub fn validate_coordinate(value: f64) -> Result<(), CoordinateError> {
    if value.is_nan() {
        Err(CoordinateError::Nan)
    } else if value.abs() < MIN_ALLOWED_VALUE && value != 0.0 {
        Err(CoordinateError::TooSmall)
    } else if value.abs() > MAX_ALLOWED_VALUE {
        Err(CoordinateError::TooLarge)
    } else {
        Ok(())
    }
}

/// Checks if a parametric position may enter the triangulation.
///
/// A position is suitable if both of its coordinates are valid. See
/// [validate_coordinate] for more information.
pub fn validate_position(position: Point2<f64>) -> Result<(), CoordinateError> {
    validate_coordinate(position.x)?;
    validate_coordinate(position.y)?;
    Ok(())
}

/// The sign of the area spanned by three points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    /// The three points are in counterclockwise order.
    Ccw,
    /// The three points are in clockwise order.
    Cw,
    /// The three points are collinear.
    Degenerate,
}

impl Orientation {
    fn from_determinant(determinant: f64) -> Self {
        if determinant > 0.0 {
            Orientation::Ccw
        } else if determinant < 0.0 {
            Orientation::Cw
        } else {
            Orientation::Degenerate
        }
    }
}

fn to_robust_coord(point: Point2<f64>) -> robust::Coord<f64> {
    robust::Coord {
        x: point.x,
        y: point.y,
    }
}

/// Exactly classifies the orientation of three points.
///
/// Uses the adaptive precision predicate of the `robust` crate, so results
/// near zero never flip sign under floating point noise.
pub fn orientation(p0: Point2<f64>, p1: Point2<f64>, p2: Point2<f64>) -> Orientation {
    let determinant = robust::orient2d(
        to_robust_coord(p0),
        to_robust_coord(p1),
        to_robust_coord(p2),
    );
    Orientation::from_determinant(determinant)
}

/// A circumcircle in metric space.
///
/// Produced by [metric_circumcircle] and cached per triangle. Collinear input
/// is represented by the distinct `Degenerate` variant so that callers can
/// never mistake it for a triangle with a valid huge radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Circumcircle {
    /// A proper circumcircle with finite radius.
    Real {
        /// The circumcenter, in metric space coordinates.
        center: Point2<f64>,
        /// The squared circumradius, in metric space coordinates.
        radius2: f64,
    },
    /// The triangle was collinear (or numerically indistinguishable from
    /// collinear) under its metric transform.
    Degenerate,
}

/// The relation of a point to a circumcircle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircleLocation {
    /// The point lies strictly inside the circle.
    Inside,
    /// The point lies strictly outside the circle.
    Outside,
    /// The point lies within the classification tolerance of the circle.
    Boundary,
}

impl Circumcircle {
    /// Returns `true` for the degenerate variant.
    pub fn is_degenerate(&self) -> bool {
        matches!(self, Circumcircle::Degenerate)
    }

    /// The squared radius, or `None` for a degenerate circle.
    pub fn radius2(&self) -> Option<f64> {
        match self {
            Circumcircle::Real { radius2, .. } => Some(*radius2),
            Circumcircle::Degenerate => None,
        }
    }

    /// The center in metric space, or `None` for a degenerate circle.
    pub fn center(&self) -> Option<Point2<f64>> {
        match self {
            Circumcircle::Real { center, .. } => Some(*center),
            Circumcircle::Degenerate => None,
        }
    }

    /// Classifies a metric space point against this circle.
    ///
    /// `tolerance` is relative to the squared radius; points whose squared
    /// center distance is within `tolerance * radius2` of `radius2` are
    /// classified as [CircleLocation::Boundary] instead of oscillating
    /// between inside and outside under floating point noise.
    ///
    /// Returns `None` for a degenerate circle - callers must special-case
    /// degenerate triangles instead of treating them as outside.
    pub fn classify(&self, point: Point2<f64>, tolerance: f64) -> Option<CircleLocation> {
        match self {
            Circumcircle::Degenerate => None,
            Circumcircle::Real { center, radius2 } => {
                let distance2 = point.distance_2(*center);
                let band = tolerance * radius2;
                Some(if (distance2 - radius2).abs() <= band {
                    CircleLocation::Boundary
                } else if distance2 < *radius2 {
                    CircleLocation::Inside
                } else {
                    CircleLocation::Outside
                })
            }
        }
    }
}

/// Computes the circumcircle of a triangle under a metric transform.
///
/// The three corners are mapped into metric space and the ordinary Euclidean
/// circumcircle is computed there. The result stays in metric space so that
/// later in-circle queries against the cached circle remain consistent with
/// the metric the triangle was created under.
pub fn metric_circumcircle(
    positions: [Point2<f64>; 3],
    transform: &MetricTransform,
) -> Circumcircle {
    let [v0, v1, v2] = positions.map(|position| transform.apply(position));

    if orientation(v0, v1, v2) == Orientation::Degenerate {
        return Circumcircle::Degenerate;
    }

    let b = v1.sub(v0);
    let c = v2.sub(v0);

    let d = 2.0 * (b.x * c.y - c.x * b.y);
    let len_b = b.dot(b);
    let len_c = c.dot(c);
    let d_inv = 1.0 / d;

    let x = (len_b * c.y - len_c * b.y) * d_inv;
    let y = (-len_b * c.x + len_c * b.x) * d_inv;
    let radius2 = x * x + y * y;

    if !radius2.is_finite() {
        return Circumcircle::Degenerate;
    }

    Circumcircle::Real {
        center: Point2::new(x, y).add(v0),
        radius2,
    }
}

/// Returns `true` if a triangle given in counterclockwise order contains the
/// query point. Points on the triangle boundary are reported as contained.
pub fn triangle_contains_point(vertices: [Point2<f64>; 3], query_point: Point2<f64>) -> bool {
    for i in 0..3 {
        let from = vertices[i];
        let to = vertices[(i + 1) % 3];
        if orientation(from, to, query_point) == Orientation::Cw {
            return false;
        }
    }
    true
}

/// Computes the barycentric coordinates of a point with respect to a
/// triangle, or `None` if the triangle is degenerate.
pub fn barycentric_coordinates(
    vertices: [Point2<f64>; 3],
    query_point: Point2<f64>,
) -> Option<[f64; 3]> {
    let [v0, v1, v2] = vertices;
    let b = v1.sub(v0);
    let c = v2.sub(v0);
    let p = query_point.sub(v0);

    let denominator = b.x * c.y - b.y * c.x;
    if denominator == 0.0 {
        return None;
    }

    let w1 = (p.x * c.y - p.y * c.x) / denominator;
    let w2 = (b.x * p.y - b.y * p.x) / denominator;
    Some([1.0 - w1 - w2, w1, w2])
}

/// Returns the area of a triangle.
pub fn triangle_area(positions: [Point2<f64>; 3]) -> f64 {
    let [v0, v1, v2] = positions;
    let b = v1.sub(v0);
    let c = v2.sub(v0);
    (b.x * c.y - b.y * c.x).abs() * 0.5
}

pub(crate) fn project_relative(
    p1: Point2<f64>,
    p2: Point2<f64>,
    query_point: Point2<f64>,
) -> f64 {
    let dir = p2.sub(p1);
    query_point.sub(p1).dot(dir) / dir.length2()
}

/// The point on the segment `p1 -> p2` closest to the query point.
pub fn nearest_point(p1: Point2<f64>, p2: Point2<f64>, query_point: Point2<f64>) -> Point2<f64> {
    let factor = project_relative(p1, p2, query_point);
    if factor <= 0.0 {
        p1
    } else if factor >= 1.0 {
        p2
    } else {
        p1.add(p2.sub(p1).mul(factor))
    }
}

/// The squared distance between a segment and a point.
pub fn distance_2(p1: Point2<f64>, p2: Point2<f64>, query_point: Point2<f64>) -> f64 {
    let nearest = nearest_point(p1, p2, query_point);
    query_point.sub(nearest).length2()
}

/// Checks whether two non-collinear segments intersect, including shared
/// endpoints.
///
/// Used by boundary edge recovery to find the triangulation edges crossing a
/// missing constraint segment.
pub(crate) fn intersects_edge_non_collinear(
    from0: Point2<f64>,
    to0: Point2<f64>,
    from1: Point2<f64>,
    to1: Point2<f64>,
) -> bool {
    let other_from = orientation(from0, to0, from1);
    let other_to = orientation(from0, to0, to1);
    let self_from = orientation(from1, to1, from0);
    let self_to = orientation(from1, to1, to0);

    debug_assert!(
        ![other_from, other_to, self_from, self_to]
            .iter()
            .all(|o| *o == Orientation::Degenerate),
        "intersects_edge_non_collinear: Given edge is collinear."
    );

    other_from != other_to && self_from != self_to
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MetricTransform;
    use approx::assert_relative_eq;

    #[test]
    fn test_validate_coordinate() {
        use CoordinateError::*;
        assert_eq!(validate_coordinate(f64::NAN), Err(Nan));
        assert_eq!(validate_coordinate(f64::INFINITY), Err(TooLarge));
        assert_eq!(validate_coordinate(f64::NEG_INFINITY), Err(TooLarge));
        assert_eq!(validate_coordinate(MAX_ALLOWED_VALUE * 2.0), Err(TooLarge));
        assert_eq!(validate_coordinate(MIN_ALLOWED_VALUE / 2.0), Err(TooSmall));

        assert_eq!(validate_coordinate(MIN_ALLOWED_VALUE), Ok(()));
        assert_eq!(validate_coordinate(0.0), Ok(()));
        assert_eq!(validate_coordinate(-42.0), Ok(()));
    }

    #[test]
    fn test_orientation() {
        let p0 = Point2::new(0.0, 0.0);
        let p1 = Point2::new(1.0, 0.0);
        assert_eq!(orientation(p0, p1, Point2::new(0.0, 1.0)), Orientation::Ccw);
        assert_eq!(orientation(p0, p1, Point2::new(0.0, -1.0)), Orientation::Cw);
        assert_eq!(
            orientation(p0, p1, Point2::new(2.0, 0.0)),
            Orientation::Degenerate
        );
    }

    #[test]
    fn test_circumcircle_right_triangle() {
        let circle = metric_circumcircle(
            [
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 0.0),
                Point2::new(1.0, 1.0),
            ],
            &MetricTransform::identity(),
        );

        let center = circle.center().unwrap();
        assert_relative_eq!(center.x, 0.5);
        assert_relative_eq!(center.y, 0.5);
        assert_relative_eq!(circle.radius2().unwrap(), 0.5);
    }

    #[test]
    fn test_circumcircle_collinear_is_degenerate() {
        let circle = metric_circumcircle(
            [
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 1.0),
                Point2::new(2.0, 2.0),
            ],
            &MetricTransform::identity(),
        );
        assert!(circle.is_degenerate());
        assert_eq!(circle.radius2(), None);
        assert_eq!(circle.classify(Point2::new(0.0, 0.0), 1.0e-10), None);
    }

    #[test]
    fn test_circumcircle_under_metric() {
        // Stretching the x axis by 2 shrinks x extents in metric space.
        let metric = crate::Metric::from_sizes_and_angle(2.0, 1.0, 0.0);
        let transform = metric.factor().unwrap();
        let circle = metric_circumcircle(
            [
                Point2::new(0.0, 0.0),
                Point2::new(2.0, 0.0),
                Point2::new(1.0, 1.0),
            ],
            &transform,
        );
        // In metric space this is the isosceles triangle (0,0), (1,0), (0.5,1).
        let center = circle.center().unwrap();
        assert_relative_eq!(center.x, 0.5, epsilon = 1.0e-12);
        assert!(circle.radius2().unwrap() < 1.0);
    }

    #[test]
    fn test_classification_tolerance() {
        let circle = Circumcircle::Real {
            center: Point2::new(0.0, 0.0),
            radius2: 1.0,
        };
        assert_eq!(
            circle.classify(Point2::new(0.5, 0.0), 1.0e-10),
            Some(CircleLocation::Inside)
        );
        assert_eq!(
            circle.classify(Point2::new(2.0, 0.0), 1.0e-10),
            Some(CircleLocation::Outside)
        );
        assert_eq!(
            circle.classify(Point2::new(1.0, 0.0), 1.0e-10),
            Some(CircleLocation::Boundary)
        );
        // A generous tolerance widens the boundary band.
        assert_eq!(
            circle.classify(Point2::new(1.01, 0.0), 0.1),
            Some(CircleLocation::Boundary)
        );
    }

    #[test]
    fn test_triangle_contains_point() {
        let triangle = [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ];
        assert!(triangle_contains_point(triangle, Point2::new(0.25, 0.25)));
        assert!(triangle_contains_point(triangle, Point2::new(0.5, 0.0)));
        assert!(triangle_contains_point(triangle, Point2::new(0.0, 0.0)));
        assert!(!triangle_contains_point(triangle, Point2::new(1.0, 1.0)));
        assert!(!triangle_contains_point(triangle, Point2::new(-0.1, 0.5)));
    }

    #[test]
    fn test_barycentric_coordinates() {
        let triangle = [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ];
        let weights = barycentric_coordinates(triangle, Point2::new(0.25, 0.25)).unwrap();
        assert_relative_eq!(weights[0], 0.5);
        assert_relative_eq!(weights[1], 0.25);
        assert_relative_eq!(weights[2], 0.25);

        let collinear = [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(2.0, 0.0),
        ];
        assert!(barycentric_coordinates(collinear, Point2::new(0.5, 0.5)).is_none());
    }

    #[test]
    fn test_edge_distance() {
        let p1 = Point2::new(0.0, 0.0);
        let p2 = Point2::new(1.0, 1.0);
        assert_relative_eq!(distance_2(p1, p2, Point2::new(1.0, 0.0)), 0.5);
        assert_relative_eq!(distance_2(p1, p2, Point2::new(0.0, 1.0)), 0.5);
        assert_relative_eq!(distance_2(p1, p2, Point2::new(-1.0, -1.0)), 2.0);
        assert_relative_eq!(distance_2(p1, p2, Point2::new(2.0, 2.0)), 2.0);
    }

    #[test]
    fn test_intersects_middle() {
        let (f0, t0) = (Point2::new(0.0, 0.0), Point2::new(5.0, 5.0));
        let (f1, t1) = (Point2::new(-1.5, 1.0), Point2::new(1.0, -1.5));
        let (f2, t2) = (Point2::new(0.5, 4.0), Point2::new(0.5, -4.0));

        assert!(!intersects_edge_non_collinear(f0, t0, f1, t1));
        assert!(intersects_edge_non_collinear(f0, t0, f2, t2));
        assert!(intersects_edge_non_collinear(f1, t1, f2, t2));
    }
}
