use crate::Point2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A symmetric positive definite 2x2 tensor describing a stretched inner
/// product over the parametric domain.
///
/// A vector `v` has the metric length `sqrt(v^T M v)`. The unit ball of a
/// metric is an ellipse in parametric space; element size and stretch
/// direction are controlled by choosing that ellipse. `Metric::from_size`
/// produces the isotropic case where the ellipse is a circle of radius `h`.
#[derive(Debug, PartialEq, Clone, Copy)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde")
)]
pub struct Metric {
    /// Top left tensor entry
    pub m11: f64,
    /// Off diagonal tensor entry
    pub m12: f64,
    /// Bottom right tensor entry
    pub m22: f64,
}

impl Metric {
    /// The identity metric - lengths are ordinary Euclidean lengths.
    #[inline]
    pub const fn identity() -> Self {
        Metric {
            m11: 1.0,
            m12: 0.0,
            m22: 1.0,
        }
    }

    /// Creates an isotropic metric with the given target element size.
    ///
    /// A segment of Euclidean length `size` has metric length 1.
    pub fn from_size(size: f64) -> Self {
        let scale = 1.0 / (size * size);
        Metric {
            m11: scale,
            m12: 0.0,
            m22: scale,
        }
    }

    /// Creates an anisotropic metric from two target sizes and an angle.
    ///
    /// `size_major` applies along the direction given by `angle` (radians,
    /// measured from the u-axis), `size_minor` along the perpendicular
    /// direction.
    pub fn from_sizes_and_angle(size_major: f64, size_minor: f64, angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        let inv_major = 1.0 / (size_major * size_major);
        let inv_minor = 1.0 / (size_minor * size_minor);
        Metric {
            m11: cos * cos * inv_major + sin * sin * inv_minor,
            m12: cos * sin * (inv_major - inv_minor),
            m22: sin * sin * inv_major + cos * cos * inv_minor,
        }
    }

    /// Returns the determinant of the tensor.
    pub fn determinant(&self) -> f64 {
        self.m11 * self.m22 - self.m12 * self.m12
    }

    /// Component-wise barycentric interpolation of three metrics.
    pub fn interpolate(metrics: [Metric; 3], weights: [f64; 3]) -> Metric {
        let mut result = Metric {
            m11: 0.0,
            m12: 0.0,
            m22: 0.0,
        };
        for (metric, weight) in metrics.iter().zip(weights) {
            result.m11 += metric.m11 * weight;
            result.m12 += metric.m12 * weight;
            result.m22 += metric.m22 * weight;
        }
        result
    }

    /// Computes the upper triangular Cholesky factor of this metric.
    ///
    /// Returns `None` if the tensor is not positive definite. Callers treat
    /// this as a recoverable failure of the candidate point that requested
    /// the metric, not as a fatal error.
    pub fn factor(&self) -> Option<MetricTransform> {
        if !(self.m11 > 0.0) {
            return None;
        }
        let t11 = self.m11.sqrt();
        let t12 = self.m12 / t11;
        let remainder = self.m22 - t12 * t12;
        if !(remainder > 0.0) {
            return None;
        }
        let transform = MetricTransform {
            t11,
            t12,
            t22: remainder.sqrt(),
        };
        if transform.t11.is_finite() && transform.t12.is_finite() && transform.t22.is_finite() {
            Some(transform)
        } else {
            None
        }
    }
}

impl Default for Metric {
    fn default() -> Self {
        Self::identity()
    }
}

/// The upper triangular square root factor of a [Metric].
///
/// Multiplying parametric coordinates by this factor maps them into *metric
/// space* where the metric's stretched inner product becomes the ordinary
/// Euclidean one. Circumcircles are computed and cached in that space.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct MetricTransform {
    t11: f64,
    t12: f64,
    t22: f64,
}

impl MetricTransform {
    /// The factor of the identity metric.
    pub const fn identity() -> Self {
        MetricTransform {
            t11: 1.0,
            t12: 0.0,
            t22: 1.0,
        }
    }

    /// Maps a parametric point into metric space.
    #[inline]
    pub fn apply(&self, point: Point2<f64>) -> Point2<f64> {
        Point2::new(self.t11 * point.x + self.t12 * point.y, self.t22 * point.y)
    }

    /// Maps a metric space point back into parametric space.
    #[inline]
    pub fn apply_inverse(&self, point: Point2<f64>) -> Point2<f64> {
        let y = point.y / self.t22;
        let x = (point.x - self.t12 * y) / self.t11;
        Point2::new(x, y)
    }

    /// Returns the metric length of the segment between two parametric
    /// points.
    pub fn distance(&self, from: Point2<f64>, to: Point2<f64>) -> f64 {
        self.apply(from).distance_2(self.apply(to)).sqrt()
    }
}

/// Normalizes a cross field angle into the canonical quarter turn range
/// `[0, PI / 2)`.
///
/// A cross field direction is only defined up to rotations by 90 degrees.
pub fn normalize_cross_angle(angle: f64) -> f64 {
    angle.rem_euclid(std::f64::consts::FRAC_PI_2)
}

/// Barycentric interpolation of quarter-turn periodic angles.
///
/// Interpolating the raw angle values would tear at the periodic seam, so
/// the angles are embedded as unit vectors of 4 times the angle first.
pub fn interpolate_cross_angle(angles: [f64; 3], weights: [f64; 3]) -> f64 {
    let mut x = 0.0;
    let mut y = 0.0;
    for (angle, weight) in angles.iter().zip(weights) {
        x += (angle * 4.0).cos() * weight;
        y += (angle * 4.0).sin() * weight;
    }
    if x * x + y * y < 1.0e-12 {
        // All contributions cancelled - any representative works.
        return normalize_cross_angle(angles[0]);
    }
    normalize_cross_angle(y.atan2(x) / 4.0)
}

/// A source of metric tensors over the parametric domain.
///
/// The cavity engine evaluates the metric at each new triangle's centroid
/// through this trait. [MetricField](crate::MetricField) is the interpolating
/// implementation; [UniformMetric] is the trivial one used for isotropic
/// passes and for constructing the background mesh itself.
pub trait MetricSource {
    /// Returns the desired metric at a parametric position.
    fn metric_at(&self, position: Point2<f64>) -> Metric;

    /// Cheap membership test for generated candidate points.
    ///
    /// The default implementation accepts everything; field-backed sources
    /// override this with a point location query.
    fn in_domain(&self, _position: Point2<f64>) -> bool {
        true
    }

    /// Aggregate anomaly counters of the source, if it keeps any.
    ///
    /// Field-backed sources report how often queries had to be clamped back
    /// into their background mesh; the driver folds the counters into the
    /// diagnostics of the meshing result.
    fn field_statistics(&self) -> Option<FieldStatistics> {
        None
    }
}

/// Counters describing how well a metric field covered its queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldStatistics {
    /// Queries that missed the background mesh and were clamped to the
    /// nearest element.
    pub clamped_queries: u64,
    /// Clamped queries whose clamp distance exceeded the sanity threshold.
    pub excessive_clamps: u64,
}

/// A metric source returning the same metric everywhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformMetric {
    metric: Metric,
}

impl UniformMetric {
    /// Creates a uniform source from any metric.
    pub fn new(metric: Metric) -> Self {
        UniformMetric { metric }
    }

    /// Creates an isotropic uniform source with the given element size.
    pub fn from_size(size: f64) -> Self {
        UniformMetric {
            metric: Metric::from_size(size),
        }
    }
}

impl Default for UniformMetric {
    fn default() -> Self {
        UniformMetric {
            metric: Metric::identity(),
        }
    }
}

impl MetricSource for UniformMetric {
    fn metric_at(&self, _position: Point2<f64>) -> Metric {
        self.metric
    }
}

#[cfg(test)]
mod test {
    use super::{interpolate_cross_angle, normalize_cross_angle, Metric, MetricTransform};
    use crate::Point2;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

    #[test]
    fn test_factor_roundtrip() {
        let metric = Metric::from_sizes_and_angle(0.5, 0.125, 0.3);
        let transform = metric.factor().unwrap();

        for point in [
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
            Point2::new(-0.7, 2.3),
        ] {
            let expected =
                metric.m11 * point.x * point.x
                    + 2.0 * metric.m12 * point.x * point.y
                    + metric.m22 * point.y * point.y;
            assert_relative_eq!(
                transform.apply(point).length2(),
                expected,
                max_relative = 1.0e-12
            );

            let roundtrip = transform.apply_inverse(transform.apply(point));
            assert_relative_eq!(roundtrip.x, point.x, epsilon = 1.0e-12);
            assert_relative_eq!(roundtrip.y, point.y, epsilon = 1.0e-12);
        }
    }

    #[test]
    fn test_sizes_and_angle() {
        let angle = 0.7;
        let metric = Metric::from_sizes_and_angle(2.0, 0.5, angle);
        let transform = metric.factor().unwrap();

        // A vector of the major size along the major axis has metric length 1.
        let major = Point2::new(angle.cos() * 2.0, angle.sin() * 2.0);
        assert_relative_eq!(transform.apply(major).length2(), 1.0, epsilon = 1.0e-12);

        let minor = Point2::new(-angle.sin() * 0.5, angle.cos() * 0.5);
        assert_relative_eq!(transform.apply(minor).length2(), 1.0, epsilon = 1.0e-12);
    }

    #[test]
    fn test_degenerate_factor() {
        let flat = Metric {
            m11: 1.0,
            m12: 1.0,
            m22: 1.0,
        };
        assert!(flat.factor().is_none());

        let negative = Metric {
            m11: -1.0,
            m12: 0.0,
            m22: 1.0,
        };
        assert!(negative.factor().is_none());

        let nan = Metric {
            m11: f64::NAN,
            m12: 0.0,
            m22: 1.0,
        };
        assert!(nan.factor().is_none());
    }

    #[test]
    fn test_identity_transform() {
        let transform = MetricTransform::identity();
        let point = Point2::new(3.0, -4.0);
        assert_eq!(transform.apply(point), point);
        assert_relative_eq!(transform.distance(Point2::new(0.0, 0.0), point), 5.0);
    }

    #[test]
    fn test_normalize_cross_angle() {
        assert_relative_eq!(normalize_cross_angle(0.3), 0.3);
        assert_relative_eq!(normalize_cross_angle(0.3 + FRAC_PI_2), 0.3, epsilon = 1.0e-12);
        assert_relative_eq!(normalize_cross_angle(0.3 + PI), 0.3, epsilon = 1.0e-12);
        assert_relative_eq!(normalize_cross_angle(0.3 - PI), 0.3, epsilon = 1.0e-12);
        assert!(normalize_cross_angle(-0.1) < FRAC_PI_2);
    }

    #[test]
    fn test_interpolate_cross_angle_constant() {
        let angle = interpolate_cross_angle([0.4, 0.4, 0.4], [0.2, 0.3, 0.5]);
        assert_relative_eq!(angle, 0.4, epsilon = 1.0e-12);
    }

    #[test]
    fn test_interpolate_cross_angle_periodic() {
        // 0 and PI/2 describe the same cross - mixing them must not yield
        // the naive average of PI/4.
        let angle = interpolate_cross_angle([0.0, FRAC_PI_2, 0.0], [0.5, 0.25, 0.25]);
        assert_relative_eq!(angle, 0.0, epsilon = 1.0e-12);

        let nearby = interpolate_cross_angle([0.01, FRAC_PI_2 - 0.01, 0.01], [0.4, 0.2, 0.4]);
        assert!(nearby < 0.02 || nearby > FRAC_PI_2 - 0.02);
        assert_ne!(nearby, FRAC_PI_4);
    }
}
