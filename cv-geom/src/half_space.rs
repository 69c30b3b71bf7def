use crate::GeometryError;
use cv_core::nalgebra::{Point3, Unit, Vector3};
use float_ord::FloatOrd;
use log::*;
use minilp::{ComparisonOp, OptimizationDirection, Problem};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The bounding box used by the linear program is this many times larger than the
/// farthest plane anchor.
const BOUNDING_SCALE: f64 = 1e4;

/// Relative tolerance on the inscribed distance below which an intersection is empty.
const EMPTY_TOLERANCE: f64 = 1e-9;

/// The closed half-space on the side of a plane that its normal points to.
///
/// A point `p` is inside when `dot(p - point, normal) >= 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct HalfPlane {
    point: Point3<f64>,
    normal: Unit<Vector3<f64>>,
}

impl HalfPlane {
    /// Creates the half-plane through `point` that contains `point + normal`.
    pub fn new(point: Point3<f64>, normal: Vector3<f64>) -> Result<Self, GeometryError> {
        let norm = normal.norm();
        if !norm.is_finite() || norm <= f64::EPSILON || !point.coords.iter().all(|c| c.is_finite()) {
            return Err(GeometryError::DegenerateNormal);
        }
        Ok(Self {
            point,
            normal: Unit::new_unchecked(normal / norm),
        })
    }

    /// Creates the half-plane through three points.
    ///
    /// The normal is `cross(b - a, c - a)`, so the inside is the side from which `a`, `b`, `c`
    /// appear counter-clockwise.
    ///
    /// ```
    /// use cv_core::nalgebra::Point3;
    /// use cv_geom::HalfPlane;
    ///
    /// let floor = HalfPlane::from_points(
    ///     Point3::new(0.0, 0.0, 0.0),
    ///     Point3::new(1.0, 0.0, 0.0),
    ///     Point3::new(0.0, 1.0, 0.0),
    /// ).unwrap();
    /// assert!(floor.contains(Point3::new(3.0, -2.0, 1.0)));
    /// assert!(!floor.contains(Point3::new(0.0, 0.0, -1.0)));
    /// ```
    pub fn from_points(
        a: Point3<f64>,
        b: Point3<f64>,
        c: Point3<f64>,
    ) -> Result<Self, GeometryError> {
        Self::new(a, (b - a).cross(&(c - a)))
    }

    pub fn point(&self) -> Point3<f64> {
        self.point
    }

    pub fn normal(&self) -> Unit<Vector3<f64>> {
        self.normal
    }

    /// The same plane with the opposite side inside.
    #[must_use]
    pub fn flipped(self) -> Self {
        Self {
            point: self.point,
            normal: Unit::new_unchecked(-self.normal.into_inner()),
        }
    }

    /// Positive inside, negative outside, zero on the plane.
    pub fn signed_distance(&self, point: Point3<f64>) -> f64 {
        self.normal.dot(&(point - self.point))
    }

    pub fn contains(&self, point: Point3<f64>) -> bool {
        self.signed_distance(point) >= 0.0
    }
}

/// Decides whether the intersection of the half-planes contains at least one point.
///
/// An empty set of half-planes is the whole space and is non-empty. The test maximizes the
/// signed distance `s` of a point `x` to every plane, with `x` restricted to a large bounding
/// box so the program stays bounded. The intersection is non-empty when the optimal `s` is
/// not negative (up to a tolerance), which also accepts intersections that are only a shared
/// face.
///
/// ```
/// use cv_core::nalgebra::{Point3, Vector3};
/// use cv_geom::{is_non_empty, HalfPlane};
///
/// let above_zero = HalfPlane::new(Point3::origin(), Vector3::z()).unwrap();
/// let above_two = HalfPlane::new(Point3::new(0.0, 0.0, 2.0), Vector3::z()).unwrap();
/// assert_eq!(is_non_empty(&[above_zero, above_two]), Ok(true));
/// assert_eq!(is_non_empty(&[above_zero.flipped(), above_two]), Ok(false));
/// ```
pub fn is_non_empty(planes: &[HalfPlane]) -> Result<bool, GeometryError> {
    if planes.is_empty() {
        return Ok(true);
    }
    let extent = planes
        .iter()
        .flat_map(|plane| plane.point.coords.iter().copied())
        .map(|c| FloatOrd(c.abs()))
        .max()
        .map_or(0.0, |FloatOrd(c)| c);
    let bound = BOUNDING_SCALE * (1.0 + extent);

    let mut problem = Problem::new(OptimizationDirection::Maximize);
    let x = problem.add_var(0.0, (-bound, bound));
    let y = problem.add_var(0.0, (-bound, bound));
    let z = problem.add_var(0.0, (-bound, bound));
    let slack = problem.add_var(1.0, (f64::NEG_INFINITY, 1.0));
    for plane in planes {
        let n = plane.normal;
        // dot(n, p) - s >= dot(n, anchor)
        problem.add_constraint(
            &[(x, n.x), (y, n.y), (z, n.z), (slack, -1.0)],
            ComparisonOp::Ge,
            n.dot(&plane.point.coords),
        );
    }

    match problem.solve() {
        Ok(solution) => {
            let distance = solution.objective();
            if distance.is_nan() {
                warn!("half-space program returned a NaN distance");
                return Err(GeometryError::Indeterminate);
            }
            trace!("largest inscribed distance is {}", distance);
            Ok(distance >= -EMPTY_TOLERANCE * (1.0 + extent))
        }
        Err(e) => {
            warn!("half-space program failed to solve: {}", e);
            Err(GeometryError::Indeterminate)
        }
    }
}

/// Like [`is_non_empty`], but an undecidable intersection counts as empty.
pub fn intersects(planes: &[HalfPlane]) -> bool {
    is_non_empty(planes).unwrap_or_else(|e| {
        debug!("treating half-space intersection as empty: {}", e);
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor(height: f64) -> HalfPlane {
        HalfPlane::from_points(
            Point3::new(0.0, 0.0, height),
            Point3::new(1.0, 0.0, height),
            Point3::new(0.0, 1.0, height),
        )
        .unwrap()
    }

    #[test]
    fn stacked_half_spaces_overlap() {
        assert_eq!(is_non_empty(&[floor(0.0), floor(2.0)]), Ok(true));
    }

    #[test]
    fn opposite_half_spaces_with_gap_are_empty() {
        assert_eq!(is_non_empty(&[floor(0.0).flipped(), floor(2.0)]), Ok(false));
    }

    #[test]
    fn touching_half_spaces_are_non_empty() {
        assert_eq!(is_non_empty(&[floor(2.0).flipped(), floor(2.0)]), Ok(true));
    }

    #[test]
    fn no_planes_is_whole_space() {
        assert_eq!(is_non_empty(&[]), Ok(true));
        assert!(intersects(&[]));
    }

    #[test]
    fn slab_is_non_empty() {
        assert_eq!(is_non_empty(&[floor(0.0), floor(2.0).flipped()]), Ok(true));
    }

    #[test]
    fn colinear_points_are_degenerate() {
        let result = HalfPlane::from_points(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        );
        assert_eq!(result, Err(GeometryError::DegenerateNormal));
    }
}
