//! Planar geometry helpers
//!
//! Sketch geometry is stored as `DVec3` but every query works in the XY plane.
//! Angles are radians, measured counter-clockwise from +X.

mod spline;

pub use spline::sample_clamped_bspline;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Coordinate axis of a key point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// All axes in storage order
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index into an `[T; 3]` per-axis array
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    /// Lower-case axis name
    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    /// Read this axis from a vector
    pub fn get(self, v: DVec3) -> f64 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
            Axis::Z => v.z,
        }
    }

    /// Write this axis of a vector
    pub fn set(self, v: &mut DVec3, value: f64) {
        match self {
            Axis::X => v.x = value,
            Axis::Y => v.y = value,
            Axis::Z => v.z = value,
        }
    }
}

/// Direction angle from `from` to `to`
pub fn angle2d(from: DVec3, to: DVec3) -> f64 {
    let diff = to - from;
    diff.y.atan2(diff.x)
}

/// Wrap an angle into `[0, 2π)`
pub fn wrap_positive(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU { 0.0 } else { wrapped }
}

/// Fold an angle in `[0, 2π)` onto `[0, π]`
pub fn fold_to_pi(angle: f64) -> f64 {
    if angle > PI { TAU - angle } else { angle }
}

/// Counter-clockwise angle at `center` from the direction of `a` to the direction of `b`,
/// wrapped into `[0, 2π)`.
pub fn angle_between(center: DVec3, a: DVec3, b: DVec3) -> f64 {
    wrap_positive(angle_between_untouched(center, a, b))
}

/// Raw difference of the two direction angles, not wrapped
pub fn angle_between_untouched(center: DVec3, a: DVec3, b: DVec3) -> f64 {
    angle2d(center, b) - angle2d(center, a)
}

/// Unsigned angle at `center` between `a` and `b`, in `[0, π]`
pub fn angle_between_positive_minimized(center: DVec3, a: DVec3, b: DVec3) -> f64 {
    fold_to_pi(angle_between(center, a, b))
}

/// Point at `radius` from `center` in direction `angle`
pub fn polar(center: DVec3, radius: f64, angle: f64) -> DVec3 {
    center + DVec3::new(angle.cos() * radius, angle.sin() * radius, 0.0)
}

/// Positive sweep from `start` to `end`, adding a full turn when `end < start`
pub fn arc_span(start: f64, end: f64) -> f64 {
    let diff = end - start;
    if diff < 0.0 { diff + TAU } else { diff }
}

/// Distance from `point` to the segment `a`-`b`.
///
/// Uses the perpendicular distance when the point projects inside the segment
/// (both corner angles below a right angle), otherwise the nearer endpoint.
pub fn segment_distance(a: DVec3, b: DVec3, point: DVec3) -> f64 {
    let alpha1 = fold_to_pi(angle_between(a, b, point));
    let alpha2 = fold_to_pi(angle_between(b, a, point));
    if alpha1 < PI / 2.0 && alpha2 < PI / 2.0 {
        a.distance(point) * alpha1.sin()
    } else {
        a.distance(point).min(b.distance(point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_angle2d() {
        let origin = DVec3::ZERO;
        assert_relative_eq!(angle2d(origin, DVec3::new(1.0, 0.0, 0.0)), 0.0);
        assert_relative_eq!(angle2d(origin, DVec3::new(0.0, 1.0, 0.0)), PI / 2.0);
        assert_relative_eq!(angle2d(origin, DVec3::new(-1.0, 0.0, 0.0)), PI);
    }

    #[test]
    fn test_angle_between_wraps() {
        let c = DVec3::ZERO;
        let east = DVec3::new(1.0, 0.0, 0.0);
        let north = DVec3::new(0.0, 1.0, 0.0);
        let south = DVec3::new(0.0, -1.0, 0.0);

        assert_relative_eq!(angle_between(c, east, north), PI / 2.0);
        assert_relative_eq!(angle_between(c, east, south), 3.0 * PI / 2.0);
        assert_relative_eq!(angle_between_untouched(c, east, south), -PI / 2.0);
        assert_relative_eq!(angle_between_positive_minimized(c, east, south), PI / 2.0);
    }

    #[test]
    fn test_segment_distance() {
        let a = DVec3::new(0.0, 0.0, 0.0);
        let b = DVec3::new(10.0, 0.0, 0.0);

        assert_relative_eq!(segment_distance(a, b, DVec3::new(5.0, 2.0, 0.0)), 2.0, epsilon = 1e-12);
        // Beyond the end the nearer endpoint wins
        assert_relative_eq!(segment_distance(a, b, DVec3::new(13.0, 4.0, 0.0)), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_arc_span() {
        assert_relative_eq!(arc_span(0.0, PI), PI);
        assert_relative_eq!(arc_span(PI, 0.0), PI);
        assert_relative_eq!(arc_span(3.0 * PI / 2.0, PI / 2.0), PI);
    }

    #[test]
    fn test_axis_accessors() {
        let mut v = DVec3::new(1.0, 2.0, 3.0);
        Axis::Y.set(&mut v, 5.0);
        assert_eq!(Axis::Y.get(v), 5.0);
        assert_eq!(Axis::Z.index(), 2);
        assert_eq!(Axis::X.name(), "x");
    }
}
