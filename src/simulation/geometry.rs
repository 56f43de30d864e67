//! Distances and terminal motion.
//!
//! Terminals move in straight lines and bounce off the world edges.

use crate::common::scene::{Point, Velocity};

/// Squared Euclidean distance (avoids a sqrt when only comparing).
pub fn distance2(a: &Point, b: &Point) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

pub fn distance(a: &Point, b: &Point) -> f64 {
    distance2(a, b).sqrt()
}

/// Axis-aligned world rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub top_left: Point,
    pub bottom_right: Point,
}

impl Bounds {
    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.top_left.x && p.x <= self.bottom_right.x && p.y >= self.top_left.y && p.y <= self.bottom_right.y
    }
}

// Fold a coordinate back into [lo, hi], flipping velocity once per bounce.
fn reflect(mut pos: f64, mut vel: f64, lo: f64, hi: f64) -> (f64, f64) {
    if hi <= lo {
        return (lo, 0.0);
    }
    // Bounded so a huge step cannot spin here.
    for _ in 0..64 {
        if pos < lo {
            pos = 2.0 * lo - pos;
            vel = -vel;
        } else if pos > hi {
            pos = 2.0 * hi - pos;
            vel = -vel;
        } else {
            return (pos, vel);
        }
    }
    (pos.clamp(lo, hi), vel)
}

/// Move `position` along `velocity` for `seconds`, reflecting at the bounds.
///
/// # Parameters
///
/// * `position` - Current position in meters
/// * `velocity` - Velocity in meters per second
/// * `seconds` - Time step
/// * `bounds` - World rectangle
///
/// # Returns
///
/// The new position and the (possibly reflected) velocity.
pub fn advance(position: Point, velocity: Velocity, seconds: f64, bounds: &Bounds) -> (Point, Velocity) {
    let (x, vx) = reflect(position.x + velocity.x * seconds, velocity.x, bounds.top_left.x, bounds.bottom_right.x);
    let (y, vy) = reflect(position.y + velocity.y * seconds, velocity.y, bounds.top_left.y, bounds.bottom_right.y);
    (Point { x, y }, Velocity { x: vx, y: vy })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> Bounds {
        Bounds {
            top_left: Point { x: 0.0, y: 0.0 },
            bottom_right: Point { x: 100.0, y: 50.0 },
        }
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Point { x: 0.0, y: 0.0 };
        let b = Point { x: 3.0, y: 4.0 };
        assert_eq!(distance2(&a, &b), 25.0);
        assert_eq!(distance(&a, &b), 5.0);
    }

    #[test]
    fn motion_inside_bounds_is_linear() {
        let (p, v) = advance(Point { x: 10.0, y: 10.0 }, Velocity { x: 5.0, y: -2.0 }, 2.0, &bounds());
        assert_eq!(p, Point { x: 20.0, y: 6.0 });
        assert_eq!(v, Velocity { x: 5.0, y: -2.0 });
    }

    #[test]
    fn motion_reflects_at_the_edges() {
        let (p, v) = advance(Point { x: 95.0, y: 2.0 }, Velocity { x: 10.0, y: -4.0 }, 1.0, &bounds());
        assert_eq!(p, Point { x: 95.0, y: 2.0 });
        assert_eq!(v, Velocity { x: -10.0, y: 4.0 });
        assert!(bounds().contains(&p));
    }
}
