//! Per-tick behavior stepping
//!
//! `step` is a pure function of the entity, the elapsed simulated time and
//! the shared reference point. The store calls it for every entity while
//! holding its lock, so one tick observes a consistent frame.

use super::entity::{Behavior, Entity, Point};

/// Remaining distance below which a follow-lag entity snaps onto the
/// reference point.
pub const FOLLOW_SNAP_DISTANCE: f64 = 0.5;

/// Advance `entity` by `dt` seconds towards the reference point `reference`.
pub fn step(entity: &mut Entity, dt: f64, reference: Point) {
    let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
    match &mut entity.behavior {
        Behavior::Mirror { offset_x, offset_y } => {
            entity.position = reference.offset(*offset_x, *offset_y);
        }
        Behavior::Static { target } => {
            entity.position = *target;
        }
        Behavior::Orbit {
            radius,
            speed,
            angle,
        } => {
            *angle += *speed * dt;
            entity.position = reference.offset(angle.cos() * *radius, angle.sin() * *radius);
        }
        Behavior::FollowLag {
            lag_ms,
            initialized,
        } => {
            if !*initialized {
                entity.position = reference;
                *initialized = true;
                return;
            }
            let alpha = follow_alpha(dt, *lag_ms);
            let pos = &mut entity.position;
            pos.x += (reference.x - pos.x) * alpha;
            pos.y += (reference.y - pos.y) * alpha;
            if pos.distance(reference) < FOLLOW_SNAP_DISTANCE {
                *pos = reference;
            }
        }
        Behavior::Scripted { .. } => {}
    }
}

/// Fraction of the remaining distance covered in one tick.
pub fn follow_alpha(dt: f64, lag_ms: f64) -> f64 {
    (dt * 1000.0 / lag_ms.max(1.0)).clamp(0.0, 1.0)
}
