//! Per-body pose interpolation between fixed steps.
//!
//! Physics advances in fixed increments while rendering samples at an
//! arbitrary rate; blending the last two simulated poses by
//! `alpha = carry_time / fixed_step` hides the mismatch. The pair only
//! advances when a physics step actually occurred; interpolation itself is
//! recomputed every tick.

use glam::{Quat, Vec3};

/// Rotation angles closer than this are blended linearly; the slerp
/// weights degenerate as `sin(theta)` approaches zero.
const SLERP_EPSILON: f32 = 1e-4;

/// Interpolation state for one simulated body.
#[derive(Debug, Clone, Copy)]
pub struct MotionState {
    pub current_position: Vec3,
    pub old_position: Vec3,
    pub current_rotation: Quat,
    pub old_rotation: Quat,
    pub interpolated_position: Vec3,
    pub interpolated_rotation: Quat,
}

impl MotionState {
    /// Creates a state with both snapshots at the given pose, so the
    /// first interpolated sample equals the spawn pose.
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self {
            current_position: position,
            old_position: position,
            current_rotation: rotation,
            old_rotation: rotation,
            interpolated_position: position,
            interpolated_rotation: rotation,
        }
    }

    /// Shifts the snapshot pair forward after a physics step:
    /// `old <- current`, `current <- fresh`.
    pub fn advance(&mut self, position: Vec3, rotation: Quat) {
        self.old_position = self.current_position;
        self.old_rotation = self.current_rotation;
        self.current_position = position;
        self.current_rotation = rotation;
    }

    /// Recomputes the interpolated pose at `alpha` in `[0, 1]` and
    /// returns it.
    pub fn interpolate(&mut self, alpha: f32) -> (Vec3, Quat) {
        let alpha = alpha.clamp(0.0, 1.0);
        self.interpolated_position = self.old_position.lerp(self.current_position, alpha);
        self.interpolated_rotation =
            slerp_shortest(self.old_rotation, self.current_rotation, alpha);
        (self.interpolated_position, self.interpolated_rotation)
    }
}

/// Shortest-path spherical interpolation from `from` to `to`.
///
/// A quaternion and its negation encode the same rotation; when their dot
/// product is negative the naive blend travels the long way around, so
/// `to` is sign-flipped first. The result is always renormalized, falling
/// back to the identity rotation on pathological cancellation instead of
/// producing NaNs.
pub fn slerp_shortest(from: Quat, to: Quat, alpha: f32) -> Quat {
    let mut dot = from.dot(to);
    let mut to = to;
    if dot < 0.0 {
        to = -to;
        dot = -dot;
    }
    let theta = dot.clamp(-1.0, 1.0).acos();
    let blended = if theta > SLERP_EPSILON {
        let sin_theta = theta.sin();
        let w_from = ((1.0 - alpha) * theta).sin() / sin_theta;
        let w_to = (alpha * theta).sin() / sin_theta;
        from * w_from + to * w_to
    } else {
        // Near-identical rotations: linear blend is exact enough.
        from * (1.0 - alpha) + to * alpha
    };
    let length = blended.length();
    if length <= f32::EPSILON {
        Quat::IDENTITY
    } else {
        blended / length
    }
}
