//! Physics-engine port.
//!
//! The backend consumes the engine as an opaque collaborator through this
//! trait: create/step/query/destroy primitives, nothing more. Methods that
//! address a body return `false` when the index no longer exists, which
//! the executor treats as a stale reference (skipped, non-fatal); methods
//! that can genuinely fail return [`EngineError`].
//!
//! [`PointMassEngine`] is the built-in implementation: semi-implicit Euler
//! gravity integration over point masses. It exists so the bridge is
//! testable end to end; it is deliberately not a rigid-body solver.

use std::collections::BTreeMap;

use bytes::Bytes;
use glam::{Quat, Vec3};

/// Errors surfaced by an engine implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("body index {0} already exists")]
    DuplicateBody(u32),

    #[error("invalid body parameters: {0}")]
    InvalidParameters(&'static str),

    #[error("engine step failed: {0}")]
    StepFailed(&'static str),
}

pub use protocol::BodyKind;

/// Creation parameters for one body, keyed by the caller's stable index.
#[derive(Debug, Clone)]
pub struct BodyDesc {
    pub index: u32,
    pub kind: BodyKind,
    pub position: Vec3,
    pub rotation: Quat,
    pub mass: f32,
    pub linear_velocity: Vec3,
    /// Optional collision geometry payload; engines may ignore it.
    pub mesh: Option<Bytes>,
}

/// Last-stepped state of one body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

/// Result of a segment raycast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub position: Vec3,
    pub normal: Vec3,
    pub body: u32,
}

/// The simulation backend's view of a physics engine.
pub trait PhysicsEngine: Send {
    /// # Errors
    /// [`EngineError::DuplicateBody`] when the index is taken and
    /// [`EngineError::InvalidParameters`] for unusable descriptors.
    fn create_body(&mut self, desc: BodyDesc) -> Result<(), EngineError>;

    /// Returns false when the body no longer exists.
    fn destroy_body(&mut self, index: u32) -> bool;

    fn destroy_all(&mut self);

    fn body_state(&self, index: u32) -> Option<BodyState>;

    fn set_transform(&mut self, index: u32, position: Option<Vec3>, rotation: Option<Quat>)
        -> bool;

    fn set_linear_velocity(&mut self, index: u32, velocity: Vec3) -> bool;

    fn set_angular_velocity(&mut self, index: u32, velocity: Vec3) -> bool;

    fn apply_impulse(&mut self, index: u32, impulse: Vec3, point: Option<Vec3>) -> bool;

    fn set_gravity(&mut self, gravity: Vec3);

    /// Queues a displacement for a kinematic character controller,
    /// consumed by the next fixed step.
    fn update_controller(&mut self, index: u32, displacement: Vec3) -> bool;

    fn set_contact_override(&mut self, enabled: bool);

    /// Advances the world by `dt` seconds using the configured number of
    /// solver sub-steps.
    ///
    /// # Errors
    /// [`EngineError::StepFailed`] when the world cannot be advanced;
    /// the backend treats this as fatal.
    fn step(&mut self, dt: f32, sub_steps: u32) -> Result<(), EngineError>;

    /// Closest hit along the segment `from..to`, if any.
    fn raycast(&self, from: Vec3, to: Vec3) -> Option<RayHit>;

    /// Indices of all non-static bodies, in stable order.
    fn active_indices(&self) -> Vec<u32>;
}

/// Collision radius used when raycasting against point masses.
const POINT_BODY_RADIUS: f32 = 0.5;

#[derive(Debug)]
struct PointBody {
    kind: BodyKind,
    mass: f32,
    state: BodyState,
    /// Pending controller displacement, consumed by the next step.
    pending_displacement: Vec3,
}

/// Built-in gravity integrator over point masses.
///
/// Dynamic bodies accelerate under gravity and integrate velocity;
/// kinematic bodies follow their velocity and queued controller
/// displacements; static bodies never move.
pub struct PointMassEngine {
    bodies: BTreeMap<u32, PointBody>,
    gravity: Vec3,
    contact_override: bool,
}

impl PointMassEngine {
    pub fn new() -> Self {
        Self {
            bodies: BTreeMap::new(),
            gravity: Vec3::new(0.0, -9.81, 0.0),
            contact_override: false,
        }
    }

    pub fn contact_override(&self) -> bool {
        self.contact_override
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }
}

impl Default for PointMassEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsEngine for PointMassEngine {
    fn create_body(&mut self, desc: BodyDesc) -> Result<(), EngineError> {
        if self.bodies.contains_key(&desc.index) {
            return Err(EngineError::DuplicateBody(desc.index));
        }
        if desc.kind == BodyKind::Dynamic && (desc.mass <= 0.0 || !desc.mass.is_finite()) {
            return Err(EngineError::InvalidParameters(
                "dynamic body mass must be positive and finite",
            ));
        }
        if !desc.position.is_finite() || !desc.rotation.is_finite() {
            return Err(EngineError::InvalidParameters("non-finite spawn pose"));
        }
        self.bodies.insert(
            desc.index,
            PointBody {
                kind: desc.kind,
                mass: desc.mass,
                state: BodyState {
                    position: desc.position,
                    rotation: desc.rotation.normalize(),
                    linear_velocity: desc.linear_velocity,
                    angular_velocity: Vec3::ZERO,
                },
                pending_displacement: Vec3::ZERO,
            },
        );
        Ok(())
    }

    fn destroy_body(&mut self, index: u32) -> bool {
        self.bodies.remove(&index).is_some()
    }

    fn destroy_all(&mut self) {
        self.bodies.clear();
    }

    fn body_state(&self, index: u32) -> Option<BodyState> {
        self.bodies.get(&index).map(|b| b.state)
    }

    fn set_transform(
        &mut self,
        index: u32,
        position: Option<Vec3>,
        rotation: Option<Quat>,
    ) -> bool {
        let Some(body) = self.bodies.get_mut(&index) else {
            return false;
        };
        if let Some(position) = position {
            body.state.position = position;
        }
        if let Some(rotation) = rotation {
            body.state.rotation = rotation.normalize();
        }
        true
    }

    fn set_linear_velocity(&mut self, index: u32, velocity: Vec3) -> bool {
        let Some(body) = self.bodies.get_mut(&index) else {
            return false;
        };
        body.state.linear_velocity = velocity;
        true
    }

    fn set_angular_velocity(&mut self, index: u32, velocity: Vec3) -> bool {
        let Some(body) = self.bodies.get_mut(&index) else {
            return false;
        };
        body.state.angular_velocity = velocity;
        true
    }

    fn apply_impulse(&mut self, index: u32, impulse: Vec3, point: Option<Vec3>) -> bool {
        let Some(body) = self.bodies.get_mut(&index) else {
            return false;
        };
        if body.kind == BodyKind::Dynamic {
            body.state.linear_velocity += impulse / body.mass;
            // Point masses carry no inertia tensor; an off-center point
            // only matters to engines with rotational dynamics.
            let _ = point;
        }
        true
    }

    fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = gravity;
    }

    fn update_controller(&mut self, index: u32, displacement: Vec3) -> bool {
        let Some(body) = self.bodies.get_mut(&index) else {
            return false;
        };
        if body.kind != BodyKind::Kinematic {
            return false;
        }
        body.pending_displacement += displacement;
        true
    }

    fn set_contact_override(&mut self, enabled: bool) {
        self.contact_override = enabled;
    }

    fn step(&mut self, dt: f32, sub_steps: u32) -> Result<(), EngineError> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(EngineError::StepFailed("non-positive step delta"));
        }
        let sub_steps = sub_steps.max(1);
        let h = dt / sub_steps as f32;
        for body in self.bodies.values_mut() {
            match body.kind {
                BodyKind::Dynamic => {
                    for _ in 0..sub_steps {
                        body.state.linear_velocity += self.gravity * h;
                        body.state.position += body.state.linear_velocity * h;
                    }
                }
                BodyKind::Kinematic => {
                    body.state.position += body.state.linear_velocity * dt;
                    body.state.position += body.pending_displacement;
                    body.pending_displacement = Vec3::ZERO;
                }
                BodyKind::Static => {}
            }
        }
        Ok(())
    }

    fn raycast(&self, from: Vec3, to: Vec3) -> Option<RayHit> {
        let dir = to - from;
        let len_sq = dir.length_squared();
        if len_sq <= f32::EPSILON {
            return None;
        }
        let mut best: Option<(f32, RayHit)> = None;
        for (&index, body) in &self.bodies {
            let center = body.state.position;
            // Closest point on the segment to the body center.
            let t = ((center - from).dot(dir) / len_sq).clamp(0.0, 1.0);
            let closest = from + dir * t;
            let offset = closest - center;
            if offset.length_squared() > POINT_BODY_RADIUS * POINT_BODY_RADIUS {
                continue;
            }
            let normal = if offset.length_squared() > f32::EPSILON {
                offset.normalize()
            } else {
                -dir.normalize()
            };
            let hit = RayHit {
                position: closest,
                normal,
                body: index,
            };
            if best.as_ref().map_or(true, |(bt, _)| t < *bt) {
                best = Some((t, hit));
            }
        }
        best.map(|(_, hit)| hit)
    }

    fn active_indices(&self) -> Vec<u32> {
        self.bodies
            .iter()
            .filter(|(_, b)| b.kind != BodyKind::Static)
            .map(|(&i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic_body(index: u32, position: Vec3) -> BodyDesc {
        BodyDesc {
            index,
            kind: BodyKind::Dynamic,
            position,
            rotation: Quat::IDENTITY,
            mass: 1.0,
            linear_velocity: Vec3::ZERO,
            mesh: None,
        }
    }

    #[test]
    fn test_gravity_integration() {
        let mut engine = PointMassEngine::new();
        engine
            .create_body(dynamic_body(0, Vec3::new(0.0, 10.0, 0.0)))
            .unwrap();
        for _ in 0..30 {
            engine.step(1.0 / 30.0, 1).unwrap();
        }
        let state = engine.body_state(0).unwrap();
        assert!(state.position.y < 10.0);
        assert!(state.linear_velocity.y < 0.0);
        assert!((state.linear_velocity.y + 9.81).abs() < 0.05);
    }

    #[test]
    fn test_static_bodies_never_move() {
        let mut engine = PointMassEngine::new();
        engine
            .create_body(BodyDesc {
                kind: BodyKind::Static,
                ..dynamic_body(1, Vec3::Y)
            })
            .unwrap();
        engine.step(1.0, 4).unwrap();
        assert_eq!(engine.body_state(1).unwrap().position, Vec3::Y);
        assert!(engine.active_indices().is_empty());
    }

    #[test]
    fn test_controller_displacement_consumed_once() {
        let mut engine = PointMassEngine::new();
        engine
            .create_body(BodyDesc {
                kind: BodyKind::Kinematic,
                ..dynamic_body(2, Vec3::ZERO)
            })
            .unwrap();
        assert!(engine.update_controller(2, Vec3::X));
        engine.step(0.016, 1).unwrap();
        let after_first = engine.body_state(2).unwrap().position;
        assert!(after_first.abs_diff_eq(Vec3::X, 1e-6));
        engine.step(0.016, 1).unwrap();
        assert!(engine.body_state(2).unwrap().position.abs_diff_eq(after_first, 1e-6));
    }

    #[test]
    fn test_invalid_mass_rejected() {
        let mut engine = PointMassEngine::new();
        let err = engine
            .create_body(BodyDesc {
                mass: 0.0,
                ..dynamic_body(3, Vec3::ZERO)
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameters(_)));
    }

    #[test]
    fn test_raycast_hits_nearest_body() {
        let mut engine = PointMassEngine::new();
        engine.create_body(dynamic_body(0, Vec3::new(0.0, 0.0, 5.0))).unwrap();
        engine.create_body(dynamic_body(1, Vec3::new(0.0, 0.0, 2.0))).unwrap();
        let hit = engine
            .raycast(Vec3::ZERO, Vec3::new(0.0, 0.0, 10.0))
            .unwrap();
        assert_eq!(hit.body, 1);
        assert!(engine.raycast(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0)).is_none());
    }
}
