//! Handler seam for decoded result frames.
//!
//! The director routes every frame it decodes to the handler registered
//! for the frame's operator. Handlers receive frames already validated
//! against their schema; the typed views here are for pulling the payload
//! apart without repeating field indices at every call site.

use glam::{Quat, Vec3};
use protocol::frame::report;
use protocol::{Frame, Operator, ProtocolError, ProtocolResult};

/// Consumer of decoded frames for one operator.
pub trait FrameHandler: Send {
    fn handle(&mut self, frame: &Frame);
}

/// Blanket impl so closures can be registered directly.
impl<F: FnMut(&Frame) + Send> FrameHandler for F {
    fn handle(&mut self, frame: &Frame) {
        self(frame)
    }
}

/// Decoded body pose report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyPose {
    pub index: u32,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl BodyPose {
    /// # Errors
    /// [`ProtocolError::SchemaMismatch`] when the frame is not a body
    /// pose report.
    pub fn decode(frame: &Frame) -> ProtocolResult<Self> {
        if frame.operator != Operator::Report || frame.command != report::BODY_POSE {
            return Err(ProtocolError::SchemaMismatch("not a body pose report"));
        }
        Ok(Self {
            index: frame.u32_at(0)?,
            position: frame.vec3_at(1)?,
            rotation: frame.quat_at(2)?,
            linear_velocity: frame.vec3_at(3)?,
            angular_velocity: frame.vec3_at(4)?,
        })
    }
}

/// Decoded raycast reply. `hit` is `None` for a miss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastReply {
    pub ray: u32,
    pub hit: Option<RaycastHit>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    pub position: Vec3,
    pub normal: Vec3,
    pub body: u32,
}

impl RaycastReply {
    /// # Errors
    /// [`ProtocolError::SchemaMismatch`] when the frame is not a raycast
    /// reply.
    pub fn decode(frame: &Frame) -> ProtocolResult<Self> {
        if frame.operator != Operator::Report || frame.command != report::RAYCAST_HIT {
            return Err(ProtocolError::SchemaMismatch("not a raycast reply"));
        }
        let ray = frame.u32_at(0)?;
        let hit = if frame.bool_at(1)? {
            Some(RaycastHit {
                position: frame.vec3_at(2)?,
                normal: frame.vec3_at(3)?,
                body: frame.u32_at(4)?,
            })
        } else {
            None
        };
        Ok(Self { ray, hit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_pose_decode() {
        let frame = Frame::new(Operator::Report, report::BODY_POSE)
            .push(4u32)
            .push(Vec3::new(1.0, 2.0, 3.0))
            .push(Quat::IDENTITY)
            .push(Vec3::X)
            .push(Vec3::ZERO);
        let pose = BodyPose::decode(&frame).unwrap();
        assert_eq!(pose.index, 4);
        assert_eq!(pose.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(pose.linear_velocity, Vec3::X);
    }

    #[test]
    fn test_raycast_miss_decode() {
        let frame = Frame::new(Operator::Report, report::RAYCAST_HIT)
            .push(9u32)
            .push(false)
            .push_opt(None::<Vec3>)
            .push_opt(None::<Vec3>)
            .push_opt(None::<u32>);
        let reply = RaycastReply::decode(&frame).unwrap();
        assert_eq!(reply.ray, 9);
        assert!(reply.hit.is_none());
    }

    #[test]
    fn test_wrong_command_rejected() {
        let frame = Frame::new(Operator::Report, report::FATAL);
        assert!(BodyPose::decode(&frame).is_err());
    }
}
