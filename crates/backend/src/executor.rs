//! Translation of decoded command frames into engine calls.
//!
//! One frame in, one outcome out. Stale references (the addressed body no
//! longer exists) are reported as [`ExecuteOutcome::Stale`] so the caller
//! can skip the command and keep decoding; real engine failures abort the
//! remaining commands of the message.

use bytes::Bytes;
use glam::Vec3;
use protocol::frame::{character, cleanup, creation, modification, query, report};
use protocol::{CommandBuffer, Frame, Operator, ProtocolError};

use crate::engine::{BodyDesc, BodyKind, EngineError, PhysicsEngine};

#[derive(Debug, PartialEq)]
pub(crate) enum ExecuteOutcome {
    Done,
    /// The addressed body no longer exists; command skipped.
    Stale,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExecuteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn stale(found: bool) -> Result<ExecuteOutcome, ExecuteError> {
    if found {
        Ok(ExecuteOutcome::Done)
    } else {
        Ok(ExecuteOutcome::Stale)
    }
}

/// Executes one decoded frame against the engine. Query results are
/// written straight into the outgoing buffer.
pub(crate) fn execute_frame(
    engine: &mut dyn PhysicsEngine,
    frame: &Frame,
    mesh_buffers: &[Bytes],
    outgoing: &mut CommandBuffer,
) -> Result<ExecuteOutcome, ExecuteError> {
    match (frame.operator, frame.command) {
        (Operator::Creation, creation::CREATE_BODY) => {
            let kind = BodyKind::from_u8(frame.u8_at(1)?)
                .ok_or(ProtocolError::SchemaMismatch("unknown body kind"))?;
            let mesh = frame
                .opt_u16_at(6)?
                .and_then(|i| mesh_buffers.get(i as usize).cloned());
            engine.create_body(BodyDesc {
                index: frame.u32_at(0)?,
                kind,
                position: frame.vec3_at(2)?,
                rotation: frame.quat_at(3)?,
                mass: frame.opt_f32_at(4)?.unwrap_or(1.0),
                linear_velocity: frame.opt_vec3_at(5)?.unwrap_or(Vec3::ZERO),
                mesh,
            })?;
            Ok(ExecuteOutcome::Done)
        }
        (Operator::Modification, modification::SET_TRANSFORM) => stale(engine.set_transform(
            frame.u32_at(0)?,
            frame.opt_vec3_at(1)?,
            frame.opt_quat_at(2)?,
        )),
        (Operator::Modification, modification::SET_LINEAR_VELOCITY) => {
            stale(engine.set_linear_velocity(frame.u32_at(0)?, frame.vec3_at(1)?))
        }
        (Operator::Modification, modification::SET_ANGULAR_VELOCITY) => {
            stale(engine.set_angular_velocity(frame.u32_at(0)?, frame.vec3_at(1)?))
        }
        (Operator::Modification, modification::APPLY_IMPULSE) => stale(engine.apply_impulse(
            frame.u32_at(0)?,
            frame.vec3_at(1)?,
            frame.opt_vec3_at(2)?,
        )),
        (Operator::Modification, modification::SET_GRAVITY) => {
            engine.set_gravity(frame.vec3_at(0)?);
            Ok(ExecuteOutcome::Done)
        }
        (Operator::Query, query::RAYCAST) => {
            let ray_id = frame.u32_at(0)?;
            let hit = engine.raycast(frame.vec3_at(1)?, frame.vec3_at(2)?);
            let response = Frame::new(Operator::Report, report::RAYCAST_HIT)
                .push(ray_id)
                .push(hit.is_some())
                .push_opt(hit.map(|h| h.position))
                .push_opt(hit.map(|h| h.normal))
                .push_opt(hit.map(|h| h.body));
            outgoing.write_frame(&response)?;
            Ok(ExecuteOutcome::Done)
        }
        (Operator::Cleanup, cleanup::DESTROY_BODY) => stale(engine.destroy_body(frame.u32_at(0)?)),
        (Operator::Cleanup, cleanup::DESTROY_ALL) => {
            engine.destroy_all();
            Ok(ExecuteOutcome::Done)
        }
        (Operator::Character, character::UPDATE_CONTROLLER) => {
            stale(engine.update_controller(frame.u32_at(0)?, frame.vec3_at(1)?))
        }
        // Result frames flow backend -> director only.
        (Operator::Report, _) => Err(ProtocolError::SchemaMismatch(
            "report frames are not executable commands",
        )
        .into()),
        (operator, command) => Err(ProtocolError::UnknownCommand { operator, command }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PointMassEngine;
    use glam::Quat;

    fn create_frame(index: u32) -> Frame {
        Frame::new(Operator::Creation, creation::CREATE_BODY)
            .push(index)
            .push(0u8)
            .push(Vec3::ZERO)
            .push(Quat::IDENTITY)
            .push_opt(Some(1.0f32))
            .push_opt(None::<Vec3>)
            .push_opt(None::<u16>)
    }

    #[test]
    fn test_stale_modification_is_skipped_not_fatal() {
        let mut engine = PointMassEngine::new();
        let mut out = CommandBuffer::new(64, true);
        let frame = Frame::new(Operator::Modification, modification::SET_LINEAR_VELOCITY)
            .push(99u32)
            .push(Vec3::X);
        let outcome = execute_frame(&mut engine, &frame, &[], &mut out).unwrap();
        assert_eq!(outcome, ExecuteOutcome::Stale);
    }

    #[test]
    fn test_duplicate_create_is_engine_error() {
        let mut engine = PointMassEngine::new();
        let mut out = CommandBuffer::new(64, true);
        execute_frame(&mut engine, &create_frame(1), &[], &mut out).unwrap();
        let err = execute_frame(&mut engine, &create_frame(1), &[], &mut out).unwrap_err();
        assert!(matches!(err, ExecuteError::Engine(EngineError::DuplicateBody(1))));
    }

    #[test]
    fn test_raycast_miss_writes_hit_frame_with_flag_clear() {
        let mut engine = PointMassEngine::new();
        let mut out = CommandBuffer::new(128, true);
        let frame = Frame::new(Operator::Query, query::RAYCAST)
            .push(5u32)
            .push(Vec3::ZERO)
            .push(Vec3::X);
        execute_frame(&mut engine, &frame, &[], &mut out).unwrap();

        let reply = out.read_frame().unwrap();
        assert_eq!(reply.command, report::RAYCAST_HIT);
        assert_eq!(reply.u32_at(0).unwrap(), 5);
        assert!(!reply.bool_at(1).unwrap());
        assert!(!reply.is_present(2));
    }

    #[test]
    fn test_mesh_reference_resolved_from_side_buffers() {
        let mut engine = PointMassEngine::new();
        let mut out = CommandBuffer::new(64, true);
        let meshes = vec![Bytes::from_static(b"triangles")];
        let frame = Frame::new(Operator::Creation, creation::CREATE_BODY)
            .push(2u32)
            .push(1u8)
            .push(Vec3::ZERO)
            .push(Quat::IDENTITY)
            .push_opt(None::<f32>)
            .push_opt(None::<Vec3>)
            .push_opt(Some(0u16));
        execute_frame(&mut engine, &frame, &meshes, &mut out).unwrap();
        assert_eq!(engine.body_count(), 1);
    }
}
