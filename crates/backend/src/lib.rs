//! Simulation backend: the far side of the bridge.
//!
//! Runs wherever the dispatcher executes code (the caller's context or a
//! worker thread) and owns the incoming command buffer, the physics
//! engine, the fixed-step accumulator and the per-body motion states.
//! Each tick flows receive -> execute -> step -> write results -> respond;
//! a tick with no commands buffer ever received short-circuits straight to
//! an empty response.
//!
//! Failure policy: an engine error while executing queued commands aborts
//! the remaining commands of that message but keeps the backend alive; an
//! error while stepping or writing results trips the fatal flag, after
//! which every round trip is still answered (the caller must never hang)
//! but no simulation happens again.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use protocol::frame::{cleanup, report};
use protocol::{
    BridgeSettings, CommandBuffer, Envelope, Frame, MessageKind, Operator, ProtocolError,
};
use tracing::{debug, error, warn};
use transport::BackendHost;

/// Fixed-timestep accumulator with catch-up clamping.
pub mod accumulator;
/// Physics-engine port and the built-in point-mass engine.
pub mod engine;
/// Per-body pose interpolation between fixed steps.
pub mod motion_state;

mod executor;

pub use accumulator::StepAccumulator;
pub use engine::{BodyDesc, BodyKind, BodyState, EngineError, PhysicsEngine, PointMassEngine, RayHit};
pub use motion_state::MotionState;

use executor::{ExecuteError, ExecuteOutcome};

/// Per-tick callback invoked after every fixed step with the step size.
pub type StepCallback = Box<dyn FnMut(f32) + Send>;

enum TickMode {
    /// Derive elapsed time from the backend's own wall clock.
    Wall,
    /// Advance exactly the requested number of fixed steps.
    Manual(u32),
}

/// The far side of the bridge: executes commands, steps physics, reports
/// poses.
pub struct SimulationBackend {
    settings: BridgeSettings,
    engine: Box<dyn PhysicsEngine>,
    incoming: CommandBuffer,
    outgoing: CommandBuffer,
    accumulator: StepAccumulator,
    motion_states: HashMap<u32, MotionState>,
    mesh_buffers: Vec<Bytes>,
    on_step: Option<StepCallback>,
    last_tick: Option<Instant>,
    /// No commands buffer has ever arrived; nothing to simulate yet.
    received_any: bool,
    /// The incoming payload this tick was a transfer whose storage must
    /// go home with the response.
    adopted_transfer: bool,
    fatal: bool,
    fatal_reported: bool,
    stale_skips: u64,
}

impl SimulationBackend {
    pub fn new(settings: BridgeSettings, engine: Box<dyn PhysicsEngine>) -> Self {
        let incoming = CommandBuffer::new(
            settings.commands_buffer_size,
            settings.allow_commands_buffer_resize,
        );
        let outgoing = CommandBuffer::new(
            settings.commands_buffer_size,
            settings.allow_commands_buffer_resize,
        );
        let accumulator = StepAccumulator::new(settings.fixed_step, settings.max_skipped_steps);
        Self {
            settings,
            engine,
            incoming,
            outgoing,
            accumulator,
            motion_states: HashMap::new(),
            mesh_buffers: Vec::new(),
            on_step: None,
            last_tick: None,
            received_any: false,
            adopted_transfer: false,
            fatal: false,
            fatal_reported: false,
            stale_skips: 0,
        }
    }

    /// Registers a callback run after every fixed step.
    pub fn set_step_callback(&mut self, callback: impl FnMut(f32) + Send + 'static) {
        self.on_step = Some(Box::new(callback));
    }

    /// The backend is dead and will not simulate again.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Commands skipped because their target no longer existed.
    pub fn stale_skips(&self) -> u64 {
        self.stale_skips
    }

    fn process(&mut self, envelope: Envelope) -> Envelope {
        match envelope.kind {
            MessageKind::CreateBackend => self.on_create(envelope),
            MessageKind::Step => self.tick(envelope, TickMode::Wall),
            MessageKind::ManualStep => {
                let steps = envelope.steps;
                self.tick(envelope, TickMode::Manual(steps))
            }
            MessageKind::Interpolate => self.on_interpolate(envelope),
            MessageKind::OverrideContacts => {
                if let Some(enabled) = envelope.contacts_override {
                    self.engine.set_contact_override(enabled);
                }
                Envelope::response(MessageKind::OverrideContacts, 0)
            }
            MessageKind::Destroy => self.on_destroy(),
        }
    }

    fn on_create(&mut self, envelope: Envelope) -> Envelope {
        if let Some(settings) = envelope.settings {
            self.incoming = CommandBuffer::new(
                settings.commands_buffer_size,
                settings.allow_commands_buffer_resize,
            );
            self.outgoing = CommandBuffer::new(
                settings.commands_buffer_size,
                settings.allow_commands_buffer_resize,
            );
            self.accumulator =
                StepAccumulator::new(settings.fixed_step, settings.max_skipped_steps);
            self.settings = settings;
        }
        if let Some(pair) = envelope.shared_buffers {
            self.incoming = CommandBuffer::with_shared(
                pair.to_backend,
                self.settings.allow_commands_buffer_resize,
            );
            self.outgoing = CommandBuffer::with_shared(
                pair.to_manager,
                self.settings.allow_commands_buffer_resize,
            );
        }
        debug!(settings = ?self.settings, "backend created");
        Envelope::response(MessageKind::CreateBackend, 0)
    }

    fn on_destroy(&mut self) -> Envelope {
        self.engine.destroy_all();
        self.motion_states.clear();
        self.mesh_buffers.clear();
        self.received_any = false;
        debug!("backend destroyed");
        Envelope::response(MessageKind::Destroy, 0)
    }

    fn on_interpolate(&mut self, mut envelope: Envelope) -> Envelope {
        self.outgoing.complete_flight(envelope.in_buffer.take());
        if !self.fatal && self.received_any {
            self.write_results();
        }
        self.respond(MessageKind::Interpolate, 0)
    }

    /// Adopts the delivered buffers. Returns whether a commands buffer
    /// arrived this tick.
    fn receive(&mut self, envelope: &mut Envelope) -> Result<bool, ProtocolError> {
        self.outgoing.complete_flight(envelope.in_buffer.take());
        self.adopted_transfer = false;
        let Some(payload) = envelope.buffer.take() else {
            return Ok(false);
        };
        self.adopted_transfer = matches!(payload, protocol::BufferPayload::Transfer { .. });
        self.incoming.adopt(payload)?;
        self.mesh_buffers = std::mem::take(&mut envelope.mesh_buffers);
        self.received_any = true;
        Ok(true)
    }

    fn tick(&mut self, mut envelope: Envelope, mode: TickMode) -> Envelope {
        let kind = envelope.kind;
        if let Err(err) = self.receive(&mut envelope) {
            error!(%err, "failed to adopt delivered buffer; dropping message");
            return self.respond(kind, 0);
        }
        if !self.received_any {
            // Nothing has ever been simulated; answer so the round trip
            // completes.
            return Envelope::response(kind, 0);
        }

        self.execute_commands();

        let mut steps_taken = 0;
        if !self.fatal {
            let steps = match mode {
                TickMode::Manual(steps) => steps,
                TickMode::Wall => {
                    let now = Instant::now();
                    let dt = self
                        .last_tick
                        .map(|t| now.duration_since(t).as_secs_f32())
                        .unwrap_or(0.0);
                    self.last_tick = Some(now);
                    self.accumulator.advance(dt)
                }
            };
            let fixed = self.accumulator.fixed_step();
            for _ in 0..steps {
                if let Err(err) = self.engine.step(fixed, self.settings.sub_steps) {
                    self.set_fatal("engine step failed", &err);
                    break;
                }
                self.advance_motion_states();
                if let Some(callback) = self.on_step.as_mut() {
                    callback(fixed);
                }
                steps_taken += 1;
            }
        }

        if !self.fatal {
            self.write_results();
        }
        self.respond(kind, steps_taken)
    }

    /// Shifts every body's pose pair forward after a fixed step, so
    /// interpolation always blends the last two simulated poses.
    fn advance_motion_states(&mut self) {
        if !self.settings.use_motion_states {
            return;
        }
        for index in self.engine.active_indices() {
            let Some(state) = self.engine.body_state(index) else {
                continue;
            };
            self.motion_states
                .entry(index)
                .or_insert_with(|| MotionState::new(state.position, state.rotation))
                .advance(state.position, state.rotation);
        }
    }

    fn execute_commands(&mut self) {
        if self.fatal {
            self.incoming.reset();
            return;
        }
        let count = self.incoming.commands_count();
        for index in 0..count {
            let frame = match self.incoming.read_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    // Field boundaries after a bad frame are unknowable;
                    // the rest of this message cannot be decoded.
                    error!(%err, frame = index, "aborting command decode");
                    break;
                }
            };
            match executor::execute_frame(
                self.engine.as_mut(),
                &frame,
                &self.mesh_buffers,
                &mut self.outgoing,
            ) {
                Ok(ExecuteOutcome::Done) => self.after_execute(&frame),
                Ok(ExecuteOutcome::Stale) => {
                    self.stale_skips += 1;
                    debug!(
                        operator = ?frame.operator,
                        command = frame.command,
                        "command target no longer exists; skipped"
                    );
                }
                Err(ExecuteError::Protocol(err)) => {
                    error!(%err, frame = index, "aborting command decode");
                    break;
                }
                Err(ExecuteError::Engine(err)) => {
                    warn!(%err, frame = index, "command failed; remaining commands in message aborted");
                    break;
                }
            }
        }
        self.incoming.reset();
        self.mesh_buffers.clear();
    }

    /// Bookkeeping for commands that change the body set.
    fn after_execute(&mut self, frame: &Frame) {
        if frame.operator != Operator::Cleanup {
            return;
        }
        match frame.command {
            cleanup::DESTROY_BODY => {
                if let Ok(index) = frame.u32_at(0) {
                    self.motion_states.remove(&index);
                }
            }
            cleanup::DESTROY_ALL => self.motion_states.clear(),
            _ => {}
        }
    }

    fn write_results(&mut self) {
        let alpha = self.accumulator.alpha();
        for index in self.engine.active_indices() {
            let Some(state) = self.engine.body_state(index) else {
                continue;
            };
            let (position, rotation) = if self.settings.use_motion_states {
                self.motion_states
                    .entry(index)
                    .or_insert_with(|| MotionState::new(state.position, state.rotation))
                    .interpolate(alpha)
            } else {
                (state.position, state.rotation)
            };
            let frame = Frame::new(Operator::Report, report::BODY_POSE)
                .push(index)
                .push(position)
                .push(rotation)
                .push(state.linear_velocity)
                .push(state.angular_velocity);
            if let Err(err) = self.outgoing.write_frame(&frame) {
                self.set_fatal("failed to serialize body pose", &err);
                return;
            }
        }
    }

    fn set_fatal(&mut self, context: &str, err: &dyn std::fmt::Display) {
        error!(%err, context, "backend entered fatal state; simulation halted");
        self.fatal = true;
    }

    fn respond(&mut self, kind: MessageKind, steps: u32) -> Envelope {
        if self.fatal && !self.fatal_reported {
            let fatal = Frame::new(Operator::Report, report::FATAL);
            if self.outgoing.write_frame(&fatal).is_ok() {
                self.fatal_reported = true;
            }
        }
        let mut response = Envelope::response(kind, steps);
        if self.outgoing.is_dirty() {
            match self.outgoing.to_payload() {
                Ok(payload) => response.buffer = Some(payload),
                Err(err) => error!(%err, "failed to package response buffer"),
            }
        }
        if self.adopted_transfer {
            if let Some(bytes) = self.incoming.take_transfer() {
                response.in_buffer = Some(bytes);
            }
            self.adopted_transfer = false;
        }
        response
    }
}

impl BackendHost for SimulationBackend {
    fn handle(&mut self, envelope: Envelope) -> Option<Envelope> {
        Some(self.process(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};
    use protocol::frame::{creation, modification, query};

    fn settings() -> BridgeSettings {
        BridgeSettings {
            fixed_step: 1.0 / 30.0,
            ..BridgeSettings::default()
        }
    }

    fn new_backend() -> SimulationBackend {
        let mut backend =
            SimulationBackend::new(settings(), Box::new(PointMassEngine::new()));
        backend.process(Envelope::create_backend(settings()));
        backend
    }

    fn commands(frames: &[Frame]) -> protocol::BufferPayload {
        let mut cb = CommandBuffer::new(1024, true);
        for frame in frames {
            cb.write_frame(frame).unwrap();
        }
        cb.to_payload().unwrap()
    }

    fn create_body_frame(index: u32, position: Vec3) -> Frame {
        Frame::new(Operator::Creation, creation::CREATE_BODY)
            .push(index)
            .push(0u8)
            .push(position)
            .push(Quat::IDENTITY)
            .push_opt(Some(1.0f32))
            .push_opt(None::<Vec3>)
            .push_opt(None::<u16>)
    }

    fn decode_poses(response: &mut Envelope) -> Vec<(u32, Vec3, Vec3)> {
        // A response with nothing to report carries no buffer at all.
        let Some(payload) = response.buffer.take() else {
            return Vec::new();
        };
        let mut cb = CommandBuffer::new(0, true);
        cb.adopt(payload).unwrap();
        let mut poses = Vec::new();
        for _ in 0..cb.commands_count() {
            let frame = cb.read_frame().unwrap();
            if frame.command == report::BODY_POSE {
                poses.push((
                    frame.u32_at(0).unwrap(),
                    frame.vec3_at(1).unwrap(),
                    frame.vec3_at(3).unwrap(),
                ));
            }
        }
        poses
    }

    #[test]
    fn test_short_circuit_before_any_commands() {
        let mut backend = new_backend();
        let response = backend.process(Envelope::step(0.016));
        assert!(response.buffer.is_none());
        assert_eq!(response.steps, 0);
    }

    #[test]
    fn test_gravity_drop_scenario() {
        let mut backend = new_backend();
        let payload = commands(&[create_body_frame(0, Vec3::new(0.0, 10.0, 0.0))]);
        backend.process(Envelope::manual_step(0).with_buffer(payload));

        let mut response = backend.process(Envelope::manual_step(30));
        assert_eq!(response.steps, 30);
        let poses = decode_poses(&mut response);
        assert_eq!(poses.len(), 1);
        let (index, position, velocity) = poses[0];
        assert_eq!(index, 0);
        assert!(position.y < 10.0);
        assert!(velocity.y < 0.0);
        assert!((velocity.y + 9.81).abs() < 0.05);
    }

    #[test]
    fn test_stale_command_skipped_and_rest_executed() {
        let mut backend = new_backend();
        let payload = commands(&[
            create_body_frame(0, Vec3::ZERO),
            // Body 7 never existed.
            Frame::new(Operator::Modification, modification::SET_LINEAR_VELOCITY)
                .push(7u32)
                .push(Vec3::X),
            Frame::new(Operator::Modification, modification::SET_LINEAR_VELOCITY)
                .push(0u32)
                .push(Vec3::new(0.0, 0.0, 3.0)),
        ]);
        let mut response = backend.process(Envelope::manual_step(1).with_buffer(payload));
        assert_eq!(backend.stale_skips(), 1);
        let poses = decode_poses(&mut response);
        // The command after the stale one still ran.
        assert!(poses[0].2.z > 2.9);
    }

    #[test]
    fn test_command_failure_aborts_message_but_backend_survives() {
        let mut backend = new_backend();
        let bad = Frame::new(Operator::Creation, creation::CREATE_BODY)
            .push(0u32)
            .push(0u8)
            .push(Vec3::ZERO)
            .push(Quat::IDENTITY)
            .push_opt(Some(-1.0f32)) // invalid mass
            .push_opt(None::<Vec3>)
            .push_opt(None::<u16>);
        let after = create_body_frame(1, Vec3::ZERO);
        let payload = commands(&[bad, after]);
        let mut response = backend.process(Envelope::manual_step(1).with_buffer(payload));
        // Body 1 was aborted along with the rest of the message.
        assert!(decode_poses(&mut response).is_empty());
        assert!(!backend.is_fatal());

        // A later message works normally.
        let payload = commands(&[create_body_frame(2, Vec3::Y)]);
        let mut response = backend.process(Envelope::manual_step(1).with_buffer(payload));
        assert_eq!(decode_poses(&mut response).len(), 1);
    }

    #[test]
    fn test_raycast_query_round_trip() {
        let mut backend = new_backend();
        let payload = commands(&[
            create_body_frame(0, Vec3::new(0.0, 0.0, 3.0)),
            Frame::new(Operator::Query, query::RAYCAST)
                .push(11u32)
                .push(Vec3::ZERO)
                .push(Vec3::new(0.0, 0.0, 10.0)),
        ]);
        let mut response = backend.process(Envelope::manual_step(0).with_buffer(payload));
        let mut cb = CommandBuffer::new(0, true);
        cb.adopt(response.buffer.take().unwrap()).unwrap();
        let mut saw_hit = false;
        for _ in 0..cb.commands_count() {
            let frame = cb.read_frame().unwrap();
            if frame.command == report::RAYCAST_HIT {
                assert_eq!(frame.u32_at(0).unwrap(), 11);
                assert!(frame.bool_at(1).unwrap());
                assert_eq!(frame.opt_u32_at(4).unwrap(), Some(0));
                saw_hit = true;
            }
        }
        assert!(saw_hit);
    }

    /// Engine whose step always fails, for fatal-path coverage.
    struct BrokenEngine(PointMassEngine);

    impl PhysicsEngine for BrokenEngine {
        fn create_body(&mut self, desc: BodyDesc) -> Result<(), EngineError> {
            self.0.create_body(desc)
        }
        fn destroy_body(&mut self, index: u32) -> bool {
            self.0.destroy_body(index)
        }
        fn destroy_all(&mut self) {
            self.0.destroy_all()
        }
        fn body_state(&self, index: u32) -> Option<BodyState> {
            self.0.body_state(index)
        }
        fn set_transform(&mut self, i: u32, p: Option<Vec3>, r: Option<Quat>) -> bool {
            self.0.set_transform(i, p, r)
        }
        fn set_linear_velocity(&mut self, i: u32, v: Vec3) -> bool {
            self.0.set_linear_velocity(i, v)
        }
        fn set_angular_velocity(&mut self, i: u32, v: Vec3) -> bool {
            self.0.set_angular_velocity(i, v)
        }
        fn apply_impulse(&mut self, i: u32, v: Vec3, p: Option<Vec3>) -> bool {
            self.0.apply_impulse(i, v, p)
        }
        fn set_gravity(&mut self, g: Vec3) {
            self.0.set_gravity(g)
        }
        fn update_controller(&mut self, i: u32, d: Vec3) -> bool {
            self.0.update_controller(i, d)
        }
        fn set_contact_override(&mut self, e: bool) {
            self.0.set_contact_override(e)
        }
        fn step(&mut self, _dt: f32, _sub_steps: u32) -> Result<(), EngineError> {
            Err(EngineError::StepFailed("broken by design of this test"))
        }
        fn raycast(&self, from: Vec3, to: Vec3) -> Option<RayHit> {
            self.0.raycast(from, to)
        }
        fn active_indices(&self) -> Vec<u32> {
            self.0.active_indices()
        }
    }

    #[test]
    fn test_step_failure_is_fatal_but_round_trips_continue() {
        let mut backend = SimulationBackend::new(
            settings(),
            Box::new(BrokenEngine(PointMassEngine::new())),
        );
        backend.process(Envelope::create_backend(settings()));
        let payload = commands(&[create_body_frame(0, Vec3::ZERO)]);
        let mut response = backend.process(Envelope::manual_step(1).with_buffer(payload));
        assert!(backend.is_fatal());
        assert_eq!(response.steps, 0);

        // Fatal is reported exactly once.
        let mut cb = CommandBuffer::new(0, true);
        cb.adopt(response.buffer.take().unwrap()).unwrap();
        let frame = cb.read_frame().unwrap();
        assert_eq!(frame.command, report::FATAL);

        // Dead backend still answers.
        let response = backend.process(Envelope::manual_step(5));
        assert_eq!(response.steps, 0);
        assert!(response.buffer.is_none());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut backend = new_backend();
        let payload = commands(&[create_body_frame(0, Vec3::ZERO)]);
        backend.process(Envelope::manual_step(1).with_buffer(payload));
        let first = backend.process(Envelope::destroy());
        assert_eq!(first.kind, MessageKind::Destroy);
        let second = backend.process(Envelope::destroy());
        assert_eq!(second.kind, MessageKind::Destroy);
    }
}
