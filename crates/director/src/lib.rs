//! Simulation director: the near side of the bridge.
//!
//! The director owns the outgoing command buffer and the transport
//! dispatcher. Callers queue typed commands at any time; the director
//! flushes them with the next step request and routes decoded result
//! frames to registered handlers.
//!
//! Dispatch is single flight: at most one step request is in the air at a
//! time. A step requested while one is outstanding is not sent and not
//! lost; the skipped flag is raised, the frame delta accumulates, and the
//! queued commands keep accumulating in the buffer. When the outstanding
//! response is consumed, the skipped step is dispatched immediately with
//! everything that piled up. This keeps shared storage uncontended and
//! bounds the work in flight regardless of how far the backend falls
//! behind.

use bytes::Bytes;
use glam::{Quat, Vec3};
use protocol::frame::{character, cleanup, creation, modification, query, report};
use protocol::{
    BodyKind, BridgeSettings, CommandBuffer, Envelope, Frame, MessageKind, Operator,
    ProtocolError, SharedBufferPair, SharedBytes,
};
use tracing::{debug, error, warn};
use transport::{Dispatcher, TransportError};

/// Handler seam and typed views of result frames.
pub mod handlers;

pub use handlers::{BodyPose, FrameHandler, RaycastHit, RaycastReply};

/// Errors surfaced by the director.
#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("bridge already destroyed")]
    Destroyed,

    #[error("a simulation flight is already in progress")]
    Busy,
}

/// Result alias for director operations.
pub type DirectorResult<T> = Result<T, DirectorError>;

/// Creation parameters for one body. Absent optionals fall back to the
/// backend's defaults and cost one packed bit on the wire.
#[derive(Debug, Clone)]
pub struct CreateBody {
    pub index: u32,
    pub kind: BodyKind,
    pub position: Vec3,
    pub rotation: Quat,
    pub mass: Option<f32>,
    pub linear_velocity: Option<Vec3>,
    /// Collision geometry, shipped as a side buffer alongside the frames.
    pub mesh: Option<Bytes>,
}

impl CreateBody {
    pub fn dynamic(index: u32, position: Vec3) -> Self {
        Self {
            index,
            kind: BodyKind::Dynamic,
            position,
            rotation: Quat::IDENTITY,
            mass: None,
            linear_velocity: None,
            mesh: None,
        }
    }
}

/// One handler slot per operator.
const OPERATOR_SLOTS: usize = 6;

/// The near side of the bridge: queues commands, dispatches step
/// requests, routes results.
pub struct SimulationDirector {
    dispatcher: Dispatcher,
    outgoing: CommandBuffer,
    incoming: CommandBuffer,
    handlers: [Option<Box<dyn FrameHandler>>; OPERATOR_SLOTS],
    /// A step request is in the air and unanswered.
    flight: bool,
    /// A step was requested during the current flight.
    skipped: bool,
    accumulated_delta: f32,
    /// The backend's transfer storage, to be handed back with the next
    /// request.
    pending_return: Option<Vec<u8>>,
    mesh_buffers: Vec<Bytes>,
    next_ray: u32,
    perf_counter: u32,
    /// Fixed steps the backend took for the last answered request.
    last_steps: u32,
    destroyed: bool,
    fatal: bool,
}

impl SimulationDirector {
    /// Builds the director and sends the backend-creation request through
    /// the dispatcher. In shared-memory mode this allocates the two
    /// shared storages and hands the backend its views.
    ///
    /// # Errors
    /// Propagates transport failures from the creation send.
    pub fn new(settings: &BridgeSettings, mut dispatcher: Dispatcher) -> DirectorResult<Self> {
        let mut create = Envelope::create_backend(settings.clone());
        let (outgoing, incoming) = if settings.use_shared_memory {
            let to_backend = SharedBytes::with_capacity(settings.commands_buffer_size);
            let to_manager = SharedBytes::with_capacity(settings.commands_buffer_size);
            create = create.with_shared_buffers(SharedBufferPair {
                to_backend: to_backend.share_view(),
                to_manager: to_manager.share_view(),
            });
            (
                CommandBuffer::with_shared(to_backend, settings.allow_commands_buffer_resize),
                CommandBuffer::with_shared(to_manager, settings.allow_commands_buffer_resize),
            )
        } else {
            (
                CommandBuffer::new(
                    settings.commands_buffer_size,
                    settings.allow_commands_buffer_resize,
                ),
                CommandBuffer::new(0, true),
            )
        };
        dispatcher.send(create)?;
        Ok(Self {
            dispatcher,
            outgoing,
            incoming,
            handlers: std::array::from_fn(|_| None),
            flight: false,
            skipped: false,
            accumulated_delta: 0.0,
            pending_return: None,
            mesh_buffers: Vec::new(),
            next_ray: 0,
            perf_counter: 0,
            last_steps: 0,
            destroyed: false,
            fatal: false,
        })
    }

    /// Registers the handler receiving decoded frames for `operator`,
    /// replacing any previous one.
    pub fn set_handler(&mut self, operator: Operator, handler: Box<dyn FrameHandler>) {
        self.handlers[operator as usize] = Some(handler);
    }

    /// The backend reported an unrecoverable failure; no further results
    /// will arrive.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// A step request is currently unanswered.
    pub fn in_flight(&self) -> bool {
        self.flight
    }

    /// Fixed steps taken for the last answered step request.
    pub fn last_steps(&self) -> u32 {
        self.last_steps
    }

    // ------------------------------------------------------------------
    // Command writers
    // ------------------------------------------------------------------

    /// Queues a body creation.
    ///
    /// # Errors
    /// Propagates frame encoding failures.
    pub fn create_body(&mut self, cmd: CreateBody) -> DirectorResult<()> {
        self.ensure_alive()?;
        let mesh_index = cmd.mesh.map(|bytes| {
            self.mesh_buffers.push(bytes);
            (self.mesh_buffers.len() - 1) as u16
        });
        let frame = Frame::new(Operator::Creation, creation::CREATE_BODY)
            .push(cmd.index)
            .push(cmd.kind.as_u8())
            .push(cmd.position)
            .push(cmd.rotation)
            .push_opt(cmd.mass)
            .push_opt(cmd.linear_velocity)
            .push_opt(mesh_index);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    pub fn set_transform(
        &mut self,
        index: u32,
        position: Option<Vec3>,
        rotation: Option<Quat>,
    ) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame = Frame::new(Operator::Modification, modification::SET_TRANSFORM)
            .push(index)
            .push_opt(position)
            .push_opt(rotation);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    pub fn set_linear_velocity(&mut self, index: u32, velocity: Vec3) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame = Frame::new(Operator::Modification, modification::SET_LINEAR_VELOCITY)
            .push(index)
            .push(velocity);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    pub fn set_angular_velocity(&mut self, index: u32, velocity: Vec3) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame = Frame::new(Operator::Modification, modification::SET_ANGULAR_VELOCITY)
            .push(index)
            .push(velocity);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    pub fn apply_impulse(
        &mut self,
        index: u32,
        impulse: Vec3,
        point: Option<Vec3>,
    ) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame = Frame::new(Operator::Modification, modification::APPLY_IMPULSE)
            .push(index)
            .push(impulse)
            .push_opt(point);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    pub fn set_gravity(&mut self, gravity: Vec3) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame =
            Frame::new(Operator::Modification, modification::SET_GRAVITY).push(gravity);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    /// Queues a segment raycast and returns the id its reply will carry.
    pub fn raycast(&mut self, from: Vec3, to: Vec3) -> DirectorResult<u32> {
        self.ensure_alive()?;
        let ray = self.next_ray;
        self.next_ray = self.next_ray.wrapping_add(1);
        let frame = Frame::new(Operator::Query, query::RAYCAST)
            .push(ray)
            .push(from)
            .push(to);
        self.outgoing.write_frame(&frame)?;
        Ok(ray)
    }

    pub fn destroy_body(&mut self, index: u32) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame = Frame::new(Operator::Cleanup, cleanup::DESTROY_BODY).push(index);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    pub fn destroy_all_bodies(&mut self) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame = Frame::new(Operator::Cleanup, cleanup::DESTROY_ALL);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    pub fn update_controller(&mut self, index: u32, displacement: Vec3) -> DirectorResult<()> {
        self.ensure_alive()?;
        let frame = Frame::new(Operator::Character, character::UPDATE_CONTROLLER)
            .push(index)
            .push(displacement);
        self.outgoing.write_frame(&frame)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Requests a wall-clock step, flushing queued commands.
    ///
    /// Returns `false` when a flight was already outstanding; the step is
    /// coalesced into the next dispatch instead of being sent.
    ///
    /// # Errors
    /// [`DirectorError::Destroyed`] after [`SimulationDirector::destroy`],
    /// and transport or encoding failures from the send itself.
    pub fn step(&mut self, delta: f32) -> DirectorResult<bool> {
        self.ensure_alive()?;
        if self.flight {
            self.skipped = true;
            self.accumulated_delta += delta;
            return Ok(false);
        }
        let delta = self.accumulated_delta + delta;
        self.accumulated_delta = 0.0;
        self.dispatch_flight(Envelope::step(delta), true)?;
        Ok(true)
    }

    /// Requests exactly `steps` fixed steps, bypassing the backend's wall
    /// clock. Used for deterministic drives.
    ///
    /// # Errors
    /// [`DirectorError::Busy`] while a flight is outstanding.
    pub fn manual_step(&mut self, steps: u32) -> DirectorResult<()> {
        self.ensure_alive()?;
        if self.flight {
            return Err(DirectorError::Busy);
        }
        self.dispatch_flight(Envelope::manual_step(steps), true)
    }

    /// Requests freshly interpolated poses without advancing simulation
    /// time. Queued commands are held back for the next step.
    ///
    /// # Errors
    /// [`DirectorError::Busy`] while a flight is outstanding.
    pub fn interpolate(&mut self) -> DirectorResult<()> {
        self.ensure_alive()?;
        if self.flight {
            return Err(DirectorError::Busy);
        }
        self.dispatch_flight(Envelope::interpolate(), false)
    }

    /// Toggles the backend's contact-reporting override. Control
    /// messages bypass the flight gate; ordered delivery keeps them
    /// sequenced with step requests.
    pub fn override_contacts(&mut self, enabled: bool) -> DirectorResult<()> {
        self.ensure_alive()?;
        self.dispatcher.send(Envelope::override_contacts(enabled))?;
        Ok(())
    }

    /// Tears the bridge down. Idempotent; every operation after this
    /// returns [`DirectorError::Destroyed`], and responses still in the
    /// air are dropped.
    pub fn destroy(&mut self) -> DirectorResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.dispatcher.send(Envelope::destroy())?;
        Ok(())
    }

    /// Consumes every response the backend has delivered, routes decoded
    /// frames to handlers, and dispatches a coalesced skipped step if one
    /// is pending. Returns the number of responses consumed.
    ///
    /// # Errors
    /// Propagates adoption failures and the skipped-step send.
    pub fn pump(&mut self) -> DirectorResult<usize> {
        let mut consumed = 0;
        while let Some(response) = self.dispatcher.poll() {
            consumed += 1;
            self.absorb(response)?;
        }
        if !self.flight && self.skipped && !self.destroyed {
            self.skipped = false;
            let delta = self.accumulated_delta;
            self.accumulated_delta = 0.0;
            self.dispatch_flight(Envelope::step(delta), true)?;
        }
        Ok(consumed)
    }

    fn ensure_alive(&self) -> DirectorResult<()> {
        if self.destroyed {
            return Err(DirectorError::Destroyed);
        }
        Ok(())
    }

    fn dispatch_flight(
        &mut self,
        mut envelope: Envelope,
        attach_commands: bool,
    ) -> DirectorResult<()> {
        if attach_commands && self.outgoing.is_dirty() {
            envelope.buffer = Some(self.outgoing.to_payload()?);
            let meshes = std::mem::take(&mut self.mesh_buffers);
            if !meshes.is_empty() {
                envelope.mesh_buffers = meshes;
            }
        }
        if let Some(bytes) = self.pending_return.take() {
            envelope.in_buffer = Some(bytes);
        }
        self.perf_counter = self.perf_counter.wrapping_add(1);
        envelope.perf_index = Some(self.perf_counter);
        self.dispatcher.send(envelope)?;
        self.flight = true;
        Ok(())
    }

    fn absorb(&mut self, mut response: Envelope) -> DirectorResult<()> {
        if self.destroyed {
            debug!(kind = ?response.kind, "dropping response after destroy");
            return Ok(());
        }
        match response.kind {
            MessageKind::Step | MessageKind::ManualStep | MessageKind::Interpolate => {
                self.flight = false;
                self.last_steps = response.steps;
                self.outgoing.complete_flight(response.in_buffer.take());
                if let Some(payload) = response.buffer.take() {
                    self.incoming.adopt(payload)?;
                    self.route_frames();
                    self.pending_return = self.incoming.take_transfer();
                }
            }
            MessageKind::CreateBackend
            | MessageKind::OverrideContacts
            | MessageKind::Destroy => {}
        }
        Ok(())
    }

    fn route_frames(&mut self) {
        let count = self.incoming.commands_count();
        for index in 0..count {
            let frame = match self.incoming.read_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    // Field boundaries after a bad frame are unknowable.
                    error!(%err, frame = index, "aborting response decode");
                    break;
                }
            };
            if frame.operator == Operator::Report && frame.command == report::FATAL {
                self.fatal = true;
                warn!("backend reported an unrecoverable simulation failure");
            }
            match self.handlers[frame.operator as usize].as_mut() {
                Some(handler) => handler.handle(&frame),
                None => debug!(
                    operator = ?frame.operator,
                    command = frame.command,
                    "no handler registered; frame dropped"
                ),
            }
        }
        self.incoming.reset();
    }
}
