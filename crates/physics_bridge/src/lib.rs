//! One-stop facade over the simulation bridge.
//!
//! Wires the three layers together from a [`BridgeSettings`]: a
//! [`SimulationBackend`] hosting a physics engine, a transport
//! [`Dispatcher`] in direct or worker mode, and a [`SimulationDirector`]
//! driving it. On top of the director it keeps a world mirror: the last
//! reported pose per body and the raycast replies that have come back,
//! so callers read simulation state without touching frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use backend::{PhysicsEngine, PointMassEngine, SimulationBackend};
use bytes::Bytes;
use director::{DirectorError, SimulationDirector};
use glam::{Quat, Vec3};
use protocol::frame::report;
use protocol::{Frame, Operator, SettingsError};
use transport::{Dispatcher, TransportError};

pub use backend::{BodyDesc, BodyState, EngineError, RayHit};
pub use director::{BodyPose, CreateBody, RaycastHit, RaycastReply};
pub use protocol::{BodyKind, BridgeSettings};

/// Errors surfaced by the bridge facade.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Director(#[from] DirectorError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Front-side view of the simulated world, fed by report frames.
#[derive(Debug, Default)]
struct WorldMirror {
    poses: HashMap<u32, BodyPose>,
    raycasts: Vec<RaycastReply>,
    fatal: bool,
}

/// A fully wired simulation bridge.
pub struct PhysicsBridge {
    director: SimulationDirector,
    mirror: Arc<Mutex<WorldMirror>>,
}

impl PhysicsBridge {
    /// Builds a bridge over the built-in point-mass engine.
    ///
    /// # Errors
    /// [`BridgeError::Settings`] for invalid settings, and transport
    /// failures when the worker context cannot be spawned.
    pub fn new(settings: BridgeSettings) -> BridgeResult<Self> {
        Self::with_engine_factory(settings, || Box::new(PointMassEngine::new()))
    }

    /// Builds a bridge over a caller-supplied engine. The factory runs in
    /// the backend's context, which in worker mode is the worker thread.
    ///
    /// # Errors
    /// See [`PhysicsBridge::new`].
    pub fn with_engine_factory<F>(settings: BridgeSettings, engine: F) -> BridgeResult<Self>
    where
        F: FnOnce() -> Box<dyn PhysicsEngine> + Send + 'static,
    {
        settings.validate()?;
        let dispatcher = if settings.use_worker_context {
            let backend_settings = settings.clone();
            Dispatcher::worker(move || {
                Box::new(SimulationBackend::new(backend_settings, engine()))
            })?
        } else {
            Dispatcher::direct(Box::new(SimulationBackend::new(
                settings.clone(),
                engine(),
            )))
        };
        let mut director = SimulationDirector::new(&settings, dispatcher)?;

        let mirror = Arc::new(Mutex::new(WorldMirror::default()));
        let sink = Arc::clone(&mirror);
        director.set_handler(
            Operator::Report,
            Box::new(move |frame: &Frame| {
                let mut mirror = sink.lock().unwrap_or_else(|e| e.into_inner());
                match frame.command {
                    report::BODY_POSE => {
                        if let Ok(pose) = BodyPose::decode(frame) {
                            mirror.poses.insert(pose.index, pose);
                        }
                    }
                    report::RAYCAST_HIT => {
                        if let Ok(reply) = RaycastReply::decode(frame) {
                            mirror.raycasts.push(reply);
                        }
                    }
                    report::FATAL => mirror.fatal = true,
                    _ => {}
                }
            }),
        );
        Ok(Self { director, mirror })
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Queues a body creation for the next step.
    ///
    /// # Errors
    /// Propagates encoding failures and [`DirectorError::Destroyed`].
    pub fn create_body(&mut self, cmd: CreateBody) -> BridgeResult<()> {
        Ok(self.director.create_body(cmd)?)
    }

    pub fn set_transform(
        &mut self,
        index: u32,
        position: Option<Vec3>,
        rotation: Option<Quat>,
    ) -> BridgeResult<()> {
        Ok(self.director.set_transform(index, position, rotation)?)
    }

    pub fn set_linear_velocity(&mut self, index: u32, velocity: Vec3) -> BridgeResult<()> {
        Ok(self.director.set_linear_velocity(index, velocity)?)
    }

    pub fn set_angular_velocity(&mut self, index: u32, velocity: Vec3) -> BridgeResult<()> {
        Ok(self.director.set_angular_velocity(index, velocity)?)
    }

    pub fn apply_impulse(
        &mut self,
        index: u32,
        impulse: Vec3,
        point: Option<Vec3>,
    ) -> BridgeResult<()> {
        Ok(self.director.apply_impulse(index, impulse, point)?)
    }

    pub fn set_gravity(&mut self, gravity: Vec3) -> BridgeResult<()> {
        Ok(self.director.set_gravity(gravity)?)
    }

    /// Queues a segment raycast; the reply surfaces later via
    /// [`PhysicsBridge::take_raycast_replies`] under the returned id.
    pub fn raycast(&mut self, from: Vec3, to: Vec3) -> BridgeResult<u32> {
        Ok(self.director.raycast(from, to)?)
    }

    pub fn update_controller(&mut self, index: u32, displacement: Vec3) -> BridgeResult<()> {
        Ok(self.director.update_controller(index, displacement)?)
    }

    /// Queues a body destruction and forgets its mirrored pose.
    pub fn destroy_body(&mut self, index: u32) -> BridgeResult<()> {
        self.director.destroy_body(index)?;
        self.lock_mirror().poses.remove(&index);
        Ok(())
    }

    /// Queues destruction of every body and clears the mirror.
    pub fn destroy_all_bodies(&mut self) -> BridgeResult<()> {
        self.director.destroy_all_bodies()?;
        self.lock_mirror().poses.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Requests a wall-clock step; consumes responses first so single
    /// flight coalescing only kicks in when the backend is genuinely
    /// behind. Returns `false` when the request was coalesced.
    ///
    /// # Errors
    /// Propagates director failures.
    pub fn step(&mut self, delta: f32) -> BridgeResult<bool> {
        self.director.pump()?;
        Ok(self.director.step(delta)?)
    }

    /// Advances exactly `steps` fixed steps. Deterministic: no wall clock
    /// is involved.
    ///
    /// # Errors
    /// [`DirectorError::Busy`] while a step is outstanding.
    pub fn manual_step(&mut self, steps: u32) -> BridgeResult<()> {
        self.director.pump()?;
        Ok(self.director.manual_step(steps)?)
    }

    /// Requests freshly interpolated poses without advancing simulation
    /// time.
    ///
    /// # Errors
    /// [`DirectorError::Busy`] while a step is outstanding.
    pub fn interpolate(&mut self) -> BridgeResult<()> {
        self.director.pump()?;
        Ok(self.director.interpolate()?)
    }

    pub fn override_contacts(&mut self, enabled: bool) -> BridgeResult<()> {
        Ok(self.director.override_contacts(enabled)?)
    }

    /// Consumes delivered responses and updates the world mirror.
    /// Returns the number of responses consumed.
    ///
    /// # Errors
    /// Propagates adoption failures and the coalesced-step send.
    pub fn pump(&mut self) -> BridgeResult<usize> {
        Ok(self.director.pump()?)
    }

    /// Tears the bridge down. Idempotent.
    ///
    /// # Errors
    /// Propagates transport failures from the teardown send.
    pub fn destroy(&mut self) -> BridgeResult<()> {
        Ok(self.director.destroy()?)
    }

    // ------------------------------------------------------------------
    // Mirror reads
    // ------------------------------------------------------------------

    /// Last reported pose of a body, if any report has arrived.
    pub fn body_pose(&self, index: u32) -> Option<BodyPose> {
        self.lock_mirror().poses.get(&index).copied()
    }

    /// Number of bodies with a mirrored pose.
    pub fn mirrored_bodies(&self) -> usize {
        self.lock_mirror().poses.len()
    }

    /// Drains the raycast replies received since the last call.
    pub fn take_raycast_replies(&mut self) -> Vec<RaycastReply> {
        std::mem::take(&mut self.lock_mirror().raycasts)
    }

    /// The backend reported an unrecoverable failure.
    pub fn is_fatal(&self) -> bool {
        self.lock_mirror().fatal || self.director.is_fatal()
    }

    pub fn is_destroyed(&self) -> bool {
        self.director.is_destroyed()
    }

    /// A step request is currently unanswered.
    pub fn in_flight(&self) -> bool {
        self.director.in_flight()
    }

    /// Fixed steps taken for the last answered step request.
    pub fn last_steps(&self) -> u32 {
        self.director.last_steps()
    }

    fn lock_mirror(&self) -> std::sync::MutexGuard<'_, WorldMirror> {
        self.mirror.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Creation shorthand with collision geometry attached.
pub fn create_body_with_mesh(index: u32, kind: BodyKind, position: Vec3, mesh: Bytes) -> CreateBody {
    CreateBody {
        index,
        kind,
        position,
        rotation: Quat::IDENTITY,
        mass: None,
        linear_velocity: None,
        mesh: Some(mesh),
    }
}
