//! Message envelope passed through the transport dispatcher.
//!
//! The dispatcher never interprets command bytes; everything it needs to
//! route and account for a message lives here. `buffer` carries the
//! sender's outgoing command bytes, `in_buffer` optionally hands a
//! previously transferred storage back to its owner.

use bytes::Bytes;

use crate::buffer::{BufferPayload, SharedBytes};
use crate::config::BridgeSettings;

/// Which side of the boundary sent the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manager,
    Backend,
}

/// What the receiver is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Execute queued commands, advance the wall-clock accumulator, report.
    Step,
    /// Execute queued commands, advance exactly `steps` fixed steps.
    ManualStep,
    /// Recompute interpolated poses at the current carry-time alpha
    /// without stepping.
    Interpolate,
    /// Construct the backend with the attached settings.
    CreateBackend,
    /// Toggle the engine's contact-reporting override.
    OverrideContacts,
    /// Tear the backend down. Idempotent; later deliveries are no-ops.
    Destroy,
}

/// Shared command-buffer storages exchanged once at backend creation.
#[derive(Debug, Clone)]
pub struct SharedBufferPair {
    /// Manager-written, backend-read storage.
    pub to_backend: SharedBytes,
    /// Backend-written, manager-read storage.
    pub to_manager: SharedBytes,
}

/// One message crossing the execution boundary.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Origin,
    pub kind: MessageKind,
    /// The sender's outgoing command bytes, if any were written.
    pub buffer: Option<BufferPayload>,
    /// Returns the receiver's transferred storage to its owner.
    pub in_buffer: Option<Vec<u8>>,
    /// Fixed steps to advance for [`MessageKind::ManualStep`]; the number
    /// of fixed steps taken on a response.
    pub steps: u32,
    /// The sender's frame delta, carried for diagnostics.
    pub delta: f32,
    /// Debug timing correlation id.
    pub perf_index: Option<u32>,
    /// Auxiliary geometry payloads referenced by creation commands.
    pub mesh_buffers: Vec<Bytes>,
    /// Present on [`MessageKind::CreateBackend`].
    pub settings: Option<BridgeSettings>,
    /// Present on [`MessageKind::CreateBackend`] in shared-memory mode.
    pub shared_buffers: Option<SharedBufferPair>,
    /// Present on [`MessageKind::OverrideContacts`].
    pub contacts_override: Option<bool>,
}

impl Envelope {
    fn bare(origin: Origin, kind: MessageKind) -> Self {
        Self {
            origin,
            kind,
            buffer: None,
            in_buffer: None,
            steps: 0,
            delta: 0.0,
            perf_index: None,
            mesh_buffers: Vec::new(),
            settings: None,
            shared_buffers: None,
            contacts_override: None,
        }
    }

    /// A manager-side step request.
    pub fn step(delta: f32) -> Self {
        let mut env = Self::bare(Origin::Manager, MessageKind::Step);
        env.delta = delta;
        env
    }

    /// A manager-side request for an exact number of fixed steps.
    pub fn manual_step(steps: u32) -> Self {
        let mut env = Self::bare(Origin::Manager, MessageKind::ManualStep);
        env.steps = steps;
        env
    }

    pub fn interpolate() -> Self {
        Self::bare(Origin::Manager, MessageKind::Interpolate)
    }

    pub fn create_backend(settings: BridgeSettings) -> Self {
        let mut env = Self::bare(Origin::Manager, MessageKind::CreateBackend);
        env.settings = Some(settings);
        env
    }

    pub fn override_contacts(enabled: bool) -> Self {
        let mut env = Self::bare(Origin::Manager, MessageKind::OverrideContacts);
        env.contacts_override = Some(enabled);
        env
    }

    pub fn destroy() -> Self {
        Self::bare(Origin::Manager, MessageKind::Destroy)
    }

    /// A backend-side response, echoing the kind of the request it
    /// answers.
    pub fn response(kind: MessageKind, steps: u32) -> Self {
        let mut env = Self::bare(Origin::Backend, kind);
        env.steps = steps;
        env
    }

    pub fn with_buffer(mut self, payload: BufferPayload) -> Self {
        self.buffer = Some(payload);
        self
    }

    pub fn with_in_buffer(mut self, bytes: Vec<u8>) -> Self {
        self.in_buffer = Some(bytes);
        self
    }

    pub fn with_perf_index(mut self, index: u32) -> Self {
        self.perf_index = Some(index);
        self
    }

    pub fn with_mesh_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.mesh_buffers = buffers;
        self
    }

    pub fn with_shared_buffers(mut self, pair: SharedBufferPair) -> Self {
        self.shared_buffers = Some(pair);
        self
    }
}
