//! Transport dispatcher for the simulation bridge.
//!
//! Unifies two delivery modes behind one send/poll contract: direct
//! synchronous invocation within the caller's context, and asynchronous
//! message passing to a dedicated worker thread. The dispatcher treats
//! command bytes as opaque; buffer identity is preserved either by shared
//! storage (no copy, no ownership change) or by moving the bytes with the
//! message and handing them back via `in_buffer`.

use protocol::Envelope;

/// Direct (in-context) delivery.
pub mod direct;
/// Cross-context delivery via a worker thread.
pub mod worker;

pub use direct::DirectLink;
pub use worker::WorkerLink;

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn backend worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("backend context is gone")]
    Closed,
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// The far side of the boundary: receives one envelope, optionally
/// answers with one.
///
/// Implementations run wherever the dispatcher executes code, so they
/// must be [`Send`] even in direct mode.
pub trait BackendHost: Send {
    fn handle(&mut self, envelope: Envelope) -> Option<Envelope>;
}

/// A transport endpoint owned by its creator. There is no ambient global
/// dispatcher; callers construct one per bridge and destroy it with the
/// bridge.
pub enum Dispatcher {
    Direct(DirectLink),
    Worker(WorkerLink),
}

impl Dispatcher {
    /// Creates an in-context dispatcher that invokes the host
    /// synchronously on every send.
    pub fn direct(host: Box<dyn BackendHost>) -> Self {
        Dispatcher::Direct(DirectLink::new(host))
    }

    /// Spawns a worker thread, constructs the host inside it, and returns
    /// a dispatcher delivering envelopes to it.
    ///
    /// # Errors
    /// Returns [`TransportError::Spawn`] if the thread cannot be created.
    pub fn worker<F>(factory: F) -> TransportResult<Self>
    where
        F: FnOnce() -> Box<dyn BackendHost> + Send + 'static,
    {
        Ok(Dispatcher::Worker(WorkerLink::spawn(factory)?))
    }

    /// Delivers an envelope to the backend context.
    ///
    /// After a destroy message has been sent, further sends are no-ops.
    pub fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        match self {
            Dispatcher::Direct(link) => link.send(envelope),
            Dispatcher::Worker(link) => link.send(envelope),
        }
    }

    /// Takes the next response delivered by the backend, if any.
    ///
    /// Direct mode makes responses available immediately after the send
    /// that produced them; worker mode whenever the thread has answered.
    pub fn poll(&mut self) -> Option<Envelope> {
        match self {
            Dispatcher::Direct(link) => link.poll(),
            Dispatcher::Worker(link) => link.poll(),
        }
    }

    /// True until a destroy message has been delivered.
    pub fn is_alive(&self) -> bool {
        match self {
            Dispatcher::Direct(link) => link.is_alive(),
            Dispatcher::Worker(link) => link.is_alive(),
        }
    }
}
