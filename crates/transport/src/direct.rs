//! Direct (in-context) delivery.
//!
//! The backend host lives inside the link and is invoked synchronously on
//! every send; responses queue up and are drained by polling, so callers
//! see the same send/poll contract as the worker path. Transfer hints are
//! meaningless here (there is no real ownership boundary) and are ignored.

use std::collections::VecDeque;

use protocol::{Envelope, MessageKind};
use tracing::debug;

use crate::{BackendHost, TransportResult};

/// Synchronous in-context delivery link.
pub struct DirectLink {
    host: Option<Box<dyn BackendHost>>,
    responses: VecDeque<Envelope>,
}

impl DirectLink {
    pub fn new(host: Box<dyn BackendHost>) -> Self {
        Self {
            host: Some(host),
            responses: VecDeque::new(),
        }
    }

    /// Invokes the host with exactly the envelope sent (no mutation in
    /// transit). A destroy message releases the host; deliveries after
    /// that are no-ops.
    pub fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        let destroy = matches!(envelope.kind, MessageKind::Destroy);
        let Some(host) = self.host.as_mut() else {
            debug!("direct link destroyed; dropping {:?} envelope", envelope.kind);
            return Ok(());
        };
        if let Some(response) = host.handle(envelope) {
            self.responses.push_back(response);
        }
        if destroy {
            self.host = None;
        }
        Ok(())
    }

    pub fn poll(&mut self) -> Option<Envelope> {
        self.responses.pop_front()
    }

    pub fn is_alive(&self) -> bool {
        self.host.is_some()
    }
}
