//! Cross-context delivery via a worker thread.
//!
//! The backend host is constructed inside a dedicated thread and owns its
//! half of the channel pair for its whole life. Envelopes are moved, not
//! copied: transfer-mode buffers change ownership with the message, while
//! shared-mode storage stays put and only cursor metadata crosses. The
//! worker exits when it handles a destroy message or when the sending
//! half is dropped.

use std::thread::JoinHandle;

use protocol::{Envelope, MessageKind};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::{BackendHost, TransportResult};

/// Asynchronous delivery link to a backend worker thread.
pub struct WorkerLink {
    requests: Option<UnboundedSender<Envelope>>,
    responses: UnboundedReceiver<Envelope>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerLink {
    /// Spawns the worker and constructs the host inside it.
    pub fn spawn<F>(factory: F) -> TransportResult<Self>
    where
        F: FnOnce() -> Box<dyn BackendHost> + Send + 'static,
    {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Envelope>();
        let (response_tx, response_rx) = mpsc::unbounded_channel::<Envelope>();

        let thread = std::thread::Builder::new()
            .name("physics-backend".into())
            .spawn(move || {
                let mut host = factory();
                while let Some(envelope) = request_rx.blocking_recv() {
                    let destroy = matches!(envelope.kind, MessageKind::Destroy);
                    if let Some(response) = host.handle(envelope) {
                        if response_tx.send(response).is_err() {
                            // Director side is gone; nothing left to do.
                            break;
                        }
                    }
                    if destroy {
                        break;
                    }
                }
                debug!("backend worker exiting");
            })?;

        Ok(Self {
            requests: Some(request_tx),
            responses: response_rx,
            thread: Some(thread),
        })
    }

    /// Queues an envelope for the worker. Sends after the worker has gone
    /// down (destroyed or panicked) are no-ops.
    pub fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        let destroy = matches!(envelope.kind, MessageKind::Destroy);
        let Some(requests) = self.requests.as_ref() else {
            debug!("worker link destroyed; dropping {:?} envelope", envelope.kind);
            return Ok(());
        };
        if requests.send(envelope).is_err() {
            debug!("backend worker already exited; dropping envelope");
        }
        if destroy {
            // Closing the channel lets the worker drain and exit even if
            // it never saw the destroy (e.g. it already panicked).
            self.requests = None;
        }
        Ok(())
    }

    pub fn poll(&mut self) -> Option<Envelope> {
        self.responses.try_recv().ok()
    }

    pub fn is_alive(&self) -> bool {
        self.requests.is_some()
    }

    fn join(&mut self) {
        self.requests = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("backend worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        self.join();
    }
}
