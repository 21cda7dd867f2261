//! Named endpoints bound on the imp whose connections are tunnelled back.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bifroest_core::{ConnectionId, ImpError, ImpResult, MuxStream};

/// Routes imp-opened connection channels to their listener.
#[derive(Default)]
pub(crate) struct PipeRegistry {
    listeners: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<MuxStream>>>,
}

impl PipeRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<MuxStream>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<MuxStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        rx
    }

    pub(crate) fn unregister(&self, id: &ConnectionId) {
        self.lock().remove(id);
    }

    pub(crate) fn contains(&self, id: &ConnectionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Hand a connection to its listener; gives it back if nobody listens.
    pub(crate) fn deliver(&self, id: &ConnectionId, stream: MuxStream) -> Result<(), MuxStream> {
        let sender = self.lock().get(id).cloned();
        match sender {
            Some(tx) => tx.send(stream).map_err(|e| e.0),
            None => Err(stream),
        }
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

/// A named pipe bound on the imp side.
///
/// Every connection a local client makes to [`PipeListener::path`] on the
/// imp shows up here as a stream. Closing the listener (or dropping it)
/// unbinds the endpoint on the imp.
pub struct PipeListener {
    connection_id: ConnectionId,
    path: String,
    control: Mutex<Option<MuxStream>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    registry: Arc<PipeRegistry>,
}

impl PipeListener {
    pub(crate) fn new(
        connection_id: ConnectionId,
        path: String,
        control: MuxStream,
        incoming: mpsc::UnboundedReceiver<MuxStream>,
        registry: Arc<PipeRegistry>,
    ) -> Self {
        Self {
            connection_id,
            path,
            control: Mutex::new(Some(control)),
            incoming: tokio::sync::Mutex::new(incoming),
            registry,
        }
    }

    /// Path of the endpoint on the imp.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next connection to the pipe.
    ///
    /// Fails with `ConnectionLost` once the listener or its session is closed.
    pub async fn accept_conn(&self, cancel: &CancellationToken) -> ImpResult<MuxStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(ImpError::Timeout),
            s = incoming.recv() => s.ok_or(ImpError::ConnectionLost),
        }
    }

    /// Unbind the pipe on the imp. Idempotent.
    pub fn close(&self) {
        let control = self.control.lock().unwrap_or_else(|e| e.into_inner()).take();
        if control.is_some() {
            debug!(path = %self.path, "closing named pipe listener");
        }
        self.registry.unregister(&self.connection_id);
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PipeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeListener")
            .field("connection_id", &self.connection_id)
            .field("path", &self.path)
            .finish()
    }
}
