//! One authenticated master/imp connection bound to a login session.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use bifroest_core::messages::{RemoteError, RemoteErrorKind};
use bifroest_core::{
    fingerprint, Call, ConnectionId, ImpError, ImpResult, MuxConn, MuxStream, Outcome, PublicKey,
    SessionId, Signal, TunnelOpen, TunnelReply,
};

use crate::pipe::{PipeListener, PipeRegistry};
use crate::rpc::ControlClient;

struct Inner {
    id: SessionId,
    imp_key: PublicKey,
    conn: MuxConn,
    control: ControlClient,
    pipes: Arc<PipeRegistry>,
    tracker: TaskTracker,
}

/// A live protocol session. Cheap to clone; all clones share the connection.
///
/// Every operation takes a cancellation token and a [`ConnectionId`] that
/// identifies the call or tunnel attempt on both sides.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.conn.remote())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Wrap an established connection.
    pub(crate) fn start(id: SessionId, imp_key: PublicKey, conn: MuxConn, control: MuxStream) -> Self {
        let tracker = TaskTracker::new();
        let control = ControlClient::start(control, &tracker);
        let session = Self {
            inner: Arc::new(Inner {
                id,
                imp_key,
                conn,
                control,
                pipes: Arc::new(PipeRegistry::default()),
                tracker,
            }),
        };
        session
            .inner
            .tracker
            .spawn(accept_loop(session.inner.conn.clone(), session.inner.pipes.clone()));
        info!(
            session_id = %id,
            remote = %session.inner.conn.remote(),
            imp = %fingerprint(&session.inner.imp_key),
            "session established"
        );
        session
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The imp's verified public key.
    pub fn imp_public_key(&self) -> &PublicKey {
        &self.inner.imp_key
    }

    /// Whether the underlying connection is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed() || self.inner.control.is_closed()
    }

    /// Resolves once the session's connection is torn down.
    pub async fn closed(&self) {
        self.inner.conn.closed().await
    }

    /// Open channels on the connection, the control channel included.
    pub fn channel_count(&self) -> usize {
        self.inner.conn.channel_count()
    }

    /// Whether both handles refer to the same connection.
    pub(crate) fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn call(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
        call: Call,
    ) -> ImpResult<Outcome> {
        self.inner.control.call(cancel, connection_id, call).await
    }

    /// Liveness check without side effects.
    pub async fn ping(&self, cancel: &CancellationToken, connection_id: ConnectionId) -> ImpResult<()> {
        match self.call(cancel, connection_id, Call::Ping).await? {
            Outcome::Pong => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Round-trip `text` through the imp; it answers `"thanks for: " + text`.
    pub async fn echo(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
        text: &str,
    ) -> ImpResult<String> {
        let call = Call::Echo {
            text: text.to_string(),
        };
        match self.call(cancel, connection_id, call).await? {
            Outcome::Echoed { text } => Ok(text),
            other => Err(unexpected("echo", &other)),
        }
    }

    /// Deliver `signal` to process `pid` on the imp's host.
    ///
    /// Fails with `NoSuchProcess` when there is no such process.
    pub async fn kill(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
        pid: u32,
        signal: Signal,
    ) -> ImpResult<()> {
        match self.call(cancel, connection_id, Call::Kill { pid, signal }).await? {
            Outcome::Killed => Ok(()),
            other => Err(unexpected("kill", &other)),
        }
    }

    /// Ask the imp to terminate with `code`.
    ///
    /// Losing the connection while doing so counts as success; every later
    /// call fails with `ConnectionLost`.
    pub async fn exit(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
        code: i32,
    ) -> ImpResult<()> {
        match self.call(cancel, connection_id, Call::Exit { code }).await {
            Ok(Outcome::Exiting) | Err(ImpError::ConnectionLost) => Ok(()),
            Ok(other) => Err(unexpected("exit", &other)),
            Err(e) => Err(e),
        }
    }

    /// Environment variables of the imp process.
    pub async fn get_environment(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
    ) -> ImpResult<BTreeMap<String, String>> {
        match self.call(cancel, connection_id, Call::GetEnvironment).await? {
            Outcome::Environment { variables } => Ok(variables),
            other => Err(unexpected("get_environment", &other)),
        }
    }

    /// Exit code recorded on the imp for `connection_id`.
    ///
    /// Fails with `NotFound` while none has been recorded.
    pub async fn get_connection_exit_code(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
    ) -> ImpResult<i32> {
        match self
            .call(cancel, connection_id, Call::GetConnectionExitCode)
            .await?
        {
            Outcome::ExitCode { code } => Ok(code),
            other => Err(unexpected("get_connection_exit_code", &other)),
        }
    }

    async fn open(&self, cancel: &CancellationToken, open: TunnelOpen) -> ImpResult<(TunnelReply, MuxStream)> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ImpError::Timeout),
            r = self.inner.conn.open(open) => r,
        }
    }

    /// Have the imp connect to `host:port` and tunnel the connection back.
    ///
    /// The caller owns the returned stream and closes it when done.
    pub async fn initiate_tcp_forward(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
        host: &str,
        port: u16,
    ) -> ImpResult<MuxStream> {
        let open = TunnelOpen::TcpForward {
            connection_id,
            host: host.to_string(),
            port,
        };
        match self.open(cancel, open).await? {
            (TunnelReply::Connected, stream) => {
                debug!(session_id = %self.inner.id, %host, port, "tcp forward established");
                Ok(stream)
            }
            (other, _) => Err(unexpected_reply("tcp forward", &other)),
        }
    }

    /// Have the imp create an SSH agent socket whose connection is tunnelled
    /// back here. Returns the stream and the socket path to export as
    /// `SSH_AUTH_SOCK` on the imp side.
    pub async fn initiate_agent_forward(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
    ) -> ImpResult<(MuxStream, String)> {
        match self.open(cancel, TunnelOpen::AgentForward { connection_id }).await? {
            (TunnelReply::AgentSocket { path }, stream) => {
                debug!(session_id = %self.inner.id, %path, "agent forward established");
                Ok((stream, path))
            }
            (other, _) => Err(unexpected_reply("agent forward", &other)),
        }
    }

    /// Bind a named endpoint on the imp; its connections come back through
    /// the returned listener.
    pub async fn initiate_named_pipe(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
        name: &str,
    ) -> ImpResult<PipeListener> {
        // Registered first: the imp may tunnel a connection right after binding.
        let incoming = self.inner.pipes.register(connection_id);
        let open = TunnelOpen::NamedPipe {
            connection_id,
            name: name.to_string(),
        };
        let result = self.open(cancel, open).await;
        match result {
            Ok((TunnelReply::PipeBound { path }, control)) => {
                debug!(session_id = %self.inner.id, %path, "named pipe bound");
                Ok(PipeListener::new(
                    connection_id,
                    path,
                    control,
                    incoming,
                    self.inner.pipes.clone(),
                ))
            }
            Ok((other, _)) => {
                self.inner.pipes.unregister(&connection_id);
                Err(unexpected_reply("named pipe", &other))
            }
            Err(e) => {
                self.inner.pipes.unregister(&connection_id);
                Err(e)
            }
        }
    }

    /// Close the session and every tunnel in it, then wait for all tasks.
    pub async fn close(&self) {
        if !self.inner.conn.is_closed() {
            debug!(session_id = %self.inner.id, "closing session");
        }
        self.inner.conn.close();
        self.inner.pipes.clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.conn.wait().await;
    }
}

/// Route channels opened by the imp.
async fn accept_loop(conn: MuxConn, pipes: Arc<PipeRegistry>) {
    while let Some(incoming) = conn.accept().await {
        match incoming.request() {
            TunnelOpen::NamedPipeConn { connection_id } => {
                let connection_id = *connection_id;
                if !pipes.contains(&connection_id) {
                    incoming.reject(RemoteError::new(
                        RemoteErrorKind::NotFound,
                        format!("no listener for named pipe {connection_id}"),
                    ));
                    continue;
                }
                match incoming.accept(TunnelReply::Accepted) {
                    // A listener closed in between drops the stream, which resets it.
                    Ok(stream) => {
                        let _ = pipes.deliver(&connection_id, stream);
                    }
                    Err(e) => debug!(error = %e, "cannot accept named pipe connection"),
                }
            }
            other => {
                let kind = other.kind();
                incoming.reject(RemoteError::new(
                    RemoteErrorKind::Unsupported,
                    format!("master does not serve {kind} channels"),
                ));
            }
        }
    }
}

fn unexpected(call: &str, outcome: &Outcome) -> ImpError {
    ImpError::Protocol(format!("unexpected outcome for {call}: {outcome:?}"))
}

fn unexpected_reply(what: &str, reply: &TunnelReply) -> ImpError {
    ImpError::Protocol(format!("unexpected reply to {what}: {reply:?}"))
}
