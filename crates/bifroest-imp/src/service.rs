//! The imp's serve loop.
//!
//! ```text
//! Idle ──▶ AwaitingHandshake ──▶ Authenticated ──▶ Serving ──▶ Closed
//!                  │                                              ▲
//!                  └──────────────── auth failure ────────────────┘
//! ```
//!
//! One connection is served at a time. A listening imp goes back to `Idle`
//! after a connection ends or fails to authenticate; an imp adopting a single
//! transport (stdio) stops instead.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use bifroest_core::codec::{read_frame, write_frame};
use bifroest_core::handshake::{self, ImpHandshake};
use bifroest_core::messages::{RemoteError, Request, Response};
use bifroest_core::wait::Backoff;
use bifroest_core::{
    fingerprint, AccessToken, Call, ImpError, ImpResult, KeyedMutex, MuxConn, MuxStream,
    PrivateKey, PublicKey, Restriction, Side, Transport,
};

use crate::dispatch::Dispatcher;
use crate::tunnels::Tunnels;

/// Default limit for a master to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an exiting imp waits for its acknowledgement to leave.
const EXIT_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of the imp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    AwaitingHandshake,
    Authenticated,
    Serving,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Idle => "idle",
            State::AwaitingHandshake => "awaiting-handshake",
            State::Authenticated => "authenticated",
            State::Serving => "serving",
            State::Closed => "closed",
        })
    }
}

/// Where the imp takes its connections from.
pub enum Binding {
    /// Listen on `host:port`.
    Tcp(String),
    /// Accept on an already bound listener.
    Listener(TcpListener),
    /// Serve exactly one master over stdin/stdout.
    Stdio,
    /// Serve exactly one master over the given transport.
    Transport(Transport),
}

/// Why [`Service::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Cancelled, or the single adopted connection ended.
    Closed,
    /// The master asked the imp to exit with this code.
    Exit(i32),
}

/// The imp service.
///
/// The trust anchor is part of the service, so several imps with different
/// anchors can run in one process.
pub struct Service {
    key: PrivateKey,
    trust_anchor: Option<PublicKey>,
    restriction: Restriction,
    token: Option<AccessToken>,
    allow_unauthenticated: bool,
    exit_code_dir: Option<PathBuf>,
    socket_dir: PathBuf,
    handshake_timeout: Duration,
    kills: Arc<KeyedMutex<u32>>,
    state: watch::Sender<State>,
}

impl Service {
    /// An imp identified by `key` that accepts only the master holding
    /// `trust_anchor`.
    pub fn new(key: PrivateKey, trust_anchor: Option<PublicKey>) -> Self {
        if trust_anchor.is_none() {
            warn!("imp has no trust anchor; only unauthenticated masters could connect");
        }
        Self {
            key,
            trust_anchor,
            restriction: Restriction::default(),
            token: None,
            allow_unauthenticated: false,
            exit_code_dir: None,
            socket_dir: std::env::temp_dir().join("bifroest"),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            kills: Arc::new(KeyedMutex::new()),
            state: watch::channel(State::Idle).0,
        }
    }

    /// Minimum strength required of the master's key.
    pub fn with_restriction(mut self, restriction: Restriction) -> Self {
        self.restriction = restriction;
        self
    }

    /// Require masters to prove knowledge of `token`.
    pub fn with_access_token(mut self, token: AccessToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Accept masters without a key when no trust anchor is configured.
    pub fn allow_unauthenticated(mut self, allow: bool) -> Self {
        self.allow_unauthenticated = allow;
        self
    }

    /// Directory holding `<connection id>` files with recorded exit codes.
    pub fn with_exit_code_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exit_code_dir = Some(dir.into());
        self
    }

    /// Directory for agent and named pipe sockets.
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn public_key(&self) -> &PublicKey {
        self.key.public_key()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    fn transition(&self, to: State) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!(%from, %to, "imp state changed");
        }
    }

    /// Serve masters until `cancel` fires or a master requests an exit.
    ///
    /// Listening bindings keep going after rejected or finished connections.
    /// Single-transport bindings serve one master; a failed handshake is
    /// returned as an error there.
    pub async fn serve(&self, cancel: &CancellationToken, binding: Binding) -> ImpResult<ServeOutcome> {
        let outcome = match binding {
            Binding::Tcp(addr) => {
                let listener = TcpListener::bind(&addr).await?;
                self.serve_listener(cancel, listener).await
            }
            Binding::Listener(listener) => self.serve_listener(cancel, listener).await,
            Binding::Stdio => self.serve_once(cancel, Transport::stdio()).await,
            Binding::Transport(transport) => self.serve_once(cancel, transport).await,
        };
        self.transition(State::Closed);
        outcome
    }

    async fn serve_once(&self, cancel: &CancellationToken, transport: Transport) -> ImpResult<ServeOutcome> {
        Ok(match self.serve_connection(cancel, transport).await? {
            Some(code) => ServeOutcome::Exit(code),
            None => ServeOutcome::Closed,
        })
    }

    async fn serve_listener(
        &self,
        cancel: &CancellationToken,
        listener: TcpListener,
    ) -> ImpResult<ServeOutcome> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "imp listening");
        }
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(5));
        loop {
            self.transition(State::Idle);
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(ServeOutcome::Closed),
                r = listener.accept() => r,
            };
            let (tcp, peer) = match accepted {
                Ok(a) => {
                    backoff.reset();
                    a
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = backoff.current().as_millis() as u64, "accept failed");
                    if backoff.wait(cancel).await.is_err() {
                        return Ok(ServeOutcome::Closed);
                    }
                    continue;
                }
            };
            debug!(peer = %peer, "master connected");
            match self.serve_connection(cancel, Transport::tcp(tcp)).await {
                Ok(Some(code)) => return Ok(ServeOutcome::Exit(code)),
                Ok(None) => debug!(peer = %peer, "connection finished"),
                Err(e) if e.is_expected() => debug!(peer = %peer, error = %e, "connection ended"),
                Err(e) => warn!(peer = %peer, error = %e, "rejected connection"),
            }
        }
    }

    /// Authenticate and serve one master. Returns the exit code it asked for.
    async fn serve_connection(
        &self,
        cancel: &CancellationToken,
        transport: Transport,
    ) -> ImpResult<Option<i32>> {
        self.transition(State::AwaitingHandshake);
        let params = ImpHandshake {
            key: &self.key,
            trust_anchor: self.trust_anchor.as_ref(),
            restriction: &self.restriction,
            token: self.token.as_ref(),
            allow_unauthenticated: self.allow_unauthenticated,
        };
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            r = tokio::time::timeout(self.handshake_timeout, handshake::respond(transport, params)) => {
                r.map_err(|_| ImpError::Timeout).and_then(|r| r)
            }
        };
        let (transport, accepted) = match accepted {
            Ok(a) => a,
            Err(e) => {
                self.transition(State::Closed);
                return Err(e);
            }
        };
        self.transition(State::Authenticated);
        info!(
            session_id = %accepted.session_id,
            remote = %transport.remote(),
            master = %accepted
                .master_key
                .as_ref()
                .map(fingerprint)
                .unwrap_or_else(|| "unauthenticated".to_string()),
            "master authenticated"
        );

        let conn_cancel = cancel.child_token();
        let (conn, control) = MuxConn::start(transport, Side::Imp, &conn_cancel);
        let tracker = TaskTracker::new();
        let tunnels = Tunnels::new(
            conn.clone(),
            self.socket_dir.clone(),
            tracker.clone(),
            conn_cancel.clone(),
        );
        tracker.spawn(tunnels.run());
        self.transition(State::Serving);

        let dispatcher = Dispatcher::new(self.kills.clone(), self.exit_code_dir.clone());
        let exit = control_loop(control, &dispatcher).await;
        if exit.is_some() {
            // Give the acknowledgement a moment to reach the master.
            let _ = tokio::time::timeout(EXIT_GRACE, conn.closed()).await;
        }

        conn_cancel.cancel();
        conn.close();
        tracker.close();
        tracker.wait().await;
        conn.wait().await;
        self.transition(State::Closed);
        info!(session_id = %accepted.session_id, "session ended");
        Ok(exit)
    }
}

/// Answer calls in receipt order until the channel ends or an exit is requested.
async fn control_loop(control: MuxStream, dispatcher: &Dispatcher) -> Option<i32> {
    let (mut rd, mut wr) = tokio::io::split(control);
    loop {
        let request: Request = match read_frame(&mut rd).await {
            Ok(r) => r,
            Err(ImpError::Io(e)) if bifroest_core::is_closed_error(&e) => return None,
            Err(e) => {
                debug!(error = %e, "control channel ended");
                return None;
            }
        };
        let exit = match request.call {
            Call::Exit { code } => Some(code),
            _ => None,
        };
        let call = request.call.name();
        let result = dispatcher
            .handle(request.connection_id, request.call)
            .await
            .map_err(|e| {
                if e.is_expected() {
                    debug!(call, error = %e, "call failed");
                } else {
                    warn!(call, error = %e, "call failed");
                }
                RemoteError::from(&e)
            });
        let response = Response {
            seq: request.seq,
            result,
        };
        if let Err(e) = write_frame(&mut wr, &response).await {
            debug!(error = %e, "cannot answer call");
            return exit;
        }
        if exit.is_some() {
            let _ = wr.shutdown().await;
            return exit;
        }
    }
}
