//! Tunnel handlers: bridge channels opened by the master to local resources.

use std::path::{Path, PathBuf};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use bifroest_core::messages::{RemoteError, RemoteErrorKind};
use bifroest_core::{
    full_duplex_copy, ConnectionId, CopyOpts, CopyReport, ImpError, ImpResult, IncomingChannel,
    MuxConn, TunnelOpen, TunnelReply,
};

/// Everything a tunnel task needs from its connection.
#[derive(Clone)]
pub(crate) struct Tunnels {
    conn: MuxConn,
    socket_dir: PathBuf,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Tunnels {
    pub(crate) fn new(
        conn: MuxConn,
        socket_dir: PathBuf,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            socket_dir,
            tracker,
            cancel,
        }
    }

    /// Serve channels opened by the master until the connection goes away.
    pub(crate) async fn run(self) {
        while let Some(incoming) = self.conn.accept().await {
            let tunnels = self.clone();
            self.tracker.spawn(async move { tunnels.serve(incoming).await });
        }
    }

    async fn serve(&self, incoming: IncomingChannel) {
        match incoming.request().clone() {
            TunnelOpen::TcpForward {
                connection_id,
                host,
                port,
            } => self.tcp_forward(incoming, connection_id, &host, port).await,
            TunnelOpen::AgentForward { connection_id } => {
                self.agent_forward(incoming, connection_id).await
            }
            TunnelOpen::NamedPipe {
                connection_id,
                name,
            } => self.named_pipe(incoming, connection_id, &name).await,
            TunnelOpen::NamedPipeConn { .. } => incoming.reject(RemoteError::new(
                RemoteErrorKind::Unsupported,
                "imp does not accept named pipe connections",
            )),
        }
    }

    fn copy_opts(&self, connection_id: ConnectionId, kind: &'static str) -> CopyOpts {
        CopyOpts::new()
            .tracked_by(self.tracker.clone())
            .on_end(move |report: &CopyReport| {
                debug!(
                    connection_id = %connection_id,
                    kind,
                    sent = report.left_to_right,
                    received = report.right_to_left,
                    duration_ms = report.duration.as_millis() as u64,
                    failed = ?report.failed_direction,
                    "tunnel finished"
                );
            })
    }

    // ── TCP forward ──────────────────────────────────────────────────

    async fn tcp_forward(
        &self,
        incoming: IncomingChannel,
        connection_id: ConnectionId,
        host: &str,
        port: u16,
    ) {
        let target = bifroest_core::transport::with_default_port(host, port);
        debug!(connection_id = %connection_id, %target, "tcp forward requested");
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = TcpStream::connect(&target) => r,
        };
        let tcp = match connected {
            Ok(tcp) => tcp,
            Err(e) => {
                debug!(connection_id = %connection_id, %target, error = %e, "tcp forward target unreachable");
                incoming.reject(RemoteError::new(
                    RemoteErrorKind::Unreachable,
                    format!("cannot connect to {target}: {e}"),
                ));
                return;
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(connection_id = %connection_id, error = %e, "cannot disable nagle on tcp forward");
        }
        let stream = match incoming.accept(TunnelReply::Connected) {
            Ok(s) => s,
            Err(_) => return,
        };
        let opts = self.copy_opts(connection_id, "tcp-forward");
        if let Err(e) = full_duplex_copy(&self.cancel, stream, tcp, opts).await {
            debug!(connection_id = %connection_id, error = %e, "tcp forward failed");
        }
    }

    // ── Agent forward ────────────────────────────────────────────────

    #[cfg(unix)]
    async fn agent_forward(&self, incoming: IncomingChannel, connection_id: ConnectionId) {
        let path = self.socket_dir.join(format!("agent-{connection_id}.sock"));
        let socket = match BoundSocket::bind(&path) {
            Ok(s) => s,
            Err(e) => {
                incoming.reject(RemoteError::from(&e));
                return;
            }
        };
        let stream = match incoming.accept(TunnelReply::AgentSocket {
            path: path.display().to_string(),
        }) {
            Ok(s) => s,
            Err(_) => return,
        };
        debug!(connection_id = %connection_id, path = %path.display(), "agent socket ready");

        // The socket serves exactly one agent connection.
        let accepted = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = socket.listener.accept() => r,
        };
        drop(socket);
        match accepted {
            Ok((local, _)) => {
                let opts = self.copy_opts(connection_id, "agent-forward");
                if let Err(e) = full_duplex_copy(&self.cancel, stream, local, opts).await {
                    debug!(connection_id = %connection_id, error = %e, "agent forward failed");
                }
            }
            Err(e) => warn!(connection_id = %connection_id, error = %e, "cannot accept agent connection"),
        }
    }

    #[cfg(not(unix))]
    async fn agent_forward(&self, incoming: IncomingChannel, _connection_id: ConnectionId) {
        incoming.reject(RemoteError::new(
            RemoteErrorKind::Unsupported,
            "agent forwarding requires unix domain sockets",
        ));
    }

    // ── Named pipe ───────────────────────────────────────────────────

    #[cfg(unix)]
    async fn named_pipe(&self, incoming: IncomingChannel, connection_id: ConnectionId, name: &str) {
        use tokio::io::AsyncReadExt;

        let path = match pipe_path(&self.socket_dir, name) {
            Ok(p) => p,
            Err(e) => {
                incoming.reject(RemoteError::from(&e));
                return;
            }
        };
        let socket = match BoundSocket::bind(&path) {
            Ok(s) => s,
            Err(e) => {
                incoming.reject(RemoteError::from(&e));
                return;
            }
        };
        let mut control = match incoming.accept(TunnelReply::PipeBound {
            path: path.display().to_string(),
        }) {
            Ok(s) => s,
            Err(_) => return,
        };
        debug!(connection_id = %connection_id, path = %path.display(), "named pipe bound");

        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                // The master never writes here; EOF or an error means the listener closed.
                r = control.read(&mut scratch) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
                r = socket.listener.accept() => match r {
                    Ok((local, _)) => {
                        let tunnels = self.clone();
                        self.tracker.spawn(async move {
                            tunnels.named_pipe_conn(connection_id, local).await
                        });
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot accept named pipe connection");
                        break;
                    }
                },
            }
        }
        debug!(connection_id = %connection_id, path = %path.display(), "named pipe closed");
    }

    #[cfg(unix)]
    async fn named_pipe_conn(&self, connection_id: ConnectionId, local: tokio::net::UnixStream) {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.conn.open(TunnelOpen::NamedPipeConn { connection_id }) => r,
        };
        let stream = match opened {
            Ok((TunnelReply::Accepted, stream)) => stream,
            Ok((other, _)) => {
                warn!(connection_id = %connection_id, reply = ?other, "unexpected reply for named pipe connection");
                return;
            }
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "master refused named pipe connection");
                return;
            }
        };
        let opts = self.copy_opts(connection_id, "named-pipe");
        if let Err(e) = full_duplex_copy(&self.cancel, stream, local, opts).await {
            debug!(connection_id = %connection_id, error = %e, "named pipe connection failed");
        }
    }

    #[cfg(not(unix))]
    async fn named_pipe(&self, incoming: IncomingChannel, _connection_id: ConnectionId, _name: &str) {
        incoming.reject(RemoteError::new(
            RemoteErrorKind::Unsupported,
            "named pipes are not supported on this platform",
        ));
    }
}

/// Location of the named pipe `name` inside `dir`.
fn pipe_path(dir: &Path, name: &str) -> ImpResult<PathBuf> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if !valid {
        return Err(ImpError::InvalidParameters(format!(
            "invalid named pipe name {name:?}"
        )));
    }
    Ok(dir.join(name))
}

/// A unix listener whose socket file is removed on drop.
#[cfg(unix)]
struct BoundSocket {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl BoundSocket {
    fn bind(path: &Path) -> ImpResult<Self> {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

        if let Some(parent) = path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }
        if path.exists() {
            return Err(ImpError::InvalidParameters(format!(
                "{} is already in use",
                path.display()
            )));
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }
}

#[cfg(unix)]
impl Drop for BoundSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_cannot_escape_the_socket_dir() {
        let dir = Path::new("/run/bifroest");
        assert_eq!(pipe_path(dir, "docker").unwrap(), dir.join("docker"));
        for bad in ["", ".", "..", "../etc/passwd", "a/b", "a\\b"] {
            assert!(
                matches!(pipe_path(dir, bad), Err(ImpError::InvalidParameters(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bound_socket_is_private_and_removed_on_drop() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("s.sock");
        let socket = BoundSocket::bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(matches!(
            BoundSocket::bind(&path),
            Err(ImpError::InvalidParameters(_))
        ));
        drop(socket);
        assert!(!path.exists());
    }
}
