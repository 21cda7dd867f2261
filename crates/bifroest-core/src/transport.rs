//! Byte stream with two named endpoints.
//!
//! A [`Transport`] is whatever carries the master/imp protocol: a TCP socket,
//! a pair of OS pipes (stdio), or the stdio of a spawned imp process. Above
//! this layer everything is a plain `AsyncRead + AsyncWrite`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ImpError, ImpResult};
use crate::messages::DEFAULT_PORT;

/// Anything that can carry the protocol.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

/// A connected byte stream plus descriptive names of both ends.
pub struct Transport {
    stream: Box<dyn Stream>,
    local: String,
    remote: String,
    // Keeps a spawned imp alive; it is killed when the transport is dropped.
    _child: Option<Child>,
}

impl Transport {
    pub fn new(stream: impl Stream, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            local: local.into(),
            remote: remote.into(),
            _child: None,
        }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        let local = describe(stream.local_addr());
        let remote = describe(stream.peer_addr());
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%remote, error = %e, "cannot disable nagle");
        }
        Self::new(stream, local, remote)
    }

    /// Adopt the process's own stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(
            PipePair::new(tokio::io::stdin(), tokio::io::stdout()),
            "stdio",
            "parent",
        )
    }

    /// Use the stdin/stdout pipes of a spawned child.
    pub fn process(mut child: Child, name: impl Into<String>) -> ImpResult<Self> {
        let name = name.into();
        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(ImpError::Unreachable(format!(
                "process {name} was spawned without piped stdio"
            )));
        };
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        let mut transport = Self::new(PipePair::new(stdout, stdin), "parent", format!("{name}[{pid}]"));
        transport._child = Some(child);
        Ok(transport)
    }

    /// Two transports connected back to back, for tests and in-process use.
    pub fn in_memory_pair(buffer: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(buffer);
        (Self::new(a, "memory:a", "memory:b"), Self::new(b, "memory:b", "memory:a"))
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

fn describe(addr: io::Result<std::net::SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|_| "unknown".into())
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A read pipe and a write pipe presented as one duplex stream.
#[derive(Debug)]
pub struct PipePair<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> PipePair<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for PipePair<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for PipePair<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

// ── Endpoints ────────────────────────────────────────────────────────

/// Where the master reaches an imp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host[:port]`; the port defaults to [`DEFAULT_PORT`].
    Tcp(String),
    /// Spawn the imp and talk to it over its stdio.
    Process { program: PathBuf, args: Vec<String> },
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    /// Establish a transport to this endpoint.
    ///
    /// Dial failures are `Unreachable`; cancellation yields `Timeout`.
    pub async fn dial(&self, cancel: &CancellationToken) -> ImpResult<Transport> {
        match self {
            Endpoint::Tcp(addr) => {
                let target = with_default_port(addr, DEFAULT_PORT);
                debug!(target = %target, "dialing imp");
                let stream = tokio::select! {
                    _ = cancel.cancelled() => return Err(ImpError::Timeout),
                    r = TcpStream::connect(&target) => r.map_err(|e| {
                        ImpError::Unreachable(format!("cannot connect to {target}: {e}"))
                    })?,
                };
                Ok(Transport::tcp(stream))
            }
            Endpoint::Process { program, args } => {
                debug!(program = %program.display(), ?args, "spawning imp");
                let child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        ImpError::Unreachable(format!("cannot start {}: {e}", program.display()))
                    })?;
                Transport::process(child, program.display().to_string())
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", with_default_port(addr, DEFAULT_PORT)),
            Endpoint::Process { program, .. } => write!(f, "exec://{}", program.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ImpError;

    /// Accepts `host[:port]`, `tcp://host[:port]` and `exec:///path/to/imp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("exec://") {
            let mut parts = rest.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| ImpError::InvalidParameters("empty exec endpoint".into()))?;
            return Ok(Endpoint::Process {
                program: PathBuf::from(program),
                args: parts.map(str::to_string).collect(),
            });
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        if addr.is_empty() {
            return Err(ImpError::InvalidParameters("empty endpoint".into()));
        }
        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

/// Append `port` to `addr` unless it already names one.
pub fn with_default_port(addr: &str, port: u16) -> String {
    if addr.parse::<std::net::SocketAddr>().is_ok() {
        return addr.to_string();
    }
    if addr.starts_with('[') && addr.ends_with(']') {
        return format!("{addr}:{port}");
    }
    match addr.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => addr.to_string(),
        // Bare IPv6 literal.
        Some(_) => format!("[{addr}]:{port}"),
        None => format!("{addr}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn default_port_handling() {
        assert_eq!(with_default_port("imp.local", 8683), "imp.local:8683");
        assert_eq!(with_default_port("imp.local:22", 8683), "imp.local:22");
        assert_eq!(with_default_port("10.0.0.1", 8683), "10.0.0.1:8683");
        assert_eq!(with_default_port("[::1]", 8683), "[::1]:8683");
        assert_eq!(with_default_port("::1", 8683), "[::1]:8683");
        assert_eq!(with_default_port("[::1]:9000", 8683), "[::1]:9000");
    }

    #[test]
    fn parse_endpoints() {
        assert_eq!("tcp://a:1".parse::<Endpoint>().unwrap(), Endpoint::tcp("a:1"));
        assert_eq!("a".parse::<Endpoint>().unwrap(), Endpoint::tcp("a"));
        assert_eq!(
            "exec:///usr/bin/bifroest-imp serve --stdio".parse::<Endpoint>().unwrap(),
            Endpoint::Process {
                program: PathBuf::from("/usr/bin/bifroest-imp"),
                args: vec!["serve".into(), "--stdio".into()],
            }
        );
        assert!("".parse::<Endpoint>().is_err());
        assert_eq!(Endpoint::tcp("a").to_string(), "tcp://a:8683");
    }

    #[tokio::test]
    async fn refused_dial_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Endpoint::tcp(addr.to_string())
            .dial(&CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ImpError::Unreachable(_))));
    }

    #[tokio::test]
    async fn cancelled_dial_is_timeout() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // A non-routable address keeps connect pending until cancellation wins.
        let result = Endpoint::tcp("10.255.255.1:9").dial(&cancel).await;
        assert!(matches!(
            result,
            Err(ImpError::Timeout) | Err(ImpError::Unreachable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_endpoint_talks_over_stdio() {
        let endpoint = Endpoint::Process {
            program: PathBuf::from("cat"),
            args: vec![],
        };
        let mut transport = endpoint.dial(&CancellationToken::new()).await.unwrap();
        assert!(transport.remote().starts_with("cat["));
        transport.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn in_memory_pair_is_connected() {
        let (mut a, mut b) = Transport::in_memory_pair(64);
        a.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(a.remote(), b.local());
    }
}
