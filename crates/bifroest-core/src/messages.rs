//! Protocol messages exchanged between master and imp.
//!
//! Every call kind and every tunnel kind is a variant of a closed enum, so
//! adding one is a compile-checked change on both sides.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ImpError;
use crate::ids::{ConnectionId, SessionId};

/// Version carried in the handshake `Hello`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default TCP port of an imp.
pub const DEFAULT_PORT: u16 = 8683;

/// Process exit code an imp uses when it terminates because of an `Exit` call.
pub const EXIT_CODE_INTENTIONAL: i32 = 666;

// ── Handshake ────────────────────────────────────────────────────────

/// First message, master → imp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub session_id: SessionId,
    pub nonce: Vec<u8>,
    /// OpenSSH encoding of the master's public key; absent in unauthenticated mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_proof: Option<Vec<u8>>,
}

/// Imp → master: the imp's identity plus its signature over the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub imp_key: String,
    pub nonce: Vec<u8>,
    pub signature: String,
}

/// Master → imp: the master's signature over the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Imp → master: final decision of the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Control channel ──────────────────────────────────────────────────

/// Signals the master may ask the imp to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Term,
    Kill,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Int => "SIGINT",
            Signal::Hup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
        };
        f.write_str(name)
    }
}

/// Call kinds carried on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    Ping,
    Echo { text: String },
    Kill { pid: u32, signal: Signal },
    Exit { code: i32 },
    GetEnvironment,
    GetConnectionExitCode,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Ping => "ping",
            Call::Echo { .. } => "echo",
            Call::Kill { .. } => "kill",
            Call::Exit { .. } => "exit",
            Call::GetEnvironment => "get_environment",
            Call::GetConnectionExitCode => "get_connection_exit_code",
        }
    }
}

/// A call as sent by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub connection_id: ConnectionId,
    pub call: Call,
}

/// Successful result of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pong,
    Echoed { text: String },
    Killed,
    Exiting,
    Environment { variables: BTreeMap<String, String> },
    ExitCode { code: i32 },
}

/// The imp's answer to a [`Request`], correlated by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub result: Result<Outcome, RemoteError>,
}

/// Category of an error reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NoSuchProcess,
    Unsupported,
    NotFound,
    Unreachable,
    InvalidParameters,
    Failed,
}

/// An error as transported over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pid: None,
        }
    }
}

impl From<&ImpError> for RemoteError {
    fn from(e: &ImpError) -> Self {
        match e {
            ImpError::NoSuchProcess(pid) => RemoteError {
                kind: RemoteErrorKind::NoSuchProcess,
                message: e.to_string(),
                pid: Some(*pid),
            },
            ImpError::Unsupported(m) => RemoteError::new(RemoteErrorKind::Unsupported, m.clone()),
            ImpError::NotFound(m) => RemoteError::new(RemoteErrorKind::NotFound, m.clone()),
            ImpError::Unreachable(m) => RemoteError::new(RemoteErrorKind::Unreachable, m.clone()),
            ImpError::InvalidParameters(m) => {
                RemoteError::new(RemoteErrorKind::InvalidParameters, m.clone())
            }
            other => RemoteError::new(RemoteErrorKind::Failed, other.to_string()),
        }
    }
}

impl From<RemoteError> for ImpError {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            RemoteErrorKind::NoSuchProcess => ImpError::NoSuchProcess(e.pid.unwrap_or_default()),
            RemoteErrorKind::Unsupported => ImpError::Unsupported(e.message),
            RemoteErrorKind::NotFound => ImpError::NotFound(e.message),
            RemoteErrorKind::Unreachable => ImpError::Unreachable(e.message),
            RemoteErrorKind::InvalidParameters => ImpError::InvalidParameters(e.message),
            RemoteErrorKind::Failed => ImpError::Remote(e.message),
        }
    }
}

// ── Tunnels ──────────────────────────────────────────────────────────

/// Kind of a multiplexed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Control,
    TcpForward,
    AgentForward,
    NamedPipe,
    NamedPipeConn,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Control => "control",
            ChannelKind::TcpForward => "tcp-forward",
            ChannelKind::AgentForward => "agent-forward",
            ChannelKind::NamedPipe => "named-pipe",
            ChannelKind::NamedPipeConn => "named-pipe-conn",
        };
        f.write_str(name)
    }
}

/// Payload of an OPEN frame: which tunnel to create and with what parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelOpen {
    TcpForward {
        connection_id: ConnectionId,
        host: String,
        port: u16,
    },
    AgentForward {
        connection_id: ConnectionId,
    },
    NamedPipe {
        connection_id: ConnectionId,
        name: String,
    },
    /// Opened by the imp for every connection accepted on a named pipe;
    /// `connection_id` is the one of the `NamedPipe` request that bound it.
    NamedPipeConn {
        connection_id: ConnectionId,
    },
}

impl TunnelOpen {
    pub fn kind(&self) -> ChannelKind {
        match self {
            TunnelOpen::TcpForward { .. } => ChannelKind::TcpForward,
            TunnelOpen::AgentForward { .. } => ChannelKind::AgentForward,
            TunnelOpen::NamedPipe { .. } => ChannelKind::NamedPipe,
            TunnelOpen::NamedPipeConn { .. } => ChannelKind::NamedPipeConn,
        }
    }
}

/// Payload of an OPEN_OK frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelReply {
    Connected,
    AgentSocket { path: String },
    PipeBound { path: String },
    Accepted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, cbor_encode};

    #[test]
    fn no_such_process_keeps_pid_across_the_wire() {
        let remote = RemoteError::from(&ImpError::NoSuchProcess(4711));
        let bytes = cbor_encode(&remote).unwrap();
        let back: RemoteError = cbor_decode(&bytes).unwrap();
        assert!(matches!(ImpError::from(back), ImpError::NoSuchProcess(4711)));
    }

    #[test]
    fn unknown_local_errors_become_failed() {
        let remote = RemoteError::from(&ImpError::Protocol("garbage".into()));
        assert_eq!(remote.kind, RemoteErrorKind::Failed);
        assert!(matches!(ImpError::from(remote), ImpError::Remote(_)));
    }

    #[test]
    fn tunnel_open_kind() {
        let open = TunnelOpen::NamedPipe {
            connection_id: ConnectionId::new(),
            name: "docker".into(),
        };
        assert_eq!(open.kind(), ChannelKind::NamedPipe);
        assert_eq!(open.kind().to_string(), "named-pipe");
    }

    #[test]
    fn response_carries_result() {
        let rsp = Response {
            seq: 3,
            result: Ok(Outcome::Echoed {
                text: "thanks for: x".into(),
            }),
        };
        let back: Response = cbor_decode(&cbor_encode(&rsp).unwrap()).unwrap();
        assert_eq!(back.seq, 3);
        assert_eq!(
            back.result.unwrap(),
            Outcome::Echoed {
                text: "thanks for: x".into()
            }
        );
    }
}
