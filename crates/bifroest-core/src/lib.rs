//! bifroest-core: Shared protocol library for the Bifröst master/imp channel.
//!
//! Provides CBOR messages and framing, key identities and restrictions, the
//! TLS layer with the mutual-authentication handshake on top, the channel
//! multiplexer, the duplex pump used by every tunnel, and the small
//! concurrency primitives they rely on.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod ids;
pub mod keygen;
pub mod keyed_mutex;
pub mod messages;
pub mod mux;
pub mod pump;
pub mod restriction;
pub mod tls;
pub mod token;
pub mod transport;
pub mod wait;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, frame_encode, read_frame, write_frame};
pub use error::{is_closed_error, ImpError, ImpResult};
pub use identity::{fingerprint, PrivateKey, PublicKey};
pub use ids::{ConnectionId, SessionId};
pub use keyed_mutex::KeyedMutex;
pub use keygen::{KeyRequirement, KeyType};
pub use messages::{Call, Outcome, Signal, TunnelOpen, TunnelReply, DEFAULT_PORT, EXIT_CODE_INTENTIONAL};
pub use mux::{IncomingChannel, MuxConn, MuxStream, Side};
pub use pump::{full_duplex_copy, CopyOpts, CopyReport, Direction};
pub use restriction::Restriction;
pub use token::AccessToken;
pub use transport::{Endpoint, Transport};

/// Cancellation handle passed to every blocking operation.
pub use tokio_util::sync::CancellationToken;
