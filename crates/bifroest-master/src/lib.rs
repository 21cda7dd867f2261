//! bifroest-master: Gateway-side client for the Bifröst imp protocol.
//!
//! A [`Master`] dials an imp, authenticates it and hands out one [`Session`]
//! per login. Sessions issue control calls and open tunnels whose bytes are
//! multiplexed over the same transport.
//!
//! # Quick Start
//!
//! ```no_run
//! use bifroest_master::{Master, Ref};
//! use bifroest_core::{CancellationToken, ConnectionId, Endpoint, KeyRequirement, SessionId};
//!
//! # async fn example(imp_key: bifroest_core::PublicKey) -> bifroest_core::ImpResult<()> {
//! let master = Master::new(KeyRequirement::default().generate()?);
//! let target = Ref::new(imp_key, Endpoint::tcp("10.0.0.7"));
//! let cancel = CancellationToken::new();
//!
//! let session = master.open(&cancel, SessionId::new(), &target).await?;
//! let reply = session.echo(&cancel, ConnectionId::new(), "hello").await?;
//! assert_eq!(reply, "thanks for: hello");
//!
//! master.close().await;
//! # Ok(())
//! # }
//! ```

pub mod master;
pub mod pipe;
mod rpc;
pub mod session;

pub use master::{Master, Ref, DEFAULT_HANDSHAKE_TIMEOUT};
pub use pipe::PipeListener;
pub use session::Session;

pub use bifroest_core::{ImpError, ImpResult};
