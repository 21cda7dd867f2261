//! bifroest-imp: Target-side agent of the Bifröst protocol.
//!
//! The imp runs inside the target environment. It verifies the connecting
//! master against its trust anchor, answers control calls and bridges tunnel
//! channels to local TCP targets and unix sockets.

pub mod config;
mod dispatch;
pub mod service;
mod tunnels;

pub use config::{ImpConfig, Overrides};
pub use service::{Binding, ServeOutcome, Service, State};
