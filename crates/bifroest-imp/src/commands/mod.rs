//! CLI subcommand implementations.

pub mod keygen;
pub mod serve;
