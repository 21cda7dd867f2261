//! bifroest-imp: Bifröst imp agent.
//!
//! Runs inside a target environment and serves one authenticated master at a
//! time, over TCP or over stdio when launched by the master itself.

mod commands;

use clap::{Parser, Subcommand};
use tracing::error;

/// bifroest-imp — Bifröst imp agent
#[derive(Parser)]
#[command(name = "bifroest-imp", version, about = "Bifröst imp agent")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.bifroest/imp.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve masters
    Serve(commands::serve::ServeArgs),

    /// Ensure a key file exists and print its public key
    Keygen(commands::keygen::KeygenArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout may carry the protocol; logs go to stderr.
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = match cli.command {
        Command::Serve(args) => commands::serve::run(&cli.config, args).await,
        Command::Keygen(args) => commands::keygen::run(args),
    };

    match result {
        // Exit explicitly: a blocked stdin reader would keep the runtime alive.
        Ok(code) => std::process::exit(code.unwrap_or(0)),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("bifroest-imp: {e:#}");
            std::process::exit(1);
        }
    }
}
