//! `bifroest-imp serve` — run the imp service.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use bifroest_core::{fingerprint, EXIT_CODE_INTENTIONAL};
use bifroest_imp::{Binding, ImpConfig, Overrides, ServeOutcome, Service};

#[derive(Args)]
pub struct ServeArgs {
    /// Listen address (host:port)
    #[arg(long, conflicts_with = "stdio")]
    listen: Option<String>,

    /// Serve a single master over stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// Private key file; generated when missing
    #[arg(long)]
    key_file: Option<String>,

    /// Trust anchor: the master's public key in OpenSSH form
    #[arg(long, env = "BIFROEST_IMP_MASTER_PUBLIC_KEY", hide_env_values = true)]
    master_public_key: Option<String>,

    /// Hex encoded access token masters must prove
    #[arg(long, env = "BIFROEST_IMP_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Accept masters without a key when no trust anchor is set
    #[arg(long)]
    allow_unauthenticated: bool,

    /// Directory with recorded per-connection exit codes
    #[arg(long)]
    exit_code_dir: Option<String>,

    /// Directory for agent and named pipe sockets
    #[arg(long)]
    socket_dir: Option<String>,
}

/// Serve until shutdown. Returns the exit code a master asked for.
pub async fn run(config_path: &str, args: ServeArgs) -> Result<Option<i32>> {
    let config = ImpConfig::load(
        Path::new(config_path),
        Overrides {
            listen: args.listen,
            key_file: args.key_file,
            master_public_key: args.master_public_key,
            access_token: args.access_token,
            allow_unauthenticated: args.allow_unauthenticated,
            exit_code_dir: args.exit_code_dir,
            socket_dir: args.socket_dir,
        },
    )
    .context("failed to load config")?;

    let key = config
        .key_requirement
        .ensure_file(&config.key_file)
        .with_context(|| format!("cannot load key file {}", config.key_file.display()))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        fingerprint = %fingerprint(key.public_key()),
        "starting bifroest-imp"
    );

    let mut service = Service::new(key, config.trust_anchor)
        .with_restriction(config.restriction)
        .allow_unauthenticated(config.allow_unauthenticated)
        .with_handshake_timeout(config.handshake_timeout);
    if let Some(token) = config.access_token {
        service = service.with_access_token(token);
    }
    if let Some(dir) = config.exit_code_dir {
        service = service.with_exit_code_dir(dir);
    }
    if let Some(dir) = config.socket_dir {
        service = service.with_socket_dir(dir);
    }

    let binding = if args.stdio {
        Binding::Stdio
    } else {
        Binding::Tcp(config.listen)
    };

    let cancel = CancellationToken::new();
    let serve = service.serve(&cancel, binding);
    tokio::pin!(serve);
    let outcome = tokio::select! {
        r = &mut serve => r,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            cancel.cancel();
            serve.await
        }
    }
    .context("imp failed")?;

    match outcome {
        ServeOutcome::Exit(code) => {
            info!(code, intentional = code == EXIT_CODE_INTENTIONAL, "exiting on master request");
            Ok(Some(code))
        }
        ServeOutcome::Closed => {
            info!("bifroest-imp stopped");
            Ok(None)
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
