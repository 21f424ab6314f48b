//! A JSON-RPC 2.0 switching broker.
//!
//! `rpcswitch` accepts connections from clients that call methods and
//! workers that implement them, authenticates both, checks every call
//! against an ACL policy, and relays traffic between the chosen pair over
//! a virtual channel.  Application methods never run in this process.
//!
//! # Command-line interface
//!
//! `rpcswitch` uses the [`clap`](https://docs.rs/clap/) crate for
//! command-line argument parsing; run `rpcswitch --help` for the details.
//! The only required piece of configuration is the config file, by
//! default `rpcswitch.toml` in the working directory.
//!
//! # Configuration
//!
//! Two TOML files: the main config (listeners, auth tables, logging,
//! tunables) and the policy file it points at (ACLs, methods, backends,
//! filters).  Send SIGHUP to reload the policy without dropping
//! connections; see `rpcswitch.example.toml` and `policy.example.toml`.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::unwrap_used)]
#![allow(clippy::print_stderr)] // Allowed in this crate only.
#![allow(clippy::print_stdout)] // Allowed in this crate only.

mod cfg;
mod process;
mod reload;
mod trace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{info, warn};

use rpcswitch_broker::{Broker, Policy, StaticTokenBackend};

use crate::cfg::{ListenerConfig, SwitchConfig};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "rpcswitch.toml")]
    config: PathBuf,

    /// Override the console log filter, e.g. "debug" or
    /// "rpcswitch_broker=trace,info".
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = SwitchConfig::load(&args.config)?;
    let _log_guards = trace::setup_logging(&cfg.logging, args.log_level.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("could not start async runtime")?;
    runtime.block_on(run(cfg))
}

/// Bring the switch up and run it until a shutdown signal arrives.
async fn run(cfg: SwitchConfig) -> Result<()> {
    process::use_max_file_limit();

    let policy = Policy::load_path(&cfg.policy)
        .with_context(|| format!("could not load policy from {}", cfg.policy.display()))?;
    let auth = Arc::new(StaticTokenBackend::new(cfg.auth.clone()));
    let broker = Broker::new(policy, auth, cfg.broker_options());

    reload::watch_for_policy_reload(&broker, cfg.policy.clone())?;

    if cfg.listeners.is_empty() {
        bail!("no listeners configured; nothing to do");
    }
    let mut listeners: JoinSet<std::io::Result<()>> = JoinSet::new();
    for listener in &cfg.listeners {
        match listener {
            ListenerConfig::Tcp(addr) => {
                let socket = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("could not listen on {}", addr))?;
                listeners.spawn(rpcswitch_broker::accept_tcp(Arc::clone(&broker), socket));
            }
            #[cfg(unix)]
            ListenerConfig::Unix(path) => {
                // A previous run may have left its socket file behind.
                match std::fs::remove_file(path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        return Err(e)
                            .with_context(|| format!("could not remove {}", path.display()));
                    }
                    _ => {}
                }
                let socket = tokio::net::UnixListener::bind(path)
                    .with_context(|| format!("could not listen on {}", path.display()))?;
                listeners.spawn(rpcswitch_broker::accept_unix(Arc::clone(&broker), socket));
            }
            #[cfg(not(unix))]
            ListenerConfig::Unix(path) => {
                bail!("unix listener {} unsupported on this platform", path.display());
            }
        }
    }
    info!("rpcswitch is up with {} listener(s)", cfg.listeners.len());

    tokio::select! {
        () = wait_for_shutdown() => {}
        joined = listeners.join_next() => {
            match joined {
                Some(Ok(Err(e))) => warn!("listener failed: {}", e),
                Some(Err(e)) => warn!("listener task died: {}", e),
                _ => {}
            }
        }
    }

    info!("shutting down");
    broker.shutdown().await;
    Ok(())
}

/// Resolve when the process is asked to stop.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("could not install SIGINT handler: {}", e);
            return std::future::pending().await;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("could not install SIGTERM handler: {}", e);
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}

/// Resolve when the process is asked to stop.
#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("could not wait for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("interrupt received");
}
