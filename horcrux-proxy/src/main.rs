// Copyright (C) 2024 Strangelove Ventures
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Process glue: parses the CLI, wires the configured `HorcruxConnection`
//! (listener pool or gRPC client), starts the sentry watcher, and waits for
//! SIGINT/SIGTERM before tearing everything down in reverse order.
//!
//! Grounded on `cmd/start.go` and `cmd/root.go`'s `runE`, collapsed into a
//! single `start` entry point per spec.md §6 (no cobra command tree here —
//! `start` is the only subcommand the original ships).

mod cli;
mod config;
mod discovery;
mod watcher;

use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use proxy_core::addr::{Endpoint, SentryAddr};
use proxy_core::grpc_client::HorcruxGrpcClient;
use proxy_core::horcrux_connection::HorcruxConnection;
use proxy_core::identity;
use proxy_core::load_balancer::{ListenerSignEndpoint, LoadBalancer, SignEndpoint};
use proxy_core::signer_listener::SignerListenerEndpoint;

use crate::cli::Cli;
use crate::config::Config;
use crate::discovery::KubeSentryDiscovery;
use crate::watcher::Watcher;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;

    let result = run(cli, runtime.handle().clone());
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "horcrux-proxy failed to start");
            Err(e)
        }
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Merges config-file and CLI-flag sentry/listen addresses (CLI wins on
/// overlap, matching spec.md §7's Configuration-error policy of failing
/// fast rather than silently picking one source).
fn merged_addresses(cli: &[String], from_config: Vec<String>) -> Vec<String> {
    let mut seen: std::collections::HashSet<String> = cli.iter().cloned().collect();
    let mut merged: Vec<String> = cli.to_vec();
    for addr in from_config {
        if seen.insert(addr.clone()) {
            merged.push(addr);
        }
    }
    merged
}

fn run(cli: Cli, runtime: tokio::runtime::Handle) -> Result<()> {
    let file_config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config file {}", path.display()))?,
        None => Config::default(),
    };

    let sentry_addresses: Vec<SentryAddr> = merged_addresses(&cli.sentry, file_config.sentry_addresses())
        .iter()
        .map(|raw| SentryAddr::parse(raw).with_context(|| format!("invalid --sentry address {raw:?}")))
        .collect::<Result<_>>()?;

    let listen_addresses: Vec<String> = if cli.listen.is_empty() {
        file_config.listen_addr.into_iter().collect()
    } else {
        cli.listen.clone()
    };

    let horcrux_connection: Arc<dyn HorcruxConnection> = if let Some(grpc_addr) = &cli.grpc {
        info!(address = %grpc_addr, "using gRPC upstream");
        Arc::new(HorcruxGrpcClient::connect(grpc_addr.clone(), runtime.clone())?)
    } else {
        if listen_addresses.is_empty() {
            bail!("at least one --listen address is required unless --grpc is set");
        }
        Arc::new(start_listener_pool(&listen_addresses)?)
    };

    let discovery: Option<Arc<dyn discovery::SentryDiscovery>> = if cli.operator {
        info!("enabling Kubernetes sentry discovery");
        let kube = runtime
            .block_on(KubeSentryDiscovery::new(cli.all, cli.label.clone()))
            .context("failed to initialize Kubernetes discovery")?;
        Some(Arc::new(kube))
    } else {
        None
    };

    let watcher = Watcher::new(
        sentry_addresses,
        horcrux_connection,
        discovery,
        runtime.clone(),
        cli.max_read_size,
    );
    watcher.watch();

    wait_for_shutdown_signal()?;

    info!("shutting down");
    watcher.stop().context("errors during watcher shutdown")?;
    info!("shutdown complete");
    Ok(())
}

/// Binds every `--listen` address as a signer-listener endpoint, spawns its
/// accept loop on a dedicated thread (spec.md §5: "one accept/serve task per
/// signer-listener endpoint"), and returns a `LoadBalancer` owning all of
/// them.
fn start_listener_pool(addresses: &[String]) -> Result<LoadBalancer> {
    let identity_key = Arc::new(identity::generate());
    let mut endpoints: Vec<Arc<dyn SignEndpoint>> = Vec::with_capacity(addresses.len());

    for raw in addresses {
        let address = SentryAddr::parse(raw).with_context(|| format!("invalid --listen address {raw:?}"))?;
        match address.endpoint() {
            Endpoint::Tcp(hostport) => {
                let listener = TcpListener::bind(hostport)
                    .with_context(|| format!("binding listen address {raw:?}"))?;
                let endpoint = SignerListenerEndpoint::new();
                let serve_listener = listener.try_clone().context("cloning TCP listener")?;
                let serve_endpoint = endpoint.clone();
                let serve_identity = identity_key.clone();
                thread::Builder::new()
                    .name(format!("signer-listener:{raw}"))
                    .spawn(move || {
                        proxy_core::signer_listener::serve_tcp(serve_listener, serve_endpoint, serve_identity)
                    })
                    .with_context(|| format!("spawning accept loop for {raw}"))?;
                endpoints.push(Arc::new(ListenerSignEndpoint {
                    address: raw.clone(),
                    endpoint,
                }));
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let listener =
                    UnixListener::bind(path).with_context(|| format!("binding listen address {raw:?}"))?;
                let endpoint = SignerListenerEndpoint::new();
                let serve_endpoint = endpoint.clone();
                let serve_identity = identity_key.clone();
                thread::Builder::new()
                    .name(format!("signer-listener:{raw}"))
                    .spawn(move || proxy_core::signer_listener::serve_unix(listener, serve_endpoint, serve_identity))
                    .with_context(|| format!("spawning accept loop for {raw}"))?;
                endpoints.push(Arc::new(ListenerSignEndpoint {
                    address: raw.clone(),
                    endpoint,
                }));
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => bail!("unix:// listen addresses are not supported on this platform"),
        }
    }

    info!(count = endpoints.len(), "signer-listener pool ready");
    Ok(LoadBalancer::new(endpoints))
}

/// Blocks until SIGINT or SIGTERM, mirroring `cmd/root.go`'s
/// `signal.NotifyContext(context.Background(), os.Interrupt, syscall.SIGTERM)`.
fn wait_for_shutdown_signal() -> Result<()> {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let signaled = pair.clone();

    ctrlc::set_handler(move || {
        let (lock, cvar) = &*signaled;
        *lock.lock().expect("shutdown mutex poisoned") = true;
        cvar.notify_all();
    })
    .context("failed to install signal handler")?;

    let (lock, cvar) = &*pair;
    let mut fired = lock.lock().expect("shutdown mutex poisoned");
    while !*fired {
        fired = cvar.wait(fired).expect("shutdown condvar poisoned");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_addresses_take_priority_over_config_file_duplicates() {
        let merged = merged_addresses(
            &["tcp://a:1".to_string()],
            vec!["tcp://a:1".to_string(), "tcp://b:1".to_string()],
        );
        assert_eq!(merged, vec!["tcp://a:1".to_string(), "tcp://b:1".to_string()]);
    }
}
