//! ephemeral-tunnel CLI
//!
//! Opens one tunnel, prints the local port and forwards until Ctrl-C or
//! until the remote side goes away.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use et_cloud::{ComputeResolver, OsLoginDirectory};
use et_core::config::{BackendConfig, TunnelConfig};
use et_core::TunnelTarget;
use et_tunnel::{CloseReason, Collaborators, TunnelSession};

use ephemeral_tunnel::args::Cli;
use ephemeral_tunnel::output::{format_stats, print_error, print_info, print_success, print_warning};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match (&cli.log_level, std::env::var("RUST_LOG")) {
        (None, Ok(from_env)) => from_env,
        _ => cli.log_filter(),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = match cli.tunnel_config() {
        Ok(config) => run(config, cli.quiet).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

/// Cloud collaborators for `config`; only what its backend and target need
fn collaborators(config: &TunnelConfig) -> Result<Collaborators> {
    let mut collaborators = Collaborators::new();

    if matches!(config.target, Some(TunnelTarget::Instance(_))) {
        let resolver = ComputeResolver::new(
            config.credentials.clone(),
            config.project.clone(),
            config.zone.clone(),
        )
        .context("Failed to create Compute Engine client")?;
        collaborators = collaborators.with_resolver(Arc::new(resolver));
    }

    if let BackendConfig::Protocol(_) = config.backend {
        let directory = OsLoginDirectory::new(config.credentials.clone(), config.project.clone())
            .context("Failed to create OS Login client")?;
        collaborators = collaborators.with_directory(Arc::new(directory));
    }

    Ok(collaborators)
}

async fn run(config: TunnelConfig, quiet: bool) -> Result<()> {
    let destination = format!(
        "{}:{}",
        config.target.as_ref().map(ToString::to_string).unwrap_or_default(),
        config.remote_port
    );
    let backend = config.backend.name();

    let handle = TunnelSession::start(config.clone(), collaborators(&config)?);

    let port = tokio::select! {
        result = handle.local_port() => result,
        _ = tokio::signal::ctrl_c() => {
            handle.close().await;
            return Ok(());
        }
    };
    let port = match port {
        Ok(port) => port,
        Err(e) => {
            handle.close().await;
            return Err(e).context("Tunnel setup failed");
        }
    };

    if quiet {
        println!("{}", port);
    } else {
        print_success(&format!(
            "Forwarding 127.0.0.1:{} -> {} ({} backend)",
            port, destination, backend
        ));
        print_info("Press Ctrl-C to close the tunnel");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, closing tunnel");
        }
        reason = handle.closed() => match reason {
            CloseReason::BackendClosed(e) => print_warning(&format!("Remote side closed: {}", e)),
            CloseReason::Failed(e) => print_warning(&format!("Tunnel failed: {}", e)),
            CloseReason::Requested => {}
        },
    }

    handle.close().await;
    if !quiet {
        print_info(&format!("Tunnel closed: {}", format_stats(&handle.stats())));
    }
    Ok(())
}
