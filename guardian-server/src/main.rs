// Guardian Server - HTTP front for Guardian
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Guardian Server
//!
//! Serves the Guardian health contract and gates a demo pipeline.
//!
//! ## Usage
//!
//! ```bash
//! # Nominal readings, default thresholds
//! guardian-server --port 8787
//!
//! # Replay a recorded load scenario
//! guardian-server --csv readings.csv --config guardian.json
//!
//! # Gate on a publisher running elsewhere
//! guardian-server --health-url http://10.0.0.5:8787/guardian/health
//! ```

use axum::{routing::get, Router};
use clap::Parser;
use guardian::{FixedSampler, GuardianConfig, HealthPublisher, PublisherSource, Sampler};
use guardian_server::{router, AppState, GateSource, RemoteHealthSource, ServerError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "replay")]
use guardian_server::replay::ReplaySampler;

/// Guardian admission-control server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8787")]
    port: u16,

    /// JSON configuration file (thresholds and gate settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// CSV file of recorded readings to replay
    #[arg(short, long)]
    csv: Option<PathBuf>,

    /// Stop on the last replayed row instead of looping
    #[arg(long)]
    once: bool,

    /// Gate on a remote health endpoint instead of the local publisher.
    /// /guardian/health then relays the remote report, and operator
    /// lockdown must be issued on the remote side.
    #[arg(long)]
    health_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Guardian Server v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            info!("Loaded configuration from {}", path.display());
            GuardianConfig::from_json(&json)?
        }
        None => GuardianConfig::default(),
    };

    let publisher = Arc::new(HealthPublisher::boxed(
        build_sampler(&args)?,
        config.thresholds.clone(),
    ));

    let source = match &args.health_url {
        Some(url) => {
            info!("Gating on remote health endpoint {}", url);
            if args.csv.is_some() {
                tracing::warn!("--csv has no effect on admission with --health-url");
            }
            GateSource::Remote(RemoteHealthSource::new(
                url.clone(),
                config.gate.fetch_timeout(),
            )?)
        }
        None => GateSource::Local(PublisherSource::new(Arc::clone(&publisher))),
    };

    let state = AppState::new(publisher, source, config.gate.clone());
    let pipeline = Router::new().route("/v1/ping", get(|| async { "pong" }));
    let app = router(state, pipeline);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Health contract: http://{}/guardian/health", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "replay")]
fn build_sampler(args: &Args) -> Result<Box<dyn Sampler>, ServerError> {
    match &args.csv {
        Some(path) => Ok(Box::new(ReplaySampler::from_csv(path, !args.once)?)),
        None => {
            info!("No replay file, reporting nominal readings");
            Ok(Box::new(FixedSampler::nominal()))
        }
    }
}

#[cfg(not(feature = "replay"))]
fn build_sampler(args: &Args) -> Result<Box<dyn Sampler>, ServerError> {
    if args.csv.is_some() {
        tracing::warn!("Replay feature not enabled, ignoring --csv argument");
    }
    Ok(Box::new(FixedSampler::nominal()))
}
