//! Helios Server - WebSocket host for the Helios/Starling protocol engine.
//!
//! Accepts starling connections on `/ws` (subprotocol `helios-starling`,
//! optional `?recover=<token>`) and serves a small set of demo methods.

mod handler;
mod server;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use helios_core::{Helios, HeliosEvent, RequestContext};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "helios-server")]
#[command(about = "WebSocket server for Helios starlings")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Seconds a disconnected starling is kept for recovery
    #[arg(long, default_value = "300")]
    disconnection_ttl_secs: u64,

    /// Hex-encoded token signing key (random when omitted)
    #[arg(long)]
    secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Helios Server");

    let mut builder =
        Helios::builder().disconnection_ttl(Duration::from_secs(args.disconnection_ttl_secs));
    if let Some(secret) = args.secret {
        builder = builder.secret(secret);
    }
    let helios = builder.build()?;

    register_demo_methods(&helios)?;
    spawn_event_logger(&helios);

    let addr = server::start_server(helios.clone(), &args.host, args.port).await?;
    info!("Accepting starlings on ws://{}/ws", addr);

    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    helios.shutdown();

    Ok(())
}

fn register_demo_methods(helios: &Helios) -> helios_core::Result<()> {
    helios.method("echo", |ctx: RequestContext| async move {
        let payload = ctx.payload().clone();
        ctx.success(payload)
    })?;

    helios.method("server:time", |ctx: RequestContext| async move {
        ctx.success(json!({ "now": Utc::now().to_rfc3339() }))
    })?;

    Ok(())
}

fn spawn_event_logger(helios: &Helios) {
    let mut events = helios.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HeliosEvent::DeliveryFailed {
                    starling,
                    message_id,
                    attempts,
                }) => {
                    warn!(
                        "Delivery of {} to {} failed after {} attempts",
                        message_id, starling, attempts
                    );
                }
                Ok(event) => debug!("Event: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event logger skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
