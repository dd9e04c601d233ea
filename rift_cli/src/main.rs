//! Demo Rift server: a broadcast-style chat over the default namespace and
//! a `/pol` namespace exercising acknowledged calls.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use rift_core::{Ack, Context, Server};
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(version, about = "Rift demo server")]
struct Arguments {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: SocketAddr,

    /// Resource name (first path segment).
    #[arg(long, default_value = "net.io")]
    resource: String,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 12)]
    ping_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Arguments::parse();

    let server = Server::builder()
        .resource_name(args.resource.clone())
        .ping_interval(Duration::from_secs(args.ping_interval))
        .build()?;

    register_handlers(&server);

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, resource = %args.resource, "rift server up");

    let app = server.router();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
            }
        })
        .await?;

    Ok(())
}

fn register_handlers(server: &Arc<Server>) {
    {
        let broadcast = server.clone();
        server.on("connect", move |ns: Context| {
            let sid = ns.session_id().unwrap_or_default();
            tracing::info!(%sid, "client connected");
            broadcast.broadcast("connected", (sid,));
        });
    }

    {
        let broadcast = server.clone();
        server.on("news", move |_ns: Context, message: String| {
            broadcast.broadcast("news", (message,));
        });
    }

    server.on("ping", |ns: Context| {
        if let Err(e) = ns.emit("pong", ()) {
            tracing::debug!(error = %e, "pong failed");
        }
    });

    server.on("disconnect", |ns: Context| {
        tracing::info!(sid = ?ns.session_id(), "client disconnected");
    });

    // The /pol namespace answers polls with an acknowledgment.
    let pol = server.of("/pol");
    pol.on("poll", |_ns: Context, message: String, ack: Ack| {
        let verdict = message.contains("Nixon");
        if let Err(e) = ack.send((verdict,)) {
            tracing::debug!(error = %e, "poll ack failed");
        }
    });
}
