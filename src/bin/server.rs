//! tcpcore Echo Server
//!
//! Echoes every length-prefixed frame back to its sender.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tcpcore::{Config, Connection, Frame, Handler, LengthPrefixed, NetError, Packet, Server};
use tracing_subscriber::{fmt, EnvFilter};

/// tcpcore Echo Server
#[derive(Parser, Debug)]
#[command(name = "tcpcore-echo")]
#[command(about = "Length-prefixed TCP echo server")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    listen: String,

    /// Read deadline in milliseconds (0 = none)
    #[arg(short, long, default_value = "10000")]
    read_timeout_ms: u64,

    /// Write deadline in milliseconds (0 = none)
    #[arg(short, long, default_value = "0")]
    write_timeout_ms: u64,
}

struct Echo;

impl Handler<LengthPrefixed> for Echo {
    fn on_connected(&self, conn: &Arc<Connection<LengthPrefixed>>) {
        tracing::info!("New connection: {}", conn.peer_addr());
    }

    fn on_message(&self, conn: &Arc<Connection<LengthPrefixed>>, packet: Frame) {
        tracing::info!(
            "Received from {}: {}",
            conn.id(),
            String::from_utf8_lossy(packet.as_bytes())
        );
        if let Err(e) = conn.write_packet(packet) {
            tracing::warn!("Echo to {} failed: {}", conn.id(), e);
        }
    }

    fn on_disconnected(&self, conn: &Arc<Connection<LengthPrefixed>>) {
        tracing::info!("{} disconnected", conn.peer_addr());
    }

    fn on_error(&self, err: &NetError) {
        tracing::warn!("Connection error: {}", err);
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tcpcore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("tcpcore echo server v{}", tcpcore::VERSION);
    tracing::info!("Listen address: {}", args.listen);

    let config = Config::builder()
        .listen_addr(&args.listen)
        .read_timeout(Duration::from_millis(args.read_timeout_ms))
        .write_timeout(Duration::from_millis(args.write_timeout_ms))
        .build();

    let handler: Arc<dyn Handler<LengthPrefixed>> = Arc::new(Echo);
    let server = match Server::new(config, handler, Arc::new(LengthPrefixed)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    match server.listen_and_serve() {
        Err(NetError::ServerClosed) | Ok(()) => tracing::info!("Server stopped"),
        Err(e) => {
            tracing::error!("Server error: {}", e);
            std::process::exit(1);
        }
    }
}
