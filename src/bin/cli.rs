//! tcpcore CLI Client
//!
//! Sends one message to an echo server and prints the reply.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam::channel::{self, Sender};
use tcpcore::{Config, Connection, Frame, Handler, LengthPrefixed, NetError, Packet, Server};
use tracing_subscriber::{fmt, EnvFilter};

/// tcpcore CLI
#[derive(Parser, Debug)]
#[command(name = "tcpcore-cli")]
#[command(about = "Send a message to a tcpcore echo server")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    server: String,

    /// How long to wait for the reply, in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    /// Message to send
    message: String,
}

/// Forwards the first reply to `main`
struct Reply {
    tx: Sender<Vec<u8>>,
}

impl Handler<LengthPrefixed> for Reply {
    fn on_connected(&self, conn: &Arc<Connection<LengthPrefixed>>) {
        tracing::debug!("Connected to {}", conn.peer_addr());
    }

    fn on_message(&self, _conn: &Arc<Connection<LengthPrefixed>>, packet: Frame) {
        let _ = self.tx.try_send(packet.as_bytes().to_vec());
    }

    fn on_disconnected(&self, conn: &Arc<Connection<LengthPrefixed>>) {
        tracing::debug!("Disconnected from {}", conn.peer_addr());
    }

    fn on_error(&self, err: &NetError) {
        tracing::warn!("Connection error: {}", err);
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let (tx, rx) = channel::bounded(1);
    let handler: Arc<dyn Handler<LengthPrefixed>> = Arc::new(Reply { tx });
    let protocol = Arc::new(LengthPrefixed);

    let client = match Server::new(Config::default(), handler.clone(), protocol.clone()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let conn = match client.connect(&args.server, handler, protocol) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Could not connect to {}: {}", args.server, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = conn.write_packet(Frame::from(args.message.into_bytes())) {
        eprintln!("Send failed: {}", e);
        std::process::exit(1);
    }

    let code = match rx.recv_timeout(Duration::from_millis(args.timeout_ms)) {
        Ok(reply) => {
            println!("{}", String::from_utf8_lossy(&reply));
            0
        }
        Err(_) => {
            eprintln!("No reply within {} ms", args.timeout_ms);
            1
        }
    };

    client.close();
    std::process::exit(code);
}
