//! # tcpcore
//!
//! Building block for TCP servers and clients:
//! - Connection lifecycle with coordinated, idempotent shutdown
//! - Pluggable framing through the [`Protocol`] trait
//! - Event delivery through the [`Handler`] trait
//! - Accept loop with capped backoff and a self-pruning connection registry
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Server                               │
//! │              accept loop  ·  connect(addr)                   │
//! └──────────────┬──────────────────────────────▲───────────────┘
//!                │ put                          │ closed ids
//! ┌──────────────▼───────────────┐     ┌────────┴──────────────┐
//! │          Registry            │◄────│      Reclaimer        │
//! │   (RwLock<HashMap<id,conn>>) │     │  (polls closed queue) │
//! └──────────────┬───────────────┘     └───────────────────────┘
//!                │
//!                ▼
//!   ┌─────────────────────────────────────────────────┐
//!   │                  Connection                      │
//!   │   reader ──► inbound ──► dispatcher ──► Handler  │
//!   │   writer ◄── outbound ◄── write_packet           │
//!   └─────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod network;
pub mod protocol;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{NetError, Result};
pub use config::Config;
pub use network::{Connection, ConnectionState, Handler, Registry, Server};
pub use protocol::{Frame, LengthPrefixed, Packet, Protocol};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of tcpcore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
