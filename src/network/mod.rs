//! Network Module
//!
//! TCP server and connection handling.
//!
//! ## Architecture
//! - Accept loop on the caller's thread
//! - Three threads per connection: reader, writer, dispatcher
//! - One reclaimer thread per server pruning closed connections

mod backoff;
mod connection;
mod handler;
mod registry;
mod server;

pub use backoff::{is_transient, Backoff, BASE_DELAY, MAX_DELAY};
pub use connection::{Connection, ConnectionState};
pub use handler::Handler;
pub use registry::Registry;
pub use server::Server;
