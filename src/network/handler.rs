//! Event Handler
//!
//! Application callbacks driven by the connection pipeline.

use std::sync::Arc;

use crate::error::NetError;
use crate::network::Connection;
use crate::protocol::Protocol;

/// Business logic plugged into a [`Connection`]
///
/// Per connection the calls arrive as: one `on_connected`, any number of
/// `on_message` / `on_error`, then one `on_disconnected`.
///
/// `on_message` runs on the connection's dispatcher thread, so a slow handler
/// only delays further messages of that same connection. `on_error` runs on
/// whichever stage hit the failure.
pub trait Handler<P: Protocol>: Send + Sync + 'static {
    fn on_connected(&self, conn: &Arc<Connection<P>>);

    fn on_message(&self, conn: &Arc<Connection<P>>, packet: P::Packet);

    fn on_disconnected(&self, conn: &Arc<Connection<P>>);

    fn on_error(&self, err: &NetError);
}
