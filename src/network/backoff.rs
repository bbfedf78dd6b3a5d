//! Accept backoff
//!
//! Capped exponential delay applied between transient accept failures.

use std::io;
use std::time::Duration;

/// First delay after a transient failure
pub const BASE_DELAY: Duration = Duration::from_millis(5);

/// Delays never grow past this
pub const MAX_DELAY: Duration = Duration::from_secs(1);

/// Delay state of the accept loop
#[derive(Debug, Default)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to sleep after one more transient failure
    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            BASE_DELAY
        } else {
            (self.delay * 2).min(MAX_DELAY)
        };
        self.delay
    }

    /// Forget previous failures after a successful accept
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

/// Accept errors worth retrying
///
/// Covers interrupted/aborted handshakes and running out of descriptors or
/// memory, which clear up on their own.
pub fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::OutOfMemory => true,
        _ => is_resource_exhaustion(err),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE
    matches!(err.raw_os_error(), Some(12) | Some(23) | Some(24))
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}
