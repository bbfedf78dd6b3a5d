//! Configuration for tcpcore
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use crate::error::{NetError, Result};

/// Configuration shared by a server and the connections it builds
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address (host:port)
    pub listen_addr: String,

    /// Per-read socket deadline, `Duration::ZERO` disables it
    pub read_timeout: Duration,

    /// Per-write socket deadline, `Duration::ZERO` disables it
    pub write_timeout: Duration,

    // -------------------------------------------------------------------------
    // Queue Configuration
    // -------------------------------------------------------------------------
    /// Decoded packets waiting for the dispatcher
    pub inbound_capacity: usize,

    /// Packets waiting for the writer
    pub outbound_capacity: usize,

    // -------------------------------------------------------------------------
    // Registry Configuration
    // -------------------------------------------------------------------------
    /// Pending closed-notifications before `close` blocks
    pub reclaim_capacity: usize,

    /// Idle sleep of the reclaimer when it finds nothing to do
    pub reclaim_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9001".to_string(),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            inbound_capacity: 100,
            outbound_capacity: 100,
            reclaim_capacity: 100,
            reclaim_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.inbound_capacity == 0 || self.outbound_capacity == 0 {
            return Err(NetError::Config(
                "queue capacities must be greater than zero".to_string(),
            ));
        }
        if self.reclaim_capacity == 0 {
            return Err(NetError::Config(
                "reclaim capacity must be greater than zero".to_string(),
            ));
        }
        if self.reclaim_interval.is_zero() {
            return Err(NetError::Config(
                "reclaim interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Set the inbound queue capacity
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity;
        self
    }

    /// Set the outbound queue capacity
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.config.outbound_capacity = capacity;
        self
    }

    /// Set the closed-notification queue capacity
    pub fn reclaim_capacity(mut self, capacity: usize) -> Self {
        self.config.reclaim_capacity = capacity;
        self
    }

    /// Set the reclaimer idle interval
    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.config.reclaim_interval = interval;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
