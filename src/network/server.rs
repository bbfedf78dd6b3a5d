//! TCP Server
//!
//! Accepts connections, starts their pipelines and keeps them registered.
//!
//! The accept loop runs on the caller's thread. `close` may be called from any
//! other thread holding the server (typically through an `Arc`).

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{NetError, Result};
use crate::network::backoff::{self, Backoff};
use crate::network::{Connection, Handler, Registry};
use crate::protocol::Protocol;

/// How long `close` waits when poking the accept loop awake
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// TCP server for tcpcore
pub struct Server<P: Protocol> {
    config: Config,
    handler: Arc<dyn Handler<P>>,
    protocol: Arc<P>,
    registry: Arc<Registry<P>>,

    /// Closed-notification queue handed to every connection
    reclaim_tx: Sender<String>,

    stopped: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<P: Protocol> Server<P> {
    /// Create a new server and start its registry reclaimer
    pub fn new(config: Config, handler: Arc<dyn Handler<P>>, protocol: Arc<P>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(Registry::new());
        let (reclaim_tx, reclaim_rx) = channel::bounded(config.reclaim_capacity);
        registry.spawn_reclaimer(reclaim_rx, config.reclaim_interval)?;

        Ok(Self {
            config,
            handler,
            protocol,
            registry,
            reclaim_tx,
            stopped: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind `config.listen_addr` and run the accept loop (blocking)
    ///
    /// Returns [`NetError::ServerClosed`] after [`Server::close`], or the
    /// error that killed the listener.
    pub fn listen_and_serve(&self) -> Result<()> {
        let addr = resolve(&self.config.listen_addr)?;
        let listener = TcpListener::bind(addr)?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.serve(listener)
    }

    /// Run the accept loop over an already bound listener (blocking)
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        *self.local_addr.lock() = Some(listener.local_addr()?);

        let mut backoff = Backoff::new();
        loop {
            if self.is_stopped() {
                return Err(NetError::ServerClosed);
            }

            let stream = match listener.accept() {
                Ok((stream, _)) => {
                    backoff.reset();
                    stream
                }
                Err(e) => match retry_delay(&mut backoff, &e) {
                    Some(delay) => {
                        tracing::warn!("Accept error: {}; retrying in {:?}", e, delay);
                        thread::sleep(delay);
                        continue;
                    }
                    None => {
                        tracing::error!("Listener error: {}", e);
                        return Err(e.into());
                    }
                },
            };

            // The wake-up connection from close() lands here
            if self.is_stopped() {
                return Err(NetError::ServerClosed);
            }

            let handler = Arc::clone(&self.handler);
            let protocol = Arc::clone(&self.protocol);
            if let Err(e) = self.admit(stream, handler, protocol) {
                tracing::warn!("Failed to admit connection: {}", e);
            }
        }
    }

    /// Dial `address` and run it through the same pipeline as accepted sockets
    ///
    /// The connection is registered with this server like any inbound one.
    pub fn connect(
        &self,
        address: &str,
        handler: Arc<dyn Handler<P>>,
        protocol: Arc<P>,
    ) -> Result<Arc<Connection<P>>> {
        let addr = resolve(address)?;
        let stream = TcpStream::connect(addr)?;
        tracing::debug!("Connected to {}", addr);
        self.admit(stream, handler, protocol)
    }

    fn admit(
        &self,
        stream: TcpStream,
        handler: Arc<dyn Handler<P>>,
        protocol: Arc<P>,
    ) -> Result<Arc<Connection<P>>> {
        let conn = Connection::with_reclaimer(
            stream,
            Some(handler),
            Some(protocol),
            &self.config,
            Some(self.reclaim_tx.clone()),
        )?;

        // Registered first so the close notification can never beat the put
        self.registry.put(conn.id(), Arc::clone(&conn));
        conn.start()?;
        Ok(conn)
    }

    /// Stop accepting and close every open connection
    ///
    /// Each connection fires `on_disconnected`; registry entries disappear
    /// once the reclaimer catches up.
    pub fn close(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!("Server closing");
            self.wake_acceptor();
        }

        for conn in self.registry.get_all() {
            if !conn.is_closed() {
                conn.close();
            }
        }
    }

    /// Drop a connection from the registry and close it silently
    pub fn evict(&self, id: &str) -> Option<Arc<Connection<P>>> {
        self.registry.evict(id)
    }

    /// Snapshot of every registered connection
    pub fn get_all_connections(&self) -> Vec<Arc<Connection<P>>> {
        self.registry.get_all()
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<Connection<P>>> {
        self.registry.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Address of the running accept loop, once `serve` has started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `accept` has no timeout; a throwaway connection gets it to re-check
    /// the stop flag.
    fn wake_acceptor(&self) {
        let Some(mut addr) = self.local_addr() else {
            return;
        };
        if addr.ip().is_unspecified() {
            let loopback = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }
        if let Err(e) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
            tracing::warn!(
                "Wake-up connect to {} failed, accept loop may stay blocked: {}",
                addr,
                e
            );
        }
    }
}

/// How long to wait before the next `accept`, or `None` if the listener is dead
fn retry_delay(backoff: &mut Backoff, err: &io::Error) -> Option<Duration> {
    backoff::is_transient(err).then(|| backoff.next_delay())
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| NetError::AddrResolve(address.to_string()))
}
