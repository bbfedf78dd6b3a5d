//! Connection
//!
//! Runs the per-connection pipeline and coordinates its shutdown.
//!
//! ## Pipeline
//! ```text
//!   socket ──► reader ──► inbound queue ──► dispatcher ──► Handler::on_message
//!                                                                 │
//!   socket ◄── writer ◄── outbound queue ◄── write_packet ◄───────┘
//! ```
//!
//! Each stage is its own thread. When any stage stops, the connection closes:
//! the shutdown channel is disconnected (waking every stage parked in
//! `select!`), socket I/O is shut down (waking a stage parked in a syscall),
//! and the closer waits on the stage `WaitGroup` before releasing anything.

use std::any::Any;
use std::io::BufReader;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::cell::Cell;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{NetError, Result};
use crate::network::Handler;
use crate::protocol::Protocol;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Created = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::Running,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One established TCP connection and its three pipeline stages
pub struct Connection<P: Protocol> {
    /// Remote address, the registry key
    id: String,

    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,

    handler: Option<Arc<dyn Handler<P>>>,
    protocol: Option<Arc<P>>,

    /// `None` means no deadline
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,

    inbound_tx: Sender<P::Packet>,
    inbound_rx: Receiver<P::Packet>,
    outbound_tx: Sender<P::Packet>,
    outbound_rx: Receiver<P::Packet>,

    state: AtomicU8,

    /// Never sent on. Dropping it disconnects every clone of `shutdown_rx`.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,

    /// Stage barrier, taken by whoever finishes the close
    stages: Mutex<Option<WaitGroup>>,

    /// Closed-notification queue of the owning registry
    reclaim_tx: Mutex<Option<Sender<String>>>,

    this: Weak<Self>,
}

impl<P: Protocol> Connection<P> {
    /// Wrap an established stream
    ///
    /// Deadlines and queue capacities are taken from `config`. Nothing runs
    /// until [`Connection::start`] is called.
    pub fn new(
        stream: TcpStream,
        handler: Option<Arc<dyn Handler<P>>>,
        protocol: Option<Arc<P>>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        Self::with_reclaimer(stream, handler, protocol, config, None)
    }

    pub(crate) fn with_reclaimer(
        stream: TcpStream,
        handler: Option<Arc<dyn Handler<P>>>,
        protocol: Option<Arc<P>>,
        config: &Config,
        reclaim_tx: Option<Sender<String>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let (inbound_tx, inbound_rx) = channel::bounded(config.inbound_capacity);
        let (outbound_tx, outbound_rx) = channel::bounded(config.outbound_capacity);
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);

        Ok(Arc::new_cyclic(|this| Self {
            id: peer_addr.to_string(),
            stream,
            peer_addr,
            local_addr,
            handler,
            protocol,
            read_timeout: deadline(config.read_timeout),
            write_timeout: deadline(config.write_timeout),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            state: AtomicU8::new(ConnectionState::Created as u8),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            stages: Mutex::new(Some(WaitGroup::new())),
            reclaim_tx: Mutex::new(reclaim_tx),
            this: this.clone(),
        }))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Fire `on_connected` and launch the reader, writer and dispatcher
    ///
    /// Returns as soon as the stages are spawned. A connection missing its
    /// handler or protocol is closed on the spot and reported as a
    /// configuration error; `on_disconnected` still fires if there is a
    /// handler to fire it on.
    pub fn start(&self) -> Result<()> {
        let (handler, protocol) = match (self.handler.clone(), self.protocol.clone()) {
            (Some(handler), Some(protocol)) => (handler, protocol),
            (handler, _) => {
                if handler.is_some() {
                    self.close();
                } else {
                    self.close_silent();
                }
                return Err(NetError::Config(
                    "handler and protocol are not allowed to be missing".to_string(),
                ));
            }
        };
        let conn = self.this.upgrade().ok_or(NetError::ConnectionClosed)?;

        if let Err(current) = self.state.compare_exchange(
            ConnectionState::Created as u8,
            ConnectionState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match ConnectionState::from_u8(current) {
                ConnectionState::Running => {
                    NetError::Config("connection already started".to_string())
                }
                _ => NetError::ConnectionClosed,
            });
        }

        tracing::debug!(peer = %self.id, "Connection established");
        let greeted = panic::catch_unwind(AssertUnwindSafe(|| handler.on_connected(&conn)));
        if let Err(payload) = greeted {
            let message = panic_message(&*payload).to_string();
            tracing::warn!(peer = %self.id, "on_connected panicked: {}", message);
            self.close();
            return Err(NetError::HandlerPanic(message));
        }

        // The handler may have closed us from on_connected
        let guards = match self.stages.lock().as_ref() {
            Some(stages) => [stages.clone(), stages.clone(), stages.clone()],
            None => return Ok(()),
        };
        let [reader_guard, writer_guard, dispatcher_guard] = guards;

        let reader_protocol = Arc::clone(&protocol);
        let writer_protocol = protocol;
        let reader_handler = Arc::clone(&handler);
        let writer_handler = Arc::clone(&handler);
        let dispatcher_handler = Arc::clone(&handler);

        let spawned = conn
            .spawn_stage("reader", reader_guard, reader_handler, move |c| {
                c.read_loop(&*reader_protocol)
            })
            .and_then(|_| {
                conn.spawn_stage("writer", writer_guard, writer_handler, move |c| {
                    c.write_loop(&*writer_protocol)
                })
            })
            .and_then(|_| {
                conn.spawn_stage("dispatcher", dispatcher_guard, handler, move |c| {
                    c.dispatch_loop(&*dispatcher_handler)
                })
            });

        if let Err(e) = spawned {
            tracing::error!(peer = %self.id, "Failed to spawn pipeline: {}", e);
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection and fire `on_disconnected`
    ///
    /// Idempotent; only the first call does anything. Safe to call from a
    /// handler callback, on this connection or any other: from a stage thread
    /// the wait for the stages happens on a separate closer thread.
    pub fn close(&self) {
        self.shutdown(true);
    }

    /// Close without firing `on_disconnected`
    pub fn close_silent(&self) {
        self.shutdown(false);
    }

    fn shutdown(&self, notify: bool) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match ConnectionState::from_u8(current) {
                ConnectionState::Created | ConnectionState::Running => {}
                ConnectionState::Closing | ConnectionState::Closed => return,
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        tracing::debug!(peer = %self.id, "Connection closing");

        // Broadcast: every stage parked on shutdown_rx wakes with Disconnected
        drop(self.shutdown_tx.lock().take());
        // Unblocks a stage parked inside the socket read/write itself
        let _ = self.stream.shutdown(Shutdown::Both);

        if on_stage_thread() {
            // Waiting here could wait on the calling stage itself, or on a
            // stage that is in turn waiting on us
            let Some(conn) = self.this.upgrade() else {
                return;
            };
            let spawned = thread::Builder::new()
                .name(format!("closer-{}", self.id))
                .spawn(move || conn.finish_close(notify));
            if let Err(e) = spawned {
                tracing::error!(peer = %self.id, "Failed to spawn closer: {}", e);
            }
        } else {
            self.finish_close(notify);
        }
    }

    fn finish_close(&self, notify: bool) {
        let stages = self.stages.lock().take();
        if let Some(stages) = stages {
            stages.wait();
        }

        // Nothing reads the queues any more
        let dropped_in = self.inbound_rx.try_iter().count();
        let dropped_out = self.outbound_rx.try_iter().count();
        if dropped_in + dropped_out > 0 {
            tracing::debug!(
                peer = %self.id,
                inbound = dropped_in,
                outbound = dropped_out,
                "Discarded queued packets"
            );
        }

        self.state.store(ConnectionState::Closed as u8, Ordering::Release);

        if let Some(reclaim_tx) = self.reclaim_tx.lock().take() {
            if reclaim_tx.send(self.id.clone()).is_err() {
                tracing::trace!(peer = %self.id, "Registry already gone");
            }
        }

        tracing::debug!(peer = %self.id, "Connection closed");

        if !notify {
            return;
        }
        if let (Some(handler), Some(conn)) = (&self.handler, self.this.upgrade()) {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_disconnected(&conn)));
            if let Err(payload) = outcome {
                tracing::warn!(
                    peer = %self.id,
                    "on_disconnected panicked: {}",
                    panic_message(&*payload)
                );
            }
        }
    }

    // =========================================================================
    // Stages
    // =========================================================================

    fn spawn_stage<F>(
        self: &Arc<Self>,
        stage: &'static str,
        guard: WaitGroup,
        handler: Arc<dyn Handler<P>>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&Arc<Self>) -> Result<()> + Send + 'static,
    {
        let conn = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-{}", stage, self.id))
            .spawn(move || {
                IN_STAGE.with(|flag| flag.set(true));

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    if let Err(e) = body(&conn) {
                        // Errors caused by our own shutdown are not news
                        if !conn.is_shutdown() {
                            handler.on_error(&e);
                        }
                    }
                }));
                if let Err(payload) = outcome {
                    tracing::warn!(
                        peer = %conn.id,
                        stage,
                        "Stage panicked: {}",
                        panic_message(&*payload)
                    );
                }

                tracing::debug!(peer = %conn.id, stage, "Stage exited");
                IN_STAGE.with(|flag| flag.set(false));
                drop(guard);
                conn.close();
            })?;
        Ok(())
    }

    fn read_loop(self: &Arc<Self>, protocol: &P) -> Result<()> {
        let mut reader = BufReader::new(&self.stream);
        loop {
            if self.is_shutdown() {
                return Ok(());
            }

            self.stream.set_read_timeout(self.read_timeout)?;
            let packet = match protocol.read_packet(&mut reader) {
                Ok(packet) => packet,
                Err(e) if e.is_eof() => {
                    tracing::debug!(peer = %self.id, "Peer closed the stream");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            tracing::trace!(peer = %self.id, "Packet decoded");

            // Blocks while the dispatcher is behind, which throttles the peer
            select! {
                send(self.inbound_tx, packet) -> sent => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
                recv(self.shutdown_rx) -> _ => return Ok(()),
            }
        }
    }

    fn write_loop(self: &Arc<Self>, protocol: &P) -> Result<()> {
        let mut writer = &self.stream;
        loop {
            if self.is_shutdown() {
                return Ok(());
            }

            select! {
                recv(self.outbound_rx) -> packet => {
                    let Ok(packet) = packet else {
                        return Ok(());
                    };
                    self.stream.set_write_timeout(self.write_timeout)?;
                    protocol.write_packet(&mut writer, &packet)?;
                    tracing::trace!(peer = %self.id, "Packet written");
                }
                recv(self.shutdown_rx) -> _ => return Ok(()),
            }
        }
    }

    fn dispatch_loop(self: &Arc<Self>, handler: &dyn Handler<P>) -> Result<()> {
        loop {
            if self.is_shutdown() {
                return Ok(());
            }

            select! {
                recv(self.inbound_rx) -> packet => {
                    let Ok(packet) = packet else {
                        return Ok(());
                    };
                    handler.on_message(self, packet);
                }
                recv(self.shutdown_rx) -> _ => return Ok(()),
            }
        }
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Queue a packet for the writer stage
    ///
    /// Never blocks: a full queue is reported as [`NetError::BufferFull`] and
    /// the packet is handed back to nobody. The connection stays open.
    pub fn write_packet(&self, packet: P::Packet) -> Result<()> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        match self.outbound_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NetError::BufferFull),
            Err(TrySendError::Disconnected(_)) => Err(NetError::ConnectionClosed),
        }
    }

    /// Decode one packet straight off the socket, bypassing the pipeline
    ///
    /// Only meaningful before [`Connection::start`]; afterwards it would race
    /// the reader stage for bytes.
    pub fn read_packet(&self) -> Result<P::Packet> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        let protocol = self
            .protocol
            .as_ref()
            .ok_or_else(|| NetError::Config("no protocol configured".to_string()))?;

        self.stream.set_read_timeout(self.read_timeout)?;
        let mut reader = &self.stream;
        protocol.read_packet(&mut reader)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Registry key: the remote address as `ip:port`
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True from the moment a close begins
    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_addr.ip()
    }

    /// The underlying socket
    pub fn raw_stream(&self) -> &TcpStream {
        &self.stream
    }

    fn is_shutdown(&self) -> bool {
        matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl<P: Protocol> std::fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

thread_local! {
    /// Set while the current thread runs a pipeline stage of any connection
    static IN_STAGE: Cell<bool> = Cell::new(false);
}

fn on_stage_thread() -> bool {
    IN_STAGE.with(Cell::get)
}

fn deadline(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
