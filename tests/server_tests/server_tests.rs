//! Tests for Server
//!
//! These tests verify:
//! - End-to-end echo through the accept loop
//! - Registry size tracks open connections, with async reclamation
//! - close() disconnects every connection and stops the accept loop
//! - connect() runs outbound sockets through the same pipeline
//! - Address and lifecycle error paths

#[path = "../common/mod.rs"]
mod common;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::{
    as_handler, connect_client, recv_frame, send_frame, spawn_server, test_config, wait_until,
    Behavior, Recorder, WAIT,
};
use tcpcore::{Config, Connection, Frame, Handler, LengthPrefixed, NetError, Server};

// =============================================================================
// Helper Functions
// =============================================================================

/// Echo handler whose very first on_connected panics
struct PanicOnFirstConnect {
    inner: Arc<Recorder>,
    tripped: AtomicBool,
}

impl Handler<LengthPrefixed> for PanicOnFirstConnect {
    fn on_connected(&self, conn: &Arc<Connection<LengthPrefixed>>) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("greeting failed");
        }
        Handler::<LengthPrefixed>::on_connected(&*self.inner, conn);
    }

    fn on_message(&self, conn: &Arc<Connection<LengthPrefixed>>, packet: Frame) {
        Handler::<LengthPrefixed>::on_message(&*self.inner, conn, packet);
    }

    fn on_disconnected(&self, conn: &Arc<Connection<LengthPrefixed>>) {
        Handler::<LengthPrefixed>::on_disconnected(&*self.inner, conn);
    }

    fn on_error(&self, err: &NetError) {
        Handler::<LengthPrefixed>::on_error(&*self.inner, err);
    }
}

// =============================================================================
// Echo Tests
// =============================================================================

#[test]
fn test_server_echo_ping() {
    let recorder = Recorder::new(Behavior::Echo);
    let (server, addr, accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &recorder);

    let mut client = connect_client(addr);
    send_frame(&mut client, b"ping");

    assert_eq!(recv_frame(&mut client), b"ping");
    assert_eq!(recorder.messages.lock().as_slice(), &[b"ping".to_vec()]);

    server.close();
    assert!(matches!(accept.join().unwrap(), Err(NetError::ServerClosed)));
}

#[test]
fn test_get_connection_by_remote_address() {
    let recorder = Recorder::new(Behavior::Record);
    let (server, addr, _accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &recorder);

    let client = connect_client(addr);
    let id = client.local_addr().unwrap().to_string();

    assert!(wait_until(WAIT, || server.get_connection(&id).is_some()));
    assert_eq!(server.get_connection(&id).unwrap().id(), id);
    assert!(server.get_connection("127.0.0.1:1").is_none());

    server.close();
}

// =============================================================================
// Registry Tracking Tests
// =============================================================================

fn check_registry_tracks_connections(n: usize) {
    let recorder = Recorder::new(Behavior::Record);
    let (server, addr, _accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &recorder);

    let dialers: Vec<_> = (0..n)
        .map(|_| thread::spawn(move || connect_client(addr)))
        .collect();
    let clients: Vec<_> = dialers.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(wait_until(WAIT, || server.connection_count() == n));
    assert!(wait_until(WAIT, || recorder.connected() == n));

    drop(clients);

    assert!(wait_until(WAIT, || recorder.disconnected() == n));
    assert!(wait_until(WAIT, || server.get_all_connections().is_empty()));

    server.close();
}

#[test]
fn test_registry_tracks_zero_connections() {
    check_registry_tracks_connections(0);
}

#[test]
fn test_registry_tracks_one_connection() {
    check_registry_tracks_connections(1);
}

#[test]
fn test_registry_tracks_many_connections() {
    check_registry_tracks_connections(8);
}

#[test]
fn test_partial_disconnect_leaves_the_rest() {
    let recorder = Recorder::new(Behavior::Record);
    let (server, addr, _accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &recorder);

    let mut clients: Vec<_> = (0..4).map(|_| connect_client(addr)).collect();
    assert!(wait_until(WAIT, || server.connection_count() == 4));

    clients.truncate(1);

    assert!(wait_until(WAIT, || server.connection_count() == 1));
    let remaining = clients[0].local_addr().unwrap().to_string();
    assert!(server.get_connection(&remaining).is_some());

    server.close();
}

#[test]
fn test_on_connected_panic_keeps_accepting() {
    let recorder = Recorder::new(Behavior::Echo);
    let handler: Arc<dyn Handler<LengthPrefixed>> = Arc::new(PanicOnFirstConnect {
        inner: Arc::clone(&recorder),
        tripped: AtomicBool::new(false),
    });
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(test_config(), handler, Arc::new(LengthPrefixed)).unwrap());
    let accept = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve(listener))
    };

    // The panicking connection is closed and reclaimed
    let mut first = connect_client(addr);
    let first_id = first.local_addr().unwrap().to_string();
    let err = tcpcore::Protocol::read_packet(&LengthPrefixed, &mut first).unwrap_err();
    assert!(err.is_eof());
    assert!(wait_until(WAIT, || server.get_connection(&first_id).is_none()));

    // The accept loop survived
    let mut second = connect_client(addr);
    send_frame(&mut second, b"ping");
    assert_eq!(recv_frame(&mut second), b"ping");
    assert!(!accept.is_finished());
    assert_eq!(recorder.connected(), 1);

    server.close();
    assert!(matches!(accept.join().unwrap(), Err(NetError::ServerClosed)));
}

// =============================================================================
// Close Tests
// =============================================================================

#[test]
fn test_close_disconnects_all_connections() {
    let recorder = Recorder::new(Behavior::Record);
    let (server, addr, accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &recorder);

    let _clients: Vec<_> = (0..3).map(|_| connect_client(addr)).collect();
    assert!(wait_until(WAIT, || recorder.connected() == 3));

    server.close();

    assert_eq!(recorder.disconnected(), 3);
    assert!(wait_until(WAIT, || server.get_all_connections().is_empty()));
    assert!(matches!(accept.join().unwrap(), Err(NetError::ServerClosed)));
    assert!(server.is_stopped());
}

#[test]
fn test_close_twice_is_harmless() {
    let recorder = Recorder::new(Behavior::Record);
    let (server, addr, accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &recorder);

    let _client = connect_client(addr);
    assert!(wait_until(WAIT, || recorder.connected() == 1));

    server.close();
    server.close();

    assert_eq!(recorder.disconnected(), 1);
    assert!(accept.join().unwrap().is_err());
}

#[test]
fn test_serve_after_close_returns_immediately() {
    let server = Server::new(
        test_config(),
        as_handler(&Recorder::new(Behavior::Record)),
        Arc::new(LengthPrefixed),
    )
    .unwrap();
    server.close();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    assert!(matches!(server.serve(listener), Err(NetError::ServerClosed)));
}

#[test]
fn test_evict_suppresses_disconnect() {
    let recorder = Recorder::new(Behavior::Record);
    let (server, addr, _accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &recorder);

    let client = connect_client(addr);
    let id = client.local_addr().unwrap().to_string();
    assert!(wait_until(WAIT, || server.get_connection(&id).is_some()));

    let evicted = server.evict(&id).unwrap();

    assert!(evicted.is_closed());
    assert!(server.get_connection(&id).is_none());
    assert_eq!(recorder.disconnected(), 0);

    server.close();
}

// =============================================================================
// Outbound Connection Tests
// =============================================================================

#[test]
fn test_connect_is_symmetric() {
    let remote = Recorder::new(Behavior::Echo);
    let (server, addr, _accept) = spawn_server(test_config(), Arc::new(LengthPrefixed), &remote);

    let local = Recorder::new(Behavior::Record);
    let dialer = Server::new(test_config(), as_handler(&local), Arc::new(LengthPrefixed)).unwrap();

    let conn = dialer
        .connect(&addr.to_string(), as_handler(&local), Arc::new(LengthPrefixed))
        .unwrap();
    assert_eq!(conn.peer_addr(), addr);
    assert!(dialer.get_connection(conn.id()).is_some());

    conn.write_packet(tcpcore::Frame::from("hello")).unwrap();

    assert!(wait_until(WAIT, || local.message_count() == 1));
    assert_eq!(local.messages.lock()[0], b"hello");
    assert_eq!(local.connected(), 1);
    assert_eq!(remote.connected(), 1);

    dialer.close();
    assert_eq!(local.disconnected(), 1);
    assert!(wait_until(WAIT, || remote.disconnected() == 1));

    server.close();
}

#[test]
fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let recorder = Recorder::new(Behavior::Record);
    let dialer =
        Server::new(test_config(), as_handler(&recorder), Arc::new(LengthPrefixed)).unwrap();

    let result = dialer.connect(&addr.to_string(), as_handler(&recorder), Arc::new(LengthPrefixed));
    assert!(matches!(result, Err(NetError::Io(_))));
    assert_eq!(dialer.connection_count(), 0);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_listen_on_bad_address() {
    let config = Config::builder().listen_addr("not-an-address").build();
    let server = Server::new(
        config,
        as_handler(&Recorder::new(Behavior::Record)),
        Arc::new(LengthPrefixed),
    )
    .unwrap();

    assert!(server.listen_and_serve().is_err());
}

#[test]
fn test_invalid_config_rejected() {
    let config = Config::builder().inbound_capacity(0).build();
    let result = Server::new(
        config,
        as_handler(&Recorder::new(Behavior::Record)),
        Arc::new(LengthPrefixed),
    );

    assert!(matches!(result, Err(NetError::Config(_))));
}
