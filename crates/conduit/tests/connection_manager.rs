use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Condvar, Mutex, Weak},
    time::{Duration, Instant},
};

use conduit::{
    Comm, CommConfig, ConnectionHandlerFactory, ConnectionInitializer, ConnectionManager,
    DispatchHandler, Event, Frame, PROTOCOL_NONE, codec,
};

fn comm() -> Arc<Comm> {
    let config = CommConfig {
        reactor_count: 2,
        poll_interval_ms: 50,
        reconnect_initial_ms: 100,
        reconnect_max_ms: 1000,
        connect_timeout_ms: 2000,
        ..CommConfig::default()
    };
    Arc::new(Comm::new(config).expect("comm setup"))
}

fn bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

/// Publishes the address of each accepted connection.
#[derive(Default)]
struct AcceptLog {
    peers: Mutex<Vec<SocketAddr>>,
    cond: Condvar,
}

impl AcceptLog {
    fn wait_for(&self, n: usize, timeout: Duration) -> Vec<SocketAddr> {
        let deadline = Instant::now() + timeout;
        let mut peers = self.peers.lock().unwrap();
        while peers.len() < n {
            let now = Instant::now();
            assert!(now < deadline, "only {} of {n} connections accepted", peers.len());
            let (guard, _) = self.cond.wait_timeout(peers, deadline - now).unwrap();
            peers = guard;
        }
        peers.clone()
    }
}

struct LoggingFactory {
    log: Arc<AcceptLog>,
}

impl ConnectionHandlerFactory for LoggingFactory {
    fn make_handler(&self, peer: SocketAddr) -> Arc<dyn DispatchHandler> {
        self.log.peers.lock().unwrap().push(peer);
        self.log.cond.notify_all();
        Arc::new(|_event: Event| {})
    }
}

/// Counts CONNECTED events so a test can observe reconnects.
#[derive(Default)]
struct ConnectCounter {
    count: Mutex<usize>,
    cond: Condvar,
}

impl ConnectCounter {
    fn wait_for(&self, n: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count < n {
            let now = Instant::now();
            assert!(now < deadline, "saw {} of {n} connects", *count);
            let (guard, _) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
        }
    }
}

impl DispatchHandler for ConnectCounter {
    fn handle(&self, event: Event) {
        if matches!(event, Event::Connected { .. }) {
            *self.count.lock().unwrap() += 1;
            self.cond.notify_all();
        }
    }
}

#[test]
fn managed_peer_reconnects_after_server_side_close() {
    let server = comm();
    let log = Arc::new(AcceptLog::default());
    let factory = Arc::new(LoggingFactory { log: log.clone() });
    let noop: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    let addr = server.listen(bind_addr(), factory, noop).expect("listen");

    let client = comm();
    let manager = ConnectionManager::new(client.clone()).expect("manager");
    let counter = Arc::new(ConnectCounter::default());
    manager.add(addr, counter.clone());

    assert!(manager.wait_for_connection(addr, Duration::from_secs(5)), "initial connect");
    counter.wait_for(1, Duration::from_secs(5));

    // Server drops the connection; the manager must dial back in.
    let peers = log.wait_for(1, Duration::from_secs(5));
    server.close(peers[0]).expect("server close");

    counter.wait_for(2, Duration::from_secs(10));
    assert!(manager.wait_for_connection(addr, Duration::from_secs(5)), "reconnect");
    let _ = log.wait_for(2, Duration::from_secs(5));

    manager.remove(addr);
    assert!(!manager.wait_for_connection(addr, Duration::from_millis(100)));
}

#[test]
fn wait_for_connection_times_out_without_a_server() {
    let client = comm();
    let manager = ConnectionManager::new(client).expect("manager");
    // Discard port: nothing is listening there.
    let dead = SocketAddr::from((Ipv4Addr::LOCALHOST, 9));
    let handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    manager.add(dead, handler);
    assert!(!manager.wait_for_connection(dead, Duration::from_millis(500)));
}

/// Greets with "hello" and accepts the connection only when the peer's
/// response comes back uppercased.
struct GreetingInitializer;

impl ConnectionInitializer for GreetingInitializer {
    fn create_initialization_request(&self) -> Frame {
        let mut frame = Frame::new(PROTOCOL_NONE, 32);
        frame.append_vstr("hello");
        frame
    }

    fn process_initialization_response(&self, event: &Event) -> bool {
        let Event::Message { payload, .. } = event else { return false };
        let mut cursor = &payload[..];
        codec::decode_vstr(&mut cursor).is_ok_and(|text| text == "HELLO")
    }
}

struct UppercaseFactory {
    comm: Weak<Comm>,
}

impl ConnectionHandlerFactory for UppercaseFactory {
    fn make_handler(&self, _peer: SocketAddr) -> Arc<dyn DispatchHandler> {
        let comm = self.comm.clone();
        Arc::new(move |event: Event| {
            if let Event::Message { peer, header, payload } = event {
                let Some(comm) = comm.upgrade() else { return };
                let mut cursor = &payload[..];
                let text = codec::decode_vstr(&mut cursor).expect("request payload");
                let mut response = Frame::new(PROTOCOL_NONE, 32);
                response.initialize_from_request(&header);
                response.append_vstr(&text.to_uppercase());
                comm.send_response(peer, response).expect("send response");
            }
        })
    }
}

#[test]
fn initializer_handshake_gates_connection_established() {
    let server = comm();
    let factory = Arc::new(UppercaseFactory { comm: Arc::downgrade(&server) });
    let noop: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    let addr = server.listen(bind_addr(), factory, noop).expect("listen");

    let client = comm();
    let manager = ConnectionManager::new(client).expect("manager");
    let counter = Arc::new(ConnectCounter::default());
    manager.add_with_initializer(addr, counter.clone(), Some(Arc::new(GreetingInitializer)));

    assert!(manager.wait_for_connection(addr, Duration::from_secs(5)), "handshake connect");
    counter.wait_for(1, Duration::from_secs(5));
}
