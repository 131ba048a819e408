use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use conduit::{
    Comm, CommConfig, ConnectionHandlerFactory, DispatchHandler, DispatchHandlerSynchronizer,
    ErrorKind, Event, Frame, PROTOCOL_NONE, ReplySynchronizer,
};

fn comm() -> Arc<Comm> {
    let config = CommConfig { reactor_count: 2, poll_interval_ms: 50, ..CommConfig::default() };
    Arc::new(Comm::new(config).expect("comm setup"))
}

fn bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

/// A server that accepts connections and never answers anything.
struct SilentFactory;

impl ConnectionHandlerFactory for SilentFactory {
    fn make_handler(&self, _peer: SocketAddr) -> Arc<dyn DispatchHandler> {
        Arc::new(|_event: Event| {})
    }
}

#[test]
fn unanswered_request_times_out() {
    let server = comm();
    let noop: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    let addr = server.listen(bind_addr(), Arc::new(SilentFactory), noop).expect("listen");

    let client = comm();
    let default_handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    client.connect(addr, default_handler).expect("connect");

    let reply = Arc::new(DispatchHandlerSynchronizer::new());
    let mut request = Frame::new(PROTOCOL_NONE, 16);
    request.append_u32(42);
    let started = Instant::now();
    client
        .send_request(addr, Duration::from_millis(100), request, Some(reply.clone()))
        .expect("send request");

    let outcome = reply.wait_timeout(Duration::from_secs(5)).expect("timeout fired");
    let elapsed = started.elapsed();
    assert_eq!(outcome, Err(ErrorKind::RequestTimeout));
    assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
    // Tolerance is bounded by the reactor poll interval plus scheduling
    // noise; a second of slack keeps this stable on loaded machines.
    assert!(elapsed <= Duration::from_millis(1100), "fired late: {elapsed:?}");
}

#[test]
fn close_sweeps_pending_requests() {
    let server = comm();
    let noop: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    let addr = server.listen(bind_addr(), Arc::new(SilentFactory), noop).expect("listen");

    let client = comm();
    let default_handler = Arc::new(ReplySynchronizer::new());
    client.connect(addr, default_handler.clone()).expect("connect");

    let pending: Vec<Arc<DispatchHandlerSynchronizer>> =
        (0..3).map(|_| Arc::new(DispatchHandlerSynchronizer::new())).collect();
    for handler in &pending {
        let mut request = Frame::new(PROTOCOL_NONE, 16);
        request.append_u32(7);
        client
            .send_request(addr, Duration::from_secs(30), request, Some(handler.clone()))
            .expect("send request");
    }

    client.close(addr).expect("close");

    for handler in &pending {
        let outcome = handler.wait_timeout(Duration::from_secs(5)).expect("sweep error");
        assert_eq!(outcome, Err(ErrorKind::CommNotConnected));
    }
    // Exactly one DISCONNECT for the default handler, nothing after it.
    let disconnect = default_handler.wait_for_reply_timeout(Duration::from_secs(5));
    assert_eq!(disconnect, Some(Err(ErrorKind::Ok)));
    assert_eq!(default_handler.wait_for_reply_timeout(Duration::from_millis(300)), None);

    // The peer is gone for the façade as well.
    let mut request = Frame::new(PROTOCOL_NONE, 16);
    request.append_u32(7);
    let refused = client.send_request(addr, Duration::from_secs(1), request, None);
    assert_eq!(refused, Err(ErrorKind::CommNotConnected));
}
