use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use conduit::{
    Comm, CommConfig, ConnectionHandlerFactory, DispatchHandler, DispatchHandlerSynchronizer,
    ErrorKind, Event, Frame, PROTOCOL_NONE, codec,
};

fn bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

struct SilentFactory;

impl ConnectionHandlerFactory for SilentFactory {
    fn make_handler(&self, _peer: SocketAddr) -> Arc<dyn DispatchHandler> {
        Arc::new(|_event: Event| {})
    }
}

#[test]
fn send_to_unknown_peer_is_not_connected() {
    let comm = Comm::new(CommConfig { reactor_count: 1, ..CommConfig::default() }).expect("comm");
    let nowhere = SocketAddr::from((Ipv4Addr::LOCALHOST, 9));
    let frame = Frame::new(PROTOCOL_NONE, 8);
    assert_eq!(
        comm.send_request(nowhere, Duration::from_secs(1), frame, None),
        Err(ErrorKind::CommNotConnected)
    );
    let frame = Frame::new(PROTOCOL_NONE, 8);
    assert_eq!(comm.send_response(nowhere, frame), Err(ErrorKind::CommNotConnected));
}

#[test]
fn duplicate_connect_is_already_connected() {
    let comm = Comm::new(CommConfig { reactor_count: 1, ..CommConfig::default() }).expect("comm");
    let noop: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    let addr = comm.listen(bind_addr(), Arc::new(SilentFactory), noop).expect("listen");

    let handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    comm.connect(addr, handler.clone()).expect("first connect");
    assert_eq!(comm.connect(addr, handler), Err(ErrorKind::CommAlreadyConnected));
}

#[test]
fn unresolvable_proxy_is_rejected() {
    let comm = Comm::new(CommConfig { reactor_count: 1, ..CommConfig::default() }).expect("comm");
    let handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    assert_eq!(comm.connect("no-such-service", handler), Err(ErrorKind::CommInvalidProxy));
}

#[test]
fn proxy_names_resolve_through_the_facade() {
    let server = Arc::new(
        Comm::new(CommConfig { reactor_count: 1, poll_interval_ms: 50, ..CommConfig::default() })
            .expect("comm"),
    );
    let factory = Arc::new(UppercaseFactory { comm: Arc::downgrade(&server) });
    let noop: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    let addr = server.listen(bind_addr(), factory, noop).expect("listen");

    let client =
        Comm::new(CommConfig { reactor_count: 1, poll_interval_ms: 50, ..CommConfig::default() })
            .expect("comm");
    client.add_proxy("frame-store", addr);

    let handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    client.connect("frame-store", handler).expect("connect via proxy");

    let reply = Arc::new(DispatchHandlerSynchronizer::new());
    let mut request = Frame::new(PROTOCOL_NONE, 32);
    request.append_vstr("abc");
    client
        .send_request("frame-store", Duration::from_secs(2), request, Some(reply.clone()))
        .expect("send via proxy");

    let event = reply
        .wait_timeout(Duration::from_secs(5))
        .expect("reply before deadline")
        .expect("reply not an error");
    let Event::Message { payload, .. } = event else { panic!("expected a message event") };
    let mut cursor = &payload[..];
    assert_eq!(codec::decode_vstr(&mut cursor).expect("payload"), "ABC");

    client.remove_proxy("frame-store");
    let frame = Frame::new(PROTOCOL_NONE, 8);
    assert_eq!(
        client.send_request("frame-store", Duration::from_secs(1), frame, None),
        Err(ErrorKind::CommInvalidProxy)
    );
}

#[test]
fn frames_beyond_the_queue_budget_are_refused() {
    let server = Comm::new(CommConfig { reactor_count: 1, ..CommConfig::default() }).expect("comm");
    let noop: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    let addr = server.listen(bind_addr(), Arc::new(SilentFactory), noop).expect("listen");

    let client = Comm::new(CommConfig {
        reactor_count: 1,
        send_queue_bytes: 1024,
        ..CommConfig::default()
    })
    .expect("comm");
    let handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Event| {});
    client.connect(addr, handler).expect("connect");

    let mut request = Frame::new(PROTOCOL_NONE, 2048);
    request.append_bytes(&[0u8; 2048]);
    assert_eq!(
        client.send_request(addr, Duration::from_secs(1), request, None),
        Err(ErrorKind::CommSendQueueFull)
    );
}

#[test]
fn timers_fire_at_or_after_their_deadline() {
    let comm = Comm::new(CommConfig {
        reactor_count: 1,
        poll_interval_ms: 50,
        ..CommConfig::default()
    })
    .expect("comm");

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    let relative = tx.clone();
    comm.set_timer(
        Duration::from_millis(100),
        Arc::new(move |event: Event| {
            let _ = relative.send(event);
        }),
    );
    comm.set_timer_absolute(
        started + Duration::from_millis(150),
        Arc::new(move |event: Event| {
            let _ = tx.send(event);
        }),
    );

    for _ in 0..2 {
        let event = rx.recv_timeout(Duration::from_secs(5)).expect("timer event");
        assert_eq!(event, Event::Timer);
    }
    assert!(started.elapsed() >= Duration::from_millis(150));
}

struct UppercaseFactory {
    comm: std::sync::Weak<Comm>,
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
