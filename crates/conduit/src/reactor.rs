use std::{
    collections::{BinaryHeap, HashMap},
    io,
    net::SocketAddr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU8, AtomicUsize, Ordering},
        mpsc::{Receiver, Sender, TryRecvError},
    },
    time::{Duration, Instant},
};

use conduit_wire::Frame;
use mio::{
    Events, Interest, Poll, Token, Waker,
    net::{TcpListener, TcpStream, UdpSocket},
};
use tracing::{debug, error, warn};

use crate::{
    config::CommConfig,
    datagram::DatagramHandler,
    error::ErrorKind,
    event::{ConnectionHandlerFactory, ConnectionInitializer, DispatchHandler, Event},
    lock,
    stream::{IoOutcome, StreamHandler},
};

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Shared connection registry: peer address (stream) or local address
/// (datagram) to the cross-thread connection descriptor.
pub(crate) type ConnMap = Arc<RwLock<HashMap<SocketAddr, Arc<ConnShared>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Connected = 2,
    Disconnecting = 3,
    Closed = 4,
}

/// The part of a connection visible off-reactor. The façade reads `state`
/// and `queued_bytes` for its synchronous checks; everything else about a
/// connection is private to the owning reactor thread.
#[derive(Debug)]
pub(crate) struct ConnShared {
    pub(crate) peer: SocketAddr,
    pub(crate) reactor: usize,
    token: Token,
    state: AtomicU8,
    pub(crate) queued_bytes: AtomicUsize,
}

impl ConnShared {
    pub(crate) fn new(
        peer: SocketAddr,
        reactor: usize,
        token: Token,
        state: ConnectionState,
    ) -> Self {
        Self {
            peer,
            reactor,
            token,
            state: AtomicU8::new(state as u8),
            queued_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Closed,
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Cross-thread operations enqueued onto a reactor. The sender wakes the
/// reactor after enqueueing; the queue drains at the top of each loop turn.
pub(crate) enum Command {
    RegisterStream {
        stream: TcpStream,
        shared: Arc<ConnShared>,
        handler: Arc<dyn DispatchHandler>,
        initializer: Option<Arc<dyn ConnectionInitializer>>,
        connected: bool,
    },
    RegisterListener {
        listener: TcpListener,
        local: SocketAddr,
        token: Token,
        factory: Arc<dyn ConnectionHandlerFactory>,
        handler: Arc<dyn DispatchHandler>,
    },
    RegisterDatagram {
        socket: UdpSocket,
        shared: Arc<ConnShared>,
        handler: Arc<dyn DispatchHandler>,
    },
    SendRequest {
        shared: Arc<ConnShared>,
        frame: Frame,
        timeout: Duration,
        handler: Option<Arc<dyn DispatchHandler>>,
    },
    SendResponse {
        shared: Arc<ConnShared>,
        frame: Frame,
    },
    SendDatagram {
        shared: Arc<ConnShared>,
        peer: SocketAddr,
        frame: Frame,
    },
    Close {
        shared: Arc<ConnShared>,
    },
    SetTimer {
        deadline: Instant,
        handler: Arc<dyn DispatchHandler>,
    },
    Shutdown,
}

pub(crate) struct ReactorHandle {
    tx: Sender<Command>,
    waker: Waker,
    next_token: AtomicUsize,
}

impl ReactorHandle {
    pub(crate) fn new(tx: Sender<Command>, waker: Waker) -> Self {
        Self { tx, waker, next_token: AtomicUsize::new(0) }
    }

    pub(crate) fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_ok() {
            if let Err(err) = self.waker.wake() {
                warn!(?err, "reactor wake failed");
            }
        }
    }

    /// Tokens are scoped to one reactor and never reused.
    pub(crate) fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct ReactorPool {
    handles: Vec<ReactorHandle>,
    next: AtomicUsize,
}

impl ReactorPool {
    pub(crate) fn new(handles: Vec<ReactorHandle>) -> Self {
        Self { handles, next: AtomicUsize::new(0) }
    }

    pub(crate) fn handle(&self, index: usize) -> &ReactorHandle {
        &self.handles[index]
    }

    pub(crate) fn handles(&self) -> &[ReactorHandle] {
        &self.handles
    }

    /// Round-robin assignment of new sockets to reactors.
    pub(crate) fn next_index(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len()
    }
}

struct TimerEntry {
    deadline: Instant,
    handler: Arc<dyn DispatchHandler>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the nearest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

/// Lazily invalidated index into a connection's pending-request table. A
/// popped entry whose request was already answered or swept is a no-op.
pub(crate) struct ExpiryEntry {
    pub(crate) deadline: Instant,
    pub(crate) token: Token,
    pub(crate) id: u32,
}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for ExpiryEntry {}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

struct ListenerHandler {
    listener: TcpListener,
    local: SocketAddr,
    factory: Arc<dyn ConnectionHandlerFactory>,
    handler: Arc<dyn DispatchHandler>,
}

enum HandlerVariant {
    Stream(StreamHandler),
    Listener(ListenerHandler),
    Datagram(DatagramHandler),
}

/// One readiness loop. Owns its registered I/O handlers, a timer heap and
/// the pending-request expiry heap; everything it touches is thread-private
/// except the shared connection maps.
pub(crate) struct Reactor {
    index: usize,
    poll: Poll,
    rx: Receiver<Command>,
    config: Arc<CommConfig>,
    streams_map: ConnMap,
    datagram_map: ConnMap,
    pool: Arc<ReactorPool>,
    conns: Vec<(Token, HandlerVariant)>,
    timers: BinaryHeap<TimerEntry>,
    expiries: BinaryHeap<ExpiryEntry>,
    shutdown: bool,
}

impl Reactor {
    pub(crate) fn new(
        index: usize,
        poll: Poll,
        rx: Receiver<Command>,
        config: Arc<CommConfig>,
        streams_map: ConnMap,
        datagram_map: ConnMap,
        pool: Arc<ReactorPool>,
    ) -> Self {
        Self {
            index,
            poll,
            rx,
            config,
            streams_map,
            datagram_map,
            pool,
            conns: Vec::new(),
            timers: BinaryHeap::new(),
            expiries: BinaryHeap::new(),
            shutdown: false,
        }
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            self.drain_commands();
            if self.shutdown {
                break;
            }
            self.fire_timers();
            self.sweep_expiries();

            let timeout = self.next_timeout();
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, reactor = self.index, "poll failed");
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(token, event.is_readable(), event.is_writable());
            }
        }
        debug!(reactor = self.index, "reactor stopped");
    }

    fn drain_commands(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(cmd) => self.apply(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    break;
                }
            }
        }
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterStream { stream, shared, handler, initializer, connected } => {
                let token = shared.token();
                let peer = shared.peer;
                let mut conn = StreamHandler::new(
                    stream,
                    shared,
                    handler,
                    initializer,
                    connected,
                    &self.config,
                );
                if let Err(err) = conn.register(self.poll.registry()) {
                    error!(?err, ?peer, "stream registration failed");
                    self.forget_stream(&conn);
                    conn.teardown(self.poll.registry(), ErrorKind::CommConnectFailure, false);
                    return;
                }
                self.conns.push((token, HandlerVariant::Stream(conn)));
                if connected && let Some((_, HandlerVariant::Stream(conn))) = self.conns.last() {
                    conn.notify_connected();
                }
            }
            Command::RegisterListener { listener, local, token, factory, handler } => {
                let mut listener = listener;
                if let Err(err) =
                    self.poll.registry().register(&mut listener, token, Interest::READABLE)
                {
                    error!(?err, ?local, "listener registration failed");
                    handler.handle(Event::Error { peer: local, kind: ErrorKind::CommBindFailure });
                    return;
                }
                let entry = ListenerHandler { listener, local, factory, handler };
                self.conns.push((token, HandlerVariant::Listener(entry)));
            }
            Command::RegisterDatagram { socket, shared, handler } => {
                let token = shared.token();
                let mut conn = DatagramHandler::new(socket, shared, handler);
                if let Err(err) = conn.register(self.poll.registry()) {
                    error!(?err, "datagram registration failed");
                    let mut map = lock::write(&self.datagram_map);
                    if map.get(&conn.local()).is_some_and(|c| Arc::ptr_eq(c, conn.shared())) {
                        let _ = map.remove(&conn.local());
                    }
                    drop(map);
                    conn.notify_error(ErrorKind::CommBindFailure);
                    return;
                }
                self.conns.push((token, HandlerVariant::Datagram(conn)));
            }
            Command::SendRequest { shared, frame, timeout, handler } => {
                match self.position(shared.token()) {
                    Some(i) => {
                        if let HandlerVariant::Stream(conn) = &mut self.conns[i].1 {
                            let outcome = conn.send_request(
                                frame,
                                timeout,
                                handler,
                                self.poll.registry(),
                                &mut self.expiries,
                            );
                            if let IoOutcome::Disconnected(kind) = outcome {
                                self.teardown_at(i, kind, false);
                            }
                        }
                    }
                    None => {
                        // The connection died between the façade check and
                        // this reactor turn; the frame is not dropped
                        // silently.
                        let _ =
                            shared.queued_bytes.fetch_sub(frame.wire_len(), Ordering::Relaxed);
                        if let Some(handler) = handler {
                            handler.handle(Event::Error {
                                peer: shared.peer,
                                kind: ErrorKind::CommNotConnected,
                            });
                        }
                    }
                }
            }
            Command::SendResponse { shared, frame } => match self.position(shared.token()) {
                Some(i) => {
                    if let HandlerVariant::Stream(conn) = &mut self.conns[i].1 {
                        let outcome = conn.send_response(frame, self.poll.registry());
                        if let IoOutcome::Disconnected(kind) = outcome {
                            self.teardown_at(i, kind, false);
                        }
                    }
                }
                None => {
                    let _ = shared.queued_bytes.fetch_sub(frame.wire_len(), Ordering::Relaxed);
                    debug!(peer = ?shared.peer, "response dropped, connection gone");
                }
            },
            Command::SendDatagram { shared, peer, frame } => {
                if let Some(i) = self.position(shared.token()) &&
                    let HandlerVariant::Datagram(conn) = &mut self.conns[i].1
                {
                    conn.send(peer, frame, self.poll.registry());
                }
            }
            Command::Close { shared } => {
                if let Some(i) = self.position(shared.token()) {
                    self.teardown_at(i, ErrorKind::Ok, true);
                }
            }
            Command::SetTimer { deadline, handler } => {
                self.timers.push(TimerEntry { deadline, handler });
            }
            Command::Shutdown => self.shutdown = true,
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(i) = self.position(token) else {
            // Readiness can trail a teardown within one poll batch.
            debug!(?token, "event for unregistered token");
            return;
        };
        match &mut self.conns[i].1 {
            HandlerVariant::Stream(conn) => {
                let outcome = conn.on_ready(readable, writable, self.poll.registry(), &self.config);
                if let IoOutcome::Disconnected(kind) = outcome {
                    self.teardown_at(i, kind, false);
                }
            }
            HandlerVariant::Listener(listener) => {
                accept_loop(listener, &self.pool, &self.streams_map);
            }
            HandlerVariant::Datagram(conn) => {
                conn.on_ready(readable, writable, self.poll.registry());
            }
        }
    }

    fn position(&self, token: Token) -> Option<usize> {
        self.conns.iter().position(|(t, _)| *t == token)
    }

    /// Drops the registry entry for a stream, but only if it still points at
    /// this connection; a reconnect may already have replaced it.
    fn forget_stream(&self, conn: &StreamHandler) {
        let peer = conn.shared().peer;
        let mut map = lock::write(&self.streams_map);
        if map.get(&peer).is_some_and(|c| Arc::ptr_eq(c, conn.shared())) {
            let _ = map.remove(&peer);
        }
    }

    fn teardown_at(&mut self, i: usize, kind: ErrorKind, local: bool) {
        let (_token, variant) = self.conns.swap_remove(i);
        match variant {
            HandlerVariant::Stream(mut conn) => {
                // Registry first so handlers invoked by the sweep can
                // reconnect to the same peer; the map lock is never held
                // across handler calls.
                self.forget_stream(&conn);
                conn.teardown(self.poll.registry(), kind, local);
            }
            HandlerVariant::Listener(mut listener) => {
                let _ = self.poll.registry().deregister(&mut listener.listener);
            }
            HandlerVariant::Datagram(mut conn) => {
                {
                    let mut map = lock::write(&self.datagram_map);
                    if map.get(&conn.local()).is_some_and(|c| Arc::ptr_eq(c, conn.shared())) {
                        let _ = map.remove(&conn.local());
                    }
                }
                conn.deregister(self.poll.registry());
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while self.timers.peek().is_some_and(|t| t.deadline <= now) {
            if let Some(timer) = self.timers.pop() {
                timer.handler.handle(Event::Timer);
            }
        }
    }

    fn sweep_expiries(&mut self) {
        let now = Instant::now();
        while self.expiries.peek().is_some_and(|e| e.deadline <= now) {
            let Some(expiry) = self.expiries.pop() else { break };
            if let Some(i) = self.position(expiry.token) &&
                let HandlerVariant::Stream(conn) = &mut self.conns[i].1
            {
                conn.expire_pending(expiry.id, now);
            }
        }
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = self.config.poll_interval();
        if let Some(timer) = self.timers.peek() {
            timeout = timeout.min(timer.deadline.saturating_duration_since(now));
        }
        if let Some(expiry) = self.expiries.peek() {
            timeout = timeout.min(expiry.deadline.saturating_duration_since(now));
        }
        timeout
    }
}

fn accept_loop(entry: &mut ListenerHandler, pool: &Arc<ReactorPool>, streams_map: &ConnMap) {
    loop {
        match entry.listener.accept() {
            Ok((stream, peer)) => {
                let handler = entry.factory.make_handler(peer);
                let index = pool.next_index();
                let handle = pool.handle(index);
                let token = handle.alloc_token();
                let shared =
                    Arc::new(ConnShared::new(peer, index, token, ConnectionState::Connected));
                let _ = lock::write(streams_map).insert(peer, shared.clone());
                handle.send(Command::RegisterStream {
                    stream,
                    shared,
                    handler,
                    initializer: None,
                    connected: true,
                });
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(?err, local = ?entry.local, "accept failed");
                entry
                    .handler
                    .handle(Event::Error { peer: entry.local, kind: ErrorKind::CommBrokenConnection });
                break;
            }
        }
    }
}
