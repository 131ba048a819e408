use std::{
    collections::{HashMap, VecDeque},
    io::{self, IoSlice, Read, Write},
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use conduit_wire::{Flags, Frame, Header};
use mio::{Interest, Registry};
use tracing::{debug, warn};

use crate::{
    config::CommConfig,
    error::ErrorKind,
    event::{ConnectionInitializer, DispatchHandler, Event},
    reactor::{ConnShared, ConnectionState, ExpiryEntry},
};

/// Result of driving a connection. `Disconnected` means the peer is gone and
/// the reactor must tear the connection down with the given kind.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IoOutcome {
    Alive,
    Disconnected(ErrorKind),
}

enum ReadOutcome {
    Frame(Header, Bytes),
    WouldBlock,
    Closed(ErrorKind),
}

#[derive(Clone, Copy)]
enum RxState {
    /// Accumulating the fixed-size frame header.
    Header { buf: [u8; Header::LEN], have: usize },
    /// Reading the `payload_len` bytes that follow the header.
    Payload { header: Header, have: usize },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Handshaking,
    Connected,
}

struct PendingRequest {
    handler: Arc<dyn DispatchHandler>,
    deadline: Instant,
    group: u32,
}

/// Per-group delivery bookkeeping. `order` holds request ids in submission
/// order; a response that arrives ahead of an earlier id parks until the
/// earlier slot is released by its own response, timeout or teardown.
#[derive(Default)]
struct GroupState {
    order: VecDeque<u32>,
    parked: HashMap<u32, (Arc<dyn DispatchHandler>, Event)>,
}

/// A single stream connection owned by one reactor.
///
/// Inbound bytes run the WAIT_HEADER -> WAIT_PAYLOAD machine and each
/// completed frame is routed: correlated responses to their pending-request
/// handler, everything else to the connection's default handler. Outbound
/// frames queue in FIFO order and drain with vectored writes; an unwritten
/// remainder keeps WRITABLE interest armed until the queue is empty.
pub(crate) struct StreamHandler {
    stream: mio::net::TcpStream,
    shared: Arc<ConnShared>,
    default_handler: Arc<dyn DispatchHandler>,
    initializer: Option<Arc<dyn ConnectionInitializer>>,
    phase: Phase,

    rx_state: RxState,
    rx_buf: BytesMut,

    tx_queue: VecDeque<Frame>,
    interest: Interest,

    pending: HashMap<u32, PendingRequest>,
    groups: HashMap<u32, GroupState>,
    /// Message ids are scoped to this connection; 0 is never issued.
    next_id: u32,
}

enum ConnectStep {
    Pending,
    Open,
    Failed(ErrorKind),
}

impl StreamHandler {
    pub(crate) fn new(
        stream: mio::net::TcpStream,
        shared: Arc<ConnShared>,
        default_handler: Arc<dyn DispatchHandler>,
        initializer: Option<Arc<dyn ConnectionInitializer>>,
        connected: bool,
        config: &CommConfig,
    ) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, "set_nodelay failed");
        }
        if let Some(size) = config.socket_buf_bytes {
            set_socket_buf_size(&stream, size);
        }
        let phase = if connected { Phase::Connected } else { Phase::Connecting };
        shared.set_state(if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        });
        let interest = if connected {
            Interest::READABLE
        } else {
            // WRITABLE readiness signals connect completion.
            Interest::READABLE | Interest::WRITABLE
        };
        Self {
            stream,
            shared,
            default_handler,
            initializer,
            phase,
            rx_state: RxState::Header { buf: [0; Header::LEN], have: 0 },
            rx_buf: BytesMut::new(),
            tx_queue: VecDeque::new(),
            interest,
            pending: HashMap::new(),
            groups: HashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.shared.token(), self.interest)
    }

    pub(crate) fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    pub(crate) fn notify_connected(&self) {
        self.default_handler.handle(Event::Connected { peer: self.shared.peer });
    }

    /// Drives the connection for one readiness event.
    pub(crate) fn on_ready(
        &mut self,
        readable: bool,
        writable: bool,
        registry: &Registry,
        config: &CommConfig,
    ) -> IoOutcome {
        // A failed connect can surface as readable, writable or both, so the
        // completion check runs on any readiness while connecting.
        if self.phase == Phase::Connecting {
            match self.finish_connect() {
                ConnectStep::Pending => return IoOutcome::Alive,
                ConnectStep::Failed(kind) => return IoOutcome::Disconnected(kind),
                ConnectStep::Open => {
                    if let IoOutcome::Disconnected(kind) = self.drain_tx(registry) {
                        return IoOutcome::Disconnected(kind);
                    }
                }
            }
        } else if writable {
            if let IoOutcome::Disconnected(kind) = self.drain_tx(registry) {
                return IoOutcome::Disconnected(kind);
            }
        }

        if readable {
            loop {
                match self.read_frame(config) {
                    ReadOutcome::Frame(header, payload) => {
                        if let IoOutcome::Disconnected(kind) =
                            self.route_message(header, payload, registry)
                        {
                            return IoOutcome::Disconnected(kind);
                        }
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Closed(kind) => return IoOutcome::Disconnected(kind),
                }
            }
        }

        IoOutcome::Alive
    }

    /// Stamps the frame as a request (connection-scoped id, REQUEST flag),
    /// registers the pending record when a response is wanted, and queues it.
    pub(crate) fn send_request(
        &mut self,
        mut frame: Frame,
        timeout: Duration,
        handler: Option<Arc<dyn DispatchHandler>>,
        registry: &Registry,
        expiries: &mut std::collections::BinaryHeap<ExpiryEntry>,
    ) -> IoOutcome {
        let id = self.alloc_id();
        let hdr = frame.header_mut();
        hdr.id = id;
        hdr.flags |= Flags::REQUEST;
        let group = hdr.group;
        let track = !hdr.ignores_response();

        if track && let Some(handler) = handler {
            let deadline = Instant::now() + timeout;
            self.pending.insert(id, PendingRequest { handler, deadline, group });
            expiries.push(ExpiryEntry { deadline, token: self.shared.token(), id });
            if group != 0 {
                self.groups.entry(group).or_default().order.push_back(id);
            }
        }

        frame.seal();
        self.enqueue(frame, registry)
    }

    /// Queues a response frame. Its id and group were copied from the request
    /// header by the frame builder; nothing is reassigned here.
    pub(crate) fn send_response(&mut self, mut frame: Frame, registry: &Registry) -> IoOutcome {
        frame.seal();
        self.enqueue(frame, registry)
    }

    /// Fires the timeout for a pending request if its deadline has passed.
    /// Stale expiry entries (already answered or swept) are ignored.
    pub(crate) fn expire_pending(&mut self, id: u32, now: Instant) {
        let expired = self.pending.get(&id).is_some_and(|p| p.deadline <= now);
        if !expired {
            return;
        }
        let Some(p) = self.pending.remove(&id) else { return };
        p.handler.handle(Event::Error { peer: self.shared.peer, kind: ErrorKind::RequestTimeout });
        if p.group != 0 {
            self.release_group_slot(p.group, id);
        }
    }

    /// Fails every pending request, notifies the default handler once, and
    /// closes the socket. `local` marks an application-requested close.
    pub(crate) fn teardown(&mut self, registry: &Registry, kind: ErrorKind, local: bool) {
        self.shared.set_state(ConnectionState::Disconnecting);
        let peer = self.shared.peer;
        let now = Instant::now();

        // Grouped requests fail in submission order; a response already
        // parked behind a failed slot is still a completed exchange and gets
        // delivered rather than errored.
        for (_, mut state) in std::mem::take(&mut self.groups) {
            for id in state.order.drain(..) {
                if let Some(p) = self.pending.remove(&id) {
                    p.handler
                        .handle(Event::Error { peer, kind: failure_kind(&p, now, kind, local) });
                } else if let Some((handler, event)) = state.parked.remove(&id) {
                    handler.handle(event);
                }
            }
        }
        for (_, p) in std::mem::take(&mut self.pending) {
            p.handler.handle(Event::Error { peer, kind: failure_kind(&p, now, kind, local) });
        }

        let kind = if local { ErrorKind::Ok } else { kind };
        self.default_handler.handle(Event::Disconnected { peer, kind });

        if let Err(err) = registry.deregister(&mut self.stream) {
            debug!(?err, "stream deregister failed");
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.shared.set_state(ConnectionState::Closed);
        self.shared.queued_bytes.store(0, Ordering::Relaxed);
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        self.next_id
    }

    /// Outbound connects are detected via WRITABLE readiness; `take_error`
    /// distinguishes completion from failure, `peer_addr` from still-pending.
    fn finish_connect(&mut self) -> ConnectStep {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) => {
                warn!(peer = ?self.shared.peer, ?err, "connect failed");
                return ConnectStep::Failed(ErrorKind::CommConnectFailure);
            }
            Err(err) => {
                warn!(peer = ?self.shared.peer, ?err, "connect state unreadable");
                return ConnectStep::Failed(ErrorKind::CommConnectFailure);
            }
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.socket_open();
                ConnectStep::Open
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => ConnectStep::Pending,
            Err(err) => {
                warn!(peer = ?self.shared.peer, ?err, "connect failed");
                ConnectStep::Failed(ErrorKind::CommConnectFailure)
            }
        }
    }

    fn socket_open(&mut self) {
        if let Some(init) = self.initializer.clone() {
            self.phase = Phase::Handshaking;
            self.shared.set_state(ConnectionState::Handshaking);
            let mut frame = init.create_initialization_request();
            let id = self.alloc_id();
            let hdr = frame.header_mut();
            hdr.id = id;
            hdr.flags |= Flags::REQUEST;
            frame.seal();
            self.shared.queued_bytes.fetch_add(frame.wire_len(), Ordering::Relaxed);
            // Ahead of any frames queued while the connect was in flight.
            self.tx_queue.push_front(frame);
        } else {
            self.promote_connected();
        }
    }

    fn promote_connected(&mut self) {
        self.phase = Phase::Connected;
        self.shared.set_state(ConnectionState::Connected);
        self.default_handler.handle(Event::Connected { peer: self.shared.peer });
    }

    fn route_message(&mut self, header: Header, payload: Bytes, registry: &Registry) -> IoOutcome {
        let peer = self.shared.peer;

        if self.phase == Phase::Handshaking {
            let accepted = self.initializer.as_ref().is_some_and(|init| {
                init.process_initialization_response(&Event::Message { peer, header, payload })
            });
            if !accepted {
                debug!(?peer, "initialization handshake rejected");
                return IoOutcome::Disconnected(ErrorKind::CommConnectFailure);
            }
            self.promote_connected();
            return self.drain_tx(registry);
        }

        if !header.is_request() && let Some(p) = self.pending.remove(&header.id) {
            let event = Event::Message { peer, header, payload };
            if p.group == 0 {
                p.handler.handle(event);
            } else {
                self.deliver_grouped(p.group, header.id, p.handler, event);
            }
            return IoOutcome::Alive;
        }

        // Requests, and responses with no pending record (e.g. arriving
        // after their timeout fired), are unsolicited.
        self.default_handler.handle(Event::Message { peer, header, payload });
        IoOutcome::Alive
    }

    fn deliver_grouped(
        &mut self,
        group: u32,
        id: u32,
        handler: Arc<dyn DispatchHandler>,
        event: Event,
    ) {
        match self.groups.get_mut(&group) {
            None => handler.handle(event),
            Some(state) if state.order.front() == Some(&id) => {
                state.order.pop_front();
                handler.handle(event);
                self.flush_group(group);
            }
            Some(state) => {
                state.parked.insert(id, (handler, event));
            }
        }
    }

    /// Removes a slot that will never produce an in-order delivery (timeout)
    /// and releases any responses parked behind it.
    fn release_group_slot(&mut self, group: u32, id: u32) {
        if let Some(state) = self.groups.get_mut(&group) {
            state.order.retain(|&queued| queued != id);
        }
        self.flush_group(group);
    }

    fn flush_group(&mut self, group: u32) {
        let mut freed = Vec::new();
        if let Some(state) = self.groups.get_mut(&group) {
            while let Some(&next) = state.order.front() {
                match state.parked.remove(&next) {
                    Some(entry) => {
                        let _ = state.order.pop_front();
                        freed.push(entry);
                    }
                    None => break,
                }
            }
            if state.order.is_empty() {
                let _ = self.groups.remove(&group);
            }
        }
        for (handler, event) in freed {
            handler.handle(event);
        }
    }

    fn enqueue(&mut self, frame: Frame, registry: &Registry) -> IoOutcome {
        self.tx_queue.push_back(frame);
        match self.phase {
            // The connect-completion event will flush the queue.
            Phase::Connecting => self.update_interest(registry),
            Phase::Handshaking | Phase::Connected => self.drain_tx(registry),
        }
    }

    /// Writes queued frames until the kernel blocks or the queue empties,
    /// then arms or disarms WRITABLE interest accordingly.
    fn drain_tx(&mut self, registry: &Registry) -> IoOutcome {
        while let Some(front) = self.tx_queue.front_mut() {
            let (primary, ext) = front.pending_slices();
            let slices = [IoSlice::new(primary), IoSlice::new(ext)];
            match self.stream.write_vectored(&slices) {
                Ok(0) => return IoOutcome::Disconnected(ErrorKind::CommBrokenConnection),
                Ok(n) => {
                    front.advance(n);
                    if front.is_fully_sent() {
                        let sent = front.wire_len();
                        let _ = self.tx_queue.pop_front();
                        let _ = self.shared.queued_bytes.fetch_sub(sent, Ordering::Relaxed);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "stream write failed");
                    return IoOutcome::Disconnected(ErrorKind::CommBrokenConnection);
                }
            }
        }
        self.update_interest(registry)
    }

    fn desired_interest(&self) -> Interest {
        if self.phase == Phase::Connecting || !self.tx_queue.is_empty() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn update_interest(&mut self, registry: &Registry) -> IoOutcome {
        let want = self.desired_interest();
        if want != self.interest {
            if let Err(err) = registry.reregister(&mut self.stream, self.shared.token(), want) {
                debug!(?err, "stream reregister failed");
                return IoOutcome::Disconnected(ErrorKind::CommBrokenConnection);
            }
            self.interest = want;
        }
        IoOutcome::Alive
    }

    /// Reads one complete frame if available. Loops until a frame is
    /// assembled or the socket has nothing more to give.
    fn read_frame(&mut self, config: &CommConfig) -> ReadOutcome {
        loop {
            match self.rx_state {
                RxState::Header { mut buf, mut have } => {
                    while have < Header::LEN {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Closed(ErrorKind::CommBrokenConnection),
                            Ok(n) => have += n,
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Header { buf, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                debug!(?err, "stream read failed");
                                return ReadOutcome::Closed(ErrorKind::CommBrokenConnection);
                            }
                        }
                    }

                    let mut cursor = &buf[..];
                    let Ok(header) = Header::decode(&mut cursor) else {
                        return ReadOutcome::Closed(ErrorKind::CommBrokenConnection);
                    };
                    // Framing is compromised if the header is nonsense;
                    // nothing downstream can resynchronize the stream.
                    if !header.is_well_formed() {
                        warn!(peer = ?self.shared.peer, "malformed frame header");
                        return ReadOutcome::Closed(ErrorKind::CommBrokenConnection);
                    }
                    if header.total_len as usize > config.max_frame_bytes {
                        warn!(
                            peer = ?self.shared.peer,
                            total_len = header.total_len,
                            "frame exceeds size limit"
                        );
                        return ReadOutcome::Closed(ErrorKind::MessageTooLong);
                    }
                    self.rx_buf.resize(header.payload_len(), 0);
                    self.rx_state = RxState::Payload { header, have: 0 };
                }

                RxState::Payload { header, mut have } => {
                    let need = header.payload_len();
                    while have < need {
                        match self.stream.read(&mut self.rx_buf[have..need]) {
                            Ok(0) => return ReadOutcome::Closed(ErrorKind::CommBrokenConnection),
                            Ok(n) => have += n,
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Payload { header, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                debug!(?err, "stream read failed");
                                return ReadOutcome::Closed(ErrorKind::CommBrokenConnection);
                            }
                        }
                    }
                    self.rx_state = RxState::Header { buf: [0; Header::LEN], have: 0 };
                    let payload = self.rx_buf.split_to(need).freeze();
                    return ReadOutcome::Frame(header, payload);
                }
            }
        }
    }
}

fn failure_kind(p: &PendingRequest, now: Instant, kind: ErrorKind, local: bool) -> ErrorKind {
    if p.deadline <= now {
        ErrorKind::RequestTimeout
    } else if local {
        ErrorKind::CommNotConnected
    } else {
        kind
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a stream socket.
#[cfg(unix)]
fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                std::ptr::from_ref(&size).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(opt, "setsockopt failed");
        }
    }
}

#[cfg(not(unix))]
fn set_socket_buf_size(_stream: &mio::net::TcpStream, _size: usize) {
    warn!("socket buffer sizing only supported on unix");
}
