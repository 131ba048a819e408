use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, RwLock, atomic::Ordering, mpsc},
    thread,
    time::{Duration, Instant},
};

use conduit_wire::Frame;
use mio::{
    Poll, Waker,
    net::{TcpListener, TcpStream, UdpSocket},
};
use tracing::warn;

use crate::{
    config::CommConfig,
    datagram::MAX_DATAGRAM_BYTES,
    error::ErrorKind,
    event::{ConnectionHandlerFactory, ConnectionInitializer, DispatchHandler},
    lock,
    reactor::{
        Command, ConnMap, ConnShared, ConnectionState, Reactor, ReactorHandle, ReactorPool,
        WAKER_TOKEN,
    },
};

/// Peer designator accepted by the façade: a socket address, or a proxy name
/// registered via [`Comm::add_proxy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommAddr {
    Sock(SocketAddr),
    Proxy(String),
}

impl From<SocketAddr> for CommAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Sock(addr)
    }
}

impl From<&str> for CommAddr {
    fn from(name: &str) -> Self {
        Self::Proxy(name.to_owned())
    }
}

impl From<String> for CommAddr {
    fn from(name: String) -> Self {
        Self::Proxy(name)
    }
}

/// The comm façade: an untyped framed-message substrate.
///
/// A `Comm` owns a pool of reactor threads. Every connection is pinned to
/// one reactor for its lifetime; the façade's own job is routing calls to
/// the owning reactor and answering the synchronously detectable failures
/// (`CommNotConnected`, `CommSendQueueFull`, ...) before anything is queued.
///
/// All methods are callable from any thread, including from dispatch
/// handlers running on reactor threads.
pub struct Comm {
    config: Arc<CommConfig>,
    pool: Arc<ReactorPool>,
    streams: ConnMap,
    datagrams: ConnMap,
    proxies: RwLock<HashMap<String, SocketAddr>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Comm {
    /// Spawns `config.reactor_count` reactor threads and returns the façade.
    pub fn new(config: CommConfig) -> io::Result<Self> {
        let config = Arc::new(config);
        let streams: ConnMap = Arc::new(RwLock::new(HashMap::new()));
        let datagrams: ConnMap = Arc::new(RwLock::new(HashMap::new()));

        let count = config.reactor_count.max(1);
        let mut handles = Vec::with_capacity(count);
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
            let (tx, rx) = mpsc::channel();
            handles.push(ReactorHandle::new(tx, waker));
            parts.push((poll, rx));
        }
        let pool = Arc::new(ReactorPool::new(handles));

        let mut threads = Vec::with_capacity(count);
        for (index, (poll, rx)) in parts.into_iter().enumerate() {
            let reactor = Reactor::new(
                index,
                poll,
                rx,
                config.clone(),
                streams.clone(),
                datagrams.clone(),
                pool.clone(),
            );
            let handle = thread::Builder::new()
                .name(format!("conduit-reactor-{index}"))
                .spawn(move || reactor.run())?;
            threads.push(handle);
        }

        Ok(Self {
            config,
            pool,
            streams,
            datagrams,
            proxies: RwLock::new(HashMap::new()),
            threads: Mutex::new(threads),
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Registers a stream connection to `peer`. `handler` becomes the
    /// connection's default handler and receives CONNECTION_ESTABLISHED once
    /// the socket (and optional handshake) completes.
    pub fn connect(
        &self,
        peer: impl Into<CommAddr>,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), ErrorKind> {
        self.connect_with_initializer(peer, handler, None)
    }

    pub fn connect_with_initializer(
        &self,
        peer: impl Into<CommAddr>,
        handler: Arc<dyn DispatchHandler>,
        initializer: Option<Arc<dyn ConnectionInitializer>>,
    ) -> Result<(), ErrorKind> {
        let peer = self.resolve(peer)?;
        let mut map = lock::write(&self.streams);
        if map.get(&peer).is_some_and(|conn| conn.state() != ConnectionState::Closed) {
            return Err(ErrorKind::CommAlreadyConnected);
        }
        let stream = TcpStream::connect(peer).map_err(|err| {
            warn!(?err, ?peer, "connect failed");
            ErrorKind::CommConnectFailure
        })?;
        let index = self.pool.next_index();
        let handle = self.pool.handle(index);
        let token = handle.alloc_token();
        let shared = Arc::new(ConnShared::new(peer, index, token, ConnectionState::Connecting));
        let _ = map.insert(peer, shared.clone());
        drop(map);
        handle.send(Command::RegisterStream {
            stream,
            shared,
            handler,
            initializer,
            connected: false,
        });
        Ok(())
    }

    /// Installs a listener on `bind`. `factory` produces the default handler
    /// for each accepted connection; `handler` receives listen-socket-level
    /// errors. Returns the bound address.
    pub fn listen(
        &self,
        bind: SocketAddr,
        factory: Arc<dyn ConnectionHandlerFactory>,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<SocketAddr, ErrorKind> {
        let listener = TcpListener::bind(bind).map_err(|err| {
            warn!(?err, ?bind, "bind failed");
            ErrorKind::CommBindFailure
        })?;
        let local = listener.local_addr().map_err(|_| ErrorKind::CommBindFailure)?;
        let index = self.pool.next_index();
        let handle = self.pool.handle(index);
        let token = handle.alloc_token();
        handle.send(Command::RegisterListener { listener, local, token, factory, handler });
        Ok(local)
    }

    /// Queues a request frame. With a handler (and no IGNORE_RESPONSE flag),
    /// the matching response or a `RequestTimeout` error is delivered to it
    /// exactly once.
    pub fn send_request(
        &self,
        peer: impl Into<CommAddr>,
        timeout: Duration,
        frame: Frame,
        handler: Option<Arc<dyn DispatchHandler>>,
    ) -> Result<(), ErrorKind> {
        let peer = self.resolve(peer)?;
        if frame.wire_len() > self.config.max_frame_bytes {
            return Err(ErrorKind::MessageTooLong);
        }
        let shared = self.stream_shared(peer)?;
        let len = frame.wire_len();
        if shared.queued_bytes.fetch_add(len, Ordering::Relaxed) + len >
            self.config.send_queue_bytes
        {
            let _ = shared.queued_bytes.fetch_sub(len, Ordering::Relaxed);
            return Err(ErrorKind::CommSendQueueFull);
        }
        self.pool.handle(shared.reactor).send(Command::SendRequest {
            shared,
            frame,
            timeout,
            handler,
        });
        Ok(())
    }

    /// Queues a response frame; its header was initialized from the request.
    pub fn send_response(&self, peer: impl Into<CommAddr>, frame: Frame) -> Result<(), ErrorKind> {
        let peer = self.resolve(peer)?;
        if frame.wire_len() > self.config.max_frame_bytes {
            return Err(ErrorKind::MessageTooLong);
        }
        let shared = self.stream_shared(peer)?;
        let _ = shared.queued_bytes.fetch_add(frame.wire_len(), Ordering::Relaxed);
        self.pool.handle(shared.reactor).send(Command::SendResponse { shared, frame });
        Ok(())
    }

    /// Tears the connection down on its owning reactor: one ERROR per
    /// pending request, one DISCONNECT to the default handler, then nothing
    /// further for this peer. A no-op for unknown peers.
    pub fn close(&self, peer: impl Into<CommAddr>) -> Result<(), ErrorKind> {
        let peer = self.resolve(peer)?;
        let Some(shared) = lock::read(&self.streams).get(&peer).cloned() else {
            return Ok(());
        };
        // New sends fail with NotConnected from this point on.
        shared.set_state(ConnectionState::Disconnecting);
        self.pool.handle(shared.reactor).send(Command::Close { shared });
        Ok(())
    }

    /// Delivers one TIMER event at or after `now + duration`.
    pub fn set_timer(&self, duration: Duration, handler: Arc<dyn DispatchHandler>) {
        self.set_timer_absolute(Instant::now() + duration, handler);
    }

    pub fn set_timer_absolute(&self, deadline: Instant, handler: Arc<dyn DispatchHandler>) {
        let index = self.pool.next_index();
        self.pool.handle(index).send(Command::SetTimer { deadline, handler });
    }

    /// Binds a datagram socket and registers `handler` for received packets.
    /// Returns the bound address (useful with port 0).
    pub fn create_datagram(
        &self,
        local: SocketAddr,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<SocketAddr, ErrorKind> {
        let socket = UdpSocket::bind(local).map_err(|err| {
            warn!(?err, ?local, "datagram bind failed");
            ErrorKind::CommBindFailure
        })?;
        let local = socket.local_addr().map_err(|_| ErrorKind::CommBindFailure)?;
        let index = self.pool.next_index();
        let handle = self.pool.handle(index);
        let token = handle.alloc_token();
        let shared = Arc::new(ConnShared::new(local, index, token, ConnectionState::Connected));
        let _ = lock::write(&self.datagrams).insert(local, shared.clone());
        handle.send(Command::RegisterDatagram { socket, shared, handler });
        Ok(local)
    }

    /// Whole-packet send from the socket bound at `local`.
    pub fn send_datagram(
        &self,
        peer: impl Into<CommAddr>,
        local: SocketAddr,
        frame: Frame,
    ) -> Result<(), ErrorKind> {
        let peer = self.resolve(peer)?;
        if frame.wire_len() > MAX_DATAGRAM_BYTES {
            return Err(ErrorKind::MessageTooLong);
        }
        let shared = lock::read(&self.datagrams)
            .get(&local)
            .cloned()
            .ok_or(ErrorKind::CommNotConnected)?;
        self.pool.handle(shared.reactor).send(Command::SendDatagram { shared, peer, frame });
        Ok(())
    }

    /// Registers `name` as an alias for `peer` in subsequent façade calls.
    pub fn add_proxy(&self, name: impl Into<String>, peer: SocketAddr) {
        let _ = lock::write(&self.proxies).insert(name.into(), peer);
    }

    pub fn remove_proxy(&self, name: &str) {
        let _ = lock::write(&self.proxies).remove(name);
    }

    fn stream_shared(&self, peer: SocketAddr) -> Result<Arc<ConnShared>, ErrorKind> {
        let shared = lock::read(&self.streams)
            .get(&peer)
            .cloned()
            .ok_or(ErrorKind::CommNotConnected)?;
        match shared.state() {
            ConnectionState::Disconnecting | ConnectionState::Closed => {
                Err(ErrorKind::CommNotConnected)
            }
            _ => Ok(shared),
        }
    }

    fn resolve(&self, addr: impl Into<CommAddr>) -> Result<SocketAddr, ErrorKind> {
        match addr.into() {
            CommAddr::Sock(addr) => Ok(addr),
            CommAddr::Proxy(name) => {
                lock::read(&self.proxies).get(&name).copied().ok_or(ErrorKind::CommInvalidProxy)
            }
        }
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        for handle in self.pool.handles() {
            handle.send(Command::Shutdown);
        }
        for thread in lock::mutex(&self.threads).drain(..) {
            if thread.join().is_err() {
                warn!("reactor thread panicked during shutdown");
            }
        }
    }
}
