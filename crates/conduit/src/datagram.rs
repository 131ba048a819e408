use std::{collections::VecDeque, io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use conduit_wire::{Frame, Header};
use mio::{Interest, Registry, net::UdpSocket};
use tracing::{debug, warn};

use crate::{
    error::ErrorKind,
    event::{DispatchHandler, Event},
    reactor::ConnShared,
};

/// Largest whole-packet send accepted (UDP over IPv4 payload ceiling).
pub(crate) const MAX_DATAGRAM_BYTES: usize = 65_507;

/// A datagram socket owned by one reactor. Each received packet produces
/// exactly one MESSAGE; there is no reassembly and no request correlation.
pub(crate) struct DatagramHandler {
    socket: UdpSocket,
    /// `peer` on the descriptor holds the local bind address.
    shared: Arc<ConnShared>,
    handler: Arc<dyn DispatchHandler>,
    tx_queue: VecDeque<(SocketAddr, Vec<u8>)>,
    writable_armed: bool,
    rx_buf: Vec<u8>,
    next_id: u32,
}

impl DatagramHandler {
    pub(crate) fn new(
        socket: UdpSocket,
        shared: Arc<ConnShared>,
        handler: Arc<dyn DispatchHandler>,
    ) -> Self {
        Self {
            socket,
            shared,
            handler,
            tx_queue: VecDeque::new(),
            writable_armed: false,
            rx_buf: vec![0; 65_535],
            next_id: 0,
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.socket, self.shared.token(), Interest::READABLE)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.socket);
    }

    pub(crate) fn local(&self) -> SocketAddr {
        self.shared.peer
    }

    pub(crate) fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    pub(crate) fn notify_error(&self, kind: ErrorKind) {
        self.handler.handle(Event::Error { peer: self.shared.peer, kind });
    }

    pub(crate) fn on_ready(&mut self, readable: bool, writable: bool, registry: &Registry) {
        if writable {
            self.drain_tx(registry);
        }
        if readable {
            self.recv_loop();
        }
    }

    fn recv_loop(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.rx_buf) {
                Ok((n, from)) => self.deliver(n, from),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "datagram recv failed");
                    break;
                }
            }
        }
    }

    fn deliver(&self, n: usize, from: SocketAddr) {
        let mut cursor = &self.rx_buf[..n];
        let Ok(header) = Header::decode(&mut cursor) else {
            debug!(?from, "short datagram dropped");
            return;
        };
        // A packet is one frame; a header claiming a different size is junk.
        if !header.is_well_formed() || header.total_len as usize != n {
            warn!(?from, "malformed datagram dropped");
            return;
        }
        let payload = Bytes::copy_from_slice(cursor);
        self.handler.handle(Event::Message { peer: from, header, payload });
    }

    /// Whole-packet send. A blocked socket parks the packet until the next
    /// writable event; send failures surface as ERROR events.
    pub(crate) fn send(&mut self, peer: SocketAddr, mut frame: Frame, registry: &Registry) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        frame.header_mut().id = self.next_id;
        frame.seal();
        let (primary, ext) = frame.pending_slices();
        let mut packet = Vec::with_capacity(primary.len() + ext.len());
        packet.extend_from_slice(primary);
        packet.extend_from_slice(ext);

        if self.tx_queue.is_empty() {
            match self.socket.send_to(&packet, peer) {
                Ok(_) => return,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!(?err, ?peer, "datagram send failed");
                    self.handler
                        .handle(Event::Error { peer, kind: ErrorKind::CommBrokenConnection });
                    return;
                }
            }
        }
        self.tx_queue.push_back((peer, packet));
        self.arm_writable(registry);
    }

    fn drain_tx(&mut self, registry: &Registry) {
        loop {
            let Some((peer, packet)) = self.tx_queue.front() else { break };
            let peer = *peer;
            match self.socket.send_to(packet, peer) {
                Ok(_) => {
                    let _ = self.tx_queue.pop_front();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, ?peer, "datagram send failed");
                    self.handler
                        .handle(Event::Error { peer, kind: ErrorKind::CommBrokenConnection });
                    let _ = self.tx_queue.pop_front();
                }
            }
        }
        self.disarm_writable(registry);
    }

    fn arm_writable(&mut self, registry: &Registry) {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.socket,
                self.shared.token(),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(?err, "datagram reregister failed");
                return;
            }
            self.writable_armed = true;
        }
    }

    fn disarm_writable(&mut self, registry: &Registry) {
        if self.writable_armed && self.tx_queue.is_empty() {
            if let Err(err) =
                registry.reregister(&mut self.socket, self.shared.token(), Interest::READABLE)
            {
                warn!(?err, "datagram reregister failed");
                return;
            }
            self.writable_armed = false;
        }
    }
}
