use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use conduit_wire::{Frame, Header};

use crate::error::ErrorKind;

/// Notification delivered to a [`DispatchHandler`].
///
/// The decoded header travels only with `Message`; the other variants carry
/// the peer (when there is one) and an error kind (when there is a cause).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection reached the connected state.
    Connected { peer: SocketAddr },
    /// A connection was torn down. `kind` is [`ErrorKind::Ok`] for a locally
    /// requested close.
    Disconnected { peer: SocketAddr, kind: ErrorKind },
    /// A complete frame arrived. `payload` is the bytes following the header.
    Message { peer: SocketAddr, header: Header, payload: Bytes },
    /// An asynchronous failure tied to a peer (request timeout, connect
    /// failure, send to a vanished connection).
    Error { peer: SocketAddr, kind: ErrorKind },
    /// A timer armed via `set_timer` fired.
    Timer,
}

impl Event {
    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            Self::Connected { peer } |
            Self::Disconnected { peer, .. } |
            Self::Message { peer, .. } |
            Self::Error { peer, .. } => Some(*peer),
            Self::Timer => None,
        }
    }
}

/// The polymorphic event sink. Installed per connection as the default
/// handler and per request for response delivery.
///
/// Handlers run on reactor threads and must not block; hand blocking work
/// off to an application worker pool.
pub trait DispatchHandler: Send + Sync {
    fn handle(&self, event: Event);
}

impl<F> DispatchHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    fn handle(&self, event: Event) {
        self(event);
    }
}

/// Produces the default handler for each connection accepted by a listener.
pub trait ConnectionHandlerFactory: Send + Sync {
    fn make_handler(&self, peer: SocketAddr) -> Arc<dyn DispatchHandler>;
}

impl<F> ConnectionHandlerFactory for F
where
    F: Fn(SocketAddr) -> Arc<dyn DispatchHandler> + Send + Sync,
{
    fn make_handler(&self, peer: SocketAddr) -> Arc<dyn DispatchHandler> {
        self(peer)
    }
}

/// Optional per-connection handshake run before a connection is considered
/// established. The request frame is sent as soon as the socket opens; the
/// peer's reply is fed back, and `false` resets the connection.
pub trait ConnectionInitializer: Send + Sync {
    fn create_initialization_request(&self) -> Frame;
    fn process_initialization_response(&self, event: &Event) -> bool;
}
