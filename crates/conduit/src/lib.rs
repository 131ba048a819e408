//! Event-driven framed-message substrate.
//!
//! A [`Comm`] instance runs a pool of reactor threads, each driving an OS
//! readiness loop over the connections pinned to it. Applications build
//! outbound [`Frame`]s with the wire codecs, register [`DispatchHandler`]s
//! for responses and connection events, and never touch a socket directly.
//! The core carries bytes; it does not interpret payloads.

mod comm;
mod config;
mod datagram;
mod error;
mod event;
mod lock;
mod manager;
mod reactor;
mod stream;
mod sync;

pub use comm::{Comm, CommAddr};
pub use conduit_wire::{CodecError, Flags, Frame, HEADER_VERSION, Header, PROTOCOL_NONE, codec};
pub use config::CommConfig;
pub use error::ErrorKind;
pub use event::{ConnectionHandlerFactory, ConnectionInitializer, DispatchHandler, Event};
pub use manager::ConnectionManager;
pub use sync::{DispatchHandlerSynchronizer, ReplySynchronizer};
