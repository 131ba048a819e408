pub mod codec;
mod error;
mod frame;
mod header;

pub use error::CodecError;
pub use frame::Frame;
pub use header::{Flags, HEADER_VERSION, Header, PROTOCOL_NONE};
