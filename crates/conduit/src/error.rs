use conduit_wire::CodecError;
use thiserror::Error;

/// Status/error kinds crossing the comm boundary.
///
/// Synchronous façade calls return these as `Err` values; asynchronous
/// failures travel inside [`crate::Event::Disconnected`] and
/// [`crate::Event::Error`]. `Ok` exists because a DISCONNECT event carries a
/// kind even on clean teardown; it is never used as an `Err` value.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    #[error("ok")]
    Ok,
    #[error("not connected")]
    CommNotConnected,
    #[error("broken connection")]
    CommBrokenConnection,
    #[error("connect failure")]
    CommConnectFailure,
    #[error("already connected")]
    CommAlreadyConnected,
    #[error("bind failure")]
    CommBindFailure,
    #[error("invalid proxy name")]
    CommInvalidProxy,
    #[error("send queue full")]
    CommSendQueueFull,
    #[error("message too long")]
    MessageTooLong,
    #[error("request timeout")]
    RequestTimeout,
    #[error("serialization input overrun")]
    SerializationInputOverrun,
    #[error("serialization bad vint")]
    SerializationBadVint,
    #[error("serialization bad cstr")]
    SerializationBadCstr,
}

impl From<CodecError> for ErrorKind {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InputOverrun => Self::SerializationInputOverrun,
            CodecError::BadVint => Self::SerializationBadVint,
            CodecError::BadCstr => Self::SerializationBadCstr,
        }
    }
}
