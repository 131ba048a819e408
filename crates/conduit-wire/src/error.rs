use thiserror::Error;

/// Decode failures. Encoders never fail; decoders return one of these and
/// leave the cursor positioned at the point of failure.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecError {
    #[error("serialization input overrun")]
    InputOverrun,
    #[error("variable-length integer did not terminate")]
    BadVint,
    #[error("malformed length-prefixed string")]
    BadCstr,
}
