use thiserror::Error;

/// Protocol-level error kinds. Send-path errors are returned to the caller
///  synchronously; receive-path errors are logged and the offending frame is
///  dropped (or the session closed, for stream framing violations).
///
/// The variants are `Clone` because a single failure (e.g. a disconnect) is
///  fanned out to every pending RPC continuation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("rpc timed out")]
    Timeout,

    #[error("session disconnected")]
    Disconnected,

    #[error("rpc response is not assignable to the expected type {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("no decoder registered for message id {0}")]
    UnknownMessageId(i32),

    #[error("no encoder registered for message type {0}")]
    UnknownMessageType(&'static str),

    #[error("packet shorter than the fixed header")]
    ShortHeader,

    #[error("invalid frame: {0}")]
    Framing(String),

    #[error("message decode failed: {0}")]
    Decode(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("session is already connected")]
    AlreadyConnected,
}
