use std::any::TypeId;
use std::fmt::{Display, Formatter};

/// Errors raised while encoding or decoding an object. On the receive path
/// these are logged and the offending frame is discarded; the connection
/// stays open.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("type {type_id:?} is not registered - registration order and type set must match on both peers")]
    UnregisteredType { type_id: TypeId },
    #[error("unknown class id {class_id} - registration order and type set must match on both peers")]
    UnknownClassId { class_id: u32 },
    #[error("malformed {type_name}: {cause}")]
    Malformed {
        type_name: &'static str,
        cause: anyhow::Error,
    },
}

/// Errors surfaced to callers of `send_tcp` / `send_udp`. None of these close
/// the connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("frame of {frame_len} bytes does not fit, {free} bytes free")]
    BufferOverflow { frame_len: usize, free: usize },
    #[error("connection is closed")]
    Closed,
    #[error("no datagram channel is bound for this connection")]
    NoDatagramChannel,
    #[error("datagram was not sent: {0}")]
    DatagramUnsent(#[source] std::io::Error),
}

/// Errors surfaced to callers of `Client::connect`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect did not complete registration within the timeout")]
    Timeout,
    #[error("connection closed during the registration handshake")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of remote method invocations. None of these
/// close the connection.
#[derive(Debug, thiserror::Error)]
pub enum RmiError {
    #[error("all 63 response ids are outstanding")]
    Overload,
    #[error("remote invocation timed out")]
    Timeout,
    #[error("remote invocation failed: {0}")]
    Remote(String),
    #[error("connection closed while waiting for the invocation result")]
    Disconnected,
    #[error("sending the invocation failed: {0}")]
    Send(#[from] SendError),
}

/// Why a connection transitioned to `Closed`. Fatal conditions are surfaced
/// to the application only through the `disconnected` event; the reason is
/// logged.
#[derive(Debug)]
pub(crate) enum CloseReason {
    Graceful,
    Timeout,
    PeerClosed,
    FrameTooLarge { frame_len: usize, max: usize },
    Protocol(String),
    Io(std::io::Error),
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Graceful => write!(f, "closed locally"),
            CloseReason::Timeout => write!(f, "receive timeout elapsed"),
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::FrameTooLarge { frame_len, max } => {
                write!(f, "incoming frame of {} bytes exceeds the object buffer of {} bytes", frame_len, max)
            }
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::Io(e) => write!(f, "socket error: {}", e),
        }
    }
}
