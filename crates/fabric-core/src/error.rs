use thiserror::Error;

/// Errors produced by the routing fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("no dispatcher: {0}")]
    NoDispatcher(String),

    #[error("no instances of service {0}")]
    NoInstances(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("duplicate channel id: {0}")]
    DuplicateChannel(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("remote side closed the connection")]
    RemoteClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("naming error: {0}")]
    Naming(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl FabricError {
    /// Whether this error ends a connection in an orderly way (peer close or
    /// idle timeout) rather than through a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            FabricError::RemoteClosed | FabricError::Timeout | FabricError::ChannelClosed
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for FabricError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        FabricError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for FabricError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        FabricError::Codec(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FabricError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError};
        use tokio_tungstenite::tungstenite::Error as WsError;

        match e {
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => FabricError::RemoteClosed,
            WsError::Capacity(CapacityError::MessageTooLong { size, .. }) => FabricError::FrameTooLarge(size),
            WsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => FabricError::RemoteClosed,
            WsError::Io(e) => FabricError::Io(e),
            WsError::Protocol(e) => FabricError::InvalidMessage(e.to_string()),
            other => FabricError::Transport(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for FabricError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FabricError::Timeout
    }
}

pub type FabricResult<T> = Result<T, FabricError>;
