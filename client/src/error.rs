/// Errors returned synchronously when a channel is constructed.
/// Network failures are never reported here; they surface as state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    InvalidIdentity(String),
    InvalidEndpoint(String),
    /// The channel was constructed outside a tokio runtime.
    NoRuntime,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::InvalidIdentity(msg) => write!(f, "invalid identity: {msg}"),
            ChannelError::InvalidEndpoint(msg) => write!(f, "invalid endpoint: {msg}"),
            ChannelError::NoRuntime => write!(f, "no tokio runtime available to drive the channel"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Failure reported by a transport while connecting, sending or receiving.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Connect(String),
    Send(String),
    Receive(String),
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "connect failed: {msg}"),
            TransportError::Send(msg) => write!(f, "send failed: {msg}"),
            TransportError::Receive(msg) => write!(f, "receive failed: {msg}"),
            TransportError::Timeout => write!(f, "connect timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A server frame that could not be turned into a roster message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Not JSON, or missing the `type` field.
    Malformed(String),
    UnknownType(String),
    InvalidData { kind: String, detail: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(msg) => write!(f, "malformed message: {msg}"),
            ProtocolError::UnknownType(kind) => write!(f, "unknown message type {kind:?}"),
            ProtocolError::InvalidData { kind, detail } => {
                write!(f, "invalid data for {kind}: {detail}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
