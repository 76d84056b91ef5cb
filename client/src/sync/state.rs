use chrono::{DateTime, Utc};

/// Lifecycle of the connection behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Establishing the underlying connection.
    Connecting,
    /// Connected and identified, waiting for the initial snapshot.
    Open,
    /// Snapshot received; deltas are applied as they arrive.
    Identified,
    /// `close()` was called.
    Closing,
    Closed,
    /// Waiting for the backoff timer before the next connection attempt.
    Reconnecting,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Identified => "identified",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
            ChannelState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a channel entered `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    NormalClose,
    NetworkError,
    ProtocolError,
    ServerRejected,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::NormalClose => "normal-close",
            CloseReason::NetworkError => "network-error",
            CloseReason::ProtocolError => "protocol-error",
            CloseReason::ServerRejected => "server-rejected",
        }
    }

    /// Whether the channel schedules another connection attempt after closing for this reason.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloseReason::NetworkError | CloseReason::ProtocolError)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transition, as delivered to state listeners. `reason` is set on `Closed` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub state: ChannelState,
    pub reason: Option<CloseReason>,
    pub at: DateTime<Utc>,
}

impl StateChange {
    pub fn new(state: ChannelState) -> Self {
        Self {
            state,
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn closed(reason: CloseReason) -> Self {
        Self {
            state: ChannelState::Closed,
            reason: Some(reason),
            at: Utc::now(),
        }
    }
}
