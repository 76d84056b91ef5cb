pub mod config;
pub mod error;
pub mod sync;
pub mod transport;


pub use error::{ChannelError, ProtocolError, TransportError};
pub use sync::backoff::ReconnectPolicy;
pub use sync::channel::{ChannelOptions, LiveRosterChannel};
pub use sync::identity::{Identity, Role};
pub use sync::listeners::Subscription;
pub use sync::roster::Roster;
pub use sync::state::{ChannelState, CloseReason, StateChange};
