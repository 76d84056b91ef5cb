pub mod backoff;
pub mod channel;
pub mod identity;
pub mod listeners;
pub mod machine;
pub mod protocol;
pub mod roster;
pub mod state;
