//! Sharing one broker connection between exchanges and queues.
mod manager;
mod registry;

pub use manager::ConnectionManager;
pub(crate) use registry::{when_channel_closed, EntityLink};
pub use registry::{EntityId, EntityKind};
