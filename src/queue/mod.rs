//! Consuming messages.
mod consumer;
mod handler;
mod options;
mod processing;

pub(crate) use consumer::Binding;
pub use consumer::{Queue, QueueStatus};
pub use handler::{ClosureHandler, Handler, Incoming, Reply};
pub use options::QueueOptions;
pub use processing::{BrokerAction, HandlerFailure, RequeuePolicy};
