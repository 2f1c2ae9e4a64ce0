//! Publishing messages.
mod options;
mod payload;
mod publisher;
mod reply;

pub use crate::transport::ExchangeType;
pub use options::{ExchangeOptions, PublishMode, PublishOptions};
pub use payload::Payload;
pub(crate) use payload::TEXT_PLAIN;
pub use publisher::{Exchange, DEFAULT_REQUEST_TIMEOUT};
pub use reply::Response;
