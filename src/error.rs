use crate::connection::EntityId;
use crate::transport;
use crate::transport::ReturnedMessage;
use std::sync::Arc;
use std::time::Duration;

/// Everything that can go wrong when working with exchanges and queues.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to connect to the RabbitMq broker")]
    Connect(#[source] transport::Error),
    #[error("The broker rejected {entity}")]
    Assertion {
        entity: String,
        #[source]
        source: transport::Error,
    },
    #[error("Queue `{0}` already has a consumer")]
    ConsumeMisuse(String),
    #[error("{0} was deregistered while not active, it has most likely been closed twice")]
    DoubleDeregistration(EntityId),
    #[error("No reply received within {0:?}")]
    ReplyTimeout(Duration),
    #[error("No queue is listening for requests sent with routing key `{0}`")]
    ReplyNotFound(String),
    #[error("Exchange `{0}` does not publish in reply mode")]
    NotReplying(String),
    #[error("The RabbitMq broker nacked the publishing of the message")]
    NegativeAck,
    #[error("The message could not be routed to a queue (reply code {})", .0.reply_code)]
    Unroutable(ReturnedMessage),
    #[error("Failed to get ready")]
    NotReady(#[source] Arc<Error>),
    #[error("The {0} is closed")]
    Closed(String),
    #[error("Failed to encode the message payload")]
    Encoding(#[source] serde_json::Error),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Transport(#[source] transport::Error),
}

impl Error {
    /// The error behind any number of layers of [`Error::NotReady`].
    pub fn root(&self) -> &Error {
        match self {
            Error::NotReady(inner) => inner.root(),
            other => other,
        }
    }
}
