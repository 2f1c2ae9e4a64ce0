//! Handlers turn consumed messages into replies.
use crate::exchange::Payload;
use crate::transport::Delivery;
use serde::de::DeserializeOwned;
use std::future::Future;

/// A message delivered to a [`Queue`](crate::Queue) consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// The body of the message, decoded as UTF-8. Invalid sequences are replaced.
    pub body: String,
    pub message: Delivery,
    pub queue_name: String,
}

impl Incoming {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// What a handler sends back to the publisher, if it asked for a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply(Option<Payload>);

impl Reply {
    /// Nothing to send back: the message is acknowledged and that's it.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.0.as_ref()
    }

    pub(crate) fn into_payload(self) -> Option<Payload> {
        self.0
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Self::none()
    }
}

impl From<Payload> for Reply {
    fn from(payload: Payload) -> Self {
        Self(Some(payload))
    }
}

impl<T: Into<Payload>> From<Option<T>> for Reply {
    fn from(payload: Option<T>) -> Self {
        Self(payload.map(Into::into))
    }
}

macro_rules! reply_from {
    ($($payload:ty),*) => {
        $(
            impl From<$payload> for Reply {
                fn from(payload: $payload) -> Self {
                    Self(Some(payload.into()))
                }
            }
        )*
    };
}

reply_from!(String, &str, Vec<u8>, i32, i64, u32, u64, usize, f64, bool);

/// Processes the messages consumed from a queue.
///
/// `handle` never touches the channel: acknowledging, requeueing and replying are taken care of
/// according to its outcome. An `Err` is a failed attempt, see
/// [`RequeuePolicy`](crate::queue::RequeuePolicy).
///
/// Most of the time you will pass an async closure to [`Queue::consume`](crate::Queue::consume)
/// instead of implementing the trait.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming) -> Result<Reply, anyhow::Error>;
}

#[async_trait::async_trait]
impl<H: Handler + ?Sized> Handler for Box<H> {
    async fn handle(&self, incoming: Incoming) -> Result<Reply, anyhow::Error> {
        (**self).handle(incoming).await
    }
}

/// Wraps an async closure into a [`Handler`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, R, E> Handler for ClosureHandler<F>
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Into<Reply> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    async fn handle(&self, incoming: Incoming) -> Result<Reply, anyhow::Error> {
        (self.0)(incoming).await.map(Into::into).map_err(Into::into)
    }
}
