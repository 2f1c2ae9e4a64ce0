//! The boundary between `warren` and an AMQP 0-9-1 broker.
//!
//! [`Broker`], [`BrokerConnection`] and [`BrokerChannel`] expose the handful of protocol
//! operations exchanges and queues are built on. Two implementations ship with the crate:
//!
//! - [`ConnectionFactory`](crate::amqp::ConnectionFactory), backed by [`lapin`], talks to a
//!   real RabbitMq broker;
//! - [`MemoryBroker`](memory::MemoryBroker) keeps everything in-process, which comes in handy
//!   in tests.
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use lapin::BasicProperties;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

mod error;
pub mod memory;
mod rabbit_mq;

pub use error::Error;

/// Identifies a delivery on the channel that received it.
pub type DeliveryTag = u64;

/// The messages pushed by the broker to a consumer.
///
/// The stream ends when the consumer is cancelled or its channel is closed.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, Error>> + Send>>;

/// Invoked when a connection fails without having been closed by us.
pub type ErrorCallback = Box<dyn Fn(Error) + Send + Sync + 'static>;

/// Something that can open connections to a broker.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, Error>;
}

/// A live connection, multiplexed into channels.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Open a new channel.
    ///
    /// Publishes on a channel opened with `confirm` set to `true` are acknowledged by the broker,
    /// see [`Confirmation`].
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn BrokerChannel>, Error>;

    async fn close(&self) -> Result<(), Error>;

    /// Register a callback to be notified when the connection breaks.
    fn on_error(&self, callback: ErrorCallback);

    fn is_connected(&self) -> bool;
}

/// A channel: an ordered pipe of protocol operations over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn assert_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), Error>;

    /// Declare a queue, or check that it exists if the declaration is `passive`.
    ///
    /// An empty name asks the broker to generate one.
    async fn assert_queue(&self, declaration: &QueueDeclaration) -> Result<DeclaredQueue, Error>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), Error>;

    /// Hand a message over to the channel.
    ///
    /// Returns once the message has been written; the broker's verdict, if any, is carried by
    /// the returned [`PendingConfirm`].
    async fn publish(&self, message: OutgoingMessage) -> Result<PendingConfirm, Error>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, Error>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), Error>;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), Error>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), Error>;

    /// Limit the number of unacknowledged deliveries pushed to consumers on this channel.
    /// `0` means no limit.
    async fn prefetch(&self, count: u16) -> Result<(), Error>;

    /// Drop every message sitting in the queue, returning how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, Error>;

    async fn close(&self) -> Result<(), Error>;

    /// Register a callback to be notified when the broker closes the channel, e.g. after a
    /// channel exception. It is not invoked when we close the channel ourselves.
    fn on_close(&self, callback: ErrorCallback);
}

/// The routing algorithm of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeType {
    /// The exchange of this type every broker declares out of the box.
    pub fn builtin_name(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "amq.direct",
            ExchangeType::Fanout => "amq.fanout",
            ExchangeType::Topic => "amq.topic",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeType> for lapin::ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => lapin::ExchangeKind::Direct,
            ExchangeType::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeType::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Milliseconds a message can sit in the queue before being discarded (`x-message-ttl`).
    pub message_ttl: Option<u32>,
    /// Maximum number of ready messages; the oldest are dropped first (`x-max-length`).
    pub max_length: Option<u32>,
}

/// The broker's answer to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker considers messages acknowledged as soon as they are delivered.
    pub no_ack: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
    /// Ask the broker to hand the message back if no queue is bound to its routing key.
    pub mandatory: bool,
}

/// A message pushed by the broker to one of our consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    /// `true` if the message had already been delivered, and requeued, before.
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// A mandatory message the broker could not route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    /// `312` (`NO_ROUTE`) when no queue is bound to the routing key.
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// The broker's verdict on a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The message was mandatory and could not be routed.
    Returned(ReturnedMessage),
    /// The message was published on a channel without publisher confirms.
    NotRequested,
}

/// Resolves to the [`Confirmation`] of a published message.
pub struct PendingConfirm(BoxFuture<'static, Result<Confirmation, Error>>);

impl PendingConfirm {
    pub fn new<F>(confirmation: F) -> Self
    where
        F: std::future::Future<Output = Result<Confirmation, Error>> + Send + 'static,
    {
        Self(confirmation.boxed())
    }

    /// A confirmation that is already known.
    pub fn ready(confirmation: Confirmation) -> Self {
        Self::new(futures_util::future::ready(Ok(confirmation)))
    }

    pub async fn wait(self) -> Result<Confirmation, Error> {
        self.0.await
    }
}

impl fmt::Debug for PendingConfirm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConfirm").finish_non_exhaustive()
    }
}
