use super::options::{ExchangeOptions, PublishMode, PublishOptions};
use super::payload::Payload;
use super::reply::{route_replies, PendingReplies, Response};
use crate::connection::{when_channel_closed, EntityLink};
use crate::milestone::Milestone;
use crate::queue::{Binding, Handler, Incoming, Queue, QueueOptions, Reply};
use crate::transport::{
    self, BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, ExchangeDeclaration,
    ExchangeType, OutgoingMessage, QueueDeclaration,
};
use crate::Error;
use lapin::BasicProperties;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const TRANSIENT: u8 = 1;
const PERSISTENT: u8 = 2;

/// How long [`Exchange::request`] waits for a reply when the options do not say.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);

/// A broker exchange, and the channel used to publish to it.
///
/// Obtained from a [`ConnectionManager`](crate::ConnectionManager). Clones publish on the same
/// channel.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

struct ExchangeInner {
    name: String,
    options: ExchangeOptions,
    channel: Arc<dyn BrokerChannel>,
    link: Arc<EntityLink>,
    ready: Milestone,
    /// Publishes go through one at a time, in the order they were issued.
    /// Held by the set-up task until the exchange is ready.
    gate: Arc<Mutex<()>>,
    drain: Drain,
    replies: PendingReplies,
    reply_queue: OnceLock<String>,
}

impl Exchange {
    pub(crate) async fn open(
        connection: Arc<dyn BrokerConnection>,
        options: ExchangeOptions,
        link: Arc<EntityLink>,
    ) -> Result<Self, Error> {
        let confirm = options.mode != PublishMode::Immediate;
        let channel = connection
            .create_channel(confirm)
            .await
            .map_err(Error::Transport)?;
        let gate = Arc::new(Mutex::new(()));
        let set_up_guard = Arc::clone(&gate).lock_owned().await;
        let inner = Arc::new(ExchangeInner {
            name: options.exchange_name().to_owned(),
            options,
            channel,
            link,
            ready: Milestone::new(),
            gate,
            drain: Drain::default(),
            replies: PendingReplies::default(),
            reply_queue: OnceLock::new(),
        });
        when_channel_closed(inner.channel.as_ref(), &inner, ExchangeInner::channel_closed);
        tokio::spawn(Arc::clone(&inner).set_up(set_up_guard));
        Ok(Self { inner })
    }

    /// Publish a message.
    ///
    /// What "done" means depends on the [`PublishMode`] of the exchange. In
    /// [`PublishMode::Reply`] the reply is returned, `None` otherwise.
    ///
    /// Messages published before the exchange is ready are sent as soon as it is, in the order
    /// they were published. The reply timeout, if any, covers that wait too.
    #[tracing::instrument(name = "exchange_publish", skip_all, fields(exchange = %self.inner.name, mode = ?self.inner.options.mode))]
    pub async fn publish(
        &self,
        payload: impl Into<Payload>,
        options: impl Into<PublishOptions>,
    ) -> Result<Option<Response>, Error> {
        let options = options.into();
        let payload = payload.into();
        match (self.inner.options.mode, options.timeout) {
            (PublishMode::Reply, Some(timeout)) => {
                tokio::time::timeout(timeout, self.send(payload, &options))
                    .await
                    .map_err(|_| Error::ReplyTimeout(timeout))?
            }
            _ => self.send(payload, &options).await,
        }
    }

    /// Send a request and wait for its reply, for [`DEFAULT_REQUEST_TIMEOUT`] unless the options
    /// set a timeout.
    ///
    /// Fails with [`Error::NotReplying`] unless the exchange publishes in [`PublishMode::Reply`].
    pub async fn request(
        &self,
        payload: impl Into<Payload>,
        options: impl Into<PublishOptions>,
    ) -> Result<Response, Error> {
        if self.inner.options.mode != PublishMode::Reply {
            return Err(Error::NotReplying(self.inner.name.clone()));
        }
        let mut options = options.into();
        options.timeout.get_or_insert(DEFAULT_REQUEST_TIMEOUT);
        self.publish(payload, options)
            .await?
            .ok_or_else(|| self.closed())
    }

    async fn send(
        &self,
        payload: Payload,
        options: &PublishOptions,
    ) -> Result<Option<Response>, Error> {
        let inner = &*self.inner;
        let writing = inner.drain.start();
        let gate = inner.gate.lock().await;
        inner.ready.wait().await?;
        if inner.link.is_closed() {
            return Err(self.closed());
        }
        let mut message = inner.message(payload, options);

        match inner.options.mode {
            PublishMode::Immediate => {
                inner
                    .channel
                    .publish(message)
                    .await
                    .map_err(Error::Transport)?;
                drop(gate);
                tokio::task::yield_now().await;
                drop(writing);
                Ok(None)
            }
            PublishMode::Confirm => {
                let confirm = inner
                    .channel
                    .publish(message)
                    .await
                    .map_err(Error::Transport)?;
                drop(gate);
                drop(writing);
                match confirm.wait().await.map_err(Error::Transport)? {
                    Confirmation::Ack | Confirmation::NotRequested => Ok(None),
                    Confirmation::Nack => Err(Error::NegativeAck),
                    Confirmation::Returned(returned) => Err(Error::Unroutable(returned)),
                }
            }
            PublishMode::Reply => {
                let reply_queue = inner
                    .reply_queue
                    .get()
                    .cloned()
                    .ok_or_else(|| Error::Closed("reply queue".into()))?;
                let pending = inner.replies.register(Uuid::new_v4().to_string());
                message.mandatory = true;
                message.properties = message
                    .properties
                    .with_reply_to(reply_queue.into())
                    .with_correlation_id(pending.correlation_id().into());
                let confirm = inner
                    .channel
                    .publish(message)
                    .await
                    .map_err(Error::Transport)?;
                drop(gate);
                drop(writing);

                let response = pending.wait(confirm, &options.key).await?;
                Ok(Some(response))
            }
        }
    }

    /// Declare a queue and bind it to this exchange.
    ///
    /// The queue is bound with every key in [`QueueOptions::keys`], falling back to
    /// [`QueueOptions::key`] and then to the empty key. Binding happens in the background:
    /// the queue does not consume until all bindings are in place, see [`Queue::bound`].
    #[tracing::instrument(name = "exchange_queue", skip_all, fields(exchange = %self.inner.name, queue = %options.name))]
    pub async fn queue(&self, options: QueueOptions) -> Result<Queue, Error> {
        if self.inner.link.is_closed() {
            return Err(self.closed());
        }
        let manager = self.inner.link.manager().ok_or_else(|| self.closed())?;
        let binding = Binding::new(self.clone(), options.binding_keys());
        manager.open_queue(options, Some(binding)).await
    }

    /// Answer the requests sent to this exchange with routing key `key`.
    ///
    /// Requests are taken one at a time from a queue named after the key, which goes away with
    /// its consumer. Returns once the queue consumes.
    pub async fn rpc_server<F, Fut, R, E>(&self, key: &str, handler: F) -> Result<Queue, Error>
    where
        F: Fn(Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Into<Reply> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let queue = self.queue(rpc_queue(key)).await?;
        let consumed = queue.consume(handler).await;
        serve(queue, consumed).await
    }

    /// [`Exchange::rpc_server`] with a [`Handler`].
    pub async fn rpc_server_with<H: Handler>(
        &self,
        key: &str,
        handler: H,
    ) -> Result<Queue, Error> {
        let queue = self.queue(rpc_queue(key)).await?;
        let consumed = queue.consume_with(handler).await;
        serve(queue, consumed).await
    }

    /// Wait for the broker to acknowledge the exchange, and its reply queue if any.
    pub async fn ready(&self) -> Result<(), Error> {
        self.inner.ready.wait().await
    }

    /// Wait until no publish is being written to the channel.
    pub async fn drained(&self) {
        self.inner.drain.wait().await
    }

    /// Close the channel of the exchange. Requests waiting for a reply fail.
    pub async fn close(&self) -> Result<(), Error> {
        if !self.inner.link.mark_closed() {
            return Err(self.closed());
        }
        let closed = self.inner.channel.close().await;
        self.inner.replies.clear();
        self.inner.link.release().await?;
        info!(exchange = %self.inner.name, "Closed the exchange");
        closed.map_err(Error::Transport)
    }

    /// The name of the exchange, empty for the broker's default exchange.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ExchangeType {
        self.inner.options.kind
    }

    pub fn mode(&self) -> PublishMode {
        self.inner.options.mode
    }

    /// The queue replies are sent to, once the exchange is ready in [`PublishMode::Reply`].
    pub fn reply_queue(&self) -> Option<&str> {
        self.inner.reply_queue.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.link.is_closed()
    }

    fn closed(&self) -> Error {
        Error::Closed(format!("exchange `{}`", self.inner.name))
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.options.kind)
            .field("mode", &self.inner.options.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn rpc_queue(key: &str) -> QueueOptions {
    QueueOptions::named(key)
        .durable(false)
        .auto_delete(true)
        .prefetch(1)
        .key(key)
}

async fn serve(queue: Queue, consumed: Result<String, Error>) -> Result<Queue, Error> {
    match consumed {
        Ok(consumer_tag) => {
            info!(queue = queue.name(), %consumer_tag, "Serving requests");
            Ok(queue)
        }
        Err(e) => {
            if let Err(close) = queue.close().await {
                debug!(error = ?close, "The request queue was already closed");
            }
            Err(e)
        }
    }
}

impl ExchangeInner {
    /// The broker closed our channel, after a channel exception.
    async fn channel_closed(self: Arc<Self>, error: transport::Error) {
        if !self.link.mark_closed() {
            return;
        }
        warn!(exchange = %self.name, error = ?error, "The broker closed the channel of the exchange");
        self.ready.settle(Err(Error::Closed(format!("exchange `{}`", self.name))));
        self.replies.clear();
        if let Err(e) = self.link.release().await {
            error!(error = ?e, "Failed to release the exchange");
        }
    }

    async fn set_up(self: Arc<Self>, gate: OwnedMutexGuard<()>) {
        match self.declare().await {
            Ok(()) => {
                self.ready.settle(Ok(()));
                debug!(exchange = %self.name, "Exchange ready");
            }
            Err(e) => {
                warn!(exchange = %self.name, error = ?e, "Failed to set up the exchange");
                self.ready.settle(Err(e));
                if self.link.mark_closed() {
                    if let Err(e) = self.channel.close().await {
                        debug!(error = ?e, "The channel of the exchange was already closed");
                    }
                    if let Err(e) = self.link.release().await {
                        error!(error = ?e, "Failed to release the exchange");
                    }
                }
            }
        }
        drop(gate);
    }

    async fn declare(&self) -> Result<(), Error> {
        if !self.options.is_predeclared() {
            let declaration = ExchangeDeclaration {
                name: self.name.clone(),
                kind: self.options.kind,
                durable: self.options.durable,
                auto_delete: self.options.auto_delete,
                internal: self.options.internal,
            };
            self.channel
                .assert_exchange(&declaration)
                .await
                .map_err(|source| Error::Assertion {
                    entity: format!("exchange `{}`", self.name),
                    source,
                })?;
        }

        if self.options.mode == PublishMode::Reply {
            let declaration = QueueDeclaration {
                name: self.options.reply_queue.clone().unwrap_or_default(),
                exclusive: true,
                auto_delete: true,
                ..QueueDeclaration::default()
            };
            let reply_queue = self
                .channel
                .assert_queue(&declaration)
                .await
                .map_err(|source| Error::Assertion {
                    entity: format!("the reply queue of exchange `{}`", self.name),
                    source,
                })?;
            let options = ConsumeOptions {
                no_ack: false,
                exclusive: true,
            };
            let deliveries = self
                .channel
                .consume(&reply_queue.name, &Uuid::new_v4().to_string(), options)
                .await
                .map_err(Error::Transport)?;
            tokio::spawn(route_replies(
                deliveries,
                Arc::clone(&self.channel),
                self.replies.clone(),
            ));
            debug!(exchange = %self.name, reply_queue = %reply_queue.name, "Consuming replies");
            // Only the set-up task writes it, once.
            let _ = self.reply_queue.set(reply_queue.name);
        }
        Ok(())
    }

    fn message(&self, payload: Payload, options: &PublishOptions) -> OutgoingMessage {
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| payload.content_type().to_owned());
        let delivery_mode = if options.persistent {
            PERSISTENT
        } else {
            TRANSIENT
        };
        let mut properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_delivery_mode(delivery_mode);
        if let Some(expiration) = options.expiration {
            properties = properties.with_expiration(expiration.as_millis().to_string().into());
        }
        OutgoingMessage {
            exchange: self.name.clone(),
            routing_key: options.key.clone(),
            payload: payload.into_bytes(),
            properties: with_metadata(properties),
            mandatory: options.mandatory,
        }
    }
}

/// Stamp the message with the time it was published and a unique id.
fn with_metadata(properties: BasicProperties) -> BasicProperties {
    let properties = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => properties.with_timestamp(now.as_secs()),
        Err(_) => {
            warn!("System time is before 1970");
            properties
        }
    };
    properties.with_message_id(Uuid::new_v4().to_string().into())
}

/// Tracks publishes being written, to signal when there are none left.
#[derive(Default)]
struct Drain {
    in_flight: AtomicUsize,
    drained: Notify,
}

impl Drain {
    fn start(&self) -> Writing<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Writing(self)
    }

    async fn wait(&self) {
        loop {
            // Created before checking the counter, so that no notification is missed.
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

struct Writing<'a>(&'a Drain);

impl Drop for Writing<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}
