use super::handler::{ClosureHandler, Handler, Incoming, Reply};
use super::options::QueueOptions;
use super::processing::{Consumer, HandlerFailure, RequeuePolicy};
use crate::connection::{when_channel_closed, EntityLink};
use crate::exchange::Exchange;
use crate::milestone::Milestone;
use crate::transport::{
    self, BrokerChannel, BrokerConnection, ConsumeOptions, DeclaredQueue, QueueDeclaration,
};
use crate::Error;
use futures_util::future::try_join_all;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A broker queue, and the channel used to consume from it.
///
/// A queue has at most one consumer at a time. Clones share the queue and its consumer.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    /// As resolved by the broker.
    name: String,
    options: QueueOptions,
    channel: Arc<dyn BrokerChannel>,
    link: Arc<EntityLink>,
    bound: Milestone,
    state: Mutex<State>,
    failure_sender: Option<mpsc::UnboundedSender<HandlerFailure>>,
    failures: SyncMutex<Option<mpsc::UnboundedReceiver<HandlerFailure>>>,
}

enum State {
    Unbound,
    Bound,
    Consuming {
        consumer_tag: String,
        // Detached on cancel: the task ends with its delivery stream.
        _task: JoinHandle<()>,
    },
    Closed,
}

/// The bindings requested for a queue created through [`Exchange::queue`].
pub(crate) struct Binding {
    exchange: Exchange,
    keys: Vec<String>,
}

impl Binding {
    pub(crate) fn new(exchange: Exchange, keys: Vec<String>) -> Self {
        Self { exchange, keys }
    }
}

/// The figures returned by the broker for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Messages ready to be delivered.
    pub message_count: u32,
    pub consumer_count: u32,
}

impl Queue {
    pub(crate) async fn open(
        connection: Arc<dyn BrokerConnection>,
        options: QueueOptions,
        binding: Option<Binding>,
        link: Arc<EntityLink>,
    ) -> Result<Self, Error> {
        let channel = connection
            .create_channel(false)
            .await
            .map_err(Error::Transport)?;
        let declared = match declare(channel.as_ref(), &options).await {
            Ok(declared) => declared,
            Err(e) => {
                if let Err(close) = channel.close().await {
                    debug!(error = ?close, "The channel of the queue was already closed");
                }
                return Err(e);
            }
        };

        let (failure_sender, failures) = if options.rethrow {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Some(sender), Some(receiver))
        } else {
            (None, None)
        };
        let (bound, state) = match binding {
            Some(_) => (Milestone::new(), State::Unbound),
            None => (Milestone::reached(), State::Bound),
        };
        let inner = Arc::new(QueueInner {
            name: declared.name,
            options,
            channel,
            link,
            bound,
            state: Mutex::new(state),
            failure_sender,
            failures: SyncMutex::new(failures),
        });
        debug!(queue = %inner.name, "Queue declared");
        when_channel_closed(inner.channel.as_ref(), &inner, QueueInner::channel_closed);
        if let Some(binding) = binding {
            tokio::spawn(Arc::clone(&inner).bind(binding));
        }
        Ok(Self { inner })
    }

    /// Consume messages with an async closure.
    ///
    /// The value the closure resolves to is sent back to the publisher if it asked for a
    /// reply, see [`PublishMode::Reply`](crate::PublishMode::Reply).
    ///
    /// ```rust,no_run
    /// # async fn run(queue: warren::Queue) -> Result<(), warren::Error> {
    /// queue
    ///     .consume(|incoming| async move {
    ///         let n: u64 = incoming.body.parse()?;
    ///         Ok::<_, anyhow::Error>(n * 2)
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn consume<F, Fut, R, E>(&self, handler: F) -> Result<String, Error>
    where
        F: Fn(Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Into<Reply> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.consume_with(ClosureHandler(handler)).await
    }

    /// Start consuming messages, once the queue is bound, returning the consumer tag.
    ///
    /// Fails with [`Error::ConsumeMisuse`] if the queue already has a consumer.
    #[tracing::instrument(name = "queue_consume", skip_all, fields(queue = %self.inner.name))]
    pub async fn consume_with<H: Handler>(&self, handler: H) -> Result<String, Error> {
        let inner = &*self.inner;
        self.check_idle(&*inner.state.lock().await)?;
        inner.bound.wait().await?;

        let mut state = inner.state.lock().await;
        self.check_idle(&state)?;
        if inner.link.is_closed() {
            return Err(self.closed());
        }
        let consumer_tag = Uuid::new_v4().to_string();
        let options = ConsumeOptions {
            no_ack: !inner.options.ack,
            exclusive: false,
        };
        let deliveries = inner
            .channel
            .consume(&inner.name, &consumer_tag, options)
            .await
            .map_err(Error::Transport)?;
        let consumer = Arc::new(Consumer {
            queue_name: inner.name.clone(),
            channel: Arc::clone(&inner.channel),
            handler: Arc::new(handler),
            ack: inner.options.ack,
            requeue: RequeuePolicy(inner.options.requeue),
            failures: inner.failure_sender.clone(),
        });
        let task = tokio::spawn(consumer.run(deliveries, inner.options.prefetch > 1));
        info!(%consumer_tag, "Consuming");
        *state = State::Consuming {
            consumer_tag: consumer_tag.clone(),
            _task: task,
        };
        Ok(consumer_tag)
    }

    /// Stop consuming. A new consumer can be started afterwards.
    pub async fn cancel(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let State::Consuming { consumer_tag, .. } = &*state else {
            return Ok(());
        };
        self.inner
            .channel
            .cancel(consumer_tag)
            .await
            .map_err(Error::Transport)?;
        info!(queue = %self.inner.name, %consumer_tag, "Cancelled the consumer");
        *state = State::Bound;
        Ok(())
    }

    /// Bind the queue to an exchange. Binding to the default exchange is a no-op.
    pub async fn bind(&self, exchange: &str, routing_key: &str) -> Result<(), Error> {
        if exchange.is_empty() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(self.closed());
        }
        self.inner
            .channel
            .bind_queue(&self.inner.name, exchange, routing_key)
            .await
            .map_err(|source| Error::Assertion {
                entity: format!(
                    "the binding of queue `{}` to exchange `{exchange}`",
                    self.inner.name
                ),
                source,
            })
    }

    /// Remove every message waiting in the queue, returning how many there were.
    pub async fn purge(&self) -> Result<u32, Error> {
        if self.is_closed() {
            return Err(self.closed());
        }
        self.inner
            .channel
            .purge_queue(&self.inner.name)
            .await
            .map_err(Error::Transport)
    }

    pub async fn status(&self) -> Result<QueueStatus, Error> {
        if self.is_closed() {
            return Err(self.closed());
        }
        let declaration = QueueDeclaration {
            name: self.inner.name.clone(),
            passive: true,
            ..QueueDeclaration::default()
        };
        let declared = self
            .inner
            .channel
            .assert_queue(&declaration)
            .await
            .map_err(Error::Transport)?;
        Ok(QueueStatus {
            message_count: declared.message_count,
            consumer_count: declared.consumer_count,
        })
    }

    /// Close the channel of the queue, and with it the consumer.
    pub async fn close(&self) -> Result<(), Error> {
        if !self.inner.link.mark_closed() {
            return Err(self.closed());
        }
        *self.inner.state.lock().await = State::Closed;
        let closed = self.inner.channel.close().await;
        self.inner.link.release().await?;
        info!(queue = %self.inner.name, "Closed the queue");
        closed.map_err(Error::Transport)
    }

    /// Wait until the queue is bound to every routing key it was created with.
    pub async fn bound(&self) -> Result<(), Error> {
        self.inner.bound.wait().await
    }

    /// Handler failures, when the queue was opened with [`QueueOptions::rethrow`].
    ///
    /// There is a single receiver: `None` once it has been taken, or without `rethrow`.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<HandlerFailure>> {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn consumer_tag(&self) -> Option<String> {
        match &*self.inner.state.lock().await {
            State::Consuming { consumer_tag, .. } => Some(consumer_tag.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.link.is_closed()
    }

    fn check_idle(&self, state: &State) -> Result<(), Error> {
        match state {
            State::Consuming { .. } => Err(Error::ConsumeMisuse(self.inner.name.clone())),
            State::Closed => Err(self.closed()),
            State::Unbound | State::Bound => Ok(()),
        }
    }

    fn closed(&self) -> Error {
        Error::Closed(format!("queue `{}`", self.inner.name))
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("bound", &self.inner.bound.is_settled())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl QueueInner {
    /// The broker closed our channel, after a channel exception. The consumer, if any, stops
    /// with it.
    async fn channel_closed(self: Arc<Self>, error: transport::Error) {
        if !self.link.mark_closed() {
            return;
        }
        warn!(queue = %self.name, error = ?error, "The broker closed the channel of the queue");
        self.bound
            .settle(Err(Error::Closed(format!("queue `{}`", self.name))));
        *self.state.lock().await = State::Closed;
        if let Err(e) = self.link.release().await {
            error!(error = ?e, "Failed to release the queue");
        }
    }

    async fn bind(self: Arc<Self>, binding: Binding) {
        match self.bind_all(&binding).await {
            Ok(()) => {
                {
                    let mut state = self.state.lock().await;
                    if matches!(*state, State::Unbound) {
                        *state = State::Bound;
                    }
                }
                self.bound.settle(Ok(()));
                debug!(queue = %self.name, exchange = binding.exchange.name(), keys = ?binding.keys, "Queue bound");
            }
            Err(e) => {
                warn!(queue = %self.name, error = ?e, "Failed to bind the queue");
                self.bound.settle(Err(e));
                if self.link.mark_closed() {
                    *self.state.lock().await = State::Closed;
                    if let Err(e) = self.channel.close().await {
                        debug!(error = ?e, "The channel of the queue was already closed");
                    }
                    if let Err(e) = self.link.release().await {
                        error!(error = ?e, "Failed to release the queue");
                    }
                }
            }
        }
    }

    /// Bind with every key at once; the queue is bound once all of them are.
    async fn bind_all(&self, binding: &Binding) -> Result<(), Error> {
        binding.exchange.ready().await?;
        let exchange = binding.exchange.name();
        // Queues are bound to the default exchange by their name already.
        if exchange.is_empty() {
            return Ok(());
        }
        try_join_all(
            binding
                .keys
                .iter()
                .map(|key| self.channel.bind_queue(&self.name, exchange, key)),
        )
        .await
        .map_err(|source| Error::Assertion {
            entity: format!(
                "the binding of queue `{}` to exchange `{exchange}`",
                self.name
            ),
            source,
        })?;
        Ok(())
    }
}

async fn declare(
    channel: &dyn BrokerChannel,
    options: &QueueOptions,
) -> Result<DeclaredQueue, Error> {
    channel
        .prefetch(options.prefetch)
        .await
        .map_err(Error::Transport)?;
    channel
        .assert_queue(&options.declaration())
        .await
        .map_err(|source| Error::Assertion {
            entity: if options.name.is_empty() {
                "a server-named queue".to_owned()
            } else {
                format!("queue `{}`", options.name)
            },
            source,
        })
}
