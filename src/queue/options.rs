use crate::transport::QueueDeclaration;
use std::time::Duration;

/// Options to open a [`Queue`](crate::Queue).
///
/// ```rust
/// use warren::QueueOptions;
///
/// let options = QueueOptions::named("jobs")
///     .prefetch(10)
///     .requeue(1)
///     .keys(["jobs.created", "jobs.retried"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Leave empty to let the broker generate a unique name.
    pub name: String,
    pub durable: bool,
    /// Only usable by our connection, deleted when it closes.
    pub exclusive: bool,
    /// Deleted by the broker once its last consumer goes away.
    pub auto_delete: bool,
    /// Maximum number of unacknowledged messages pushed to the consumer, `0` for no limit.
    /// Messages are handled concurrently when it is greater than one.
    pub prefetch: u16,
    /// Acknowledge messages once handled. When `false`, the broker considers messages
    /// acknowledged as soon as they are delivered, and failures are never requeued.
    pub ack: bool,
    /// How many delivery attempts may be requeued after a failure, see [`RequeuePolicy`].
    ///
    /// [`RequeuePolicy`]: crate::queue::RequeuePolicy
    pub requeue: u32,
    /// Forward handler failures to [`Queue::failures`](crate::Queue::failures).
    pub rethrow: bool,
    /// Routing keys used when binding to an exchange, see [`Exchange::queue`].
    ///
    /// [`Exchange::queue`]: crate::Exchange::queue
    pub keys: Vec<String>,
    /// Used when `keys` is empty.
    pub key: Option<String>,
    pub message_ttl: Option<Duration>,
    pub max_length: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            prefetch: 1,
            ack: true,
            requeue: 0,
            rethrow: false,
            keys: Vec::new(),
            key: None,
            message_ttl: None,
            max_length: None,
        }
    }
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A queue for this connection only, named by the broker.
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            durable: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    #[must_use]
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    #[must_use]
    pub fn ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    #[must_use]
    pub fn requeue(mut self, requeue: u32) -> Self {
        self.requeue = requeue;
        self
    }

    #[must_use]
    pub fn rethrow(mut self, rethrow: bool) -> Self {
        self.rethrow = rethrow;
        self
    }

    #[must_use]
    pub fn keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn message_ttl(mut self, message_ttl: Duration) -> Self {
        self.message_ttl = Some(message_ttl);
        self
    }

    #[must_use]
    pub fn max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// The keys to bind the queue with: `keys`, else `key`, else the empty key.
    pub(crate) fn binding_keys(&self) -> Vec<String> {
        if !self.keys.is_empty() {
            return self.keys.clone();
        }
        vec![self.key.clone().unwrap_or_default()]
    }

    pub(crate) fn declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.name.clone(),
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            message_ttl: self
                .message_ttl
                .map(|ttl| u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX)),
            max_length: self.max_length,
        }
    }
}
