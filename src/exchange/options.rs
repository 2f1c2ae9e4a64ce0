use crate::transport::ExchangeType;
use std::time::Duration;

/// How [`Exchange::publish`](crate::Exchange::publish) behaves. Fixed when the exchange is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// Done as soon as the message is written to the channel.
    #[default]
    Immediate,
    /// Done once the broker confirmed it took responsibility for the message.
    Confirm,
    /// Done once a consumer replied to the message.
    Reply,
}

/// Options to open an [`Exchange`](crate::Exchange).
///
/// ```rust
/// use warren::{ExchangeOptions, ExchangeType, PublishMode};
///
/// let options = ExchangeOptions::default()
///     .name("animals")
///     .kind(ExchangeType::Topic)
///     .mode(PublishMode::Confirm);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// `None` picks the built-in exchange for `kind`, e.g. `amq.topic`. An empty name is the
    /// broker's nameless default exchange.
    pub name: Option<String>,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub mode: PublishMode,
    /// Name of the queue replies are sent to, in [`PublishMode::Reply`].
    /// The broker generates one when `None`.
    pub reply_queue: Option<String>,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            name: None,
            kind: ExchangeType::Direct,
            durable: true,
            auto_delete: false,
            internal: false,
            mode: PublishMode::Immediate,
            reply_queue: None,
        }
    }
}

impl ExchangeOptions {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: ExchangeType) -> Self {
        self.kind = kind;
        self
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
    pub fn mode(mut self, mode: PublishMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn reply_queue(mut self, reply_queue: impl Into<String>) -> Self {
        self.reply_queue = Some(reply_queue.into());
        self
    }

    /// The name of the exchange these options refer to.
    pub fn exchange_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.kind.builtin_name())
    }

    /// Built-in exchanges, and the nameless one, exist on every broker and are never declared.
    pub(crate) fn is_predeclared(&self) -> bool {
        let name = self.exchange_name();
        name.is_empty() || name == self.kind.builtin_name()
    }
}

/// Options for a single [`Exchange::publish`](crate::Exchange::publish).
///
/// A routing key converts into options:
/// `exchange.publish("Hello", "greetings")`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub key: String,
    /// Overrides the content type of the payload.
    pub content_type: Option<String>,
    pub mandatory: bool,
    /// Ask the broker to store the message on disk.
    pub persistent: bool,
    /// Per-message TTL, in milliseconds.
    pub expiration: Option<Duration>,
    /// How long to wait for a reply, in [`PublishMode::Reply`]. Forever when `None`.
    pub timeout: Option<Duration>,
}

impl PublishOptions {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    #[must_use]
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for PublishOptions {
    fn from(key: &str) -> Self {
        Self::key(key)
    }
}

impl From<String> for PublishOptions {
    fn from(key: String) -> Self {
        Self::key(key)
    }
}

impl From<&String> for PublishOptions {
    fn from(key: &String) -> Self {
        Self::key(key.as_str())
    }
}
