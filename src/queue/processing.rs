use super::handler::{Handler, Incoming};
use crate::exchange::TEXT_PLAIN;
use crate::transport::{BrokerChannel, Delivery, DeliveryStream, DeliveryTag, OutgoingMessage};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How often a failed message goes back to the queue.
///
/// The broker only tells us whether a message was delivered before, so a delivery counts as
/// the first attempt, or as the second when it is flagged as redelivered. A failed message is
/// requeued if the policy allows at least that many attempts:
///
/// - `0` never requeues;
/// - `1` requeues once, for a total of two attempts;
/// - `2` or more requeues until the handler succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeuePolicy(pub u32);

impl RequeuePolicy {
    pub fn attempts(redelivered: bool) -> u32 {
        if redelivered {
            2
        } else {
            1
        }
    }

    pub fn should_requeue(&self, redelivered: bool) -> bool {
        self.0 >= Self::attempts(redelivered)
    }
}

/// What we tell the broker about a message once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// The message can be removed from the queue.
    Ack,
    /// The message was not processed successfully and goes back to the queue.
    Nack,
    /// The message was not processed successfully and is dropped.
    Reject,
}

impl BrokerAction {
    fn after_failure(requeue: bool) -> Self {
        if requeue {
            BrokerAction::Nack
        } else {
            BrokerAction::Reject
        }
    }

    async fn execute(
        &self,
        channel: &dyn BrokerChannel,
        delivery_tag: DeliveryTag,
    ) -> Result<(), crate::transport::Error> {
        match self {
            BrokerAction::Ack => channel.ack(delivery_tag).await,
            BrokerAction::Nack => channel.nack(delivery_tag, true).await,
            BrokerAction::Reject => channel.nack(delivery_tag, false).await,
        }
    }
}

/// A handler failed to process a message.
#[derive(Debug)]
pub struct HandlerFailure {
    pub queue_name: String,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    /// `true` if the message went back to the queue.
    pub requeued: bool,
    pub error: anyhow::Error,
}

/// Drives a handler over the deliveries of a consumer.
pub(crate) struct Consumer {
    pub(crate) queue_name: String,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) handler: Arc<dyn Handler>,
    /// `false` when the broker does not expect acknowledgements.
    pub(crate) ack: bool,
    pub(crate) requeue: RequeuePolicy,
    pub(crate) failures: Option<mpsc::UnboundedSender<HandlerFailure>>,
}

impl Consumer {
    /// Handle deliveries until the stream ends.
    ///
    /// When `concurrent` each delivery gets its own task, otherwise they are handled one at a
    /// time, in order.
    pub(crate) async fn run(self: Arc<Self>, mut deliveries: DeliveryStream, concurrent: bool) {
        let mut in_flight: FuturesUnordered<JoinHandle<BrokerAction>> = FuturesUnordered::new();
        loop {
            tokio::select! {
                Some(_) = in_flight.next(), if !in_flight.is_empty() => {}
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) if concurrent => {
                        let consumer = Arc::clone(&self);
                        in_flight.push(tokio::spawn(async move { consumer.process(delivery).await }));
                    }
                    Some(Ok(delivery)) => {
                        self.process(delivery).await;
                    }
                    Some(Err(e)) => {
                        error!(queue = %self.queue_name, error = ?e, "The consumer failed");
                        break;
                    }
                    None => break,
                }
            }
        }
        while in_flight.next().await.is_some() {}
        debug!(queue = %self.queue_name, "The consumer stopped");
    }

    #[tracing::instrument(name = "process_message", level = "debug", skip_all, fields(queue = %self.queue_name, delivery_tag = delivery.delivery_tag))]
    pub(crate) async fn process(&self, delivery: Delivery) -> BrokerAction {
        let delivery_tag = delivery.delivery_tag;
        let redelivered = delivery.redelivered;
        let properties = delivery.properties.clone();
        let incoming = Incoming {
            body: String::from_utf8_lossy(&delivery.data).into_owned(),
            message: delivery,
            queue_name: self.queue_name.clone(),
        };

        let action = match self.handler.handle(incoming).await {
            Ok(reply) => {
                if let Some(payload) = reply.into_payload() {
                    self.reply(&properties, payload).await;
                }
                BrokerAction::Ack
            }
            Err(error) => {
                let requeue = self.ack && self.requeue.should_requeue(redelivered);
                self.report(HandlerFailure {
                    queue_name: self.queue_name.clone(),
                    delivery_tag,
                    redelivered,
                    requeued: requeue,
                    error,
                });
                BrokerAction::after_failure(requeue)
            }
        };

        if self.ack {
            if let Err(e) = action.execute(self.channel.as_ref(), delivery_tag).await {
                warn!(error = ?e, ?action, "Failed to settle the message with the broker");
            }
        }
        action
    }

    /// Send the outcome of a request back to whoever asked for it.
    async fn reply(&self, request: &BasicProperties, payload: crate::Payload) {
        let (Some(reply_to), Some(correlation_id)) =
            (request.reply_to().clone(), request.correlation_id().clone())
        else {
            return;
        };
        let content_type = request
            .content_type()
            .clone()
            .unwrap_or_else(|| TEXT_PLAIN.into());
        let message = OutgoingMessage {
            exchange: String::new(),
            routing_key: reply_to.as_str().to_owned(),
            payload: payload.into_bytes(),
            properties: BasicProperties::default()
                .with_content_type(content_type)
                .with_correlation_id(correlation_id),
            mandatory: false,
        };
        if let Err(e) = self.channel.publish(message).await {
            warn!(error = ?e, reply_to = reply_to.as_str(), "Failed to send a reply");
        }
    }

    fn report(&self, failure: HandlerFailure) {
        warn!(
            queue = %failure.queue_name,
            redelivered = failure.redelivered,
            requeued = failure.requeued,
            error = ?failure.error,
            "The handler failed to process a message"
        );
        if let Some(failures) = &self.failures {
            if failures.send(failure).is_err() {
                debug!("Nobody is listening for handler failures");
            }
        }
    }
}
