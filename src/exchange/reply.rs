use crate::transport::{
    BrokerChannel, Confirmation, Delivery, DeliveryStream, PendingConfirm,
};
use crate::Error;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The reply to a message published in [`PublishMode::Reply`](crate::PublishMode::Reply).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    body: String,
    message: Delivery,
}

impl Response {
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// The raw reply, properties included.
    pub fn message(&self) -> &Delivery {
        &self.message
    }

    pub fn into_body(self) -> String {
        self.body
    }
}

impl From<Delivery> for Response {
    fn from(message: Delivery) -> Self {
        Self {
            body: String::from_utf8_lossy(&message.data).into_owned(),
            message,
        }
    }
}

/// Requests waiting for a reply, by correlation id.
#[derive(Clone, Default)]
pub(crate) struct PendingReplies {
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>,
}

impl PendingReplies {
    /// Start waiting for the reply to `correlation_id`.
    ///
    /// The registration is dropped along with the returned [`PendingReply`], whatever the
    /// outcome of the request.
    pub(crate) fn register(&self, correlation_id: String) -> PendingReply {
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(correlation_id.clone(), sender);
        PendingReply {
            correlation_id,
            receiver,
            replies: self.clone(),
        }
    }

    /// Returns `false` if nobody is waiting for this reply, e.g. because the request timed out.
    pub(crate) fn resolve(&self, correlation_id: &str, response: Response) -> bool {
        match self.lock().remove(correlation_id) {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Give up on every pending request: their replies can no longer arrive.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct PendingReply {
    correlation_id: String,
    receiver: oneshot::Receiver<Response>,
    replies: PendingReplies,
}

impl PendingReply {
    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the broker to route the request, then for its reply.
    pub(crate) async fn wait(
        mut self,
        confirm: PendingConfirm,
        routing_key: &str,
    ) -> Result<Response, Error> {
        match confirm.wait().await.map_err(Error::Transport)? {
            Confirmation::Returned(_) => return Err(Error::ReplyNotFound(routing_key.to_owned())),
            Confirmation::Nack => return Err(Error::NegativeAck),
            Confirmation::Ack | Confirmation::NotRequested => {}
        }
        (&mut self.receiver)
            .await
            .map_err(|_| Error::Closed("reply queue".into()))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.replies.lock().remove(&self.correlation_id);
    }
}

/// Hand replies over to the requests waiting for them, acknowledging each of them.
pub(crate) async fn route_replies(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    replies: PendingReplies,
) {
    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = ?e, "The reply consumer failed");
                break;
            }
        };
        let delivery_tag = delivery.delivery_tag;
        match delivery.properties.correlation_id().clone() {
            Some(correlation_id) => {
                if !replies.resolve(correlation_id.as_str(), delivery.into()) {
                    debug!(
                        correlation_id = correlation_id.as_str(),
                        "Dropped a reply nobody is waiting for"
                    );
                }
            }
            None => warn!("Dropped a reply without correlation id"),
        }
        if let Err(e) = channel.ack(delivery_tag).await {
            warn!(error = ?e, "Failed to ack a reply");
        }
    }
    replies.clear();
    debug!("The reply consumer stopped");
}
