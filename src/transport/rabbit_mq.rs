//! [`Broker`] implementation for a RabbitMq broker, via [`lapin`].
use super::{
    Broker, BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, DeclaredQueue,
    Delivery, DeliveryStream, DeliveryTag, Error, ErrorCallback, ExchangeDeclaration,
    OutgoingMessage, PendingConfirm, QueueDeclaration, ReturnedMessage,
};
use crate::amqp::ConnectionFactory;
use amq_protocol_types::{AMQPValue, FieldTable};
use futures_util::StreamExt;
use lapin::message::BasicReturnMessage;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use std::sync::Arc;

/// Reply code sent along with graceful closes.
const REPLY_SUCCESS: u16 = 200;

#[async_trait::async_trait]
impl Broker for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, Error> {
        let connection = self.new_connection().await?;
        Ok(Arc::new(RabbitMqConnection(connection)))
    }
}

struct RabbitMqConnection(lapin::Connection);

#[async_trait::async_trait]
impl BrokerConnection for RabbitMqConnection {
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn BrokerChannel>, Error> {
        let channel = self.0.create_channel().await?;
        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(Arc::new(RabbitMqChannel(channel)))
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(self.0.close(REPLY_SUCCESS, "closing").await?)
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.0.on_error(move |e| callback(e.into()));
    }

    fn is_connected(&self) -> bool {
        self.0.status().connected()
    }
}

struct RabbitMqChannel(lapin::Channel);

#[async_trait::async_trait]
impl BrokerChannel for RabbitMqChannel {
    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn assert_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable: declaration.durable,
            auto_delete: declaration.auto_delete,
            internal: declaration.internal,
            nowait: false,
        };
        self.0
            .exchange_declare(
                &declaration.name,
                declaration.kind.into(),
                options,
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn assert_queue(&self, declaration: &QueueDeclaration) -> Result<DeclaredQueue, Error> {
        let options = QueueDeclareOptions {
            passive: declaration.passive,
            durable: declaration.durable,
            exclusive: declaration.exclusive,
            auto_delete: declaration.auto_delete,
            nowait: false,
        };
        let mut arguments = FieldTable::default();
        if let Some(ttl) = declaration.message_ttl {
            arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
        }
        if let Some(max_length) = declaration.max_length {
            arguments.insert("x-max-length".into(), AMQPValue::LongUInt(max_length));
        }
        let queue = self
            .0
            .queue_declare(&declaration.name, options, arguments)
            .await?;
        Ok(DeclaredQueue {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.0
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<PendingConfirm, Error> {
        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            immediate: false,
        };
        let confirm = self
            .0
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                options,
                &message.payload,
                message.properties,
            )
            .await?;
        Ok(PendingConfirm::new(async move {
            let confirmation = match confirm.await? {
                lapin::publisher_confirm::Confirmation::Ack(Some(returned))
                | lapin::publisher_confirm::Confirmation::Nack(Some(returned)) => {
                    Confirmation::Returned((*returned).into())
                }
                lapin::publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
                lapin::publisher_confirm::Confirmation::Nack(None) => Confirmation::Nack,
                lapin::publisher_confirm::Confirmation::NotRequested => {
                    Confirmation::NotRequested
                }
            };
            Ok(confirmation)
        }))
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self))]
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, Error> {
        let options = BasicConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .0
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(Box::pin(consumer.map(|delivery| {
            delivery.map(Delivery::from).map_err(Error::from)
        })))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        Ok(self
            .0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), Error> {
        Ok(self
            .0
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?)
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), Error> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        Ok(self.0.basic_nack(delivery_tag, options).await?)
    }

    async fn prefetch(&self, count: u16) -> Result<(), Error> {
        Ok(self
            .0
            .basic_qos(count, BasicQosOptions { global: false })
            .await?)
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, Error> {
        Ok(self
            .0
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?)
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(self.0.close(REPLY_SUCCESS, "closing").await?)
    }

    fn on_close(&self, callback: ErrorCallback) {
        self.0.on_error(move |e| callback(e.into()));
    }
}

impl From<BasicReturnMessage> for ReturnedMessage {
    fn from(returned: BasicReturnMessage) -> Self {
        Self {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.as_str().to_owned(),
            exchange: returned.delivery.exchange.as_str().to_owned(),
            routing_key: returned.delivery.routing_key.as_str().to_owned(),
        }
    }
}
