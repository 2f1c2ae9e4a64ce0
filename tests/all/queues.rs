use crate::helpers::{
    assert_silent, bodies, forward_to, next, rabbit, recorder, take, unique,
};
use std::future::{ready, Ready};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Barrier;
use warren::transport::memory::MemoryBroker;
use warren::{ConnectionManager, Error, Exchange, ExchangeOptions, Incoming, Queue, QueueOptions};

/// A handler that always fails, after forwarding the message to `sender`.
fn failing(
    sender: UnboundedSender<Incoming>,
) -> impl Fn(Incoming) -> Ready<Result<(), anyhow::Error>> + Send + Sync + 'static {
    move |incoming| {
        let _ = sender.send(incoming);
        ready(Err(anyhow::anyhow!("Failed to process the message")))
    }
}

async fn queue_with(options: QueueOptions) -> (MemoryBroker, ConnectionManager, Queue, Exchange) {
    let (broker, manager) = rabbit();
    let queue = manager.queue(options).await.unwrap();
    let exchange = manager
        .default_exchange(ExchangeOptions::default())
        .await
        .unwrap();
    (broker, manager, queue, exchange)
}

#[tokio::test]
async fn a_queue_has_a_single_consumer() {
    // Arrange
    let (_broker, _manager, queue, exchange) =
        queue_with(QueueOptions::named(unique("single"))).await;
    let (sender, mut receiver) = recorder();
    queue.consume(forward_to(sender)).await.unwrap();

    // Act
    let second = queue
        .consume(|_incoming| async { Ok::<_, anyhow::Error>(()) })
        .await;

    // Assert
    assert!(matches!(second, Err(Error::ConsumeMisuse(_))), "{second:?}");
    exchange.publish("still here", queue.name()).await.unwrap();
    assert_eq!(next(&mut receiver).await.body, "still here");
}

#[tokio::test]
async fn failures_are_not_requeued_by_default() {
    // Arrange
    let name = unique("no-requeue");
    let (broker, _manager, queue, exchange) = queue_with(QueueOptions::named(&name)).await;
    let (sender, mut receiver) = recorder();
    queue.consume(failing(sender)).await.unwrap();

    // Act
    exchange.publish("once", queue.name()).await.unwrap();

    // Assert
    assert!(!next(&mut receiver).await.message.redelivered);
    assert_silent(&mut receiver).await;
    assert_eq!(broker.ready_messages(&name), Some(0));
}

#[tokio::test]
async fn a_requeue_of_one_allows_a_second_attempt() {
    // Arrange
    let (_broker, _manager, queue, exchange) =
        queue_with(QueueOptions::named(unique("requeue-once")).requeue(1)).await;
    let (sender, mut receiver) = recorder();
    queue.consume(failing(sender)).await.unwrap();

    // Act
    exchange.publish("twice", queue.name()).await.unwrap();

    // Assert
    let attempts = take(&mut receiver, 2).await;
    assert!(!attempts[0].message.redelivered);
    assert!(attempts[1].message.redelivered);
    assert_silent(&mut receiver).await;
}

#[tokio::test]
async fn a_requeue_of_two_retries_until_the_handler_succeeds() {
    // Arrange
    let (_broker, _manager, queue, exchange) =
        queue_with(QueueOptions::named(unique("requeue-forever")).requeue(2)).await;
    let (sender, mut receiver) = recorder();
    queue.consume(failing(sender)).await.unwrap();

    // Act
    exchange.publish("again", queue.name()).await.unwrap();

    // Assert
    let attempts = take(&mut receiver, 5).await;
    assert!(attempts.iter().skip(1).all(|a| a.message.redelivered));
    queue.cancel().await.unwrap();
}

#[tokio::test]
async fn failures_are_forwarded_when_rethrowing() {
    // Arrange
    let (_broker, _manager, queue, exchange) = queue_with(
        QueueOptions::named(unique("rethrow"))
            .requeue(1)
            .rethrow(true),
    )
    .await;
    let mut failures = queue.failures().unwrap();
    assert!(queue.failures().is_none());
    let (sender, _receiver) = recorder();
    queue.consume(failing(sender)).await.unwrap();

    // Act
    exchange.publish("broken", queue.name()).await.unwrap();

    // Assert
    let first = next(&mut failures).await;
    let second = next(&mut failures).await;
    assert_eq!(first.queue_name, queue.name());
    assert!(first.requeued && !first.redelivered);
    assert!(!second.requeued && second.redelivered);
    assert_eq!(
        second.error.to_string(),
        "Failed to process the message"
    );
}

#[tokio::test]
async fn failures_without_acknowledgements_are_reported_but_never_requeued() {
    // Arrange
    let (_broker, _manager, queue, exchange) = queue_with(
        QueueOptions::named(unique("no-ack"))
            .ack(false)
            .requeue(5)
            .rethrow(true),
    )
    .await;
    let mut failures = queue.failures().unwrap();
    let (sender, mut receiver) = recorder();
    queue.consume(failing(sender)).await.unwrap();

    // Act
    exchange.publish("gone", queue.name()).await.unwrap();

    // Assert
    assert!(!next(&mut failures).await.requeued);
    next(&mut receiver).await;
    assert_silent(&mut receiver).await;
}

#[tokio::test]
async fn a_cancelled_queue_can_be_consumed_again() {
    // Arrange
    let (_broker, _manager, queue, exchange) =
        queue_with(QueueOptions::named(unique("cancel"))).await;
    queue
        .consume(|_incoming| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap();
    assert!(queue.consumer_tag().await.is_some());

    // Act
    queue.cancel().await.unwrap();
    let (sender, mut receiver) = recorder();
    let consumer_tag = queue.consume(forward_to(sender)).await.unwrap();

    // Assert
    assert_eq!(queue.consumer_tag().await, Some(consumer_tag));
    exchange.publish("second", queue.name()).await.unwrap();
    assert_eq!(next(&mut receiver).await.body, "second");
}

#[tokio::test]
async fn cancelling_without_a_consumer_does_nothing() {
    // Arrange
    let (_broker, _manager, queue, _exchange) =
        queue_with(QueueOptions::named(unique("idle"))).await;

    // Act
    let cancelled = queue.cancel().await;

    // Assert
    assert!(cancelled.is_ok());
    assert_eq!(queue.consumer_tag().await, None);
}

#[tokio::test]
async fn waiting_messages_can_be_counted_and_purged() {
    // Arrange
    let (_broker, _manager, queue, exchange) =
        queue_with(QueueOptions::named(unique("purge"))).await;
    for n in 0..3i32 {
        exchange.publish(n, queue.name()).await.unwrap();
    }

    // Act
    let before = queue.status().await.unwrap();
    let purged = queue.purge().await.unwrap();
    let after = queue.status().await.unwrap();

    // Assert
    assert_eq!(before.message_count, 3);
    assert_eq!(before.consumer_count, 0);
    assert_eq!(purged, 3);
    assert_eq!(after.message_count, 0);
}

#[tokio::test]
async fn a_prefetch_above_one_handles_messages_concurrently() {
    // Arrange
    let (_broker, _manager, queue, exchange) =
        queue_with(QueueOptions::named(unique("concurrent")).prefetch(2)).await;
    let barrier = Arc::new(Barrier::new(2));
    let (sender, mut receiver) = recorder();
    queue
        .consume(move |incoming: Incoming| {
            let barrier = Arc::clone(&barrier);
            let sender = sender.clone();
            async move {
                // Only passes if both messages are being handled at once.
                barrier.wait().await;
                let _ = sender.send(incoming);
                Ok::<_, anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    // Act
    exchange.publish("left", queue.name()).await.unwrap();
    exchange.publish("right", queue.name()).await.unwrap();

    // Assert
    let mut received = bodies(take(&mut receiver, 2).await);
    received.sort();
    assert_eq!(received, vec!["left", "right"]);
}

#[tokio::test]
async fn the_oldest_messages_are_dropped_beyond_the_maximum_length() {
    // Arrange
    let name = unique("bounded");
    let (broker, _manager, queue, exchange) =
        queue_with(QueueOptions::named(&name).max_length(2)).await;

    // Act
    for n in 0..3i32 {
        exchange.publish(n, queue.name()).await.unwrap();
    }

    // Assert
    assert_eq!(broker.ready_messages(&name), Some(2));
    let (sender, mut receiver) = recorder();
    queue.consume(forward_to(sender)).await.unwrap();
    assert_eq!(bodies(take(&mut receiver, 2).await), vec!["1", "2"]);
}
