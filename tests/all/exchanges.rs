use crate::helpers::{
    active_count_reaches, assert_silent, bodies, eventually, forward_to, next, rabbit, recorder,
    take, unique,
};
use futures_util::future::join_all;
use std::time::Duration;
use warren::{
    Error, ExchangeOptions, ExchangeType, Payload, PublishMode, PublishOptions, QueueOptions,
};

#[tokio::test]
async fn publishes_issued_before_the_exchange_is_ready_keep_their_order() {
    // Arrange
    let (_broker, manager) = rabbit();
    let name = unique("ordered");
    let queue = manager.queue(QueueOptions::named(&name)).await.unwrap();
    let (sender, mut receiver) = recorder();
    queue.consume(forward_to(sender)).await.unwrap();

    // Act
    let exchange = manager
        .default_exchange(ExchangeOptions::default())
        .await
        .unwrap();
    let outcomes = join_all((0..10i32).map(|n| exchange.publish(n, name.as_str()))).await;

    // Assert
    assert!(outcomes.iter().all(Result::is_ok));
    let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
    assert_eq!(bodies(take(&mut receiver, 10).await), expected);
}

#[tokio::test]
async fn confirmed_publishes_report_unroutable_messages() {
    // Arrange
    let (_broker, manager) = rabbit();
    let exchange = manager
        .exchange(
            ExchangeOptions::default()
                .name(unique("confirmed"))
                .mode(PublishMode::Confirm),
        )
        .await
        .unwrap();
    let queue = exchange
        .queue(QueueOptions::exclusive().key("somewhere"))
        .await
        .unwrap();
    queue.bound().await.unwrap();

    // Act
    let lost = exchange
        .publish("lost", PublishOptions::key("nowhere").mandatory())
        .await;
    let delivered = exchange
        .publish("delivered", PublishOptions::key("somewhere").mandatory())
        .await;

    // Assert
    match lost {
        Err(Error::Unroutable(returned)) => {
            assert_eq!(returned.reply_code, 312);
            assert_eq!(returned.routing_key, "nowhere");
        }
        other => panic!("Expected the message to be returned, got {other:?}"),
    }
    assert!(matches!(delivered, Ok(None)), "{delivered:?}");
}

#[tokio::test]
async fn a_rejected_exchange_fails_its_publishes_and_is_released() {
    // Arrange
    let (_broker, manager) = rabbit();
    let name = unique("logs");
    let fanout = manager
        .exchange(ExchangeOptions::default().name(&name).kind(ExchangeType::Fanout))
        .await
        .unwrap();
    fanout.ready().await.unwrap();

    // Act
    let topic = manager
        .exchange(ExchangeOptions::default().name(&name).kind(ExchangeType::Topic))
        .await
        .unwrap();
    let ready = topic.ready().await.unwrap_err();
    let published = topic.publish("anyone?", "key").await.unwrap_err();

    // Assert
    assert!(matches!(ready.root(), Error::Assertion { .. }), "{ready:?}");
    assert!(matches!(published.root(), Error::Assertion { .. }), "{published:?}");
    active_count_reaches(&manager, 1).await;
    assert!(topic.is_closed());
    assert!(!fanout.is_closed());
}

#[tokio::test]
async fn fanout_exchanges_deliver_to_every_bound_queue() {
    // Arrange
    let (_broker, manager) = rabbit();
    let exchange = manager
        .fanout(ExchangeOptions::default().name(unique("broadcast")))
        .await
        .unwrap();
    let (first_sender, mut first) = recorder();
    let (second_sender, mut second) = recorder();
    let first_queue = exchange.queue(QueueOptions::exclusive()).await.unwrap();
    let second_queue = exchange.queue(QueueOptions::exclusive()).await.unwrap();
    first_queue.consume(forward_to(first_sender)).await.unwrap();
    second_queue.consume(forward_to(second_sender)).await.unwrap();

    // Act
    exchange.publish("news", "ignored").await.unwrap();

    // Assert
    assert_eq!(next(&mut first).await.body, "news");
    assert_eq!(next(&mut second).await.body, "news");
}

#[tokio::test]
async fn queues_consume_only_once_every_key_is_bound() {
    // Arrange
    let (_broker, manager) = rabbit();
    let exchange = manager
        .direct(ExchangeOptions::default().name(unique("tasks")))
        .await
        .unwrap();
    let queue = exchange
        .queue(QueueOptions::exclusive().keys(["a", "b", "c"]))
        .await
        .unwrap();
    let (sender, mut receiver) = recorder();

    // Act
    queue.consume(forward_to(sender)).await.unwrap();
    for key in ["c", "b", "a", "d"] {
        exchange.publish(key, key).await.unwrap();
    }

    // Assert
    assert_eq!(bodies(take(&mut receiver, 3).await), vec!["c", "b", "a"]);
    assert_silent(&mut receiver).await;
}

#[tokio::test]
async fn a_failed_binding_closes_the_queue() {
    // Arrange
    let (broker, manager) = rabbit();
    let name = unique("doomed");
    let exchange = manager
        .direct(ExchangeOptions::default().name(&name))
        .await
        .unwrap();
    exchange.ready().await.unwrap();
    assert!(broker.delete_exchange(&name));

    // Act
    let queue = exchange
        .queue(QueueOptions::exclusive().key("key"))
        .await
        .unwrap();
    let bound = queue.bound().await.unwrap_err();
    let consumed = queue
        .consume(|_incoming| async { Ok::<_, anyhow::Error>(()) })
        .await;

    // Assert
    assert!(matches!(bound.root(), Error::Assertion { .. }), "{bound:?}");
    assert!(consumed.is_err());
    eventually(|| {
        let queue = queue.clone();
        async move { queue.is_closed() }
    })
    .await;
    active_count_reaches(&manager, 1).await;
}

#[tokio::test]
async fn an_exchange_whose_channel_the_broker_closes_is_released() {
    // Arrange
    let (broker, manager) = rabbit();
    let name = unique("vanishing");
    let exchange = manager
        .direct(ExchangeOptions::default().name(&name))
        .await
        .unwrap();
    exchange.ready().await.unwrap();
    assert!(broker.delete_exchange(&name));

    // Act
    let published = exchange.publish("lost", "key").await;

    // Assert
    assert!(published.is_err());
    eventually(|| {
        let exchange = exchange.clone();
        async move { exchange.is_closed() }
    })
    .await;
    active_count_reaches(&manager, 0).await;
    assert_eq!(broker.open_connections(), 0);
    let again = exchange.publish("again", "key").await;
    assert!(matches!(again, Err(Error::Closed(_))), "{again:?}");
}

#[tokio::test]
async fn a_queue_whose_channel_the_broker_closes_is_released() {
    // Arrange
    let (broker, manager) = rabbit();
    let queue = manager.queue(QueueOptions::exclusive()).await.unwrap();

    // Act
    let refused = queue.bind("no-such-exchange", "key").await;

    // Assert
    assert!(matches!(refused, Err(Error::Assertion { .. })), "{refused:?}");
    eventually(|| {
        let queue = queue.clone();
        async move { queue.is_closed() }
    })
    .await;
    active_count_reaches(&manager, 0).await;
    assert_eq!(broker.open_connections(), 0);
    let consumed = queue
        .consume(|_incoming| async { Ok::<_, anyhow::Error>(()) })
        .await;
    assert!(matches!(consumed, Err(Error::Closed(_))), "{consumed:?}");
}

#[tokio::test]
async fn queues_wait_for_the_last_binding_to_be_acknowledged() {
    // Arrange
    let (broker, manager) = rabbit();
    broker.hold_bindings("c");
    let exchange = manager
        .direct(ExchangeOptions::default().name(unique("slow")))
        .await
        .unwrap();
    let queue = exchange
        .queue(QueueOptions::exclusive().keys(["a", "b", "c"]))
        .await
        .unwrap();
    let (sender, mut receiver) = recorder();
    let consuming = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.consume(forward_to(sender)).await })
    };

    // Act
    let early = tokio::time::timeout(Duration::from_millis(100), queue.bound()).await;
    exchange.publish("held", "c").await.unwrap();

    // Assert
    assert!(early.is_err(), "{early:?}");
    assert!(!consuming.is_finished());
    assert_eq!(queue.consumer_tag().await, None);
    assert_silent(&mut receiver).await;

    broker.release_held();
    queue.bound().await.unwrap();
    consuming.await.unwrap().unwrap();
    assert_eq!(next(&mut receiver).await.body, "held");
}

#[tokio::test]
async fn builtin_names_are_declared_when_the_type_differs() {
    // Arrange
    let (_broker, manager) = rabbit();
    let options = ExchangeOptions::default()
        .name("amq.direct")
        .kind(ExchangeType::Topic);

    // Act
    let exchange = manager.exchange(options).await.unwrap();
    let ready = exchange.ready().await.unwrap_err();

    // Assert
    assert!(matches!(ready.root(), Error::Assertion { .. }), "{ready:?}");
}

#[tokio::test]
async fn publish_options_end_up_in_the_message_properties() {
    // Arrange
    let (_broker, manager) = rabbit();
    let name = unique("properties");
    let queue = manager.queue(QueueOptions::named(&name)).await.unwrap();
    let exchange = manager
        .default_exchange(ExchangeOptions::default())
        .await
        .unwrap();
    let (sender, mut receiver) = recorder();
    queue.consume(forward_to(sender)).await.unwrap();
    let payload = Payload::json(&serde_json::json!({ "id": 7 })).unwrap();

    // Act
    exchange
        .publish(
            payload,
            PublishOptions::key(&name)
                .persistent()
                .expiration(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    // Assert
    let incoming = next(&mut receiver).await;
    let properties = &incoming.message.properties;
    assert_eq!(incoming.json::<serde_json::Value>().unwrap()["id"], 7);
    assert_eq!(
        properties.content_type().as_ref().map(|c| c.as_str()),
        Some("application/json")
    );
    assert_eq!(*properties.delivery_mode(), Some(2));
    assert_eq!(
        properties.expiration().as_ref().map(|e| e.as_str()),
        Some("5000")
    );
    assert!(properties.message_id().is_some());
    assert!(properties.timestamp().is_some());
}

#[tokio::test]
async fn drained_resolves_once_publishes_are_written() {
    // Arrange
    let (_broker, manager) = rabbit();
    let exchange = manager
        .topic(ExchangeOptions::default())
        .await
        .unwrap();

    // Act
    join_all((0..5i32).map(|n| exchange.publish(n, "numbers"))).await;

    // Assert
    tokio::time::timeout(Duration::from_secs(1), exchange.drained())
        .await
        .unwrap();
}

#[tokio::test]
async fn queues_can_be_bound_after_the_fact() {
    // Arrange
    let (_broker, manager) = rabbit();
    let exchange = manager
        .direct(ExchangeOptions::default().name(unique("late")))
        .await
        .unwrap();
    exchange.ready().await.unwrap();
    let queue = manager.queue(QueueOptions::exclusive()).await.unwrap();
    let (sender, mut receiver) = recorder();
    queue.consume(forward_to(sender)).await.unwrap();

    // Act
    queue.bind(exchange.name(), "late").await.unwrap();
    queue.bind("", "ignored").await.unwrap();

    // Assert
    exchange.publish("better late", "late").await.unwrap();
    assert_eq!(next(&mut receiver).await.body, "better late");
}
