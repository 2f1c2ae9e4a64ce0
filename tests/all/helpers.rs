use fake::faker::lorem::en::Word;
use fake::Fake;
use std::future::{ready, Future, Ready};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Instant};
use uuid::Uuid;
use warren::transport::memory::MemoryBroker;
use warren::{ConnectionManager, Incoming};

const PATIENCE: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

/// A fresh in-memory broker, and a manager connecting to it.
pub fn rabbit() -> (MemoryBroker, ConnectionManager) {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone());
    (broker, manager)
}

/// A name no other test uses.
pub fn unique(prefix: &str) -> String {
    let word: String = Word().fake();
    format!("{prefix}-{word}-{}", Uuid::new_v4())
}

pub fn recorder<T>() -> (UnboundedSender<T>, UnboundedReceiver<T>) {
    mpsc::unbounded_channel()
}

pub async fn next<T>(receiver: &mut UnboundedReceiver<T>) -> T {
    timeout(PATIENCE, receiver.recv())
        .await
        .expect("Nothing was received in time")
        .expect("Every sender was dropped")
}

pub async fn take<T>(receiver: &mut UnboundedReceiver<T>, n: usize) -> Vec<T> {
    let mut received = Vec::with_capacity(n);
    for _ in 0..n {
        received.push(next(receiver).await);
    }
    received
}

/// Fails if anything else shows up for a little while.
pub async fn assert_silent<T: std::fmt::Debug>(receiver: &mut UnboundedReceiver<T>) {
    if let Ok(Some(unexpected)) = timeout(QUIET, receiver.recv()).await {
        panic!("Received {unexpected:?} when nothing else was expected");
    }
}

pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + PATIENCE;
    while !condition().await {
        assert!(Instant::now() < deadline, "The condition was never met");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn active_count_reaches(manager: &ConnectionManager, expected: usize) {
    eventually(|| {
        let manager = manager.clone();
        async move { manager.active_count().await == expected }
    })
    .await;
}

/// A handler forwarding every message it gets to `sender`.
pub fn forward_to(
    sender: UnboundedSender<Incoming>,
) -> impl Fn(Incoming) -> Ready<Result<(), anyhow::Error>> + Send + Sync + 'static {
    move |incoming| {
        let _ = sender.send(incoming);
        ready(Ok(()))
    }
}

pub fn bodies(messages: Vec<Incoming>) -> Vec<String> {
    messages.into_iter().map(|incoming| incoming.body).collect()
}
