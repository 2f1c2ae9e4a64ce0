//! Single-assignment readiness signals, awaitable by any number of tasks.
use crate::Error;
use std::sync::Arc;
use tokio::sync::watch;

type Outcome = Option<Result<(), Arc<Error>>>;

pub(crate) struct Milestone {
    sender: watch::Sender<Outcome>,
}

impl Milestone {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    pub(crate) fn reached() -> Self {
        let (sender, _) = watch::channel(Some(Ok(())));
        Self { sender }
    }

    /// Record the outcome. Returns `false`, leaving the first outcome in place, if the milestone
    /// was already settled.
    pub(crate) fn settle(&self, outcome: Result<(), Error>) -> bool {
        let mut outcome = Some(outcome.map_err(Arc::new));
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = outcome.take();
            true
        })
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Wait for the outcome; failures are shared between all waiters.
    pub(crate) async fn wait(&self) -> Result<(), Error> {
        let mut receiver = self.sender.subscribe();
        loop {
            let outcome = receiver.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome.map_err(Error::NotReady);
            }
            // The sender lives in `self`, it cannot be dropped while we wait.
            if receiver.changed().await.is_err() {
                return Err(Error::Closed("readiness signal".into()));
            }
        }
    }
}
