use super::manager::ManagerInner;
use crate::transport::{self, BrokerChannel};
use crate::Error;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Exchange,
    Queue,
}

/// Identifies an exchange or a queue among those sharing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    kind: EntityKind,
    sequence: u64,
}

impl EntityId {
    pub(crate) fn new(kind: EntityKind, sequence: u64) -> Self {
        Self { kind, sequence }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntityKind::Exchange => write!(f, "exchange #{}", self.sequence),
            EntityKind::Queue => write!(f, "queue #{}", self.sequence),
        }
    }
}

/// An entity's handle on the manager that owns its connection.
pub(crate) struct EntityLink {
    id: EntityId,
    manager: Weak<ManagerInner>,
    closed: AtomicBool,
}

impl EntityLink {
    pub(crate) fn new(id: EntityId, manager: Weak<ManagerInner>) -> Self {
        Self {
            id,
            manager,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> EntityId {
        self.id
    }

    pub(crate) fn manager(&self) -> Option<Arc<ManagerInner>> {
        self.manager.upgrade()
    }

    /// Flag the entity as closed. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Leave the active set, letting the manager close the connection if we were the last one.
    pub(crate) async fn release(&self) -> Result<(), Error> {
        match self.manager() {
            Some(manager) => manager.deregister(self.id).await,
            None => Ok(()),
        }
    }
}

/// Run `closed` when the broker closes `channel` under the feet of `entity`.
///
/// Nothing happens if the entity was dropped in the meantime.
pub(crate) fn when_channel_closed<T, F, Fut>(
    channel: &dyn BrokerChannel,
    entity: &Arc<T>,
    closed: F,
) where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, transport::Error) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Handle::current();
    let entity = Arc::downgrade(entity);
    channel.on_close(Box::new(move |error| {
        if let Some(entity) = entity.upgrade() {
            runtime.spawn(closed(entity, error));
        }
    }));
}

/// The exchanges and queues currently using the shared connection.
#[derive(Default)]
pub(crate) struct Registry {
    active: HashMap<EntityId, Arc<EntityLink>>,
}

impl Registry {
    pub(crate) fn register(&mut self, link: Arc<EntityLink>) {
        self.active.insert(link.id(), link);
    }

    pub(crate) fn deregister(&mut self, id: EntityId) -> Result<(), Error> {
        match self.active.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::DoubleDeregistration(id)),
        }
    }

    /// Empty the registry, flagging every entity as closed.
    pub(crate) fn close_all(&mut self) -> usize {
        let count = self.active.len();
        for (_, link) in self.active.drain() {
            link.mark_closed();
        }
        count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}
