//! An in-process broker, good enough to exercise exchanges and queues without a RabbitMq
//! instance.
//!
//! [`MemoryBroker`] follows AMQP 0-9-1 semantics where `warren` can observe them: default,
//! direct, fanout and topic routing, server-named and exclusive queues, prefetch windows,
//! requeueing with the `redelivered` flag, mandatory returns and publisher confirms.
//! Broker-side failures close the channel they happened on, as they would on RabbitMq.
//!
//! Message TTLs are recorded but not enforced.
use super::{
    Broker, BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, DeclaredQueue,
    Delivery, DeliveryStream, DeliveryTag, Error, ErrorCallback, ExchangeDeclaration,
    ExchangeType, OutgoingMessage, PendingConfirm, QueueDeclaration, ReturnedMessage,
};
use lapin::BasicProperties;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

mod routing;

const NO_ROUTE: u16 = 312;

type ConnectionId = u64;
type ChannelId = u64;

/// A broker living in the current process.
///
/// Clones share the same state: keep one around to inspect the broker, or to break it, while
/// a [`ConnectionManager`](crate::ConnectionManager) is using another.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker with nothing but the built-in exchanges declared.
    pub fn new() -> Self {
        let mut exchanges = HashMap::new();
        for kind in [ExchangeType::Direct, ExchangeType::Fanout, ExchangeType::Topic] {
            let name = kind.builtin_name().to_owned();
            exchanges.insert(
                name.clone(),
                ExchangeDeclaration {
                    name,
                    kind,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                },
            );
        }
        let state = State {
            next_id: 0,
            reachable: true,
            connections_opened: 0,
            exchanges,
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            held: HashMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// When `false`, connection attempts are refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// How many connections have been opened since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// How many connections are currently open.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Number of messages waiting in the queue to be delivered, `None` if there is no such
    /// queue.
    pub fn ready_messages(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|queue| queue.messages.len())
    }

    /// Delete an exchange, and every binding to it, as another client could.
    pub fn delete_exchange(&self, name: &str) -> bool {
        let mut state = self.lock();
        state.bindings.retain(|binding| binding.exchange != name);
        state.exchanges.remove(name).is_some()
    }

    /// Keep the broker from answering bindings with `routing_key` until
    /// [`MemoryBroker::release_held`] is called.
    ///
    /// The binding takes effect right away: messages published with that key are routed to the
    /// queue, only the acknowledgement is late.
    pub fn hold_bindings(&self, routing_key: &str) {
        self.hold(Hold::Binding(routing_key.to_owned()));
    }

    /// Keep the broker from answering declarations of exchange `name` until
    /// [`MemoryBroker::release_held`] is called.
    pub fn hold_exchange_declarations(&self, name: &str) {
        self.hold(Hold::ExchangeDeclaration(name.to_owned()));
    }

    /// Answer every operation held back so far.
    pub fn release_held(&self) {
        for (_, gate) in self.lock().held.drain() {
            gate.close();
        }
    }

    /// Drop every open connection, as a broker restart or a network partition would.
    ///
    /// Error callbacks registered on the connections are invoked.
    pub fn disconnect_all(&self) {
        let callbacks: Vec<ErrorCallback> = {
            let mut state = self.lock();
            let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
            ids.into_iter()
                .flat_map(|id| state.close_connection(id))
                .collect()
        };
        for callback in callbacks {
            callback(Error::msg(
                "CONNECTION_FORCED - broker forced connection closure",
            ));
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hold(&self, hold: Hold) {
        self.lock()
            .held
            .entry(hold)
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Wait for [`MemoryBroker::release_held`] if the operation is held back.
    async fn answer(&self, hold: Hold) {
        let gate = self.lock().held.get(&hold).cloned();
        if let Some(gate) = gate {
            // Released gates are closed, which fails the acquisition.
            let _ = gate.acquire().await;
        }
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, Error> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(Error::msg("Connection refused (os error 111)"));
        }
        let id = state.next_id();
        state.connections_opened += 1;
        state.connections.insert(
            id,
            ConnectionState {
                callbacks: Vec::new(),
            },
        );
        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn BrokerChannel>, Error> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(connection_closed());
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                confirm,
                prefetch: 0,
                last_delivery_tag: 0,
                unacked: BTreeMap::new(),
                callbacks: Vec::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), Error> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(connection_closed());
        }
        // Callbacks only fire on failures.
        drop(state.close_connection(self.id));
        Ok(())
    }

    fn on_error(&self, callback: ErrorCallback) {
        if let Some(connection) = self.broker.lock().connections.get_mut(&self.id) {
            connection.callbacks.push(callback);
        }
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.id)
    }
}

struct MemoryChannel {
    id: ChannelId,
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), Error> {
        self.broker
            .answer(Hold::ExchangeDeclaration(declaration.name.clone()))
            .await;
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        if declaration.name.is_empty() {
            return Err(state.fail(
                self.id,
                "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
            ));
        }
        let conflicting = state
            .exchanges
            .get(&declaration.name)
            .map(|existing| {
                existing.kind != declaration.kind || existing.durable != declaration.durable
            });
        match conflicting {
            Some(true) => Err(state.fail(
                self.id,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' or 'durable' for exchange '{}'",
                    declaration.name
                ),
            )),
            Some(false) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(declaration.name.clone(), declaration.clone());
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, declaration: &QueueDeclaration) -> Result<DeclaredQueue, Error> {
        let mut state = self.broker.lock();
        let connection = state.channel(self.id)?.connection;
        let name = if declaration.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            declaration.name.clone()
        };

        if let Some(queue) = state.queues.get(&name) {
            let locked = queue.owner.map_or(false, |owner| owner != connection);
            let conflicting = !declaration.passive
                && queue.declaration.durable != declaration.durable;
            let declared = queue.declared();
            if locked {
                return Err(state.fail(
                    self.id,
                    format!("RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"),
                ));
            }
            if conflicting {
                return Err(state.fail(
                    self.id,
                    format!("PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}'"),
                ));
            }
            return Ok(declared);
        }
        if declaration.passive {
            return Err(state.fail(self.id, format!("NOT_FOUND - no queue '{name}'")));
        }

        let queue = QueueState {
            declaration: QueueDeclaration {
                name: name.clone(),
                ..declaration.clone()
            },
            owner: declaration.exclusive.then_some(connection),
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            had_consumers: false,
        };
        let declared = queue.declared();
        state.queues.insert(name, queue);
        Ok(declared)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        {
            let mut state = self.broker.lock();
            state.channel(self.id)?;
            if !state.queues.contains_key(queue) {
                return Err(state.fail(self.id, format!("NOT_FOUND - no queue '{queue}'")));
            }
            if exchange.is_empty() {
                return Err(state.fail(
                    self.id,
                    "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
                ));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(state.fail(self.id, format!("NOT_FOUND - no exchange '{exchange}'")));
            }
            let binding = Binding {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }
        self.broker
            .answer(Hold::Binding(routing_key.to_owned()))
            .await;
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<PendingConfirm, Error> {
        let mut state = self.broker.lock();
        let confirm = state.channel(self.id)?.confirm;
        let targets = match state.route(&message.exchange, &message.routing_key) {
            Ok(targets) => targets,
            Err(reason) => return Err(state.fail(self.id, reason)),
        };

        let confirmation = if !confirm {
            Confirmation::NotRequested
        } else if targets.is_empty() && message.mandatory {
            Confirmation::Returned(ReturnedMessage {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".into(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
            })
        } else {
            Confirmation::Ack
        };

        let stored = StoredMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            properties: message.properties,
            data: message.payload,
            redelivered: false,
        };
        for queue in targets {
            state.enqueue(&queue, stored.clone());
        }
        Ok(PendingConfirm::ready(confirmation))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, Error> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(queue) => {
                queue.consumers.push(ConsumerState {
                    tag: consumer_tag.to_owned(),
                    channel: self.id,
                    no_ack: options.no_ack,
                    sender,
                });
                queue.had_consumers = true;
            }
            None => return Err(state.fail(self.id, format!("NOT_FOUND - no queue '{queue}'"))),
        }
        state.dispatch(queue);

        let deliveries = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        let consumed = state.queues.iter_mut().find_map(|(name, queue)| {
            let position = queue
                .consumers
                .iter()
                .position(|c| c.channel == self.id && c.tag == consumer_tag)?;
            queue.consumers.remove(position);
            queue.next_consumer = 0;
            Some(name.clone())
        });
        if let Some(queue) = consumed {
            state.delete_if_unused(&queue);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), Error> {
        let mut state = self.broker.lock();
        if state.channel_mut(self.id)?.unacked.remove(&delivery_tag).is_none() {
            return Err(state.fail(
                self.id,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            ));
        }
        state.dispatch_channel(self.id);
        Ok(())
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), Error> {
        let mut state = self.broker.lock();
        let Some(unacked) = state.channel_mut(self.id)?.unacked.remove(&delivery_tag) else {
            return Err(state.fail(
                self.id,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            ));
        };
        if requeue {
            state.requeue(unacked);
        }
        state.dispatch_channel(self.id);
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), Error> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?.prefetch = count;
        state.dispatch_channel(self.id);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, Error> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        match state.queues.get_mut(queue) {
            Some(queue) => {
                let purged = queue.messages.len();
                queue.messages.clear();
                Ok(u32::try_from(purged).unwrap_or(u32::MAX))
            }
            None => Err(state.fail(self.id, format!("NOT_FOUND - no queue '{queue}'"))),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        // Callbacks only fire when the broker closes the channel.
        drop(state.close_channel(self.id));
        Ok(())
    }

    fn on_close(&self, callback: ErrorCallback) {
        if let Some(channel) = self.broker.lock().channels.get_mut(&self.id) {
            channel.callbacks.push(callback);
        }
    }
}

struct State {
    next_id: u64,
    reachable: bool,
    connections_opened: usize,
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<ConnectionId, ConnectionState>,
    channels: HashMap<ChannelId, ChannelState>,
    held: HashMap<Hold, Arc<Semaphore>>,
}

/// An operation the broker can be told not to answer yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Hold {
    Binding(String),
    ExchangeDeclaration(String),
}

struct ConnectionState {
    callbacks: Vec<ErrorCallback>,
}

struct ChannelState {
    connection: ConnectionId,
    confirm: bool,
    prefetch: u16,
    last_delivery_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Unacked>,
    callbacks: Vec<ErrorCallback>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct QueueState {
    declaration: QueueDeclaration,
    owner: Option<ConnectionId>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    next_consumer: usize,
    had_consumers: bool,
}

impl QueueState {
    fn declared(&self) -> DeclaredQueue {
        DeclaredQueue {
            name: self.declaration.name.clone(),
            message_count: u32::try_from(self.messages.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumers.len()).unwrap_or(u32::MAX),
        }
    }
}

struct ConsumerState {
    tag: String,
    channel: ChannelId,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, Error>>,
}

#[derive(PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

impl StoredMessage {
    fn delivery(&self, delivery_tag: DeliveryTag) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            data: self.data.clone(),
        }
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&self, id: ChannelId) -> Result<&ChannelState, Error> {
        self.channels.get(&id).ok_or_else(channel_closed)
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut ChannelState, Error> {
        self.channels.get_mut(&id).ok_or_else(channel_closed)
    }

    /// A channel exception: the channel is closed and the reason handed back to the caller.
    fn fail(&mut self, channel: ChannelId, reason: String) -> Error {
        let callbacks = self.close_channel(channel);
        notify_closed(callbacks, &reason);
        Error::msg(reason)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, String> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }
        let kind = match self.exchanges.get(exchange) {
            Some(declaration) => declaration.kind,
            None => return Err(format!("NOT_FOUND - no exchange '{exchange}'")),
        };
        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            if routing::matches(kind, &binding.routing_key, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.messages.push_back(message);
            if let Some(max_length) = state.declaration.max_length {
                while state.messages.len() > max_length as usize {
                    state.messages.pop_front();
                }
            }
        }
        self.dispatch(queue);
    }

    /// Put a message back at the head of its queue.
    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.messages.push_front(message);
        }
    }

    /// Push ready messages to consumers, round-robin, within their channel's prefetch window.
    fn dispatch(&mut self, queue_name: &str) {
        let State {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let available = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&index| {
                    let consumer = &queue.consumers[index];
                    consumer.no_ack
                        || channels
                            .get(&consumer.channel)
                            .map_or(false, ChannelState::has_capacity)
                });
            let Some(index) = available else {
                return;
            };
            let Some(channel) = channels.get_mut(&queue.consumers[index].channel) else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            queue.next_consumer = (index + 1) % count;
            channel.last_delivery_tag += 1;
            let delivery_tag = channel.last_delivery_tag;
            let delivery = message.delivery(delivery_tag);
            let no_ack = queue.consumers[index].no_ack;
            if !no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_owned(),
                        message,
                    },
                );
            }
            if queue.consumers[index].sender.send(Ok(delivery)).is_err() {
                // The consumer went away without cancelling.
                queue.consumers.remove(index);
                queue.next_consumer = 0;
                if let Some(unacked) = channel.unacked.remove(&delivery_tag) {
                    queue.messages.push_front(unacked.message);
                }
            }
        }
    }

    /// Dispatch every queue consumed from on the channel, e.g. after its window opened up.
    fn dispatch_channel(&mut self, channel: ChannelId) {
        let queues: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.consumers.iter().any(|c| c.channel == channel))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in queues {
            self.dispatch(&queue);
        }
    }

    /// Cancel the channel's consumers and requeue whatever it left unacknowledged, returning
    /// the callbacks registered to hear about the channel closing.
    fn close_channel(&mut self, id: ChannelId) -> Vec<ErrorCallback> {
        let Some(channel) = self.channels.remove(&id) else {
            return Vec::new();
        };
        let mut touched: Vec<String> = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.channel != id);
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                touched.push(name.clone());
            }
        }
        // Walk backwards so requeued messages keep their relative order.
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if !touched.contains(&unacked.queue) {
                touched.push(unacked.queue.clone());
            }
            self.requeue(unacked);
        }
        for queue in touched {
            if !self.delete_if_unused(&queue) {
                self.dispatch(&queue);
            }
        }
        channel.callbacks
    }

    /// Close a connection, returning the callbacks registered to hear about its failures.
    fn close_connection(&mut self, id: ConnectionId) -> Vec<ErrorCallback> {
        let Some(connection) = self.connections.remove(&id) else {
            return Vec::new();
        };
        let channels: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        // Channel callbacks stay silent: the connection callbacks report the failure.
        for channel in channels {
            drop(self.close_channel(channel));
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
        connection.callbacks
    }

    /// Auto-delete queues go away with their last consumer.
    fn delete_if_unused(&mut self, name: &str) -> bool {
        let unused = self.queues.get(name).map_or(false, |queue| {
            queue.declaration.auto_delete && queue.had_consumers && queue.consumers.is_empty()
        });
        if unused {
            self.delete_queue(name);
        }
        unused
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|binding| binding.queue != name);
    }
}

/// Run the callbacks of a channel the broker closed, once the broker's lock is released.
fn notify_closed(callbacks: Vec<ErrorCallback>, reason: &str) {
    if callbacks.is_empty() {
        return;
    }
    let reason = reason.to_owned();
    let notify = move || {
        for callback in &callbacks {
            callback(Error::msg(reason.clone()));
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move { notify() });
        }
        Err(_) => notify(),
    }
}

fn channel_closed() -> Error {
    Error::msg("invalid channel state: the channel is closed")
}

fn connection_closed() -> Error {
    Error::msg("invalid connection state: the connection is closed")
}
