//! In-process broker
//!
//! Implements the AMQP-style semantics the workers rely on (routing, pull
//! consumption, acknowledgement, redelivery of unacknowledged messages) for
//! single-process runs and tests. Connection failures can be injected with
//! [`InMemoryBroker::refuse_next_connections`] and
//! [`InMemoryBroker::drop_connections`].

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{BrokerError, Channel, Connector, Delivery, ExchangeKind};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    open_channels: HashSet<u64>,
    next_tag: u64,
    next_channel: u64,
    /// Bumped by `drop_connections`; channels from an older generation are dead
    generation: u64,
    refuse_connections: usize,
}

impl BrokerState {
    /// Put a channel's unacknowledged messages back at the head of their
    /// queues, oldest first
    fn requeue_where(&mut self, predicate: impl Fn(&Unacked) -> bool) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| predicate(u))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let count = tags.len();
        for tag in tags.into_iter().rev() {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.push_front(unacked.message);
                }
            }
        }
        count
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut VecDeque<StoredMessage>, BrokerError> {
        self.queues.get_mut(name).ok_or_else(|| BrokerError::NotFound {
            kind: "queue",
            name: name.to_string(),
        })
    }
}

/// Shared in-process broker; clones refer to the same broker
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    name: String,
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("memory://local")
    }
}

impl InMemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Refuse the next `n` connection attempts
    pub async fn refuse_next_connections(&self, n: usize) {
        self.state.lock().await.refuse_connections = n;
    }

    /// Sever every open connection.
    ///
    /// Existing channels fail with [`BrokerError::ConnectionLost`] from now
    /// on and all unacknowledged deliveries are requeued.
    pub async fn drop_connections(&self) -> usize {
        let mut state = self.state.lock().await;
        state.generation += 1;
        state.open_channels.clear();
        let requeued = state.requeue_where(|_| true);
        debug!(requeued, "Dropped all broker connections");
        requeued
    }

    /// Number of deliveries handed out and not yet acknowledged
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Number of bindings, used to check that declarations are idempotent
    pub async fn binding_count(&self) -> usize {
        self.state.lock().await.bindings.len()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.state.lock().await;

        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(BrokerError::ConnectionRefused(self.name.clone()));
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.open_channels.insert(id);

        trace!(channel = id, "Opened in-memory channel");

        Ok(MemoryChannel {
            id,
            generation: state.generation,
            state: self.state.clone(),
        })
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Channel on an [`InMemoryBroker`]
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    generation: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_open(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if state.generation != self.generation || !state.open_channels.contains(&self.id) {
            return Err(BrokerError::ConnectionLost);
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' already declared as {}, not {}",
                name, existing, kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }
        state.queue_mut(queue)?;

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<usize, BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;

        // A queue matched by several bindings still receives one copy
        let targets: BTreeSet<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && kind.matches(&b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            redelivered: false,
        };
        for queue in &targets {
            state.queue_mut(queue)?.push_back(message.clone());
        }

        Ok(targets.len())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        let Some(message) = state.queue_mut(queue)?.pop_front() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;

        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(
            delivery_tag,
            Unacked {
                channel_id: self.id,
                queue: queue.to_string(),
                message,
            },
        );

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel_id == self.id => {
                state.unacked.remove(&delivery_tag);
                Ok(())
            }
            _ => Err(BrokerError::UnknownDeliveryTag(delivery_tag)),
        }
    }

    async fn message_count(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        Ok(state.queue_mut(queue)?.len())
    }

    async fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        let queue = state.queue_mut(queue)?;
        let purged = queue.len();
        queue.clear();
        Ok(purged)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;

        if !state.open_channels.remove(&self.id) {
            // Already closed, or the connection dropped and requeued for us
            return Ok(());
        }

        let id = self.id;
        let requeued = state.requeue_where(|u| u.channel_id == id);
        trace!(channel = id, requeued, "Closed in-memory channel");
        Ok(())
    }
}
