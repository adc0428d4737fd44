//! Shared state of the in-memory brokers.
//!
//! Both simulated brokers reduce to the same model: named exchanges
//! (topics), named queues (subscriptions), and bindings (rules) that route
//! a message from an exchange to a queue when its key matches. Deliveries
//! stay unacknowledged until settled; unsettled deliveries of a closed
//! channel or dropped connection go back to the head of their queue
//! flagged as redelivered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::broker::{Delivery, Message};
use crate::connection::{ConnectionEvent, ConnectionListener, ConnectionSettings};
use crate::error::BrokerError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Filter {
    All,
    Key(String),
}

impl Filter {
    fn matches(&self, key: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Key(k) => k == key,
        }
    }
}

#[derive(Clone, Debug)]
struct Binding {
    exchange: String,
    queue: String,
    name: String,
    filter: Filter,
}

struct Queued {
    message: Message,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    message: Message,
    channel: u64,
    connection: u64,
}

/// One simulated client connection.
pub(crate) struct ConnectionCore {
    id: u64,
    open: AtomicBool,
    listeners: Mutex<Vec<ConnectionListener>>,
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl ConnectionCore {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self, listener: ConnectionListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed(format!(
                "connection {} is closed",
                self.id
            )))
        }
    }

    fn fire(&self, event: &ConnectionEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    refuse_connects: u32,
    fail_publishes: u32,
    fail_acks: u32,
}

#[derive(Default)]
struct CoreState {
    endpoint: Option<String>,
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<Queued>>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    dead_letters: Vec<(String, Message)>,
    connections: Vec<Arc<ConnectionCore>>,
    faults: Faults,
    next_id: u64,
    connect_attempts: u64,
    published: u64,
}

impl CoreState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn requeue(&mut self, mut tags: Vec<u64>) {
        // Highest tag first so the oldest delivery ends up at the head.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.push_front(Queued {
                        message: unacked.message,
                        redelivered: true,
                    });
                }
            }
        }
    }
}

pub(crate) struct Core {
    state: Mutex<CoreState>,
    arrivals: Condvar,
}

impl Core {
    pub(crate) fn new(endpoint: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CoreState {
                endpoint,
                ..CoreState::default()
            }),
            arrivals: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<ConnectionCore>, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if let Some(endpoint) = &state.endpoint {
            if !settings.connection_string.is_empty() && settings.connection_string != *endpoint {
                return Err(BrokerError::InvalidEndpoint(settings.connection_string.clone()));
            }
        }
        if state.faults.unreachable {
            return Err(BrokerError::Unreachable("broker is down".into()));
        }
        if state.faults.refuse_connects > 0 {
            state.faults.refuse_connects -= 1;
            return Err(BrokerError::Unreachable("connection refused".into()));
        }

        let connection = Arc::new(ConnectionCore {
            id: state.next_id(),
            open: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
        });
        state.connections.push(Arc::clone(&connection));
        Ok(connection)
    }

    /// Client-initiated close.
    pub(crate) fn close_connection(&self, connection: &ConnectionCore) {
        if !connection.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();
        let tags = state
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection.id)
            .map(|(tag, _)| *tag)
            .collect();
        state.requeue(tags);
        state.connections.retain(|c| c.id != connection.id);
        drop(state);
        self.arrivals.notify_all();
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.lock().next_id()
    }

    pub(crate) fn declare_exchange(&self, exchange: &str) {
        self.lock().exchanges.insert(exchange.to_string());
    }

    pub(crate) fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    pub(crate) fn declare_queue(&self, queue: &str) {
        self.lock().queues.entry(queue.to_string()).or_default();
    }

    pub(crate) fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Delete a queue with its bindings and pending messages.
    pub(crate) fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.lock();
        state.bindings.retain(|b| b.queue != queue);
        state.unacked.retain(|_, u| u.queue != queue);
        state.queues.remove(queue).is_some()
    }

    pub(crate) fn bind(
        &self,
        exchange: &str,
        queue: &str,
        name: &str,
        filter: Filter,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        state
            .bindings
            .retain(|b| !(b.exchange == exchange && b.queue == queue && b.name == name));
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            name: name.to_string(),
            filter,
        });
        Ok(())
    }

    pub(crate) fn unbind(&self, exchange: &str, queue: &str, name: &str) -> bool {
        let mut state = self.lock();
        let before = state.bindings.len();
        state
            .bindings
            .retain(|b| !(b.exchange == exchange && b.queue == queue && b.name == name));
        state.bindings.len() != before
    }

    /// Binding names on `queue`, in creation order.
    pub(crate) fn binding_names(&self, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.name.clone())
            .collect()
    }

    /// Route `message` to every queue bound to `exchange` with a matching
    /// filter. Returns the number of queues it reached.
    pub(crate) fn publish(
        &self,
        exchange: &str,
        key: &str,
        message: &Message,
    ) -> Result<usize, BrokerError> {
        let mut state = self.lock();
        if state.faults.fail_publishes > 0 {
            state.faults.fail_publishes -= 1;
            return Err(BrokerError::ConnectionClosed("publish interrupted".into()));
        }
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.filter.matches(key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(queue) = state.queues.get_mut(queue) {
                queue.push_back(Queued {
                    message: message.clone(),
                    redelivered: false,
                });
            }
        }
        state.published += 1;
        drop(state);

        self.arrivals.notify_all();
        Ok(targets.len())
    }

    /// Wait up to `timeout` for a message on any of `queues`.
    pub(crate) fn poll(
        &self,
        connection: &ConnectionCore,
        channel: u64,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            connection.ensure_open()?;

            let ready = queues
                .iter()
                .find(|q| state.queues.get(*q).is_some_and(|q| !q.is_empty()))
                .cloned();
            if let Some(queue) = ready {
                let tag = state.next_id();
                let Some(item) = state.queues.get_mut(&queue).and_then(|q| q.pop_front()) else {
                    continue;
                };
                state.unacked.insert(
                    tag,
                    Unacked {
                        queue,
                        message: item.message.clone(),
                        channel,
                        connection: connection.id,
                    },
                );
                return Ok(Some(Delivery {
                    message: item.message,
                    tag,
                    redelivered: item.redelivered,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .arrivals
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn ack(&self, channel: u64, tag: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.unacked.get(&tag).is_some_and(|u| u.channel == channel) {
            return Err(BrokerError::Rejected(format!("unknown delivery tag {}", tag)));
        }
        if state.faults.fail_acks > 0 {
            state.faults.fail_acks -= 1;
            return Err(BrokerError::ConnectionClosed("ack lost".into()));
        }
        state.unacked.remove(&tag);
        Ok(())
    }

    pub(crate) fn nack(&self, channel: u64, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.unacked.get(&tag).is_some_and(|u| u.channel == channel) {
            return Err(BrokerError::Rejected(format!("unknown delivery tag {}", tag)));
        }
        if requeue {
            state.requeue(vec![tag]);
            drop(state);
            self.arrivals.notify_all();
        } else if let Some(unacked) = state.unacked.remove(&tag) {
            state.dead_letters.push((unacked.queue, unacked.message));
        }
        Ok(())
    }

    /// Requeue everything a closed channel left unsettled.
    pub(crate) fn release_channel(&self, channel: u64) {
        let mut state = self.lock();
        let tags = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        if tags.is_empty() {
            return;
        }
        state.requeue(tags);
        drop(state);
        self.arrivals.notify_all();
    }

    fn open_connections(&self) -> Vec<Arc<ConnectionCore>> {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }
}

/// Fault injection and inspection for an in-memory broker.
///
/// ## Example
///
/// ```
/// use integration_bus::broker::memory::InMemoryTopicBroker;
///
/// let broker = InMemoryTopicBroker::new();
/// let controls = broker.controls();
///
/// controls.refuse_connections(3); // next three connects fail transiently
/// controls.set_reachable(false);  // every connect fails until restored
/// controls.set_reachable(true);
/// assert_eq!(controls.connect_attempts(), 0);
/// ```
#[derive(Clone)]
pub struct BrokerControls {
    core: Arc<Core>,
}

impl BrokerControls {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Fail the next `n` connection attempts as unreachable.
    pub fn refuse_connections(&self, n: u32) {
        self.core.lock().faults.refuse_connects = n;
    }

    /// Simulate the broker process going down or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.core.lock().faults.unreachable = !reachable;
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_publishes(&self, n: u32) {
        self.core.lock().faults.fail_publishes = n;
    }

    /// Fail the next `n` acknowledgements; the deliveries stay unsettled.
    pub fn fail_acks(&self, n: u32) {
        self.core.lock().faults.fail_acks = n;
    }

    /// Close every open connection from the broker side and raise a
    /// shutdown notification on each.
    pub fn drop_connections(&self, reason: &str) {
        let dropped = self.core.open_connections();
        for connection in &dropped {
            self.core.close_connection(connection);
        }
        let event = ConnectionEvent::Shutdown(reason.to_string());
        for connection in &dropped {
            connection.fire(&event);
        }
    }

    /// Raise a blocked notification on every open connection.
    pub fn block_connections(&self, reason: &str) {
        let event = ConnectionEvent::Blocked(reason.to_string());
        for connection in self.core.open_connections() {
            connection.fire(&event);
        }
    }

    /// Raise a callback-exception notification on every open connection.
    pub fn raise_callback_exception(&self, reason: &str) {
        let event = ConnectionEvent::CallbackException(reason.to_string());
        for connection in self.core.open_connections() {
            connection.fire(&event);
        }
    }

    pub fn connect_attempts(&self) -> u64 {
        self.core.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.core.open_connections().len()
    }

    /// Messages accepted by the broker, routed or not.
    pub fn published(&self) -> u64 {
        self.core.lock().published
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked(&self) -> usize {
        self.core.lock().unacked.len()
    }

    /// Messages rejected without requeue, with the queue they came from.
    pub fn dead_letters(&self) -> Vec<(String, Message)> {
        self.core.lock().dead_letters.clone()
    }

    /// Ready (not yet delivered) messages in a queue.
    pub fn ready(&self, queue: &str) -> usize {
        self.core.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }
}
