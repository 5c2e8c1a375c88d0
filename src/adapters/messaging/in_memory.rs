//! In-memory broker transport for tests.
//!
//! Behaves like a single AMQP 0-9-1 broker: durable topic exchanges with
//! `*`/`#` binding patterns, named queues, per-consumer prefetch and
//! explicit ack/nack. Dropping connections invalidates every open channel
//! and requeues unacknowledged messages as redelivered, like a broker
//! restart.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::ports::{
    BrokerChannel, BrokerError, BrokerMessage, BrokerTransport, ConnectOptions, DeliveryAcker,
    DeliveryStream, InboundDelivery,
};

/// In-memory [`BrokerTransport`]. Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBrokerTransport {
    broker: Arc<Broker>,
}

#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
    unreachable: AtomicBool,
    generation: AtomicU64,
    connect_attempts: AtomicUsize,
    open_connections: AtomicUsize,
    fail_channel_close: AtomicBool,
    stall_exchange_declare: AtomicBool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: BTreeSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<(String, String, BrokerMessage)>,
    acked: usize,
    dropped: usize,
    next_tag: u64,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Queued>,
    unacked: HashMap<u64, Queued>,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct Queued {
    routing_key: String,
    message: BrokerMessage,
    redelivered: bool,
}

impl Broker {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn wake_all(&self) {
        for queue in self.lock().queues.values() {
            queue.notify.notify_waiters();
        }
    }
}

impl InMemoryBrokerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connect` fail with `ConnectionUnavailable` while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Severs every open connection. Unacked messages return to the front
    /// of their queues flagged as redelivered.
    pub fn drop_connections(&self) {
        self.broker.generation.fetch_add(1, Ordering::SeqCst);
        self.broker.open_connections.store(0, Ordering::SeqCst);
        {
            let mut state = self.broker.lock();
            for queue in state.queues.values_mut() {
                let mut tags: Vec<u64> = queue.unacked.keys().copied().collect();
                tags.sort_unstable_by(|a, b| b.cmp(a));
                for tag in tags {
                    if let Some(mut queued) = queue.unacked.remove(&tag) {
                        queued.redelivered = true;
                        queue.ready.push_front(queued);
                    }
                }
            }
        }
        self.broker.wake_all();
    }

    /// Makes `close_channel` fail on every channel while `true`.
    pub fn fail_channel_close(&self, fail: bool) {
        self.broker.fail_channel_close.store(fail, Ordering::SeqCst);
    }

    /// Makes `declare_exchange` hang until its caller gives up while `true`.
    pub fn stall_exchange_declare(&self, stall: bool) {
        self.broker.stall_exchange_declare.store(stall, Ordering::SeqCst);
    }

    /// Places a message straight onto `queue`, bypassing exchanges.
    pub fn inject(&self, queue: &str, routing_key: &str, message: BrokerMessage) {
        let mut state = self.broker.lock();
        let queue = state.queues.entry(queue.to_string()).or_default();
        queue.ready.push_back(Queued {
            routing_key: routing_key.to_string(),
            message,
            redelivered: false,
        });
        queue.notify.notify_waiters();
    }

    /// Every accepted publish as `(exchange, routing_key, message)`.
    pub fn published(&self) -> Vec<(String, String, BrokerMessage)> {
        self.broker.lock().published.clone()
    }

    pub fn exchange_declared(&self, exchange: &str) -> bool {
        self.broker.lock().exchanges.contains(exchange)
    }

    pub fn queue_declared(&self, queue: &str) -> bool {
        self.broker.lock().queues.contains_key(queue)
    }

    /// Messages waiting for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.broker
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.broker
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn acked_count(&self) -> usize {
        self.broker.lock().acked
    }

    /// Messages rejected without requeue.
    pub fn dropped_count(&self) -> usize {
        self.broker.lock().dropped
    }

    pub fn connect_attempts(&self) -> usize {
        self.broker.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.broker.open_connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBrokerTransport {
    async fn connect(&self, _options: &ConnectOptions) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.broker.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.broker.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionUnavailable(
                "connection refused".to_string(),
            ));
        }
        self.broker.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryChannel {
            broker: Arc::clone(&self.broker),
            generation: self.broker.generation(),
            flags: Arc::new(ChannelFlags {
                channel_open: AtomicBool::new(true),
                connection_open: AtomicBool::new(true),
            }),
            prefetch: AtomicU16::new(0),
        }))
    }
}

struct InMemoryChannel {
    broker: Arc<Broker>,
    generation: u64,
    flags: Arc<ChannelFlags>,
    prefetch: AtomicU16,
}

struct ChannelFlags {
    channel_open: AtomicBool,
    connection_open: AtomicBool,
}

impl ChannelFlags {
    fn is_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }
}

impl InMemoryChannel {
    fn connection_alive(&self) -> bool {
        self.flags.connection_open.load(Ordering::SeqCst) && self.generation == self.broker.generation()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionUnavailable("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.flags.channel_open.load(Ordering::SeqCst) && self.connection_alive()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.broker.stall_exchange_declare.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.broker.lock().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Protocol(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Protocol(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Protocol(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }

        let targets: BTreeSet<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(Queued {
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }
        state
            .published
            .push((exchange.to_string(), routing_key.to_string(), message.clone()));
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let notify = match self.broker.lock().queues.get(queue) {
            Some(q) => Arc::clone(&q.notify),
            None => {
                return Err(BrokerError::Protocol(format!("NOT_FOUND - no queue '{}'", queue)));
            }
        };

        let consumer = Consumer {
            broker: Arc::clone(&self.broker),
            generation: self.generation,
            flags: Arc::clone(&self.flags),
            queue: queue.to_string(),
            prefetch: self.prefetch.load(Ordering::SeqCst),
            in_flight: Arc::new(AtomicUsize::new(0)),
            notify,
        };

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            loop {
                if !consumer.is_live() {
                    return None;
                }
                let notify = Arc::clone(&consumer.notify);
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(delivery) = consumer.try_take() {
                    return Some((Ok(delivery), consumer));
                }
                notified.await;
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close_channel(&self) -> Result<(), BrokerError> {
        if self.broker.fail_channel_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Protocol("channel close rejected".to_string()));
        }
        self.flags.channel_open.store(false, Ordering::SeqCst);
        self.broker.wake_all();
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), BrokerError> {
        self.flags.channel_open.store(false, Ordering::SeqCst);
        let was_alive = self.connection_alive();
        self.flags.connection_open.store(false, Ordering::SeqCst);
        if was_alive {
            self.broker.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        self.broker.wake_all();
        Ok(())
    }
}

struct Consumer {
    broker: Arc<Broker>,
    generation: u64,
    flags: Arc<ChannelFlags>,
    queue: String,
    prefetch: u16,
    in_flight: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Consumer {
    fn is_live(&self) -> bool {
        self.flags.is_open() && self.generation == self.broker.generation()
    }

    fn try_take(&self) -> Option<InboundDelivery> {
        if self.prefetch > 0 && self.in_flight.load(Ordering::SeqCst) >= usize::from(self.prefetch) {
            return None;
        }

        let mut state = self.broker.lock();
        state.next_tag += 1;
        let tag = state.next_tag;
        let queue = state.queues.get_mut(&self.queue)?;
        let queued = queue.ready.pop_front()?;
        queue.unacked.insert(tag, queued.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let acker = InMemoryAcker {
            broker: Arc::clone(&self.broker),
            generation: self.generation,
            queue: self.queue.clone(),
            tag,
            in_flight: Arc::clone(&self.in_flight),
        };
        Some(InboundDelivery::new(
            tag,
            queued.redelivered,
            queued.routing_key,
            queued.message,
            Box::new(acker),
        ))
    }
}

struct InMemoryAcker {
    broker: Arc<Broker>,
    generation: u64,
    queue: String,
    tag: u64,
    in_flight: Arc<AtomicUsize>,
}

impl InMemoryAcker {
    fn settle(&self, settle: impl FnOnce(&mut BrokerState, &str, Queued)) -> Result<(), BrokerError> {
        if self.generation != self.broker.generation() {
            return Err(BrokerError::ConnectionUnavailable(
                "delivery channel is closed".to_string(),
            ));
        }

        let mut state = self.broker.lock();
        let queued = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or_else(|| {
                BrokerError::Protocol(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag))
            })?;
        settle(&mut *state, &self.queue, queued);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(queue) = state.queues.get(&self.queue) {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(|state, _, _| state.acked += 1)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(|state, queue, mut queued| {
            if requeue {
                queued.redelivered = true;
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_front(queued);
                }
            } else {
                state.dropped += 1;
            }
        })
    }
}

/// AMQP topic matching: words are dot-separated, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && matches_words(rest, key_rest),
            None => false,
        },
    }
}
