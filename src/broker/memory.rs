//! Process-local broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{BrokerClient, BrokerError, Delivery, Subscription, SubscriptionMode};

#[derive(Debug, Clone)]
struct Envelope {
    payload: Vec<u8>,
    delivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    name: String,
    exclusive: bool,
    ready: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl MemoryQueue {
    fn new(name: &str, exclusive: bool) -> Self {
        Self {
            name: name.to_string(),
            exclusive,
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, envelope: Envelope) {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(envelope);
        self.notify.notify_one();
    }

    fn push_front(&self, envelope: Envelope) {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(envelope);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Envelope> {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Debug)]
struct Inner {
    queues: DashMap<String, Arc<MemoryQueue>>,
    /// topic -> names of bound queues
    bindings: DashMap<String, Vec<String>>,
    available: AtomicBool,
    next_tag: AtomicU64,
}

/// Broker living entirely inside the current process.
///
/// Clones share state, so one clone can publish while another consumes.
/// [`InMemoryBroker::set_available`] simulates losing the connection.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                bindings: DashMap::new(),
                available: AtomicBool::new(true),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Marks the broker reachable or not. Going unavailable fails waiting
    /// consumers and every later call until it comes back.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            for queue in &self.inner.queues {
                queue.notify.notify_waiters();
            }
        }
    }

    /// Number of messages ready for delivery on `queue`, if it exists.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.queues.get(queue).map(|q| q.len())
    }

    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.queues.contains_key(queue)
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::publishing(topic, "broker unavailable"));
        }

        let names = self
            .inner
            .bindings
            .get(topic)
            .map(|names| names.value().clone())
            .unwrap_or_default();
        if names.is_empty() {
            debug!("no queue bound to topic, message dropped");
        }

        for name in names {
            let queue = self.inner.queues.get(&name).map(|q| Arc::clone(q.value()));
            if let Some(queue) = queue {
                queue.push_back(Envelope {
                    payload: payload.to_vec(),
                    delivered: false,
                });
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        topic: &str,
        mode: &SubscriptionMode,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::connecting("broker unavailable"));
        }

        let (name, exclusive) = match mode {
            SubscriptionMode::Durable { queue } => (queue.clone(), false),
            SubscriptionMode::Exclusive => {
                (format!("{topic}.exclusive.{}", Uuid::new_v4().simple()), true)
            }
        };

        let queue = Arc::clone(
            self.inner
                .queues
                .entry(name.clone())
                .or_insert_with(|| Arc::new(MemoryQueue::new(&name, exclusive)))
                .value(),
        );

        {
            let mut bound = self.inner.bindings.entry(topic.to_string()).or_default();
            if !bound.contains(&name) {
                bound.push(name.clone());
            }
        }

        debug!(queue = %name, exclusive, "queue declared");
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            queue,
            topic: topic.to_string(),
            unacked: HashMap::new(),
            closed: false,
        }))
    }
}

struct MemorySubscription {
    broker: InMemoryBroker,
    queue: Arc<MemoryQueue>,
    topic: String,
    unacked: HashMap<u64, Envelope>,
    closed: bool,
}

impl MemorySubscription {
    fn release(&mut self) {
        let mut tags: Vec<u64> = self.unacked.keys().copied().collect();
        // push_front in reverse so the oldest delivery ends up first again
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(envelope) = self.unacked.remove(&tag) {
                self.queue.push_front(envelope);
            }
        }

        if self.queue.exclusive {
            let inner = &self.broker.inner;
            inner.queues.remove(&self.queue.name);
            if let Some(mut bound) = inner.bindings.get_mut(&self.topic) {
                bound.retain(|name| name != &self.queue.name);
            }
        }
        self.closed = true;
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn queue_name(&self) -> &str {
        &self.queue.name
    }

    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        let queue = Arc::clone(&self.queue);
        loop {
            // Register interest before checking, so a wake-up between the
            // check and the await is not lost.
            let notified = queue.notify.notified();

            if self.closed {
                return Err(BrokerError::consuming(&self.topic, "subscription closed"));
            }
            if !self.broker.is_available() {
                return Err(BrokerError::consuming(
                    &self.topic,
                    "connection to broker lost",
                ));
            }

            if let Some(envelope) = queue.pop() {
                let tag = self.broker.inner.next_tag.fetch_add(1, Ordering::Relaxed);
                let redelivered = envelope.delivered;
                let payload = envelope.payload.clone();
                self.unacked.insert(
                    tag,
                    Envelope {
                        payload: envelope.payload,
                        delivered: true,
                    },
                );
                return Ok(Delivery {
                    tag,
                    payload,
                    redelivered,
                });
            }

            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::consuming(&self.topic, format!("unknown delivery tag {tag}")))
    }

    async fn requeue(&mut self, tag: u64) -> Result<(), BrokerError> {
        let envelope = self.unacked.remove(&tag).ok_or_else(|| {
            BrokerError::consuming(&self.topic, format!("unknown delivery tag {tag}"))
        })?;
        self.queue.push_front(envelope);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.release();
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if !self.closed {
            self.release();
        }
    }
}
