//! Local subscription table shared by the broker implementations.
//!
//! [`SubscriptionRouter`] maps subscription ids to a topic filter and a
//! bounded delivery queue. Each subscription owns one delivery task that
//! drains its queue into the subscription's [`MessageSink`], so messages for
//! one subscription stay in broker order and a slow sink only ever backs up
//! its own queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc};

use super::{BrokerMessage, MessageSink, QoS, SubscriptionHandle, topic};

#[derive(Debug)]
struct Route {
    filter: String,
    qos: QoS,
    queue: mpsc::Sender<BrokerMessage>,
}

/// Outcome of [`SubscriptionRouter::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Added {
    /// Handle for the new subscription.
    pub handle: SubscriptionHandle,
    /// `true` if no other subscription used the same filter before.
    pub first_for_filter: bool,
}

/// Routes broker messages to every local subscription whose filter matches.
#[derive(Debug)]
pub struct SubscriptionRouter {
    routes: RwLock<HashMap<u64, Route>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl SubscriptionRouter {
    /// Creates an empty router whose per-subscription queues hold
    /// `queue_capacity` messages.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Adds a subscription and starts its delivery task.
    pub async fn add(&self, filter: &str, qos: QoS, sink: Arc<dyn MessageSink>) -> Added {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, mut rx) = mpsc::channel::<BrokerMessage>(self.queue_capacity);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                sink.deliver(message).await;
            }
        });

        let mut routes = self.routes.write().await;
        let first_for_filter = !routes.values().any(|r| r.filter == filter);
        routes.insert(
            id,
            Route {
                filter: filter.to_string(),
                qos,
                queue,
            },
        );

        Added {
            handle: SubscriptionHandle::new(id, filter),
            first_for_filter,
        }
    }

    /// Removes a subscription. Its delivery task exits once the messages
    /// already queued are delivered.
    ///
    /// Returns `None` if the handle was unknown, otherwise `Some(last)` where
    /// `last` is `true` if no other subscription uses the same filter.
    pub async fn remove(&self, handle: &SubscriptionHandle) -> Option<bool> {
        let mut routes = self.routes.write().await;
        let removed = routes.remove(&handle.id())?;
        Some(!routes.values().any(|r| r.filter == removed.filter))
    }

    /// Queues `message` for every matching subscription and returns how many
    /// matched.
    ///
    /// A full subscription queue drops the message for that subscription
    /// only.
    pub async fn dispatch(&self, message: &BrokerMessage) -> usize {
        let routes = self.routes.read().await;
        let mut matched = 0;
        for (id, route) in routes.iter() {
            if !topic::matches(&route.filter, &message.topic) {
                continue;
            }
            matched += 1;
            if let Err(mpsc::error::TrySendError::Full(_)) = route.queue.try_send(message.clone())
            {
                tracing::warn!(
                    subscription = id,
                    filter = %route.filter,
                    topic = %message.topic,
                    "subscription queue full, dropping message"
                );
            }
        }
        matched
    }

    /// Returns each distinct active filter with the highest QoS requested
    /// for it.
    pub async fn filters(&self) -> Vec<(String, QoS)> {
        let routes = self.routes.read().await;
        let mut filters: HashMap<&str, QoS> = HashMap::new();
        for route in routes.values() {
            let qos = filters.entry(route.filter.as_str()).or_insert(route.qos);
            if route.qos.level() > qos.level() {
                *qos = route.qos;
            }
        }
        filters
            .into_iter()
            .map(|(filter, qos)| (filter.to_string(), qos))
            .collect()
    }

    /// Returns the number of active subscriptions.
    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Returns `true` if there are no subscriptions.
    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}
