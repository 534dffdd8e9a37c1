//! In-memory topic exchange for standalone mode.
//!
//! Mirrors the broker semantics the subscription manager relies on: durable
//! named queues that buffer while no consumer is attached, topic bindings with
//! `*`/`#` wildcards, and consumers that can be cancelled without losing the
//! queue. Ideal for local development and testing without external dependencies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info};

use super::{topic_matches, Acknowledger, Broker, BusError, Consumer, Delivery, Result};

type Message = (String, Vec<u8>);

/// A durable queue: bindings plus a buffered channel.
struct Queue {
    bindings: HashSet<String>,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            bindings: HashSet::new(),
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }
}

#[derive(Default)]
struct Exchange {
    queues: HashMap<String, Queue>,
    consumers: HashMap<String, watch::Sender<bool>>,
}

/// In-process topic exchange.
///
/// Cheap to share behind an `Arc`; every publisher and subscriber in the
/// process sees the same queues.
#[derive(Default)]
pub struct ChannelBroker {
    exchange: Mutex<Exchange>,
    closed: AtomicBool,
    next_consumer: AtomicU64,
}

impl ChannelBroker {
    /// Create an empty exchange.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindings currently registered for a queue.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        let mut bindings: Vec<String> = self
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
            .unwrap_or_default();
        bindings.sort();
        bindings
    }

    /// Number of consumers currently attached.
    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Exchange> {
        // A poisoned lock only means a panic elsewhere; the maps stay consistent.
        self.exchange.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection("channel broker is closed".to_string()));
        }
        Ok(())
    }
}

/// Settles channel deliveries; a requeue puts the message back on its queue.
struct ChannelAcker {
    sender: mpsc::UnboundedSender<Message>,
    message: Message,
}

impl Acknowledger for ChannelAcker {
    fn ack(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if requeue {
                // Queue dropped means the broker is gone; nothing to return to.
                let _ = self.sender.send(self.message.clone());
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;

        let exchange = self.lock();
        let mut routed = 0;
        for (name, queue) in exchange.queues.iter() {
            if queue.bindings.iter().any(|b| topic_matches(b, subject)) {
                if queue.sender.send((subject.to_string(), payload.clone())).is_ok() {
                    routed += 1;
                }
                debug!(queue = %name, subject = %subject, "Routed message");
            }
        }

        debug!(subject = %subject, queues = routed, "Published message to channel exchange");
        Ok(())
    }

    async fn consume(&self, queue: &str, binding: &str) -> Result<Consumer> {
        self.ensure_open()?;

        let tag = format!(
            "{}#{}",
            queue,
            self.next_consumer.fetch_add(1, Ordering::SeqCst)
        );

        let (receiver, sender, stop_rx) = {
            let mut exchange = self.lock();
            let q = exchange
                .queues
                .entry(queue.to_string())
                .or_insert_with(Queue::new);
            q.bindings.insert(binding.to_string());
            let receiver = q.receiver.clone();
            let sender = q.sender.clone();

            let (stop_tx, stop_rx) = watch::channel(false);
            exchange.consumers.insert(tag.clone(), stop_tx);
            (receiver, sender, stop_rx)
        };

        info!(queue = %queue, binding = %binding, consumer = %tag, "Bound queue to channel exchange");

        let deliveries = futures::stream::unfold(
            (receiver, sender, stop_rx),
            |(receiver, sender, mut stop)| async move {
                if *stop.borrow() {
                    return None;
                }
                let next = {
                    let mut rx = receiver.lock().await;
                    tokio::select! {
                        biased;
                        _ = stop.changed() => None,
                        message = rx.recv() => message,
                    }
                };
                let (routing_key, data) = next?;
                let delivery = Delivery::new(routing_key.clone(), data.clone()).with_acker(
                    Box::new(ChannelAcker {
                        sender: sender.clone(),
                        message: (routing_key, data),
                    }),
                );
                Some((Ok(delivery), (receiver, sender, stop)))
            },
        )
        .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        if let Some(stop) = self.lock().consumers.remove(consumer_tag) {
            let _ = stop.send(true);
            debug!(consumer = %consumer_tag, "Cancelled channel consumer");
        }
        Ok(())
    }

    async fn unbind(&self, queue: &str, binding: &str) -> Result<()> {
        if let Some(q) = self.lock().queues.get_mut(queue) {
            q.bindings.remove(binding);
        }
        debug!(queue = %queue, binding = %binding, "Unbound queue");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let consumers: Vec<watch::Sender<bool>> =
            self.lock().consumers.drain().map(|(_, stop)| stop).collect();
        for stop in consumers {
            let _ = stop.send(true);
        }
        info!("Channel broker closed");
        Ok(())
    }
}
