//! Per-consumer subscriptions over a shared broker.
//!
//! The manager keeps a `topic -> subscriber id -> Subscription` table behind a
//! single mutex. Each subscription owns a durable queue named `<topic>-<id>`,
//! bound under `<prefix>.<topic>`, and exactly one delivery loop task.
//!
//! The delivery loop never holds the table lock. It ends when the broker closes
//! the stream, when the subscription is cancelled, or on the first decode or
//! handler failure. Failed loops are not restarted; a [`LoopObserver`] can be
//! registered to supervise them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    format_topic, subject, Broker, BusError, DeliveryStream, EventHandler, EventPayload, Result,
    SUBJECT_PREFIX,
};

/// Parameters for a new subscription.
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Subscriber identity; together with the topic it names the queue.
    pub id: String,
    /// Topic pattern, unprefixed. `>` is accepted as the multi-level wildcard.
    pub topic: String,
    pub handler: Arc<dyn EventHandler>,
}

impl SubscriberConfig {
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            handler,
        }
    }
}

impl fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

/// Why a delivery loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The broker closed the delivery stream.
    Closed,
    /// The subscription was cancelled by unsubscribe, replacement or shutdown.
    Cancelled,
    /// A message body was not a JSON object.
    DecodeFailed,
    /// The handler returned an error.
    HandlerFailed,
    /// The consumer stream yielded an error or a settle call failed.
    BrokerFailed,
}

impl LoopExit {
    /// True if the loop stopped because of a failure rather than a shutdown.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LoopExit::DecodeFailed | LoopExit::HandlerFailed | LoopExit::BrokerFailed
        )
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopExit::Closed => "closed",
            LoopExit::Cancelled => "cancelled",
            LoopExit::DecodeFailed => "decode_failed",
            LoopExit::HandlerFailed => "handler_failed",
            LoopExit::BrokerFailed => "broker_failed",
        };
        f.write_str(s)
    }
}

/// Notified whenever a delivery loop exits.
pub trait LoopObserver: Send + Sync {
    fn loop_exited(&self, topic: &str, subscriber_id: &str, exit: LoopExit);
}

/// An active subscription.
///
/// Cancelling stops the broker consumer and runs the handler's `cancel()` hook.
/// Both happen at most once per subscription, however many times `cancel` is called.
pub struct Subscription {
    topic: String,
    subscriber_id: String,
    queue: String,
    binding: String,
    consumer_tag: String,
    handler: Arc<dyn EventHandler>,
    broker: Arc<dyn Broker>,
    cancelled: Arc<AtomicBool>,
    consumer_stopped: Arc<AtomicBool>,
    task: JoinHandle<LoopExit>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Durable queue backing this subscription.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Routing pattern the queue is bound under.
    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// True once the delivery loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the consumer and notify the handler. Idempotent.
    pub async fn cancel(&self) -> Result<()> {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A loop that died on its own has already stopped the consumer.
        if !self.consumer_stopped.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.broker.cancel(&self.consumer_tag).await {
                // Leave the subscription cancellable again.
                self.consumer_stopped.store(false, Ordering::SeqCst);
                self.cancelled.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        self.handler.cancel()?;

        debug!(
            topic = %self.topic,
            subscriber = %self.subscriber_id,
            "Subscription cancelled"
        );
        Ok(())
    }

    /// Cancel and remove the queue binding.
    async fn teardown(&self) -> Result<()> {
        self.cancel().await?;
        self.broker.unbind(&self.queue, &self.binding).await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("subscriber_id", &self.subscriber_id)
            .field("queue", &self.queue)
            .field("binding", &self.binding)
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

type SubscriptionTable = HashMap<String, HashMap<String, Subscription>>;

/// Owns the subscription table for one broker connection.
pub struct SubscriptionManager {
    broker: Arc<dyn Broker>,
    prefix: String,
    subscriptions: Mutex<SubscriptionTable>,
    observer: Option<Arc<dyn LoopObserver>>,
}

impl SubscriptionManager {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            prefix: SUBJECT_PREFIX.to_string(),
            subscriptions: Mutex::new(HashMap::new()),
            observer: None,
        }
    }

    /// Use a different subject prefix for bindings.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Subscribe a handler to a topic.
    ///
    /// An existing subscription for the same (topic, id) is fully torn down
    /// first, so subscribing twice leaves exactly one active subscription.
    pub async fn subscribe(&self, config: SubscriberConfig) -> Result<()> {
        if config.id.is_empty() {
            return Err(BusError::EmptyId);
        }
        if config.topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }

        let topic = format_topic(&config.topic);
        let id = config.id;
        let mut table = self.subscriptions.lock().await;

        if let Some(old) = table.get(&topic).and_then(|subs| subs.get(&id)) {
            info!(topic = %topic, subscriber = %id, "Replacing existing subscription");
            // On failure the old entry stays so it can be torn down again.
            old.teardown().await?;
            remove(&mut table, &topic, &id);
        }

        let queue = format!("{}-{}", topic, id);
        let binding = subject(&self.prefix, &topic);
        let consumer = match self.broker.consume(&queue, &binding).await {
            Ok(consumer) => consumer,
            Err(e) => {
                prune(&mut table, &topic);
                return Err(e);
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let consumer_stopped = Arc::new(AtomicBool::new(false));

        let ctx = LoopContext {
            topic: topic.clone(),
            subscriber_id: id.clone(),
            consumer_tag: consumer.tag.clone(),
            handler: config.handler.clone(),
            broker: self.broker.clone(),
            cancelled: cancelled.clone(),
            consumer_stopped: consumer_stopped.clone(),
            observer: self.observer.clone(),
        };
        let task = tokio::spawn(run_delivery_loop(ctx, consumer.deliveries));

        info!(
            topic = %topic,
            subscriber = %id,
            queue = %queue,
            binding = %binding,
            "Subscribed"
        );

        let subscription = Subscription {
            topic: topic.clone(),
            subscriber_id: id.clone(),
            queue,
            binding,
            consumer_tag: consumer.tag,
            handler: config.handler,
            broker: self.broker.clone(),
            cancelled,
            consumer_stopped,
            task,
        };
        table.entry(topic).or_default().insert(id, subscription);
        Ok(())
    }

    /// Cancel a subscription and unbind its queue.
    pub async fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        if id.is_empty() {
            return Err(BusError::EmptyId);
        }
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }

        let topic = format_topic(topic);
        let mut table = self.subscriptions.lock().await;

        let subscription = table
            .get(&topic)
            .and_then(|subs| subs.get(id))
            .ok_or(BusError::NotSubscribed)?;
        subscription.teardown().await?;
        remove(&mut table, &topic, id);

        info!(topic = %topic, subscriber = %id, "Unsubscribed");
        Ok(())
    }

    /// Tear down every subscription. Errors are logged; the first one is returned
    /// and the subscriptions that failed stay in the table.
    pub async fn close(&self) -> Result<()> {
        let mut table = self.subscriptions.lock().await;
        let mut first_error = None;
        let mut remaining = SubscriptionTable::new();

        for (topic, subs) in table.drain() {
            for (id, subscription) in subs {
                if let Err(e) = subscription.teardown().await {
                    error!(topic = %topic, subscriber = %id, error = %e, "Failed to tear down subscription");
                    first_error.get_or_insert(e);
                    remaining
                        .entry(topic.clone())
                        .or_default()
                        .insert(id, subscription);
                }
            }
        }
        *table = remaining;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub async fn is_subscribed(&self, id: &str, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(&format_topic(topic))
            .is_some_and(|subs| subs.contains_key(id))
    }

    /// True if the (topic, id) subscription exists and its delivery loop has exited.
    pub async fn is_loop_finished(&self, id: &str, topic: &str) -> Option<bool> {
        self.subscriptions
            .lock()
            .await
            .get(&format_topic(topic))
            .and_then(|subs| subs.get(id))
            .map(Subscription::is_finished)
    }
}

fn remove(table: &mut SubscriptionTable, topic: &str, id: &str) {
    if let Some(subs) = table.get_mut(topic) {
        subs.remove(id);
    }
    prune(table, topic);
}

fn prune(table: &mut SubscriptionTable, topic: &str) {
    if table.get(topic).is_some_and(HashMap::is_empty) {
        table.remove(topic);
    }
}

struct LoopContext {
    topic: String,
    subscriber_id: String,
    consumer_tag: String,
    handler: Arc<dyn EventHandler>,
    broker: Arc<dyn Broker>,
    cancelled: Arc<AtomicBool>,
    consumer_stopped: Arc<AtomicBool>,
    observer: Option<Arc<dyn LoopObserver>>,
}

impl LoopContext {
    /// Stop the broker consumer after a loop failure so the queue is left for
    /// the next subscriber.
    async fn stop_consumer(&self) {
        if self.consumer_stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.broker.cancel(&self.consumer_tag).await {
            warn!(
                topic = %self.topic,
                subscriber = %self.subscriber_id,
                error = %e,
                "Failed to cancel consumer"
            );
        }
    }

    /// Requeue deliveries the broker already pushed to this consumer.
    async fn requeue_buffered(&self, deliveries: &mut DeliveryStream) {
        let mut requeued = 0usize;
        while let Some(Some(Ok(delivery))) = deliveries.next().now_or_never() {
            if let Err(e) = delivery.reject(true).await {
                warn!(topic = %self.topic, subscriber = %self.subscriber_id, error = %e, "Failed to requeue buffered message");
                break;
            }
            requeued += 1;
        }
        if requeued > 0 {
            debug!(topic = %self.topic, subscriber = %self.subscriber_id, requeued, "Requeued buffered messages");
        }
    }
}

async fn run_delivery_loop(ctx: LoopContext, mut deliveries: DeliveryStream) -> LoopExit {
    let exit = deliver(&ctx, &mut deliveries).await;
    if exit.is_failure() {
        ctx.requeue_buffered(&mut deliveries).await;
    }

    if exit.is_failure() {
        error!(
            topic = %ctx.topic,
            subscriber = %ctx.subscriber_id,
            exit = %exit,
            "Delivery loop terminated"
        );
    } else {
        info!(
            topic = %ctx.topic,
            subscriber = %ctx.subscriber_id,
            exit = %exit,
            "Delivery loop stopped"
        );
    }

    if let Some(observer) = &ctx.observer {
        observer.loop_exited(&ctx.topic, &ctx.subscriber_id, exit);
    }
    exit
}

async fn deliver(ctx: &LoopContext, deliveries: &mut DeliveryStream) -> LoopExit {
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(topic = %ctx.topic, subscriber = %ctx.subscriber_id, error = %e, "Consumer stream failed");
                ctx.stop_consumer().await;
                return LoopExit::BrokerFailed;
            }
        };

        let fields: EventPayload = match serde_json::from_slice(&delivery.data) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(
                    topic = %ctx.topic,
                    subscriber = %ctx.subscriber_id,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Failed to decode event"
                );
                ctx.stop_consumer().await;
                // Requeueing a malformed body would only fail the next consumer too.
                if let Err(e) = delivery.reject(false).await {
                    warn!(error = %e, "Failed to reject undecodable message");
                }
                return LoopExit::DecodeFailed;
            }
        };

        if let Err(e) = ctx.handler.handle(Arc::new(fields)).await {
            warn!(
                topic = %ctx.topic,
                subscriber = %ctx.subscriber_id,
                routing_key = %delivery.routing_key,
                error = %e,
                "Handler failed"
            );
            ctx.stop_consumer().await;
            if let Err(e) = delivery.reject(true).await {
                warn!(error = %e, "Failed to requeue message");
            }
            return LoopExit::HandlerFailed;
        }

        if let Err(e) = delivery.ack().await {
            warn!(topic = %ctx.topic, subscriber = %ctx.subscriber_id, error = %e, "Failed to ack message");
            ctx.stop_consumer().await;
            return LoopExit::BrokerFailed;
        }

        debug!(topic = %ctx.topic, subscriber = %ctx.subscriber_id, routing_key = %delivery.routing_key, "Event handled");
    }

    if ctx.cancelled.load(Ordering::SeqCst) {
        LoopExit::Cancelled
    } else {
        LoopExit::Closed
    }
}

#[cfg(test)]
mod tests;
