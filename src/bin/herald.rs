//! herald: notification consumer and delivery runtime
//!
//! Subscribes the notification consumer to the configured topic, persists a
//! notification for every recognized domain event and queues it for the
//! recipient's followers.
//!
//! ## Architecture
//! ```text
//! [producers] --(topic exchange)--> [herald consumer] --> durable store
//!                                                    \--> fan-out store --> delivery sessions
//! ```
//!
//! ## Configuration
//! - First argument or HERALD_CONFIG: path to a YAML config file (optional)
//! - HERALD__SECTION__KEY: overrides, e.g. HERALD__MESSAGING__TYPE=amqp
//! - HERALD_WATCH_TOKEN: if set, also open a delivery session for this token
//!   and log every notification it receives

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use herald::bus::{init_broker, LoopExit, LoopObserver, SubscriberConfig, SubscriptionManager};
use herald::config::Config;
use herald::delivery::DeliveryService;
use herald::directory::init_directory;
use herald::fanout::init_fanout_store;
use herald::notifications::{NotificationEventHandler, NotificationService};
use herald::storage::init_storage;
use herald::utils::bootstrap::{init_tracing, shutdown_on_ctrl_c};

const WATCH_TOKEN_ENV_VAR: &str = "HERALD_WATCH_TOKEN";

/// Shuts the process down when the consumer loop dies.
struct ShutdownOnFailure {
    shutdown: watch::Sender<bool>,
}

impl LoopObserver for ShutdownOnFailure {
    fn loop_exited(&self, topic: &str, subscriber_id: &str, exit: LoopExit) {
        if exit.is_failure() {
            error!(
                topic = %topic,
                subscriber = %subscriber_id,
                exit = %exit,
                "Consumer loop failed, shutting down"
            );
            let _ = self.shutdown.send(true);
        } else {
            info!(topic = %topic, subscriber = %subscriber_id, exit = %exit, "Consumer loop exited");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let broker = init_broker(&config.messaging)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let repo = init_storage(&config.storage)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let fanout = init_fanout_store(&config.fanout)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let directory =
        init_directory(&config.directory).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let service = Arc::new(
        NotificationService::new(repo, directory, fanout.store.clone())
            .with_page_size(config.directory.page_size),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = SubscriptionManager::new(broker.clone())
        .with_prefix(&config.messaging.prefix)
        .with_observer(Arc::new(ShutdownOnFailure {
            shutdown: shutdown_tx.clone(),
        }));

    let subscription = &config.subscription;
    manager
        .subscribe(SubscriberConfig::new(
            &subscription.id,
            &subscription.topic,
            Arc::new(NotificationEventHandler::new(service.clone())),
        ))
        .await?;

    info!(
        subscriber = %subscription.id,
        topic = %subscription.topic,
        "Notification consumer subscribed"
    );

    if let Ok(token) = std::env::var(WATCH_TOKEN_ENV_VAR) {
        let delivery =
            DeliveryService::new(service.clone(), &config.delivery).with_shutdown(shutdown_rx.clone());
        let mut stream = delivery.open(&token).await?;

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(n) => info!(
                        id = %n.id,
                        user = %n.user_id,
                        category = %n.category,
                        content = %n.content,
                        "Delivered notification"
                    ),
                    Err(e) => warn!(error = %e, "Delivery session ended with error"),
                }
            }
        });
    }

    tokio::spawn(shutdown_on_ctrl_c(shutdown_tx));

    info!("herald running, press Ctrl+C to exit");
    let mut shutdown = shutdown_rx;
    let _ = shutdown.wait_for(|stop| *stop).await;

    if let Err(e) = manager
        .unsubscribe(&subscription.id, &subscription.topic)
        .await
    {
        warn!(error = %e, "Unsubscribe at shutdown failed");
    }
    if let Err(e) = manager.close().await {
        warn!(error = %e, "Closing subscriptions failed");
    }
    broker.close().await?;

    if let Some(reaper) = fanout.reaper {
        reaper.abort();
    }

    info!("Shutdown complete");
    Ok(())
}
