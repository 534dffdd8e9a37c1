//! Client delivery: streams notifications to one connected user.
//!
//! A session authenticates the token, drains the user's unread backlog from
//! the durable store, then polls the pending slots of everyone the user
//! follows. Each hit is pushed and the scan restarts; a scan with no hits
//! sleeps for the poll interval. The session ends when the client drops the
//! stream, when shutdown is signalled, or on the first store error (which is
//! sent to the client before the stream closes).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::directory::DirectoryError;
use crate::fanout::{FanoutError, PendingNotificationStore};
use crate::notifications::{
    Notification, NotificationError, NotificationFilter, NotificationService, Page,
};
use crate::storage::StorageError;


/// Errors surfaced to a delivery client.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Directory(DirectoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

impl From<NotificationError> for DeliveryError {
    fn from(e: NotificationError) -> Self {
        match e {
            NotificationError::Unauthorized => DeliveryError::Unauthorized,
            NotificationError::Storage(e) => DeliveryError::Storage(e),
            NotificationError::Fanout(e) => DeliveryError::Fanout(e),
            NotificationError::Directory(e) => DeliveryError::Directory(e),
        }
    }
}

/// Stream of notifications handed to a connected client.
pub type NotificationStream = ReceiverStream<Result<Notification, DeliveryError>>;

/// Opens delivery sessions.
#[derive(Clone)]
pub struct DeliveryService {
    service: Arc<NotificationService>,
    poll_interval: Duration,
    page_size: u64,
    channel_capacity: usize,
    shutdown: Option<watch::Receiver<bool>>,
}

impl DeliveryService {
    pub fn new(service: Arc<NotificationService>, config: &DeliveryConfig) -> Self {
        Self {
            service,
            poll_interval: config.poll_interval(),
            page_size: config.page_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
            shutdown: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// End every session once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Authenticate `token` and start a session for its user.
    ///
    /// Authentication happens before this returns; everything after runs in a
    /// spawned task feeding the returned stream.
    pub async fn open(&self, token: &str) -> Result<NotificationStream, DeliveryError> {
        let user_id = self.service.identify(token).await?;
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        tokio::spawn(Session::new(user_id, self, tx).run());

        Ok(ReceiverStream::new(rx))
    }
}

struct Session {
    user_id: String,
    service: Arc<NotificationService>,
    poll_interval: Duration,
    page_size: u64,
    shutdown: Option<watch::Receiver<bool>>,
    /// Backlog ids not yet seen again by the live loop.
    backlog: HashSet<String>,
    delivered: u64,
    tx: mpsc::Sender<Result<Notification, DeliveryError>>,
}

/// Why a session stopped without an error.
enum Stop {
    Disconnected,
    Shutdown,
}

type Step<T> = Result<T, Option<DeliveryError>>;

impl Session {
    fn new(
        user_id: String,
        delivery: &DeliveryService,
        tx: mpsc::Sender<Result<Notification, DeliveryError>>,
    ) -> Self {
        Self {
            user_id,
            service: delivery.service.clone(),
            poll_interval: delivery.poll_interval,
            page_size: delivery.page_size,
            shutdown: delivery.shutdown.clone(),
            backlog: HashSet::new(),
            delivered: 0,
            tx,
        }
    }

    async fn run(mut self) {
        info!(user = %self.user_id, "Delivery session opened");

        let outcome = match self.drain_backlog().await {
            Ok(()) => self.live_loop().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Stop::Disconnected) => {
                debug!(user = %self.user_id, "Client disconnected");
            }
            Ok(Stop::Shutdown) => {
                debug!(user = %self.user_id, "Delivery session shut down");
            }
            Err(Some(e)) => {
                warn!(user = %self.user_id, error = %e, "Delivery session failed");
                let _ = self.tx.send(Err(e)).await;
            }
            Err(None) => {}
        }

        info!(
            user = %self.user_id,
            delivered = self.delivered,
            "Delivery session closed"
        );
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// `Some` once the session must stop before touching a store again.
    fn stopped(&self) -> Option<Stop> {
        if self.tx.is_closed() {
            Some(Stop::Disconnected)
        } else if self.shutdown_requested() {
            Some(Stop::Shutdown)
        } else {
            None
        }
    }

    /// Push a stored notification, remembering its id until the live loop
    /// pops the same notification.
    async fn push_backlog(&mut self, notification: Notification) -> Step<()> {
        if !self.backlog.insert(notification.id.clone()) {
            return Ok(());
        }
        self.send(notification).await
    }

    /// Push a popped notification unless the backlog already carried it.
    ///
    /// Pending slots are read-once, so only backlog ids can come back.
    async fn push_live(&mut self, notification: Notification) -> Step<()> {
        if self.backlog.remove(&notification.id) {
            debug!(user = %self.user_id, id = %notification.id, "Skipping duplicate");
            return Ok(());
        }
        self.send(notification).await
    }

    /// `Err(None)` means the client went away.
    async fn send(&mut self, notification: Notification) -> Step<()> {
        self.tx.send(Ok(notification)).await.map_err(|_| None)?;
        self.delivered += 1;
        Ok(())
    }

    async fn drain_backlog(&mut self) -> Step<()> {
        let filter = NotificationFilter::for_user(&self.user_id).unread();
        let mut offset = 0;

        loop {
            if self.stopped().is_some() {
                return Err(None);
            }

            let page = self
                .service
                .repository()
                .retrieve_all(&filter, Page::new(offset, self.page_size))
                .await
                .map_err(|e| Some(e.into()))?;
            let fetched = page.notifications.len() as u64;

            for notification in page.notifications {
                self.push_backlog(notification).await?;
            }

            offset += fetched;
            if fetched == 0 || offset >= page.total {
                break;
            }
        }

        debug!(user = %self.user_id, count = self.backlog.len(), "Backlog drained");
        Ok(())
    }

    async fn live_loop(&mut self) -> Step<Stop> {
        loop {
            if let Some(stop) = self.stopped() {
                return Ok(stop);
            }

            let followees = self
                .service
                .followees(&self.user_id)
                .await
                .map_err(|e| Some(e.into()))?;

            if let Some(notification) = self.scan(&followees).await? {
                self.push_live(notification).await?;
                continue;
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return Ok(Stop::Shutdown),
                _ = self.tx.closed() => return Ok(Stop::Disconnected),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Pop the first pending notification found among `followees`.
    async fn scan(&self, followees: &[String]) -> Step<Option<Notification>> {
        let fanout = self.service.fanout();

        for followee in followees {
            if self.stopped().is_some() {
                return Err(None);
            }
            if let Some(notification) = fanout
                .take_pending(followee)
                .await
                .map_err(|e| Some(e.into()))?
            {
                return Ok(Some(notification));
            }
        }
        Ok(None)
    }
}

/// Resolves once shutdown is signalled. Never resolves without a shutdown channel.
async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            // Sender gone: shutdown can no longer be signalled.
            let closed = rx.wait_for(|stop| *stop).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
