//! Test utilities and mock implementations.
//!
//! Handlers, observers and directories that record what happened to them so
//! tests can assert on side effects without a broker or a users service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{Notify, RwLock};

use crate::bus::{BusError, EventHandler, EventPayload, LoopExit, LoopObserver};
use crate::directory::{Directory, DirectoryError, FollowingsPage, MemoryDirectory};

/// Handler that records every event it sees.
#[derive(Default)]
pub struct CountingHandler {
    events: Arc<RwLock<Vec<EventPayload>>>,
    handled: Arc<AtomicUsize>,
    cancelled: AtomicUsize,
    fail_after: Arc<RwLock<Option<usize>>>,
    notify: Arc<Notify>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every event once `n` events have been handled successfully.
    pub async fn set_fail_after(&self, n: Option<usize>) {
        *self.fail_after.write().await = n;
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn events(&self) -> Vec<EventPayload> {
        self.events.read().await.clone()
    }

    /// Wait until at least `n` events were handled, or the timeout elapses.
    pub async fn wait_for(&self, n: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.handled() >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.handled() >= n;
            }
        }
    }
}

impl EventHandler for CountingHandler {
    fn handle(&self, event: Arc<EventPayload>) -> BoxFuture<'static, Result<(), BusError>> {
        let events = self.events.clone();
        let handled = self.handled.clone();
        let fail_after = self.fail_after.clone();
        let notify = self.notify.clone();

        Box::pin(async move {
            if let Some(limit) = *fail_after.read().await {
                if handled.load(Ordering::SeqCst) >= limit {
                    return Err(BusError::Handler("configured to fail".to_string()));
                }
            }
            events.write().await.push((*event).clone());
            handled.fetch_add(1, Ordering::SeqCst);
            notify.notify_waiters();
            Ok(())
        })
    }

    fn cancel(&self) -> Result<(), BusError> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Observer that records loop exits.
#[derive(Default)]
pub struct RecordingObserver {
    exits: Mutex<Vec<(String, String, LoopExit)>>,
    notify: Notify,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exits(&self) -> Vec<(String, String, LoopExit)> {
        self.exits.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Wait for the next recorded exit, or the timeout.
    pub async fn wait_for_exit(&self, timeout: std::time::Duration) -> Option<LoopExit> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some((_, _, exit)) = self.exits().last() {
                return Some(*exit);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.exits().last().map(|(_, _, exit)| *exit);
            }
        }
    }
}

impl LoopObserver for RecordingObserver {
    fn loop_exited(&self, topic: &str, subscriber_id: &str, exit: LoopExit) {
        if let Ok(mut exits) = self.exits.lock() {
            exits.push((topic.to_string(), subscriber_id.to_string(), exit));
        }
        self.notify.notify_waiters();
    }
}

/// Directory wrapper that counts calls and can be switched to fail.
pub struct RecordingDirectory {
    inner: MemoryDirectory,
    identify_calls: AtomicUsize,
    followings_calls: Mutex<HashMap<String, usize>>,
    fail_followings: RwLock<bool>,
}

impl RecordingDirectory {
    pub fn new(inner: MemoryDirectory) -> Self {
        Self {
            inner,
            identify_calls: AtomicUsize::new(0),
            followings_calls: Mutex::new(HashMap::new()),
            fail_followings: RwLock::new(false),
        }
    }

    pub async fn set_fail_followings(&self, fail: bool) {
        *self.fail_followings.write().await = fail;
    }

    pub fn identify_calls(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_followings` page requests made for a user.
    pub fn followings_calls(&self, user_id: &str) -> usize {
        self.followings_calls
            .lock()
            .ok()
            .and_then(|calls| calls.get(user_id).copied())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Directory for RecordingDirectory {
    async fn identify_user(&self, token: &str) -> Result<String, DirectoryError> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.identify_user(token).await
    }

    async fn get_followings(
        &self,
        user_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<FollowingsPage, DirectoryError> {
        if let Ok(mut calls) = self.followings_calls.lock() {
            *calls.entry(user_id.to_string()).or_default() += 1;
        }
        if *self.fail_followings.read().await {
            return Err(DirectoryError::Unavailable("configured to fail".to_string()));
        }
        self.inner.get_followings(user_id, offset, limit).await
    }
}
