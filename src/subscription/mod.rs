//! Persistent subscriptions.
//!
//! `PersistentSubscriptions` manages subscription groups and connects
//! subscribers. A connected subscriber is a `PersistentSubscription` handle
//! backed by two pieces:
//!
//! - a driver task on the client's worker pool that receives pushed events,
//!   forwards them to the handler thread, and turns handler dispositions into
//!   acks and nacks
//! - a delivery thread that runs the user's handler

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{
    Delivery, DropReason, NackAction, PushMessage, StoreConnection, SubscriptionAcker,
    SubscriptionChannel,
};
use crate::error::{ClientError, Removal, Result};
use crate::runtime::is_worker_thread;

mod delivery;
mod settings;

pub use delivery::{auto_ack, DeliveryContext, DeliveryHandler, Disposition};
pub use settings::{ConsumerStrategy, StartFrom, SubscriptionSettings};

use delivery::{spawn_delivery_thread, DeliveryWiring};

/// Default number of un-acked events a subscriber accepts.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 10;

/// Options for joining a subscription group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    /// Maximum events in flight to this subscriber.
    pub buffer_size: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl SubscribeOptions {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

/// Lifecycle of a connected subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Connected, no event outstanding.
    Active,
    /// Connected, at least one event handed to the handler.
    Delivering,
    /// No longer receiving events.
    Detached(DropReason),
}

impl SubscriptionState {
    pub fn is_detached(&self) -> bool {
        matches!(self, SubscriptionState::Detached(_))
    }
}

fn validate_names(stream: &str, group: &str) -> Result<()> {
    if stream.is_empty() {
        return Err(ClientError::InvalidArgument(
            "stream name must not be empty".to_string(),
        ));
    }
    if group.is_empty() {
        return Err(ClientError::InvalidArgument(
            "group name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Subscription group management.
#[derive(Clone)]
pub struct PersistentSubscriptions {
    connection: Arc<dyn StoreConnection>,
}

impl PersistentSubscriptions {
    pub fn new(connection: Arc<dyn StoreConnection>) -> Self {
        Self { connection }
    }

    /// Create a group. Fails with `AlreadyExists` if it is already there.
    #[tracing::instrument(name = "subscriptions.create", skip_all, fields(stream = %stream, group = %group))]
    pub async fn create(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        validate_names(stream, group)?;
        settings.validate()?;
        self.connection
            .create_subscription(stream, group, settings)
            .await?;
        info!(stream = %stream, group = %group, "Subscription group created");
        Ok(())
    }

    /// Replace a group's settings. Connected subscribers are dropped with
    /// `SettingsChanged`.
    #[tracing::instrument(name = "subscriptions.update", skip_all, fields(stream = %stream, group = %group))]
    pub async fn update(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        validate_names(stream, group)?;
        settings.validate()?;
        self.connection
            .update_subscription(stream, group, settings)
            .await
    }

    /// Delete a group. A missing group is reported as `Removal::NotFound`.
    #[tracing::instrument(name = "subscriptions.delete", skip_all, fields(stream = %stream, group = %group))]
    pub async fn delete(&self, stream: &str, group: &str) -> Result<Removal<()>> {
        validate_names(stream, group)?;
        match self.connection.delete_subscription(stream, group).await {
            Ok(()) => Ok(Removal::Removed(())),
            Err(ClientError::SubscriptionNotFound { .. }) => {
                warn!(stream = %stream, group = %group, "Subscription group not found, nothing to delete");
                Ok(Removal::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Join a group and start delivering events to `handler`.
    ///
    /// Must be called from within the client's runtime; the driver task is
    /// spawned onto it.
    #[tracing::instrument(name = "subscriptions.subscribe", skip_all, fields(stream = %stream, group = %group))]
    pub async fn subscribe<H: DeliveryHandler>(
        &self,
        stream: &str,
        group: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<PersistentSubscription> {
        validate_names(stream, group)?;
        if options.buffer_size == 0 {
            return Err(ClientError::InvalidArgument(
                "subscriber buffer size must be at least 1".to_string(),
            ));
        }

        let channel = self
            .connection
            .connect_subscription(stream, group, options.buffer_size)
            .await?;

        let (delivery_tx, delivery_rx) = mpsc::channel(options.buffer_size);
        let (disposition_tx, disposition_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let spawned = spawn_delivery_thread(
            stream,
            group,
            handler,
            DeliveryWiring {
                deliveries: delivery_rx,
                dispositions: disposition_tx,
                stop: stop.clone(),
            },
        );
        let delivery_thread = match spawned {
            Ok(handle) => handle.thread().id(),
            Err(e) => {
                let _ = channel.acker.close().await;
                return Err(e);
            }
        };

        let (state_tx, state_rx) = watch::channel(SubscriptionState::Active);
        let (close_tx, close_rx) = oneshot::channel();
        let subscription_id = channel.subscription_id.clone();

        let driver = Driver {
            stream: stream.to_string(),
            group: group.to_string(),
            channel,
            deliveries: delivery_tx,
            dispositions: disposition_rx,
            state: state_tx,
            stop,
            outstanding: 0,
        };
        let driver = tokio::spawn(driver.run(close_rx));

        info!(
            stream = %stream,
            group = %group,
            subscription_id = %subscription_id,
            "Subscribed"
        );

        Ok(PersistentSubscription {
            stream: stream.to_string(),
            group: group.to_string(),
            subscription_id,
            state: state_rx,
            close: Some(close_tx),
            driver: Some(driver),
            delivery_thread,
        })
    }
}

/// Handle to a connected subscriber.
///
/// Dropping the handle closes the subscription in the background.
pub struct PersistentSubscription {
    stream: String,
    group: String,
    subscription_id: String,
    state: watch::Receiver<SubscriptionState>,
    close: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
    delivery_thread: ThreadId,
}

impl std::fmt::Debug for PersistentSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSubscription")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("subscription_id", &self.subscription_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl PersistentSubscription {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Watch lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Wait until the subscriber is detached and return why.
    pub async fn wait_detached(&self) -> DropReason {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            if let SubscriptionState::Detached(reason) = current {
                return reason;
            }
            if state.changed().await.is_err() {
                return match state.borrow().clone() {
                    SubscriptionState::Detached(reason) => reason,
                    _ => DropReason::ServerError("subscription driver stopped".to_string()),
                };
            }
        }
    }

    /// Stop delivery, settle outstanding dispositions and leave the group.
    ///
    /// Events handed out but not yet settled are redelivered by the store.
    pub async fn close(mut self) -> Result<()> {
        self.shutdown().await
    }

    /// Blocking form of [`PersistentSubscription::close`].
    ///
    /// Called from this subscription's own handler, it only requests the
    /// close; the subscriber detaches once the handler returns.
    pub fn close_blocking(mut self) -> Result<()> {
        if is_worker_thread() {
            return Err(ClientError::BlockingInWorker("close_subscription"));
        }
        if thread::current().id() == self.delivery_thread {
            self.request_close();
            return Ok(());
        }
        futures::executor::block_on(self.shutdown())
    }

    fn request_close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.request_close();
        if let Some(driver) = self.driver.take() {
            driver
                .await
                .map_err(|e| ClientError::SubscriptionDropped(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for PersistentSubscription {
    fn drop(&mut self) {
        self.request_close();
    }
}

/// Pool-side half of a subscriber.
struct Driver {
    stream: String,
    group: String,
    channel: SubscriptionChannel,
    deliveries: mpsc::Sender<Delivery>,
    dispositions: mpsc::UnboundedReceiver<(Uuid, Disposition)>,
    state: watch::Sender<SubscriptionState>,
    stop: Arc<AtomicBool>,
    outstanding: usize,
}

impl Driver {
    async fn run(mut self, mut close: oneshot::Receiver<()>) {
        let reason = loop {
            tokio::select! {
                _ = &mut close => break DropReason::UserInitiated,
                message = self.channel.messages.recv() => match message {
                    Some(PushMessage::Event(delivery)) => {
                        self.outstanding += 1;
                        self.publish_state();
                        if self.deliveries.send(delivery).await.is_err() {
                            break DropReason::ServerError("delivery thread stopped".to_string());
                        }
                    }
                    Some(PushMessage::Dropped(reason)) => break reason,
                    None => break DropReason::ConnectionClosed,
                },
                Some((event_id, disposition)) = self.dispositions.recv() => {
                    self.settle(event_id, disposition).await;
                }
            }
        };

        // Stop the handler thread, then flush whatever it already decided.
        self.stop.store(true, Ordering::Release);
        let Driver {
            stream,
            group,
            channel,
            deliveries,
            mut dispositions,
            state,
            ..
        } = self;
        drop(deliveries);
        while let Some((event_id, disposition)) = dispositions.recv().await {
            settle(channel.acker.as_ref(), &stream, &group, event_id, disposition).await;
        }

        if let Err(e) = channel.acker.close().await {
            debug!(stream = %stream, group = %group, error = %e, "Close after detach failed");
        }
        info!(stream = %stream, group = %group, reason = %reason, "Subscription detached");
        state.send_replace(SubscriptionState::Detached(reason));
    }

    async fn settle(&mut self, event_id: Uuid, disposition: Disposition) {
        settle(
            self.channel.acker.as_ref(),
            &self.stream,
            &self.group,
            event_id,
            disposition,
        )
        .await;
        self.outstanding = self.outstanding.saturating_sub(1);
        self.publish_state();
    }

    fn publish_state(&self) {
        let next = if self.outstanding > 0 {
            SubscriptionState::Delivering
        } else {
            SubscriptionState::Active
        };
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn settle(
    acker: &dyn SubscriptionAcker,
    stream: &str,
    group: &str,
    event_id: Uuid,
    disposition: Disposition,
) {
    let result = match &disposition {
        Disposition::Ack => acker.ack(&[event_id]).await,
        Disposition::Retry(reason) => acker.nack(&[event_id], NackAction::Retry, reason).await,
        Disposition::Park(reason) => acker.nack(&[event_id], NackAction::Park, reason).await,
        Disposition::Skip => acker.nack(&[event_id], NackAction::Skip, "skipped").await,
    };
    if let Err(e) = result {
        warn!(
            stream = %stream,
            group = %group,
            event_id = %event_id,
            disposition = ?disposition,
            error = %e,
            "Failed to settle delivery"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InMemoryStore;
    use crate::event::{Event, ExpectedVersion};
    use serde_json::json;
    use std::time::Duration;

    fn manager(store: &InMemoryStore) -> PersistentSubscriptions {
        PersistentSubscriptions::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_delete_missing_group_is_not_found() {
        let store = InMemoryStore::new();
        let removal = manager(&store).delete("s", "g").await.unwrap();
        assert!(removal.is_not_found());
    }

    #[tokio::test]
    async fn test_empty_names_rejected() {
        let store = InMemoryStore::new();
        let subs = manager(&store);
        let settings = SubscriptionSettings::default();
        assert!(subs.create("", "g", &settings).await.unwrap_err().is_invalid_argument());
        assert!(subs.create("s", "", &settings).await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn test_zero_buffer_rejected_before_connecting() {
        let store = InMemoryStore::new();
        let err = manager(&store)
            .subscribe(
                "s",
                "g",
                |_ctx: &DeliveryContext| Disposition::Ack,
                SubscribeOptions::with_buffer_size(0),
            )
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_acks_and_closes() {
        let store = InMemoryStore::new();
        let subs = manager(&store);
        subs.create(
            "s",
            "g",
            &SubscriptionSettings::default().start_from_beginning(),
        )
        .await
        .unwrap();
        store
            .append("s", ExpectedVersion::Any, vec![Event::new("A", json!({}))])
            .await
            .unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let subscription = subs
            .subscribe(
                "s",
                "g",
                auto_ack(move |ctx| {
                    let _ = seen_tx.send(ctx.event.event_type.clone());
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("A"));

        subscription.close().await.unwrap();
        let info = store.group_info("s", "g").await.unwrap();
        assert_eq!(info.subscribers, 0);
        assert_eq!(info.in_flight, 0);
        assert_eq!(info.retry_queue, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_group_deletion_detaches_subscriber() {
        let store = InMemoryStore::new();
        let subs = manager(&store);
        subs.create("s", "g", &SubscriptionSettings::default())
            .await
            .unwrap();
        let subscription = subs
            .subscribe(
                "s",
                "g",
                |_ctx: &DeliveryContext| Disposition::Ack,
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Active);

        assert!(subs.delete("s", "g").await.unwrap().is_removed());
        let reason = tokio::time::timeout(Duration::from_secs(2), subscription.wait_detached())
            .await
            .unwrap();
        assert_eq!(reason, DropReason::SubscriptionDeleted);
        assert!(subscription.state().is_detached());
    }
}
