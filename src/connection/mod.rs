//! Store connection interface.
//!
//! `StoreConnection` is the seam between the client components and a concrete
//! event store. Each method is exactly one round-trip to the store; batching,
//! validation and outcome mapping live in the components above it.
//!
//! Implementations:
//! - `InMemoryStore`: in-process store for standalone mode and tests
//! - `EventStoreDbConnection`: gRPC transport (feature `eventstoredb`)

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::event::{
    DeleteResult, Event, ExpectedVersion, Position, ReadDirection, StreamPosition, WriteResult,
};
use crate::subscription::SubscriptionSettings;

pub mod memory;

#[cfg(feature = "eventstoredb")]
pub mod eventstoredb;

pub use memory::InMemoryStore;

#[cfg(feature = "eventstoredb")]
pub use eventstoredb::EventStoreDbConnection;

/// One round-trip's worth of events from a single stream.
#[derive(Debug, Clone, Default)]
pub struct StreamSlice {
    /// Events in the requested direction.
    pub events: Vec<Event>,
    /// Revision to continue from, if the stream has more.
    pub next_revision: Option<u64>,
    /// True when no further events exist in the read direction.
    pub is_end_of_stream: bool,
}

impl StreamSlice {
    /// Slice for a stream that is absent or deleted.
    pub fn empty() -> Self {
        Self {
            events: Vec::new(),
            next_revision: None,
            is_end_of_stream: true,
        }
    }
}

/// One round-trip's worth of events from the global log.
#[derive(Debug, Clone)]
pub struct AllSlice {
    /// Events in the requested direction.
    pub events: Vec<Event>,
    /// Position to continue from.
    pub next_position: Position,
    /// True when no further events exist in the read direction.
    pub is_end_of_stream: bool,
}

/// How a subscriber rejects an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Redeliver, counting toward the retry limit.
    Retry,
    /// Park immediately.
    Park,
    /// Treat as handled without processing.
    Skip,
}

/// Why a subscription channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The subscriber closed the channel.
    UserInitiated,
    /// The connection to the store was lost.
    ConnectionClosed,
    /// The group was deleted.
    SubscriptionDeleted,
    /// The group's settings were replaced.
    SettingsChanged,
    /// The store reported an error.
    ServerError(String),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::UserInitiated => write!(f, "closed by subscriber"),
            DropReason::ConnectionClosed => write!(f, "connection closed"),
            DropReason::SubscriptionDeleted => write!(f, "subscription group deleted"),
            DropReason::SettingsChanged => write!(f, "subscription settings changed"),
            DropReason::ServerError(msg) => write!(f, "server error: {}", msg),
        }
    }
}

/// An event pushed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The event to process (the link target when links are resolved).
    pub event: Event,
    /// The link event, when `event` was reached through one.
    pub link: Option<Event>,
    /// Number of earlier delivery attempts.
    pub retry_count: u32,
    /// When the store will consider the delivery timed out.
    pub deadline: Option<Instant>,
}

impl Delivery {
    /// Id the store expects in acks and nacks.
    pub fn ack_id(&self) -> Uuid {
        self.link
            .as_ref()
            .map(|link| link.event_id)
            .unwrap_or(self.event.event_id)
    }
}

/// Message on a subscription channel.
#[derive(Debug, Clone)]
pub enum PushMessage {
    Event(Delivery),
    Dropped(DropReason),
}

/// Acknowledgement half of a subscription channel.
#[async_trait]
pub trait SubscriptionAcker: Send + Sync {
    /// Acknowledge processed events.
    async fn ack(&self, event_ids: &[Uuid]) -> Result<()>;

    /// Reject events.
    async fn nack(&self, event_ids: &[Uuid], action: NackAction, reason: &str) -> Result<()>;

    /// Leave the group. Un-acked events go back to the store for redelivery.
    async fn close(&self) -> Result<()>;
}

/// A connected persistent subscription.
pub struct SubscriptionChannel {
    /// Store-assigned subscriber id.
    pub subscription_id: String,
    /// Pushed events. Closing without a `Dropped` message means the
    /// connection was lost.
    pub messages: mpsc::Receiver<PushMessage>,
    /// Ack/nack/close handle.
    pub acker: Arc<dyn SubscriptionAcker>,
}

impl std::fmt::Debug for SubscriptionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionChannel")
            .field("subscription_id", &self.subscription_id)
            .finish_non_exhaustive()
    }
}

/// Interface to an event store.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Append events atomically under an expected-version check.
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<Event>,
    ) -> Result<WriteResult>;

    /// Read up to `count` events of one stream.
    ///
    /// A missing or deleted stream yields an empty end-of-stream slice.
    async fn read_stream(
        &self,
        stream: &str,
        from: StreamPosition,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> Result<StreamSlice>;

    /// Read up to `count` events of the global log.
    ///
    /// Forward reads start at `from` inclusive; backward reads return events
    /// strictly before `from`.
    async fn read_all(
        &self,
        from: Position,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> Result<AllSlice>;

    /// Delete a stream. `hard` tombstones it.
    ///
    /// Fails with `StreamNotFound` if the stream does not exist.
    async fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard: bool,
    ) -> Result<DeleteResult>;

    /// Create a persistent subscription group.
    async fn create_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()>;

    /// Replace a group's settings.
    async fn update_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()>;

    /// Delete a persistent subscription group.
    async fn delete_subscription(&self, stream: &str, group: &str) -> Result<()>;

    /// Join a group as a subscriber accepting up to `buffer_size` in-flight events.
    async fn connect_subscription(
        &self,
        stream: &str,
        group: &str,
        buffer_size: usize,
    ) -> Result<SubscriptionChannel>;
}
