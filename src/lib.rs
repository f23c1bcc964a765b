//! esclient - event store client
//!
//! Writes batches of events into named streams, reads them back per stream
//! or over the global log, and runs persistent subscriptions: durable,
//! server-tracked consumer groups that push events to a handler and expect
//! an acknowledgement for each.
//!
//! Stores are reached through the [`connection::StoreConnection`] seam. An
//! in-process [`connection::InMemoryStore`] is always available; the
//! `eventstoredb` feature adds a gRPC transport.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod eraser;
pub mod error;
pub mod event;
pub mod reader;
pub mod runtime;
pub mod subscription;
pub mod utils;
pub mod writer;

pub use client::{Client, ClientSettings, Credentials, Transport};
pub use connection::{DropReason, InMemoryStore, StoreConnection};
pub use error::{ClientError, Removal, Result};
pub use event::{
    DeleteResult, Event, ExpectedVersion, Position, ReadDirection, StreamPosition, WriteResult,
};
pub use reader::{EventStream, ReadOptions};
pub use runtime::Pending;
pub use subscription::{
    auto_ack, ConsumerStrategy, DeliveryContext, DeliveryHandler, Disposition,
    PersistentSubscription, StartFrom, SubscribeOptions, SubscriptionSettings, SubscriptionState,
};
