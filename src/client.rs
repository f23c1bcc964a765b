//! Client facade.
//!
//! `Client` composes the writer, reader, eraser and subscription manager
//! behind one store connection and one worker pool. Every operation comes
//! in two forms:
//!
//! - `op(...)` spawns the work on the pool and returns a [`Pending`]
//! - `op_blocking(...)` waits for the same work on the caller's thread
//!
//! Blocking forms fail fast with `ClientError::BlockingInWorker` when called
//! from a pool thread. Subscription handlers run on their own delivery
//! threads and may use them freely.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, info_span, Instrument, Span};

use crate::connection::{InMemoryStore, StoreConnection};
use crate::error::{ClientError, Removal, Result};
use crate::eraser::StreamEraser;
use crate::event::{DeleteResult, Event, ExpectedVersion, Position, StreamPosition, WriteResult};
use crate::reader::{self, EventStream, ReadOptions, StreamReader};
use crate::runtime::{is_worker_thread, Pending, WorkerPool, DEFAULT_WORKER_THREADS};
use crate::subscription::{
    DeliveryHandler, PersistentSubscription, PersistentSubscriptions, SubscribeOptions,
    SubscriptionSettings, DEFAULT_SUBSCRIBER_BUFFER,
};
#[cfg(feature = "eventstoredb")]
use crate::utils::bootstrap::connect_with_retry;
use crate::writer::StreamWriter;

/// Store user credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("admin", "changeit")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Which store the client talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// In-process store.
    #[default]
    Memory,
    /// EventStoreDB node over gRPC. Requires the `eventstoredb` feature.
    EventStoreDb,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Memory => write!(f, "memory"),
            Transport::EventStoreDb => write!(f, "eventstoredb"),
        }
    }
}

/// Connection and runtime parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub tls: bool,
    /// Retries after the first failed connection attempt.
    pub connect_retries: usize,
    pub worker_threads: usize,
    /// Batch size used by the facade's collecting reads.
    pub read_batch_size: usize,
    /// Buffer size used by [`Client::subscribe`].
    pub subscription_buffer_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            transport: Transport::Memory,
            host: "127.0.0.1".to_string(),
            port: 1113,
            credentials: Credentials::default(),
            tls: false,
            connect_retries: 30,
            worker_threads: DEFAULT_WORKER_THREADS,
            read_batch_size: reader::MAX_BATCH_SIZE,
            subscription_buffer_size: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl ClientSettings {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `esdb://` connection string for the EventStoreDB transport.
    pub fn connection_string(&self) -> String {
        format!(
            "esdb://{}:{}@{}:{}?tls={}",
            self.credentials.username,
            self.credentials.password,
            self.host,
            self.port,
            self.tls
        )
    }

    /// Read options applied by the facade's collecting reads.
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions::default().with_batch_size(self.read_batch_size)
    }
}

async fn open_transport(settings: ClientSettings) -> Result<Arc<dyn StoreConnection>> {
    match settings.transport {
        Transport::Memory => Ok(Arc::new(InMemoryStore::new())),
        Transport::EventStoreDb => open_eventstoredb(&settings).await,
    }
}

#[cfg(feature = "eventstoredb")]
async fn open_eventstoredb(settings: &ClientSettings) -> Result<Arc<dyn StoreConnection>> {
    use crate::connection::EventStoreDbConnection;

    let connection_string = settings.connection_string();
    let connection = connect_with_retry(
        "eventstoredb",
        &settings.address(),
        settings.connect_retries,
        || {
            let connection_string = connection_string.clone();
            async move { EventStoreDbConnection::connect(&connection_string).await }
        },
    )
    .await?;
    Ok(Arc::new(connection))
}

#[cfg(not(feature = "eventstoredb"))]
async fn open_eventstoredb(_settings: &ClientSettings) -> Result<Arc<dyn StoreConnection>> {
    Err(ClientError::Config(
        "transport 'eventstoredb' requires the eventstoredb feature".to_string(),
    ))
}

fn ensure_blocking_allowed(operation: &'static str) -> Result<()> {
    if is_worker_thread() {
        return Err(ClientError::BlockingInWorker(operation));
    }
    Ok(())
}

/// Event store client.
///
/// Cheap to clone; clones share the connection and the worker pool. The
/// pool shuts down when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    connection: Arc<dyn StoreConnection>,
    settings: ClientSettings,
    pool: Arc<WorkerPool>,
    writer: StreamWriter,
    reader: StreamReader,
    eraser: StreamEraser,
    subscriptions: PersistentSubscriptions,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.settings.transport)
            .field("address", &self.settings.address())
            .field("credentials", &self.settings.credentials)
            .finish()
    }
}

impl Client {
    /// Open the configured transport, retrying connection failures.
    pub async fn connect(settings: ClientSettings) -> Result<Self> {
        let pool = WorkerPool::new(settings.worker_threads)?;
        let connection = pool.spawn(open_transport(settings.clone())).await?;
        Ok(Self::assemble(connection, settings, pool))
    }

    /// Blocking form of [`Client::connect`].
    pub fn connect_blocking(settings: ClientSettings) -> Result<Self> {
        ensure_blocking_allowed("connect")?;
        let pool = WorkerPool::new(settings.worker_threads)?;
        let connection = pool
            .spawn(open_transport(settings.clone()))
            .wait("connect")?;
        Ok(Self::assemble(connection, settings, pool))
    }

    /// Wrap an existing transport.
    pub fn with_connection(
        connection: Arc<dyn StoreConnection>,
        settings: ClientSettings,
    ) -> Result<Self> {
        let pool = WorkerPool::new(settings.worker_threads)?;
        Ok(Self::assemble(connection, settings, pool))
    }

    /// Standalone client over a fresh in-process store.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Arc::new(InMemoryStore::new()), ClientSettings::default())
    }

    fn assemble(
        connection: Arc<dyn StoreConnection>,
        settings: ClientSettings,
        pool: WorkerPool,
    ) -> Self {
        info!(
            transport = %settings.transport,
            address = %settings.address(),
            worker_threads = settings.worker_threads,
            "Client ready"
        );
        Self {
            writer: StreamWriter::new(connection.clone()),
            reader: StreamReader::new(connection.clone()),
            eraser: StreamEraser::new(connection.clone()),
            subscriptions: PersistentSubscriptions::new(connection.clone()),
            connection,
            settings,
            pool: Arc::new(pool),
        }
    }

    pub fn writer(&self) -> &StreamWriter {
        &self.writer
    }

    pub fn reader(&self) -> &StreamReader {
        &self.reader
    }

    pub fn eraser(&self) -> &StreamEraser {
        &self.eraser
    }

    pub fn subscriptions(&self) -> &PersistentSubscriptions {
        &self.subscriptions
    }

    pub fn connection(&self) -> &Arc<dyn StoreConnection> {
        &self.connection
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &Credentials {
        &self.settings.credentials
    }

    /// Run arbitrary work on the client's worker pool.
    pub fn spawn<T, F>(&self, future: F) -> Pending<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.pool.spawn(future)
    }

    fn submit<T, F>(&self, span: Span, future: F) -> Pending<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.pool.spawn(future.instrument(span))
    }

    fn collect(&self, span: Span, events: Result<EventStream>) -> Pending<Vec<Event>> {
        match events {
            Ok(events) => self.submit(span, reader::collect(events)),
            Err(e) => Pending::failed(e),
        }
    }

    // Writes

    /// Append `events` to `stream` under `expected`.
    pub fn append(
        &self,
        stream: &str,
        events: Vec<Event>,
        expected: ExpectedVersion,
    ) -> Pending<WriteResult> {
        let writer = self.writer.clone();
        let stream = stream.to_string();
        let span = info_span!("client.append", stream = %stream);
        self.submit(span, async move { writer.append(&stream, events, expected).await })
    }

    pub fn append_blocking(
        &self,
        stream: &str,
        events: Vec<Event>,
        expected: ExpectedVersion,
    ) -> Result<WriteResult> {
        ensure_blocking_allowed("append")?;
        self.append(stream, events, expected).wait("append")
    }

    // Reads

    /// Forward read of `stream` from `from_revision`, collected.
    pub fn read_forward(
        &self,
        stream: &str,
        from_revision: u64,
        options: &ReadOptions,
    ) -> Pending<Vec<Event>> {
        let span = info_span!("client.read_forward", stream = %stream);
        self.collect(span, self.reader.read_forward(stream, from_revision, options))
    }

    pub fn read_forward_blocking(
        &self,
        stream: &str,
        from_revision: u64,
        options: &ReadOptions,
    ) -> Result<Vec<Event>> {
        ensure_blocking_allowed("read_forward")?;
        self.read_forward(stream, from_revision, options)
            .wait("read_forward")
    }

    /// Backward read of `stream` from `from` inclusive, collected.
    pub fn read_backward(
        &self,
        stream: &str,
        from: StreamPosition,
        options: &ReadOptions,
    ) -> Pending<Vec<Event>> {
        let span = info_span!("client.read_backward", stream = %stream);
        self.collect(span, self.reader.read_backward(stream, from, options))
    }

    pub fn read_backward_blocking(
        &self,
        stream: &str,
        from: StreamPosition,
        options: &ReadOptions,
    ) -> Result<Vec<Event>> {
        ensure_blocking_allowed("read_backward")?;
        self.read_backward(stream, from, options)
            .wait("read_backward")
    }

    /// Forward read of the global log from `from` inclusive, collected.
    pub fn read_all_forward(&self, from: Position, options: &ReadOptions) -> Pending<Vec<Event>> {
        let span = info_span!("client.read_all_forward", from = %from);
        self.collect(span, self.reader.read_all_forward(from, options))
    }

    pub fn read_all_forward_blocking(
        &self,
        from: Position,
        options: &ReadOptions,
    ) -> Result<Vec<Event>> {
        ensure_blocking_allowed("read_all_forward")?;
        self.read_all_forward(from, options)
            .wait("read_all_forward")
    }

    /// Backward read of the global log strictly before `from`, collected.
    pub fn read_all_backward(&self, from: Position, options: &ReadOptions) -> Pending<Vec<Event>> {
        let span = info_span!("client.read_all_backward", from = %from);
        self.collect(span, self.reader.read_all_backward(from, options))
    }

    pub fn read_all_backward_blocking(
        &self,
        from: Position,
        options: &ReadOptions,
    ) -> Result<Vec<Event>> {
        ensure_blocking_allowed("read_all_backward")?;
        self.read_all_backward(from, options)
            .wait("read_all_backward")
    }

    /// Events of `stream` whose type contains `type_substring`, collected.
    pub fn read_filtered(&self, stream: &str, type_substring: &str) -> Pending<Vec<Event>> {
        let span = info_span!("client.read_filtered", stream = %stream, filter = %type_substring);
        self.collect(span, self.reader.read_filtered(stream, type_substring))
    }

    pub fn read_filtered_blocking(&self, stream: &str, type_substring: &str) -> Result<Vec<Event>> {
        ensure_blocking_allowed("read_filtered")?;
        self.read_filtered(stream, type_substring)
            .wait("read_filtered")
    }

    // Deletes

    /// Soft delete. A missing stream is `Removal::NotFound`.
    pub fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Pending<Removal<DeleteResult>> {
        let eraser = self.eraser.clone();
        let stream = stream.to_string();
        let span = info_span!("client.delete_stream", stream = %stream);
        self.submit(span, async move { eraser.delete(&stream, expected).await })
    }

    pub fn delete_stream_blocking(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<Removal<DeleteResult>> {
        ensure_blocking_allowed("delete_stream")?;
        self.delete_stream(stream, expected).wait("delete_stream")
    }

    /// Hard delete. The name can never be written again.
    pub fn tombstone_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Pending<Removal<DeleteResult>> {
        let eraser = self.eraser.clone();
        let stream = stream.to_string();
        let span = info_span!("client.tombstone_stream", stream = %stream);
        self.submit(span, async move { eraser.tombstone(&stream, expected).await })
    }

    pub fn tombstone_stream_blocking(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<Removal<DeleteResult>> {
        ensure_blocking_allowed("tombstone_stream")?;
        self.tombstone_stream(stream, expected)
            .wait("tombstone_stream")
    }

    // Subscriptions

    pub fn create_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: SubscriptionSettings,
    ) -> Pending<()> {
        let subscriptions = self.subscriptions.clone();
        let (stream, group) = (stream.to_string(), group.to_string());
        let span = info_span!("client.create_subscription", stream = %stream, group = %group);
        self.submit(span, async move {
            subscriptions.create(&stream, &group, &settings).await
        })
    }

    pub fn create_subscription_blocking(
        &self,
        stream: &str,
        group: &str,
        settings: SubscriptionSettings,
    ) -> Result<()> {
        ensure_blocking_allowed("create_subscription")?;
        self.create_subscription(stream, group, settings)
            .wait("create_subscription")
    }

    pub fn update_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: SubscriptionSettings,
    ) -> Pending<()> {
        let subscriptions = self.subscriptions.clone();
        let (stream, group) = (stream.to_string(), group.to_string());
        let span = info_span!("client.update_subscription", stream = %stream, group = %group);
        self.submit(span, async move {
            subscriptions.update(&stream, &group, &settings).await
        })
    }

    pub fn update_subscription_blocking(
        &self,
        stream: &str,
        group: &str,
        settings: SubscriptionSettings,
    ) -> Result<()> {
        ensure_blocking_allowed("update_subscription")?;
        self.update_subscription(stream, group, settings)
            .wait("update_subscription")
    }

    /// Delete a group. A missing group is `Removal::NotFound`.
    pub fn delete_subscription(&self, stream: &str, group: &str) -> Pending<Removal<()>> {
        let subscriptions = self.subscriptions.clone();
        let (stream, group) = (stream.to_string(), group.to_string());
        let span = info_span!("client.delete_subscription", stream = %stream, group = %group);
        self.submit(span, async move { subscriptions.delete(&stream, &group).await })
    }

    pub fn delete_subscription_blocking(&self, stream: &str, group: &str) -> Result<Removal<()>> {
        ensure_blocking_allowed("delete_subscription")?;
        self.delete_subscription(stream, group)
            .wait("delete_subscription")
    }

    /// Join a group with the client's default subscriber buffer.
    pub fn subscribe<H: DeliveryHandler>(
        &self,
        stream: &str,
        group: &str,
        handler: H,
    ) -> Pending<PersistentSubscription> {
        let options = SubscribeOptions::with_buffer_size(self.settings.subscription_buffer_size);
        self.subscribe_with(stream, group, handler, options)
    }

    pub fn subscribe_blocking<H: DeliveryHandler>(
        &self,
        stream: &str,
        group: &str,
        handler: H,
    ) -> Result<PersistentSubscription> {
        ensure_blocking_allowed("subscribe")?;
        self.subscribe(stream, group, handler).wait("subscribe")
    }

    /// Join a group with explicit options.
    pub fn subscribe_with<H: DeliveryHandler>(
        &self,
        stream: &str,
        group: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Pending<PersistentSubscription> {
        let subscriptions = self.subscriptions.clone();
        let (stream, group) = (stream.to_string(), group.to_string());
        let span = info_span!("client.subscribe", stream = %stream, group = %group);
        self.submit(span, async move {
            subscriptions
                .subscribe(&stream, &group, handler, options)
                .await
        })
    }

    pub fn subscribe_with_blocking<H: DeliveryHandler>(
        &self,
        stream: &str,
        group: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<PersistentSubscription> {
        ensure_blocking_allowed("subscribe")?;
        self.subscribe_with(stream, group, handler, options)
            .wait("subscribe")
    }
}
