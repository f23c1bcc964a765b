//! EventStoreDB implementation of `StoreConnection`.
//!
//! Thin mapping onto the `eventstore` gRPC client. Persistent subscriptions
//! are owned by a spawned task that forwards pushed events to the
//! subscriber channel and applies acks and nacks sent back to it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use eventstore::{
    AppendToStreamOptions, Client, ClientSettings, DeleteStreamOptions, EventData,
    ExpectedRevision, NakAction, PersistentSubscriptionEvent, PersistentSubscriptionOptions,
    ReadAllOptions,
    ReadStreamOptions, RecordedEvent, ResolvedEvent, StreamPosition as EsStreamPosition,
    SubscribeToPersistentSubscriptionOptions, SystemConsumerStrategy, TombstoneStreamOptions,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AllSlice, Delivery, DropReason, NackAction, PushMessage, StoreConnection, StreamSlice,
    SubscriptionAcker, SubscriptionChannel,
};
use crate::error::{ClientError, Result};
use crate::event::{
    DeleteResult, Event, ExpectedVersion, Position, ReadDirection, StreamPosition, WriteResult,
};
use crate::subscription::{ConsumerStrategy, StartFrom, SubscriptionSettings};

/// gRPC connection to an EventStoreDB node.
pub struct EventStoreDbConnection {
    client: Client,
}

impl EventStoreDbConnection {
    /// Connect using an `esdb://` connection string.
    pub fn new(connection_string: &str) -> Result<Self> {
        let settings = connection_string
            .parse::<ClientSettings>()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let client = Client::new(settings).map_err(|e| ClientError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Build a connection and confirm the node answers a one-event read.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let connection = Self::new(connection_string)?;
        connection
            .read_all(Position::END, 1, ReadDirection::Backward, false)
            .await?;
        info!("EventStoreDB node reachable");
        Ok(connection)
    }
}

fn expected_revision(expected: ExpectedVersion) -> ExpectedRevision {
    match expected {
        ExpectedVersion::Any => ExpectedRevision::Any,
        ExpectedVersion::NoStream => ExpectedRevision::NoStream,
        ExpectedVersion::StreamExists => ExpectedRevision::StreamExists,
        ExpectedVersion::Exact(revision) => ExpectedRevision::Exact(revision),
    }
}

fn position(position: eventstore::Position) -> Position {
    Position::new(position.commit, position.prepare)
}

fn map_error(stream: &str, expected: ExpectedVersion, err: eventstore::Error) -> ClientError {
    match err {
        eventstore::Error::WrongExpectedVersion { current, .. } => {
            ClientError::ConcurrencyConflict {
                stream: stream.to_string(),
                expected,
                current: match current {
                    eventstore::CurrentRevision::Current(revision) => Some(revision),
                    eventstore::CurrentRevision::NoStream => None,
                },
            }
        }
        eventstore::Error::ResourceNotFound => ClientError::StreamNotFound(stream.to_string()),
        eventstore::Error::ResourceDeleted => ClientError::StreamDeleted(stream.to_string()),
        eventstore::Error::DeadlineExceeded => ClientError::Timeout(stream.to_string()),
        other => ClientError::Connection(other.to_string()),
    }
}

fn map_group_error(stream: &str, group: &str, err: eventstore::Error) -> ClientError {
    match err {
        eventstore::Error::ResourceNotFound => ClientError::SubscriptionNotFound {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        eventstore::Error::ResourceAlreadyExists => ClientError::AlreadyExists {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        // The node reports a full group as an unmapped status; the limit
        // itself is not part of the reply.
        eventstore::Error::Grpc { ref message, .. } if is_group_full(message) => {
            ClientError::MaximumSubscribersReached {
                stream: stream.to_string(),
                group: group.to_string(),
                max: 0,
            }
        }
        other => ClientError::Connection(other.to_string()),
    }
}

fn is_group_full(message: &str) -> bool {
    message.to_ascii_lowercase().contains("maximum subscribers")
}

fn recorded(event: &RecordedEvent) -> Result<Event> {
    let payload = if event.is_json {
        serde_json::from_slice(&event.data)?
    } else {
        serde_json::Value::String(String::from_utf8_lossy(&event.data).into_owned())
    };
    Ok(Event::new(event.event_type.clone(), payload)
        .with_id(event.id)
        .with_stream(event.stream_id.clone())
        .recorded(event.revision, position(event.position), event.created))
}

/// Pick the event a read returns. Unresolvable links are dropped when
/// resolution was requested.
fn read_event(resolved: &ResolvedEvent, resolve_links: bool) -> Result<Option<Event>> {
    match (&resolved.event, &resolved.link) {
        (Some(event), _) => recorded(event).map(Some),
        (None, Some(link)) if !resolve_links => recorded(link).map(Some),
        _ => Ok(None),
    }
}

fn subscription_options(settings: &SubscriptionSettings) -> PersistentSubscriptionOptions {
    let start = match settings.start_from {
        StartFrom::Beginning => EsStreamPosition::Start,
        StartFrom::Current => EsStreamPosition::End,
        StartFrom::Revision(revision) => EsStreamPosition::Position(revision),
    };
    let strategy = match settings.consumer_strategy {
        ConsumerStrategy::RoundRobin => SystemConsumerStrategy::RoundRobin,
        ConsumerStrategy::DispatchToSingle => SystemConsumerStrategy::DispatchToSingle,
        ConsumerStrategy::Pinned => SystemConsumerStrategy::Pinned,
    };
    PersistentSubscriptionOptions::default()
        .start_from(start)
        .resolve_link_tos(settings.resolve_link_tos)
        .extra_statistics(settings.extra_statistics)
        .history_buffer_size(clamp_i32(settings.history_buffer_size))
        .live_buffer_size(clamp_i32(settings.live_buffer_size))
        .read_batch_size(clamp_i32(settings.read_batch_size))
        .checkpoint_lower_bound(clamp_i32(settings.min_checkpoint_count))
        .checkpoint_upper_bound(clamp_i32(settings.max_checkpoint_count))
        .checkpoint_after(settings.checkpoint_after)
        .max_retry_count(clamp_i32(settings.max_retry_count))
        .max_subscriber_count(clamp_i32(settings.max_subscriber_count))
        .message_timeout(settings.message_timeout)
        .consumer_strategy_name(strategy)
}

/// Group settings travel as `i32` on the wire.
fn clamp_i32<T: TryInto<i32>>(value: T) -> i32 {
    value.try_into().unwrap_or(i32::MAX)
}

#[async_trait]
impl StoreConnection for EventStoreDbConnection {
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<Event>,
    ) -> Result<WriteResult> {
        if events.is_empty() {
            return Err(ClientError::InvalidArgument(
                "append requires at least one event".to_string(),
            ));
        }
        let data = events
            .iter()
            .map(|event| {
                EventData::json(event.event_type.clone(), &event.payload)
                    .map(|data| data.id(event.event_id))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let options = AppendToStreamOptions::default().expected_revision(expected_revision(expected));
        let result = self
            .client
            .append_to_stream(stream, &options, data)
            .await
            .map_err(|e| map_error(stream, expected, e))?;

        Ok(WriteResult {
            next_expected_version: result.next_expected_version,
            log_position: position(result.position),
        })
    }

    async fn read_stream(
        &self,
        stream: &str,
        from: StreamPosition,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> Result<StreamSlice> {
        let start = match from {
            StreamPosition::Start => EsStreamPosition::Start,
            StreamPosition::End => EsStreamPosition::End,
            StreamPosition::At(revision) => EsStreamPosition::Position(revision),
        };
        let mut options = ReadStreamOptions::default().position(start).max_count(count);
        options = match direction {
            ReadDirection::Forward => options.forwards(),
            ReadDirection::Backward => options.backwards(),
        };
        if resolve_links {
            options = options.resolve_link_tos();
        }

        let mut reader = match self.client.read_stream(stream, &options).await {
            Ok(reader) => reader,
            Err(eventstore::Error::ResourceNotFound) => return Ok(StreamSlice::empty()),
            Err(e) => return Err(map_error(stream, ExpectedVersion::Any, e)),
        };

        let mut events = Vec::new();
        let mut received = 0usize;
        let mut last_revision = None;
        loop {
            match reader.next().await {
                Ok(Some(resolved)) => {
                    received += 1;
                    last_revision = Some(resolved.get_original_event().revision);
                    if let Some(event) = read_event(&resolved, resolve_links)? {
                        events.push(event);
                    }
                }
                Ok(None) => break,
                Err(eventstore::Error::ResourceNotFound) => return Ok(StreamSlice::empty()),
                Err(e) => return Err(map_error(stream, ExpectedVersion::Any, e)),
            }
        }

        let is_end_of_stream = received < count;
        let next_revision = match (is_end_of_stream, last_revision, direction) {
            (false, Some(last), ReadDirection::Forward) => Some(last + 1),
            (false, Some(last), ReadDirection::Backward) => last.checked_sub(1),
            _ => None,
        };
        Ok(StreamSlice {
            events,
            next_revision,
            is_end_of_stream: is_end_of_stream || next_revision.is_none(),
        })
    }

    async fn read_all(
        &self,
        from: Position,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> Result<AllSlice> {
        let start = if from == Position::START {
            EsStreamPosition::Start
        } else if from == Position::END {
            EsStreamPosition::End
        } else {
            EsStreamPosition::Position(eventstore::Position {
                commit: from.commit,
                prepare: from.prepare,
            })
        };
        let mut options = ReadAllOptions::default().position(start).max_count(count);
        options = match direction {
            ReadDirection::Forward => options.forwards(),
            ReadDirection::Backward => options.backwards(),
        };
        if resolve_links {
            options = options.resolve_link_tos();
        }

        let mut reader = self
            .client
            .read_all(&options)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let mut events = Vec::new();
        let mut received = 0usize;
        let mut next_position = from;
        while let Some(resolved) = reader
            .next()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?
        {
            received += 1;
            let original = position(resolved.get_original_event().position);
            next_position = match direction {
                ReadDirection::Forward => Position::new(original.commit + 1, original.prepare + 1),
                ReadDirection::Backward => original,
            };
            if let Some(event) = read_event(&resolved, resolve_links)? {
                events.push(event);
            }
        }

        Ok(AllSlice {
            events,
            next_position,
            is_end_of_stream: received < count,
        })
    }

    async fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard: bool,
    ) -> Result<DeleteResult> {
        let revision = expected_revision(expected);
        let result = if hard {
            let options = TombstoneStreamOptions::default().expected_revision(revision);
            self.client.tombstone_stream(stream, &options).await
        } else {
            let options = DeleteStreamOptions::default().expected_revision(revision);
            self.client.delete_stream(stream, &options).await
        };
        let log_position = result
            .map_err(|e| map_error(stream, expected, e))?
            .map(position)
            .unwrap_or(Position::START);
        info!(stream = %stream, hard, "Deleted stream");
        Ok(DeleteResult { log_position })
    }

    async fn create_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        self.client
            .create_persistent_subscription(stream, group, &subscription_options(settings))
            .await
            .map_err(|e| map_group_error(stream, group, e))
    }

    async fn update_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        self.client
            .update_persistent_subscription(stream, group, &subscription_options(settings))
            .await
            .map_err(|e| map_group_error(stream, group, e))
    }

    async fn delete_subscription(&self, stream: &str, group: &str) -> Result<()> {
        self.client
            .delete_persistent_subscription(stream, group, &Default::default())
            .await
            .map_err(|e| map_group_error(stream, group, e))
    }

    async fn connect_subscription(
        &self,
        stream: &str,
        group: &str,
        buffer_size: usize,
    ) -> Result<SubscriptionChannel> {
        let options = SubscribeToPersistentSubscriptionOptions::default().buffer_size(buffer_size);
        let subscription = self
            .client
            .subscribe_to_persistent_subscription(stream, group, &options)
            .await
            .map_err(|e| map_group_error(stream, group, e))?;

        let (events_tx, events_rx) = mpsc::channel(buffer_size + 1);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_subscription(subscription, events_tx, commands_rx));

        info!(stream = %stream, group = %group, buffer_size, "Subscriber connected");
        Ok(SubscriptionChannel {
            subscription_id: format!("{}::{}", stream, group),
            messages: events_rx,
            acker: Arc::new(EventStoreDbAcker {
                commands: commands_tx,
            }),
        })
    }
}

enum Command {
    Ack(Vec<Uuid>, oneshot::Sender<Result<()>>),
    Nack(Vec<Uuid>, NackAction, String, oneshot::Sender<Result<()>>),
    Close,
}

async fn run_subscription(
    mut subscription: eventstore::PersistentSubscription,
    events: mpsc::Sender<PushMessage>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Ack(ids, reply)) => {
                    let result = subscription
                        .ack_ids(ids)
                        .await
                        .map_err(|e| ClientError::Connection(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(Command::Nack(ids, action, reason, reply)) => {
                    let action = match action {
                        NackAction::Retry => NakAction::Retry,
                        NackAction::Park => NakAction::Park,
                        NackAction::Skip => NakAction::Skip,
                    };
                    let result = subscription
                        .nack_ids(ids, action, reason)
                        .await
                        .map_err(|e| ClientError::Connection(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(Command::Close) | None => {
                    debug!("Persistent subscription closed by subscriber");
                    break;
                }
            },
            next = subscription.next_subscription_event() => match next {
                Ok(PersistentSubscriptionEvent::Confirmed(id)) => {
                    debug!(subscription_id = %id, "Persistent subscription confirmed");
                }
                Ok(PersistentSubscriptionEvent::EventAppeared { event: resolved, retry_count }) => {
                    let delivery = match delivery(&resolved, retry_count) {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            warn!(error = %e, "Undecodable event, parking");
                            let _ = subscription
                                .nack(resolved, NakAction::Park, e.to_string())
                                .await;
                            continue;
                        }
                    };
                    if events.send(PushMessage::Event(delivery)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let reason = match e {
                        eventstore::Error::ResourceDeleted | eventstore::Error::ResourceNotFound => {
                            DropReason::SubscriptionDeleted
                        }
                        other => DropReason::ServerError(other.to_string()),
                    };
                    let _ = events.send(PushMessage::Dropped(reason)).await;
                    break;
                }
            }
        }
    }
}

fn delivery(resolved: &ResolvedEvent, retry_count: usize) -> Result<Delivery> {
    let event = match (&resolved.event, &resolved.link) {
        (Some(event), _) => recorded(event)?,
        (None, Some(link)) => recorded(link)?,
        (None, None) => {
            return Err(ClientError::MalformedInput(
                "pushed event has no payload".to_string(),
            ))
        }
    };
    let link = match (&resolved.event, &resolved.link) {
        (Some(_), Some(link)) => Some(recorded(link)?),
        _ => None,
    };
    Ok(Delivery {
        event,
        link,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        deadline: None::<Instant>,
    })
}

struct EventStoreDbAcker {
    commands: mpsc::UnboundedSender<Command>,
}

impl EventStoreDbAcker {
    fn closed() -> ClientError {
        ClientError::SubscriptionDropped("persistent subscription task ended".to_string())
    }
}

#[async_trait]
impl SubscriptionAcker for EventStoreDbAcker {
    async fn ack(&self, event_ids: &[Uuid]) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Ack(event_ids.to_vec(), reply))
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())?
    }

    async fn nack(&self, event_ids: &[Uuid], action: NackAction, reason: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Nack(
                event_ids.to_vec(),
                action,
                reason.to_string(),
                reply,
            ))
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())?
    }

    async fn close(&self) -> Result<()> {
        let _ = self.commands.send(Command::Close);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_group_settings_reach_server_options() {
        let settings = SubscriptionSettings::default()
            .with_resolve_link_tos(true)
            .with_extra_statistics(true)
            .with_history_buffer_size(20)
            .with_checkpoint_counts(10, 1000)
            .with_checkpoint_after(Duration::from_secs(2))
            .with_max_retry_count(500)
            .with_max_subscriber_count(5)
            .start_from_revision(7)
            .with_consumer_strategy(ConsumerStrategy::Pinned);

        let mut options = subscription_options(&settings);
        let setts = options.settings_mut();
        assert!(setts.resolve_link_tos);
        assert!(setts.extra_statistics);
        assert_eq!(setts.history_buffer_size, 20);
        assert_eq!(setts.checkpoint_lower_bound, 10);
        assert_eq!(setts.checkpoint_upper_bound, 1000);
        assert_eq!(setts.checkpoint_after, Duration::from_secs(2));
        assert_eq!(setts.max_retry_count, 500);
        assert_eq!(setts.max_subscriber_count, 5);
        assert_eq!(setts.start_from, EsStreamPosition::Position(7));
        assert_eq!(setts.consumer_strategy_name, SystemConsumerStrategy::Pinned);
    }

    #[test]
    fn test_oversized_counts_saturate() {
        assert_eq!(clamp_i32(usize::MAX), i32::MAX);
        assert_eq!(clamp_i32(u32::MAX), i32::MAX);
        assert_eq!(clamp_i32(42usize), 42);
    }

    #[test]
    fn test_expected_version_mapping() {
        assert_eq!(expected_revision(ExpectedVersion::Any), ExpectedRevision::Any);
        assert_eq!(expected_revision(ExpectedVersion::NoStream), ExpectedRevision::NoStream);
        assert_eq!(expected_revision(ExpectedVersion::Exact(3)), ExpectedRevision::Exact(3));
    }

    #[test]
    fn test_full_group_maps_to_subscriber_limit() {
        let err = map_group_error("s", "g", eventstore::Error::ResourceAlreadyExists);
        assert!(matches!(err, ClientError::AlreadyExists { .. }));

        let err = map_group_error("s", "g", eventstore::Error::ResourceNotFound);
        assert!(matches!(err, ClientError::SubscriptionNotFound { .. }));

        assert!(is_group_full("Maximum subscribers reached"));
        assert!(!is_group_full("connection reset"));
    }
}
