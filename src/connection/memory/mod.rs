//! In-memory event store.
//!
//! Implements the whole `StoreConnection` contract in process: streams with
//! soft and hard deletion, a global log, link resolution, and persistent
//! subscription groups with retries, parking, checkpoints and ack timeouts.
//! Backs standalone mode and the test suites.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
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


type GroupKey = (String, String);

/// Internal appends produced while handling acks, nacks and timeouts.
type Writes = Vec<(String, Event)>;

/// Event type of checkpoint records.
pub const CHECKPOINT_EVENT_TYPE: &str = "$SubscriptionCheckpoint";

/// Stream receiving a group's checkpoints.
pub fn checkpoint_stream(stream: &str, group: &str) -> String {
    format!("$persistentsubscription-{}::{}-checkpoint", stream, group)
}

/// Stream receiving links to a group's parked events.
pub fn parked_stream(stream: &str, group: &str) -> String {
    format!("$persistentsubscription-{}::{}-parked", stream, group)
}

/// Snapshot of a subscription group's bookkeeping.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub settings: SubscriptionSettings,
    /// Highest revision below which every event has been resolved and recorded.
    pub checkpoint: Option<u64>,
    pub in_flight: usize,
    pub parked: u64,
    pub retry_queue: usize,
    pub subscribers: usize,
}

/// In-process event store.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every store operation fail with a connection error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Drop every subscriber of a group as if the connection was lost.
    ///
    /// Their un-acked events are requeued for redelivery. Returns how many
    /// subscribers were dropped.
    pub async fn disconnect_subscribers(&self, stream: &str, group: &str) -> usize {
        let mut guard = self.state.lock().await;
        let key = (stream.to_string(), group.to_string());
        let dropped = match guard.groups.get_mut(&key) {
            Some(group) => group.drop_subscribers(DropReason::ConnectionClosed),
            None => 0,
        };
        guard.pump_group(&key);
        dropped
    }

    /// Inspect a subscription group.
    pub async fn group_info(&self, stream: &str, group: &str) -> Option<GroupInfo> {
        let guard = self.state.lock().await;
        guard
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(GroupState::info)
    }
}

#[derive(Default)]
struct StoreState {
    log: Vec<Event>,
    streams: HashMap<String, StreamState>,
    groups: HashMap<GroupKey, GroupState>,
    next_subscriber_id: u64,
    unavailable: bool,
}

/// Per-stream index into the global log. Revision `n` is `entries[n]`.
#[derive(Default)]
struct StreamState {
    entries: Vec<usize>,
    truncate_before: u64,
    tombstoned: bool,
}

impl StreamState {
    fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Last visible revision, `None` if empty or deleted.
    fn last_revision(&self) -> Option<u64> {
        if self.len() > self.truncate_before {
            Some(self.len() - 1)
        } else {
            None
        }
    }
}

/// Read-only view used for lookups while a group is borrowed mutably.
struct View<'a> {
    log: &'a [Event],
    streams: &'a HashMap<String, StreamState>,
}

impl View<'_> {
    fn event(&self, stream: &str, revision: u64) -> Option<&Event> {
        let state = self.streams.get(stream)?;
        if state.tombstoned || revision < state.truncate_before {
            return None;
        }
        let index = *state.entries.get(revision as usize)?;
        self.log.get(index)
    }

    fn resolve(&self, link: &Event) -> Option<Event> {
        let (stream, revision) = link.link_target()?;
        self.event(stream, revision).cloned()
    }

    /// Clone events for a read result. Unresolvable links are dropped.
    fn materialize<'e>(
        &self,
        events: impl Iterator<Item = &'e Event>,
        resolve_links: bool,
    ) -> Vec<Event> {
        events
            .filter_map(|event| {
                if resolve_links && event.is_link() {
                    self.resolve(event)
                } else {
                    Some(event.clone())
                }
            })
            .collect()
    }
}

impl StoreState {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(ClientError::Connection("in-memory store unavailable".to_string()));
        }
        Ok(())
    }

    fn view(&self) -> View<'_> {
        View {
            log: &self.log,
            streams: &self.streams,
        }
    }

    /// Append one event unconditionally.
    fn write(&mut self, stream: &str, event: Event) -> (u64, Position) {
        let index = self.log.len();
        let position = Position::new(index as u64, index as u64);
        let state = self.streams.entry(stream.to_string()).or_default();
        let revision = state.len();
        state.entries.push(index);
        self.log
            .push(event.with_stream(stream).recorded(revision, position, Utc::now()));
        (revision, position)
    }

    /// Apply internal writes, then let groups on the touched streams pick them up.
    fn commit(&mut self, writes: Writes) {
        let mut touched: Vec<String> = Vec::new();
        for (stream, event) in writes {
            self.write(&stream, event);
            if !touched.contains(&stream) {
                touched.push(stream);
            }
        }
        for stream in touched {
            self.pump_stream(&stream);
        }
    }

    fn pump_stream(&mut self, stream: &str) {
        let StoreState {
            log,
            streams,
            groups,
            ..
        } = self;
        let view = View { log, streams };
        for ((group_stream, _), group) in groups.iter_mut() {
            if group_stream == stream {
                group.pump(&view);
            }
        }
    }

    fn pump_group(&mut self, key: &GroupKey) {
        let StoreState {
            log,
            streams,
            groups,
            ..
        } = self;
        if let Some(group) = groups.get_mut(key) {
            group.pump(&View { log, streams });
        }
    }

    fn append(
        &mut self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<Event>,
    ) -> Result<WriteResult> {
        if events.is_empty() {
            return Err(ClientError::InvalidArgument(
                "append requires at least one event".to_string(),
            ));
        }
        let (tombstoned, current) = self
            .streams
            .get(stream)
            .map(|s| (s.tombstoned, s.last_revision()))
            .unwrap_or((false, None));
        if tombstoned {
            return Err(ClientError::StreamDeleted(stream.to_string()));
        }
        if !expected.matches(current) {
            return Err(ClientError::ConcurrencyConflict {
                stream: stream.to_string(),
                expected,
                current,
            });
        }

        let mut result = WriteResult {
            next_expected_version: 0,
            log_position: Position::START,
        };
        for event in events {
            let (revision, position) = self.write(stream, event);
            result = WriteResult {
                next_expected_version: revision,
                log_position: position,
            };
        }
        self.pump_stream(stream);
        Ok(result)
    }

    fn read_stream(
        &self,
        stream: &str,
        from: StreamPosition,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> StreamSlice {
        let Some(state) = self.streams.get(stream) else {
            return StreamSlice::empty();
        };
        let Some(last) = state.last_revision() else {
            return StreamSlice::empty();
        };
        if state.tombstoned {
            return StreamSlice::empty();
        }
        let first = state.truncate_before;
        let count = count.max(1) as u64;

        let (revisions, next_revision, is_end_of_stream): (Vec<u64>, Option<u64>, bool) =
            match direction {
                ReadDirection::Forward => {
                    let start = match from {
                        StreamPosition::Start => first,
                        StreamPosition::End => last + 1,
                        StreamPosition::At(revision) => revision.max(first),
                    };
                    let stop = start.saturating_add(count).min(last + 1);
                    let is_end = stop > last;
                    let next = (!is_end).then_some(stop);
                    ((start..stop).collect(), next, is_end)
                }
                ReadDirection::Backward => {
                    let start = match from {
                        StreamPosition::Start => first,
                        StreamPosition::End => last,
                        StreamPosition::At(revision) => revision.min(last),
                    };
                    if start < first {
                        return StreamSlice::empty();
                    }
                    let stop = start.saturating_sub(count - 1).max(first);
                    let is_end = stop == first;
                    let next = (!is_end).then(|| stop - 1);
                    ((stop..=start).rev().collect(), next, is_end)
                }
            };

        let events = revisions
            .iter()
            .filter_map(|revision| state.entries.get(*revision as usize))
            .filter_map(|index| self.log.get(*index));

        StreamSlice {
            events: self.view().materialize(events, resolve_links),
            next_revision,
            is_end_of_stream,
        }
    }

    fn read_all(
        &self,
        from: Position,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> AllSlice {
        let len = self.log.len() as u64;
        let origin = from.commit.min(len);
        let count = count as u64;

        let (range, next, is_end): (Vec<u64>, u64, bool) = match direction {
            ReadDirection::Forward => {
                let stop = origin.saturating_add(count).min(len);
                ((origin..stop).collect(), stop, stop >= len)
            }
            ReadDirection::Backward => {
                let start = origin.saturating_sub(count);
                ((start..origin).rev().collect(), start, start == 0)
            }
        };

        let events = range.iter().filter_map(|index| self.log.get(*index as usize));
        AllSlice {
            events: self.view().materialize(events, resolve_links),
            next_position: Position::new(next, next),
            is_end_of_stream: is_end,
        }
    }

    fn delete_stream(
        &mut self,
        stream: &str,
        expected: ExpectedVersion,
        hard: bool,
    ) -> Result<DeleteResult> {
        // A hard delete tombstones the name even if nothing was ever written.
        let state = if hard {
            self.streams.entry(stream.to_string()).or_default()
        } else {
            self.streams
                .get_mut(stream)
                .ok_or_else(|| ClientError::StreamNotFound(stream.to_string()))?
        };
        if state.tombstoned {
            return Err(ClientError::StreamDeleted(stream.to_string()));
        }
        let current = state.last_revision();
        if current.is_none() && !hard {
            return Err(ClientError::StreamNotFound(stream.to_string()));
        }
        if !expected.matches(current) {
            return Err(ClientError::ConcurrencyConflict {
                stream: stream.to_string(),
                expected,
                current,
            });
        }

        state.truncate_before = state.len();
        state.tombstoned = hard;
        let marker = if hard {
            Event::new("$streamDeleted", json!({}))
        } else {
            Event::new("$metadata", json!({ "$tb": state.truncate_before }))
        };
        let (_, log_position) = self.write(&format!("$${}", stream), marker);
        info!(stream = %stream, hard, "Deleted stream");
        Ok(DeleteResult { log_position })
    }

    /// Run `f` against a group on behalf of a connected subscriber, then pump
    /// the group and commit whatever `f` wrote.
    fn with_subscriber<F>(&mut self, key: &GroupKey, subscriber_id: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut GroupState) -> Writes,
    {
        let writes = {
            let StoreState {
                log,
                streams,
                groups,
                ..
            } = self;
            let group = groups
                .get_mut(key)
                .filter(|group| group.has_subscriber(subscriber_id))
                .ok_or_else(|| {
                    ClientError::SubscriptionDropped(format!(
                        "subscriber {} is no longer connected to {}::{}",
                        subscriber_id, key.0, key.1
                    ))
                })?;
            let writes = f(group);
            group.pump(&View { log, streams });
            writes
        };
        self.commit(writes);
        Ok(())
    }

    /// Periodic maintenance for one group. Returns false once the ticking
    /// subscriber is gone.
    fn tick(&mut self, key: &GroupKey, subscriber_id: u64) -> bool {
        let (alive, writes) = {
            let StoreState {
                log,
                streams,
                groups,
                ..
            } = self;
            let Some(group) = groups.get_mut(key) else {
                return false;
            };
            group.prune_closed();
            let mut writes = group.expire(Instant::now());
            writes.extend(group.maybe_checkpoint());
            group.pump(&View { log, streams });
            (group.has_subscriber(subscriber_id), writes)
        };
        self.commit(writes);
        alive
    }
}

/// An event waiting for (re)delivery.
#[derive(Debug, Clone)]
struct Pending {
    /// Revision in the group's stream.
    revision: u64,
    event: Event,
    link: Option<Event>,
    retry_count: u32,
}

impl Pending {
    fn ack_id(&self) -> Uuid {
        self.link
            .as_ref()
            .map(|link| link.event_id)
            .unwrap_or(self.event.event_id)
    }

    fn pin_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.event.stream_id.hash(&mut hasher);
        hasher.finish()
    }
}

struct InFlight {
    pending: Pending,
    subscriber: u64,
    deadline: Instant,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<PushMessage>,
    buffer_size: usize,
    in_flight: usize,
}

impl Subscriber {
    fn has_capacity(&self) -> bool {
        self.in_flight < self.buffer_size
    }
}

struct GroupState {
    stream: String,
    group: String,
    settings: SubscriptionSettings,
    start: u64,
    /// Next stream revision to read into the buffer.
    cursor: u64,
    buffer: VecDeque<Pending>,
    retry: VecDeque<Pending>,
    in_flight: HashMap<Uuid, InFlight>,
    /// Resolved revisions at or above `contiguous`.
    resolved: BTreeSet<u64>,
    /// First revision not yet resolved.
    contiguous: u64,
    checkpoint: Option<u64>,
    since_checkpoint: usize,
    last_checkpoint_at: Instant,
    parked: u64,
    subscribers: Vec<Subscriber>,
    round_robin: usize,
}

impl GroupState {
    fn new(stream: &str, group: &str, settings: SubscriptionSettings, view: &View<'_>) -> Self {
        let (first, len) = view
            .streams
            .get(stream)
            .map(|s| (s.truncate_before, s.len()))
            .unwrap_or((0, 0));
        let start = match settings.start_from {
            StartFrom::Beginning => first,
            StartFrom::Current => len,
            StartFrom::Revision(revision) => revision,
        };
        Self {
            stream: stream.to_string(),
            group: group.to_string(),
            settings,
            start,
            cursor: start,
            buffer: VecDeque::new(),
            retry: VecDeque::new(),
            in_flight: HashMap::new(),
            resolved: BTreeSet::new(),
            contiguous: start,
            checkpoint: None,
            since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
            parked: 0,
            subscribers: Vec::new(),
            round_robin: 0,
        }
    }

    fn info(&self) -> GroupInfo {
        GroupInfo {
            settings: self.settings.clone(),
            checkpoint: self.checkpoint,
            in_flight: self.in_flight.len(),
            parked: self.parked,
            retry_queue: self.retry.len(),
            subscribers: self.subscribers.len(),
        }
    }

    fn has_subscriber(&self, id: u64) -> bool {
        self.subscribers.iter().any(|s| s.id == id)
    }

    fn resolve(&mut self, revision: u64) {
        self.resolved.insert(revision);
        while self.resolved.remove(&self.contiguous) {
            self.contiguous += 1;
        }
    }

    /// Pull events from the stream until the active buffer is full.
    fn refill(&mut self, view: &View<'_>) {
        let len = view.streams.get(&self.stream).map(StreamState::len).unwrap_or(0);
        let behind = len.saturating_sub(self.cursor);
        let capacity = if behind <= self.settings.read_batch_size as u64 {
            self.settings.live_buffer_size
        } else {
            self.settings.history_buffer_size
        };

        while self.buffer.len() < capacity && self.cursor < len {
            let revision = self.cursor;
            self.cursor += 1;
            let Some(event) = view.event(&self.stream, revision) else {
                self.resolve(revision);
                continue;
            };
            if self.settings.resolve_link_tos && event.is_link() {
                match view.resolve(event) {
                    Some(target) => self.buffer.push_back(Pending {
                        revision,
                        event: target,
                        link: Some(event.clone()),
                        retry_count: 0,
                    }),
                    None => {
                        debug!(stream = %self.stream, revision, "Skipping unresolvable link");
                        self.resolve(revision);
                    }
                }
            } else {
                self.buffer.push_back(Pending {
                    revision,
                    event: event.clone(),
                    link: None,
                    retry_count: 0,
                });
            }
        }
    }

    fn choose_subscriber(&mut self, pin_hash: u64) -> Option<usize> {
        let count = self.subscribers.len();
        if count == 0 {
            return None;
        }
        match self.settings.consumer_strategy {
            ConsumerStrategy::RoundRobin => {
                let index = (0..count)
                    .map(|offset| (self.round_robin + offset) % count)
                    .find(|&i| self.subscribers[i].has_capacity())?;
                self.round_robin = (index + 1) % count;
                Some(index)
            }
            ConsumerStrategy::DispatchToSingle => {
                self.subscribers.iter().position(Subscriber::has_capacity)
            }
            ConsumerStrategy::Pinned => {
                let index = (pin_hash % count as u64) as usize;
                self.subscribers[index].has_capacity().then_some(index)
            }
        }
    }

    /// Push as many pending events to subscribers as their buffers allow.
    fn pump(&mut self, view: &View<'_>) {
        loop {
            self.refill(view);
            let from_retry = !self.retry.is_empty();
            let next = if from_retry {
                self.retry.front()
            } else {
                self.buffer.front()
            };
            let Some(pin_hash) = next.map(Pending::pin_hash) else {
                break;
            };
            let Some(index) = self.choose_subscriber(pin_hash) else {
                break;
            };
            let popped = if from_retry {
                self.retry.pop_front()
            } else {
                self.buffer.pop_front()
            };
            let Some(pending) = popped else {
                break;
            };

            let deadline = Instant::now() + self.settings.message_timeout;
            let delivery = Delivery {
                event: pending.event.clone(),
                link: pending.link.clone(),
                retry_count: pending.retry_count,
                deadline: Some(deadline),
            };
            let subscriber = &mut self.subscribers[index];
            match subscriber.tx.try_send(PushMessage::Event(delivery)) {
                Ok(()) => {
                    subscriber.in_flight += 1;
                    let subscriber = subscriber.id;
                    self.in_flight.insert(
                        pending.ack_id(),
                        InFlight {
                            pending,
                            subscriber,
                            deadline,
                        },
                    );
                }
                Err(TrySendError::Full(_)) => {
                    self.put_back(pending, from_retry);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    let id = subscriber.id;
                    self.put_back(pending, from_retry);
                    self.remove_subscriber(id);
                }
            }
        }
    }

    fn put_back(&mut self, pending: Pending, to_retry: bool) {
        if to_retry {
            self.retry.push_front(pending);
        } else {
            self.buffer.push_front(pending);
        }
    }

    /// Remove a subscriber and requeue its un-acked events in revision order.
    fn remove_subscriber(&mut self, id: u64) -> Option<Subscriber> {
        let index = self.subscribers.iter().position(|s| s.id == id)?;
        let subscriber = self.subscribers.remove(index);

        let ids: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.subscriber == id)
            .map(|(event_id, _)| *event_id)
            .collect();
        let mut requeued: Vec<Pending> = ids
            .iter()
            .filter_map(|event_id| self.in_flight.remove(event_id))
            .map(|entry| entry.pending)
            .collect();
        requeued.sort_by_key(|pending| std::cmp::Reverse(pending.revision));
        for pending in requeued {
            self.retry.push_front(pending);
        }

        debug!(
            stream = %self.stream,
            group = %self.group,
            subscriber = id,
            "Removed subscriber"
        );
        Some(subscriber)
    }

    fn drop_subscribers(&mut self, reason: DropReason) -> usize {
        let ids: Vec<u64> = self.subscribers.iter().map(|s| s.id).collect();
        for id in &ids {
            if let Some(subscriber) = self.remove_subscriber(*id) {
                let _ = subscriber.tx.try_send(PushMessage::Dropped(reason.clone()));
            }
        }
        ids.len()
    }

    fn prune_closed(&mut self) {
        let closed: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|s| s.tx.is_closed())
            .map(|s| s.id)
            .collect();
        for id in closed {
            self.remove_subscriber(id);
        }
    }

    fn release(&mut self, subscriber_id: u64) {
        if let Some(subscriber) = self.subscribers.iter_mut().find(|s| s.id == subscriber_id) {
            subscriber.in_flight = subscriber.in_flight.saturating_sub(1);
        }
    }

    fn take_in_flight(&mut self, event_id: &Uuid) -> Option<Pending> {
        let entry = self.in_flight.remove(event_id)?;
        self.release(entry.subscriber);
        Some(entry.pending)
    }

    fn complete(&mut self, revision: u64) {
        self.resolve(revision);
        self.since_checkpoint += 1;
    }

    fn ack(&mut self, event_ids: &[Uuid]) -> Writes {
        for event_id in event_ids {
            match self.take_in_flight(event_id) {
                Some(pending) => self.complete(pending.revision),
                None => debug!(event_id = %event_id, "Ack for event not in flight"),
            }
        }
        self.maybe_checkpoint().into_iter().collect()
    }

    fn nack(&mut self, event_ids: &[Uuid], action: NackAction, reason: &str) -> Writes {
        let mut writes = Writes::new();
        for event_id in event_ids {
            let Some(pending) = self.take_in_flight(event_id) else {
                debug!(event_id = %event_id, "Nack for event not in flight");
                continue;
            };
            match action {
                NackAction::Retry => self.retry_or_park(pending, reason, &mut writes),
                NackAction::Park => self.park(pending, reason, &mut writes),
                NackAction::Skip => self.complete(pending.revision),
            }
        }
        writes.extend(self.maybe_checkpoint());
        writes
    }

    fn retry_or_park(&mut self, mut pending: Pending, reason: &str, writes: &mut Writes) {
        if pending.retry_count >= self.settings.max_retry_count {
            self.park(pending, reason, writes);
        } else {
            pending.retry_count += 1;
            self.retry.push_back(pending);
        }
    }

    fn park(&mut self, pending: Pending, reason: &str, writes: &mut Writes) {
        warn!(
            stream = %self.stream,
            group = %self.group,
            revision = pending.revision,
            retry_count = pending.retry_count,
            reason = %reason,
            "Parking event"
        );
        writes.push((
            parked_stream(&self.stream, &self.group),
            Event::link_to(&self.stream, pending.revision),
        ));
        self.parked += 1;
        self.complete(pending.revision);
    }

    /// Redeliver events whose ack deadline has passed.
    fn expire(&mut self, now: Instant) -> Writes {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(event_id, _)| *event_id)
            .collect();
        let mut writes = Writes::new();
        for event_id in expired {
            if let Some(pending) = self.take_in_flight(&event_id) {
                debug!(
                    stream = %self.stream,
                    group = %self.group,
                    revision = pending.revision,
                    "Ack timeout, redelivering"
                );
                self.retry_or_park(pending, "message timeout", &mut writes);
            }
        }
        writes
    }

    fn maybe_checkpoint(&mut self) -> Option<(String, Event)> {
        if self.since_checkpoint == 0 {
            return None;
        }
        let due = self.since_checkpoint >= self.settings.max_checkpoint_count
            || (self.since_checkpoint >= self.settings.min_checkpoint_count
                && self.last_checkpoint_at.elapsed() >= self.settings.checkpoint_after);
        if !due || self.contiguous <= self.start {
            return None;
        }
        let revision = self.contiguous - 1;
        self.since_checkpoint = 0;
        self.last_checkpoint_at = Instant::now();
        if self.checkpoint == Some(revision) {
            return None;
        }
        self.checkpoint = Some(revision);
        debug!(stream = %self.stream, group = %self.group, revision, "Checkpoint");
        Some((
            checkpoint_stream(&self.stream, &self.group),
            Event::new(CHECKPOINT_EVENT_TYPE, json!({ "revision": revision })),
        ))
    }
}

/// Ack handle for one subscriber of an in-memory group.
struct MemoryAcker {
    state: Weak<Mutex<StoreState>>,
    key: GroupKey,
    subscriber_id: u64,
}

impl MemoryAcker {
    fn store(&self) -> Result<Arc<Mutex<StoreState>>> {
        self.state
            .upgrade()
            .ok_or_else(|| ClientError::Connection("in-memory store dropped".to_string()))
    }
}

#[async_trait]
impl SubscriptionAcker for MemoryAcker {
    async fn ack(&self, event_ids: &[Uuid]) -> Result<()> {
        let store = self.store()?;
        let mut guard = store.lock().await;
        guard.with_subscriber(&self.key, self.subscriber_id, |group| group.ack(event_ids))
    }

    async fn nack(&self, event_ids: &[Uuid], action: NackAction, reason: &str) -> Result<()> {
        let store = self.store()?;
        let mut guard = store.lock().await;
        guard.with_subscriber(&self.key, self.subscriber_id, |group| {
            group.nack(event_ids, action, reason)
        })
    }

    async fn close(&self) -> Result<()> {
        let Ok(store) = self.store() else {
            return Ok(());
        };
        let mut guard = store.lock().await;
        if let Some(group) = guard.groups.get_mut(&self.key) {
            group.remove_subscriber(self.subscriber_id);
        }
        guard.pump_group(&self.key);
        Ok(())
    }
}

fn spawn_ticker(
    state: Weak<Mutex<StoreState>>,
    key: GroupKey,
    subscriber_id: u64,
    message_timeout: Duration,
) {
    let period = (message_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            let mut guard = state.lock().await;
            if !guard.tick(&key, subscriber_id) {
                break;
            }
        }
    });
}

#[async_trait]
impl StoreConnection for InMemoryStore {
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<Event>,
    ) -> Result<WriteResult> {
        let mut guard = self.state.lock().await;
        guard.check_available()?;
        let result = guard.append(stream, expected, events)?;
        debug!(
            stream = %stream,
            revision = result.next_expected_version,
            "Appended events"
        );
        Ok(result)
    }

    async fn read_stream(
        &self,
        stream: &str,
        from: StreamPosition,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> Result<StreamSlice> {
        let guard = self.state.lock().await;
        guard.check_available()?;
        Ok(guard.read_stream(stream, from, count, direction, resolve_links))
    }

    async fn read_all(
        &self,
        from: Position,
        count: usize,
        direction: ReadDirection,
        resolve_links: bool,
    ) -> Result<AllSlice> {
        let guard = self.state.lock().await;
        guard.check_available()?;
        Ok(guard.read_all(from, count, direction, resolve_links))
    }

    async fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard: bool,
    ) -> Result<DeleteResult> {
        let mut guard = self.state.lock().await;
        guard.check_available()?;
        guard.delete_stream(stream, expected, hard)
    }

    async fn create_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        settings.validate()?;
        let mut guard = self.state.lock().await;
        guard.check_available()?;
        let key = (stream.to_string(), group.to_string());
        if guard.groups.contains_key(&key) {
            return Err(ClientError::AlreadyExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let state = GroupState::new(stream, group, settings.clone(), &guard.view());
        info!(
            stream = %stream,
            group = %group,
            start = state.start,
            strategy = %settings.consumer_strategy,
            "Created subscription group"
        );
        guard.groups.insert(key, state);
        Ok(())
    }

    async fn update_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        settings.validate()?;
        let mut guard = self.state.lock().await;
        guard.check_available()?;
        let key = (stream.to_string(), group.to_string());
        let state = guard
            .groups
            .get_mut(&key)
            .ok_or_else(|| ClientError::SubscriptionNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        state.settings = settings.clone();
        let dropped = state.drop_subscribers(DropReason::SettingsChanged);
        info!(stream = %stream, group = %group, dropped, "Updated subscription group");
        Ok(())
    }

    async fn delete_subscription(&self, stream: &str, group: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        guard.check_available()?;
        let mut state = guard
            .groups
            .remove(&(stream.to_string(), group.to_string()))
            .ok_or_else(|| ClientError::SubscriptionNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        state.drop_subscribers(DropReason::SubscriptionDeleted);
        info!(stream = %stream, group = %group, "Deleted subscription group");
        Ok(())
    }

    async fn connect_subscription(
        &self,
        stream: &str,
        group: &str,
        buffer_size: usize,
    ) -> Result<SubscriptionChannel> {
        if buffer_size == 0 {
            return Err(ClientError::InvalidArgument(
                "subscription buffer size must be at least 1".to_string(),
            ));
        }
        let mut guard = self.state.lock().await;
        guard.check_available()?;

        let key = (stream.to_string(), group.to_string());
        let subscriber_id = guard.next_subscriber_id;
        // One slot beyond the in-flight limit keeps room for a Dropped message.
        let (tx, rx) = mpsc::channel(buffer_size + 1);

        let state = guard
            .groups
            .get_mut(&key)
            .ok_or_else(|| ClientError::SubscriptionNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let max = state.settings.max_subscriber_count;
        if max > 0 && state.subscribers.len() >= max {
            return Err(ClientError::MaximumSubscribersReached {
                stream: stream.to_string(),
                group: group.to_string(),
                max,
            });
        }
        state.subscribers.push(Subscriber {
            id: subscriber_id,
            tx,
            buffer_size,
            in_flight: 0,
        });
        let message_timeout = state.settings.message_timeout;

        guard.next_subscriber_id += 1;
        guard.pump_group(&key);
        drop(guard);

        spawn_ticker(
            Arc::downgrade(&self.state),
            key.clone(),
            subscriber_id,
            message_timeout,
        );
        info!(
            stream = %stream,
            group = %group,
            subscriber = subscriber_id,
            buffer_size,
            "Subscriber connected"
        );

        Ok(SubscriptionChannel {
            subscription_id: format!("{}::{}::{}", stream, group, subscriber_id),
            messages: rx,
            acker: Arc::new(MemoryAcker {
                state: Arc::downgrade(&self.state),
                key,
                subscriber_id,
            }),
        })
    }
}
