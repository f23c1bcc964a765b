//! Stream reader.
//!
//! Every read mode yields a lazy [`EventStream`]. The stream issues one store
//! round-trip per `batch_size` events as it is polled and stops at the end of
//! the stream or after `max_count` events. Arguments are validated before
//! the stream is returned, so an invalid batch size never reaches the store.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::connection::StoreConnection;
use crate::error::{ClientError, Result};
use crate::event::{Event, Position, ReadDirection, StreamPosition};

/// Largest batch a single round-trip may request.
pub const MAX_BATCH_SIZE: usize = 4096;

/// Upper bound on events scanned by [`StreamReader::read_filtered`].
pub const FILTERED_READ_CEILING: usize = 4096;

/// Lazily fetched sequence of events.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// Shape of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Events requested per round-trip (`1..=MAX_BATCH_SIZE`).
    pub batch_size: usize,
    /// Stop after this many events.
    pub max_count: Option<usize>,
    /// Replace link events by their targets.
    pub resolve_links: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            max_count: None,
            resolve_links: false,
        }
    }
}

impl ReadOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn with_resolve_links(mut self, resolve_links: bool) -> Self {
        self.resolve_links = resolve_links;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ClientError::InvalidArgument(format!(
                "batch size {} outside 1..={}",
                self.batch_size, MAX_BATCH_SIZE
            )));
        }
        if self.max_count == Some(0) {
            return Err(ClientError::InvalidArgument(
                "max count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

enum Source {
    Stream { stream: String, from: StreamPosition },
    All { from: Position },
}

/// Paging state of one read.
struct Cursor {
    connection: Arc<dyn StoreConnection>,
    source: Source,
    direction: ReadDirection,
    batch_size: usize,
    remaining: Option<usize>,
    resolve_links: bool,
    done: bool,
}

impl Cursor {
    async fn next_batch(&mut self) -> Result<Vec<Event>> {
        let count = self
            .remaining
            .map_or(self.batch_size, |remaining| remaining.min(self.batch_size));

        let events = match &mut self.source {
            Source::Stream { stream, from } => {
                let slice = self
                    .connection
                    .read_stream(stream, *from, count, self.direction, self.resolve_links)
                    .await?;
                match slice.next_revision {
                    Some(next) if !slice.is_end_of_stream => *from = StreamPosition::At(next),
                    _ => self.done = true,
                }
                slice.events
            }
            Source::All { from } => {
                let slice = self
                    .connection
                    .read_all(*from, count, self.direction, self.resolve_links)
                    .await?;
                *from = slice.next_position;
                if slice.is_end_of_stream {
                    self.done = true;
                }
                slice.events
            }
        };

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(events.len());
            if *remaining == 0 {
                self.done = true;
            }
        }
        debug!(count = events.len(), done = self.done, "Read batch");
        Ok(events)
    }

    fn into_stream(self) -> EventStream {
        stream::unfold(self, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            let batch = cursor.next_batch().await;
            if batch.is_err() {
                cursor.done = true;
            }
            Some((batch, cursor))
        })
        .flat_map(|batch| {
            let items: Vec<Result<Event>> = match batch {
                Ok(events) => events.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
        .boxed()
    }
}

/// Reads streams and the global log.
#[derive(Clone)]
pub struct StreamReader {
    connection: Arc<dyn StoreConnection>,
}

impl StreamReader {
    pub fn new(connection: Arc<dyn StoreConnection>) -> Self {
        Self { connection }
    }

    fn open(
        &self,
        source: Source,
        direction: ReadDirection,
        options: &ReadOptions,
    ) -> Result<EventStream> {
        options.validate()?;
        if let Source::Stream { stream, .. } = &source {
            if stream.is_empty() {
                return Err(ClientError::InvalidArgument(
                    "stream name must not be empty".to_string(),
                ));
            }
        }
        Ok(Cursor {
            connection: self.connection.clone(),
            source,
            direction,
            batch_size: options.batch_size,
            remaining: options.max_count,
            resolve_links: options.resolve_links,
            done: false,
        }
        .into_stream())
    }

    /// Ascending revision order from `from_revision` (0 = beginning).
    pub fn read_forward(
        &self,
        stream: &str,
        from_revision: u64,
        options: &ReadOptions,
    ) -> Result<EventStream> {
        self.open(
            Source::Stream {
                stream: stream.to_string(),
                from: StreamPosition::At(from_revision),
            },
            ReadDirection::Forward,
            options,
        )
    }

    /// Descending revision order from `from` (inclusive) or the current end.
    pub fn read_backward(
        &self,
        stream: &str,
        from: StreamPosition,
        options: &ReadOptions,
    ) -> Result<EventStream> {
        self.open(
            Source::Stream {
                stream: stream.to_string(),
                from,
            },
            ReadDirection::Backward,
            options,
        )
    }

    /// Global log in commit order, starting at `from` inclusive.
    pub fn read_all_forward(&self, from: Position, options: &ReadOptions) -> Result<EventStream> {
        self.open(Source::All { from }, ReadDirection::Forward, options)
    }

    /// Global log in reverse commit order, strictly before `from`.
    pub fn read_all_backward(&self, from: Position, options: &ReadOptions) -> Result<EventStream> {
        self.open(Source::All { from }, ReadDirection::Backward, options)
    }

    /// Forward read of the first `FILTERED_READ_CEILING` events of `stream`,
    /// keeping those whose type contains `type_substring`.
    pub fn read_filtered(&self, stream: &str, type_substring: &str) -> Result<EventStream> {
        let options = ReadOptions::default().with_max_count(FILTERED_READ_CEILING);
        let substring = type_substring.to_string();
        let events = self.read_forward(stream, 0, &options)?;
        Ok(events
            .try_filter(move |event| futures::future::ready(event.event_type.contains(&substring)))
            .boxed())
    }
}

/// Drain an event stream into a vector, stopping at the first error.
pub async fn collect(events: EventStream) -> Result<Vec<Event>> {
    events.try_collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InMemoryStore;
    use crate::event::ExpectedVersion;
    use serde_json::json;

    async fn seeded(count: usize) -> (InMemoryStore, StreamReader) {
        let store = InMemoryStore::new();
        let events: Vec<_> = (0..count)
            .map(|i| Event::new(if i % 2 == 0 { "even" } else { "odd" }, json!({ "i": i })))
            .collect();
        if !events.is_empty() {
            store
                .append("s", ExpectedVersion::Any, events)
                .await
                .unwrap();
        }
        let reader = StreamReader::new(Arc::new(store.clone()));
        (store, reader)
    }

    fn indices(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.payload["i"].as_u64().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_forward_pages_across_batches() {
        let (_store, reader) = seeded(10).await;
        let options = ReadOptions::default().with_batch_size(3);
        let events = collect(reader.read_forward("s", 0, &options).unwrap())
            .await
            .unwrap();
        assert_eq!(indices(&events), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_forward_honours_max_count_and_origin() {
        let (_store, reader) = seeded(10).await;
        let options = ReadOptions::default().with_batch_size(2).with_max_count(3);
        let events = collect(reader.read_forward("s", 4, &options).unwrap())
            .await
            .unwrap();
        assert_eq!(indices(&events), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_backward_from_end_and_from_revision() {
        let (_store, reader) = seeded(5).await;
        let options = ReadOptions::default().with_batch_size(2);
        let events = collect(reader.read_backward("s", StreamPosition::End, &options).unwrap())
            .await
            .unwrap();
        assert_eq!(indices(&events), vec![4, 3, 2, 1, 0]);

        let events = collect(reader.read_backward("s", StreamPosition::At(2), &options).unwrap())
            .await
            .unwrap();
        assert_eq!(indices(&events), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_all_forward_and_backward() {
        let (_store, reader) = seeded(6).await;
        let options = ReadOptions::default().with_batch_size(4);
        let forward = collect(reader.read_all_forward(Position::START, &options).unwrap())
            .await
            .unwrap();
        assert_eq!(indices(&forward), (0..6).collect::<Vec<_>>());

        let backward = collect(reader.read_all_backward(Position::END, &options).unwrap())
            .await
            .unwrap();
        assert_eq!(indices(&backward), vec![5, 4, 3, 2, 1, 0]);

        let before_start = collect(reader.read_all_backward(Position::START, &options).unwrap())
            .await
            .unwrap();
        assert!(before_start.is_empty());
    }

    #[tokio::test]
    async fn test_filtered_counts() {
        let (_store, reader) = seeded(101).await;
        let even = collect(reader.read_filtered("s", "even").unwrap()).await.unwrap();
        let odd = collect(reader.read_filtered("s", "odd").unwrap()).await.unwrap();
        assert_eq!(even.len(), 51);
        assert_eq!(odd.len(), 50);
        assert!(even.iter().all(|e| e.event_type == "even"));
    }

    #[tokio::test]
    async fn test_batch_size_bounds() {
        let (_store, reader) = seeded(3).await;
        for size in [0, MAX_BATCH_SIZE + 1] {
            let options = ReadOptions::default().with_batch_size(size);
            assert!(reader.read_forward("s", 0, &options).err().unwrap().is_invalid_argument());
            assert!(reader
                .read_backward("s", StreamPosition::End, &options)
                .err()
                .unwrap()
                .is_invalid_argument());
            assert!(reader
                .read_all_forward(Position::START, &options)
                .err()
                .unwrap()
                .is_invalid_argument());
            assert!(reader
                .read_all_backward(Position::END, &options)
                .err()
                .unwrap()
                .is_invalid_argument());
        }
        for size in [1, MAX_BATCH_SIZE] {
            let options = ReadOptions::default().with_batch_size(size);
            let events = collect(reader.read_forward("s", 0, &options).unwrap())
                .await
                .unwrap();
            assert_eq!(events.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_zero_max_count_rejected() {
        let (_store, reader) = seeded(1).await;
        let options = ReadOptions::default().with_max_count(0);
        assert!(reader.read_forward("s", 0, &options).err().unwrap().is_invalid_argument());
    }

    #[tokio::test]
    async fn test_missing_stream_reads_empty() {
        let (_store, reader) = seeded(0).await;
        let events = collect(reader.read_forward("nope", 0, &ReadOptions::default()).unwrap())
            .await
            .unwrap();
        assert!(events.is_empty());

        let options = ReadOptions::default();
        let events = collect(reader.read_backward("s", StreamPosition::End, &options).unwrap())
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_once() {
        let (store, reader) = seeded(3).await;
        store.set_unavailable(true).await;
        let mut events = reader.read_forward("s", 0, &ReadOptions::default()).unwrap();
        assert!(events.next().await.unwrap().unwrap_err().is_connection_error());
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let (store, reader) = seeded(3).await;
        store.set_unavailable(true).await;
        // Opening does not touch the store
        let events = reader.read_forward("s", 0, &ReadOptions::default()).unwrap();
        store.set_unavailable(false).await;
        assert_eq!(collect(events).await.unwrap().len(), 3);
    }
}
