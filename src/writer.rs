//! Stream writer.

use std::sync::Arc;

use tracing::debug;

use crate::connection::StoreConnection;
use crate::error::{ClientError, Result};
use crate::event::{Event, ExpectedVersion, WriteResult};

/// Appends batches of events to named streams.
#[derive(Clone)]
pub struct StreamWriter {
    connection: Arc<dyn StoreConnection>,
}

impl StreamWriter {
    pub fn new(connection: Arc<dyn StoreConnection>) -> Self {
        Self { connection }
    }

    /// Append `events` to `stream` atomically under `expected`.
    ///
    /// Events are stamped with `stream` before they are sent. Either the
    /// whole batch is written in order or none of it is.
    #[tracing::instrument(name = "writer.append", skip_all, fields(stream = %stream, count = events.len()))]
    pub async fn append(
        &self,
        stream: &str,
        events: Vec<Event>,
        expected: ExpectedVersion,
    ) -> Result<WriteResult> {
        if stream.is_empty() {
            return Err(ClientError::InvalidArgument(
                "stream name must not be empty".to_string(),
            ));
        }
        if events.is_empty() {
            return Err(ClientError::InvalidArgument(
                "cannot append an empty batch".to_string(),
            ));
        }

        let events = events
            .into_iter()
            .map(|event| event.with_stream(stream))
            .collect();
        let result = self.connection.append(stream, expected, events).await?;

        debug!(
            revision = result.next_expected_version,
            position = %result.log_position,
            "Append committed"
        );
        Ok(result)
    }
}
