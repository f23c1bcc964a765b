//! Stream eraser.
//!
//! Deleting is idempotent from the caller's point of view: a stream that is
//! already gone is reported as `Removal::NotFound`, not as an error.

use std::sync::Arc;

use tracing::{info, warn};

use crate::connection::StoreConnection;
use crate::error::{ClientError, Removal, Result};
use crate::event::{DeleteResult, ExpectedVersion};

/// Deletes streams.
#[derive(Clone)]
pub struct StreamEraser {
    connection: Arc<dyn StoreConnection>,
}

impl StreamEraser {
    pub fn new(connection: Arc<dyn StoreConnection>) -> Self {
        Self { connection }
    }

    /// Soft delete. The stream reads as empty and may be written again,
    /// continuing its revision numbering.
    #[tracing::instrument(name = "eraser.delete", skip_all, fields(stream = %stream))]
    pub async fn delete(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<Removal<DeleteResult>> {
        self.remove(stream, expected, false).await
    }

    /// Hard delete. The stream name can never be written again.
    #[tracing::instrument(name = "eraser.tombstone", skip_all, fields(stream = %stream))]
    pub async fn tombstone(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<Removal<DeleteResult>> {
        self.remove(stream, expected, true).await
    }

    async fn remove(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard: bool,
    ) -> Result<Removal<DeleteResult>> {
        if stream.is_empty() {
            return Err(ClientError::InvalidArgument(
                "stream name must not be empty".to_string(),
            ));
        }
        match self.connection.delete_stream(stream, expected, hard).await {
            Ok(result) => {
                info!(position = %result.log_position, hard, "Stream deleted");
                Ok(Removal::Removed(result))
            }
            Err(ClientError::StreamNotFound(_)) => {
                warn!("Stream not found, nothing to delete");
                Ok(Removal::NotFound)
            }
            Err(e) => Err(e),
        }
    }
}
