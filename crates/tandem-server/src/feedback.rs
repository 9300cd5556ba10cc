//! Feedback persistence.
//!
//! Submissions are stamped with their arrival time and queued to a background
//! task that appends them to a sink. Submitting never waits for the write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors writing feedback.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("Failed to write feedback: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize feedback: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A feedback submission as stored.
///
/// The client payload is kept as-is, with `received_at` added at the top
/// level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl FeedbackRecord {
    /// Stamp a payload with the current time.
    #[must_use]
    pub fn new(payload: Map<String, Value>) -> Self {
        Self::at(payload, Utc::now())
    }

    /// Stamp a payload with a given time. A client-supplied `received_at`
    /// is replaced.
    #[must_use]
    pub fn at(mut payload: Map<String, Value>, received_at: DateTime<Utc>) -> Self {
        payload.remove("received_at");
        Self {
            received_at,
            payload,
        }
    }
}

/// Where feedback records end up.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// Persist one record.
    async fn write(&self, record: &FeedbackRecord) -> Result<(), FeedbackError>;
}

/// Appends records to a JSON Lines file.
#[derive(Debug, Clone)]
pub struct JsonlFeedbackSink {
    path: PathBuf,
}

impl JsonlFeedbackSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedbackSink for JsonlFeedbackSink {
    async fn write(&self, record: &FeedbackRecord) -> Result<(), FeedbackError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Handle to the background feedback writer.
#[derive(Debug, Clone)]
pub struct FeedbackWriter {
    tx: mpsc::UnboundedSender<FeedbackRecord>,
}

impl FeedbackWriter {
    /// Spawn the writer task on the current runtime.
    #[must_use]
    pub fn spawn(sink: Arc<dyn FeedbackSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<FeedbackRecord>();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match sink.write(&record).await {
                    Ok(()) => debug!(received_at = %record.received_at, "Feedback stored"),
                    Err(e) => warn!(error = %e, "Dropping feedback"),
                }
            }
            debug!("Feedback writer stopped");
        });

        Self { tx }
    }

    /// Queue a record for writing.
    ///
    /// Returns `false` if the writer task is gone.
    pub fn submit(&self, record: FeedbackRecord) -> bool {
        self.tx.send(record).is_ok()
    }
}
