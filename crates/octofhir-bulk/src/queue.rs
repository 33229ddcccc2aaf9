//! Work queue between the kickoff handler and the worker pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Export job queue is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectReference {
    pub reference: String,
}

/// One export request as handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobMessage {
    /// Id of the status record this message belongs to.
    pub client_entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<Vec<SubjectReference>>,
    /// Subject ids the export is scoped to, resolved at kickoff. `None` means
    /// unscoped for system exports and "every Patient" otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_ids: Option<Vec<String>>,
    pub system_level_export: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<String>>,
    #[serde(default)]
    pub by_patient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

impl ExportJobMessage {
    pub fn new(client_entry: impl Into<String>) -> Self {
        Self {
            client_entry: client_entry.into(),
            types: None,
            type_filter: None,
            patient: None,
            patient_ids: None,
            system_level_export: true,
            elements: None,
            by_patient: false,
            since: None,
        }
    }
}

/// At-least-once delivery of export messages.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: ExportJobMessage) -> Result<(), QueueError>;

    /// Waits for the next message. `None` once the queue is closed and drained.
    async fn dequeue(&self) -> Option<ExportJobMessage>;

    /// Stops accepting new messages; queued ones are still delivered.
    async fn close(&self);
}

/// Queue over an unbounded tokio channel, shared by every worker.
pub struct InMemoryJobQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<ExportJobMessage>>>,
    receiver: Mutex<mpsc::UnboundedReceiver<ExportJobMessage>>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: ExportJobMessage) -> Result<(), QueueError> {
        let guard = self.sender.lock().await;
        let sender = guard.as_ref().ok_or(QueueError::Closed)?;
        sender.send(message).map_err(|_| QueueError::Closed)
    }

    async fn dequeue(&self) -> Option<ExportJobMessage> {
        self.receiver.lock().await.recv().await
    }

    async fn close(&self) {
        self.sender.lock().await.take();
    }
}
