//! Progress reporting and the append-only workflow audit trail (§4.9).
//!
//! Grounded in the donor's `MessageRouter::publish` fan-out for the
//! progress stream, and in `storage.rs`'s append-record idiom for the audit
//! log, generalized from per-agent records to a per-workflow sequence kept
//! in the key-value store under `workflows/audit/`.

use crate::comm_manager::CommunicationManager;
use crate::domain_types::{AgentId, AuditSeq, Timestamp, TopicName, WorkflowId};
use crate::envelope::{Envelope, EnvelopeOptions, EnvelopeKind, Recipient};
use crate::error::CoreError;
use crate::kv::KvStore;
use crate::workflow::state::WorkflowStatus;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const AUDIT_NAMESPACE: &str = "workflows/audit";
const PROGRESS_TOPIC: &str = "workflow/progress";

fn engine_agent_id() -> AgentId {
    AgentId::try_new("workflow-engine".to_string()).expect("\"workflow-engine\" is a valid AgentId")
}

/// A point-in-time progress update for a single workflow instance,
/// published on the shared progress topic on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The workflow this update describes.
    pub workflow_id: WorkflowId,
    /// The stage in progress, if any.
    pub stage: Option<String>,
    /// The workflow's status as of this update.
    pub status: WorkflowStatus,
    /// Coarse completion estimate, 0-100.
    pub percent: u8,
    /// A human-readable summary of what just happened.
    pub message: String,
    /// When this update was produced.
    pub at: Timestamp,
}

/// The kind of fact an [`AuditRecord`] reports, covering every event §4.9
/// requires the audit trail to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// The workflow was accepted and began running.
    WorkflowStarted,
    /// A stage was dispatched.
    StageStarted,
    /// A stage finished (successfully, skipped, or failed).
    StageFinished,
    /// Input validation rejected the submission or a stage's output.
    ValidationFailed,
    /// An approval gate was reached and a decision requested.
    ApprovalRequested,
    /// An approval decision was recorded.
    ApprovalDecided,
    /// A stage produced a generated document artifact.
    DocumentGenerated,
    /// A non-fatal or fatal error occurred during processing.
    ErrorOccurred,
    /// The workflow reached `completed`.
    WorkflowCompleted,
    /// The workflow reached `cancelled`.
    WorkflowCancelled,
}

/// One append-only entry in a workflow's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic position within this workflow's trail.
    pub seq: AuditSeq,
    /// The workflow this entry belongs to.
    pub workflow_id: WorkflowId,
    /// What kind of fact this entry reports.
    pub kind: AuditEventKind,
    /// Event-specific structured detail.
    pub detail: Value,
    /// When the entry was recorded.
    pub at: Timestamp,
}

/// Publishes progress updates and appends audit records, backed by the
/// same key-value store the workflow engine persists state to.
pub struct ProgressTracker {
    comm: Arc<CommunicationManager>,
    kv: Arc<dyn KvStore>,
    latest: DashMap<WorkflowId, ProgressEvent>,
}

impl ProgressTracker {
    /// Builds a tracker over `comm`'s fabric and `kv`'s audit namespace.
    #[must_use]
    pub fn new(comm: Arc<CommunicationManager>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            comm,
            kv,
            latest: DashMap::new(),
        }
    }

    /// Publishes `event` to the shared progress topic and caches it as the
    /// latest snapshot for its workflow.
    ///
    /// # Errors
    /// Propagates whatever [`CommunicationManager::send`] returns; the
    /// in-memory snapshot is still updated even if publication fails, so a
    /// later `latest` query reflects the most recent call regardless.
    pub async fn record_progress(&self, event: ProgressEvent) -> Result<(), CoreError> {
        self.latest.insert(event.workflow_id, event.clone());
        let topic = TopicName::try_new(PROGRESS_TOPIC.to_string())
            .expect("progress topic name is a valid TopicName literal");
        let envelope = Envelope::new_request(
            engine_agent_id(),
            Recipient::Topic(topic),
            serde_json::to_value(&event)?,
            EnvelopeOptions::default(),
        )
        .with_kind(EnvelopeKind::Publish);
        self.comm.send(envelope).await
    }

    /// The most recently recorded progress update for `workflow_id`, if
    /// any was published since process start.
    #[must_use]
    pub fn latest(&self, workflow_id: WorkflowId) -> Option<ProgressEvent> {
        self.latest.get(&workflow_id).map(|entry| entry.clone())
    }

    /// Appends an audit record for `workflow_id`, assigning the next
    /// sequence number in its trail.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]-family errors from the backing store.
    pub async fn append_audit(
        &self,
        workflow_id: WorkflowId,
        kind: AuditEventKind,
        detail: Value,
    ) -> Result<AuditRecord, CoreError> {
        let next_seq = self.next_seq(workflow_id).await?;
        let record = AuditRecord {
            seq: next_seq,
            workflow_id,
            kind,
            detail,
            at: Timestamp::now(),
        };
        let key = audit_key(workflow_id, next_seq);
        self.kv
            .set(AUDIT_NAMESPACE, &key, serde_json::to_value(&record)?, None)
            .await?;
        Ok(record)
    }

    /// The full audit trail for `workflow_id`, ordered by sequence number.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]-family errors from the backing store.
    pub async fn audit_trail(&self, workflow_id: WorkflowId) -> Result<Vec<AuditRecord>, CoreError> {
        let prefix = format!("{workflow_id}:");
        let mut records = Vec::new();
        for key in self.kv.keys(AUDIT_NAMESPACE).await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            if let Some(value) = self.kv.get(AUDIT_NAMESPACE, &key).await? {
                records.push(serde_json::from_value::<AuditRecord>(value)?);
            }
        }
        records.sort_by_key(|record| record.seq);
        Ok(records)
    }

    async fn next_seq(&self, workflow_id: WorkflowId) -> Result<AuditSeq, CoreError> {
        let trail = self.audit_trail(workflow_id).await?;
        Ok(trail.last().map_or(AuditSeq::first(), |record| record.seq.next()))
    }
}

fn audit_key(workflow_id: WorkflowId, seq: AuditSeq) -> String {
    format!("{workflow_id}:{:020}", seq.into_inner())
}
