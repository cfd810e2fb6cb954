//! The workflow instance record (§3 "Workflow state") and its status
//! lifecycle.
//!
//! Grounded in the donor's `AgentLifecycleManager` state transitions
//! (`lifecycle.rs`): the same guarded "only these edges are legal" shape,
//! applied to workflow status instead of agent liveness.

use crate::domain_types::{RfpId, TemplateId, Timestamp, WorkflowId};
use crate::error::CoreError;
use crate::workflow::template::StageOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Where a workflow instance currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Accepted, not yet dispatched to its first stage.
    Pending,
    /// A stage is in flight.
    Running,
    /// Stopped at an approval gate, waiting on a decision.
    WaitingApproval,
    /// Suspended by an operator; resumes where it left off.
    Paused,
    /// Every stage finished; `response_builder_stage`'s output is final.
    Completed,
    /// A stage failed terminally under `on_error: fail_workflow`.
    Failed,
    /// Cancelled by an operator before completion.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status accepts no further stage transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is a legal transition from `self` (§3 invariant: the
    /// status machine only moves forward, never back into `pending`, and
    /// never leaves a terminal status).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Pending, Self::Running | Self::Cancelled) => true,
            (
                Self::Running,
                Self::Running
                | Self::WaitingApproval
                | Self::Paused
                | Self::Completed
                | Self::Failed
                | Self::Cancelled,
            ) => true,
            (Self::WaitingApproval, Self::Running | Self::Failed | Self::Cancelled) => true,
            (Self::Paused, Self::Running | Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// A completed stage's recorded outcome, kept in `stage_results` for
/// auditing and for later stages' context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// What happened: succeeded, skipped, or failed.
    pub outcome: StageOutcome,
    /// The handler's response payload, if any (absent for `skipped`).
    pub output: Option<Value>,
    /// Attempts the retry layer made before this result.
    pub attempts: u8,
    /// When the stage started.
    pub started_at: Timestamp,
    /// When it finished.
    pub finished_at: Timestamp,
}

/// A running or finished workflow instance (§3 "Workflow state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Unique id for this instance.
    pub workflow_id: WorkflowId,
    /// The RFP document this workflow processes.
    pub rfp_id: RfpId,
    /// The template driving this instance.
    pub template_id: TemplateId,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// The stage currently executing (or about to execute), if any.
    pub current_stage: Option<String>,
    /// Stages that have finished, in completion order.
    pub completed_stages: Vec<String>,
    /// Merged context: stage name (or mapped field) to output value,
    /// threaded into later stages' requests.
    pub context: HashMap<String, Value>,
    /// Per-stage outcomes, keyed by stage name, kept for audit/debugging.
    pub stage_results: BTreeMap<String, StageResult>,
    /// When the workflow was accepted.
    pub started_at: Timestamp,
    /// When this record was last written.
    pub updated_at: Timestamp,
    /// When the workflow reached a terminal status.
    pub ended_at: Option<Timestamp>,
    /// The failure reason, if `status == failed`.
    pub error: Option<String>,
    /// The stage currently waiting on an approval decision, if
    /// `status == waiting_approval`.
    pub approval_pending: Option<String>,
    /// The final response payload, once `status == completed`.
    pub response: Option<Value>,
}

impl WorkflowState {
    /// Builds a freshly-accepted, `pending` workflow instance.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, rfp_id: RfpId, template_id: TemplateId) -> Self {
        let now = Timestamp::now();
        Self {
            workflow_id,
            rfp_id,
            template_id,
            status: WorkflowStatus::Pending,
            current_stage: None,
            completed_stages: Vec::new(),
            context: HashMap::new(),
            stage_results: BTreeMap::new(),
            started_at: now,
            updated_at: now,
            ended_at: None,
            error: None,
            approval_pending: None,
            response: None,
        }
    }

    /// Moves to `next`, stamping `updated_at` (and `ended_at` if `next` is
    /// terminal).
    ///
    /// # Errors
    /// Returns [`CoreError::StateConflict`] if the transition is illegal.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::StateConflict(format!(
                "workflow {} cannot move from {:?} to {:?}",
                self.workflow_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Timestamp::now();
        if next.is_terminal() {
            self.ended_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Records a finished stage's result, merges its mapped fields into
    /// the workflow context, and appends it to `completed_stages`.
    pub fn record_stage(&mut self, stage_name: &str, result: StageResult, merged_fields: HashMap<String, Value>) {
        self.context.extend(merged_fields);
        self.stage_results.insert(stage_name.to_string(), result);
        self.completed_stages.push(stage_name.to_string());
        self.updated_at = Timestamp::now();
    }
}
