//! The stage executor (§4.8): selects a template, dispatches each stage to
//! an agent, merges results into the running context, and carries
//! approvals, error policies, and crash recovery.
//!
//! Grounded in the donor's `AgentLifecycleManager` (`lifecycle.rs`): the
//! same `Arc<Self>`-cloned-into-`tokio::spawn` shape, with a resumption
//! scan standing in for `run_health_monitor`'s background sweep.

use crate::comm_manager::CommunicationManager;
use crate::domain_types::{StageName, TemplateId, Timestamp, WorkflowId};
use crate::envelope::{Envelope, EnvelopeOptions, Recipient};
use crate::error::CoreError;
use crate::kv::KvStore;
use crate::progress::{AuditEventKind, ProgressEvent, ProgressTracker};
use crate::workflow::state::{StageResult, WorkflowState, WorkflowStatus};
use crate::workflow::template::{OnErrorPolicy, RfpDocument, Stage, StageOutcome, TemplateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use dashmap::DashMap;

const WORKFLOW_NAMESPACE: &str = "workflows";

fn engine_agent_id() -> crate::domain_types::AgentId {
    crate::domain_types::AgentId::try_new("workflow-engine".to_string())
        .expect("\"workflow-engine\" is a valid AgentId")
}

/// A human (or escalation path)'s answer to a stage's approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// The stage's output is accepted; the workflow continues.
    Approved,
    /// The stage's output is rejected; the workflow fails.
    Rejected,
}

/// What a single stage's (or parallel-group member's) run resolved to,
/// decided by applying its `on_error` policy if dispatch failed.
enum StageResolution {
    /// Continue normally, merging `fields` into the running context.
    Continue {
        stage_name: StageName,
        result: StageResult,
        fields: HashMap<String, Value>,
    },
    /// Fail the whole workflow with `reason`.
    FailWorkflow { reason: String },
    /// Jump to `target` instead of the template's next stage.
    RouteTo { target: StageName },
}

/// The stage-by-stage executor driving workflow instances to completion.
pub struct WorkflowEngine {
    comm: Arc<CommunicationManager>,
    kv: Arc<dyn KvStore>,
    progress: Arc<ProgressTracker>,
    templates: Arc<TemplateStore>,
    approvals: DashMap<WorkflowId, oneshot::Sender<ApprovalDecision>>,
    cancellations: DashMap<WorkflowId, CancellationToken>,
}

impl WorkflowEngine {
    /// Builds the engine. Does not itself resume in-flight workflows; call
    /// [`WorkflowEngine::resume_pending`] once after construction.
    #[must_use]
    pub fn new(
        comm: Arc<CommunicationManager>,
        kv: Arc<dyn KvStore>,
        progress: Arc<ProgressTracker>,
        templates: Arc<TemplateStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            comm,
            kv,
            progress,
            templates,
            approvals: DashMap::new(),
            cancellations: DashMap::new(),
        })
    }

    /// Accepts a new RFP document, selects (or validates) its template,
    /// persists the initial state, and spawns its execution.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `template_id` is given explicitly
    /// and no such template is registered.
    #[instrument(skip(self, document), fields(rfp_id = %document.rfp_id))]
    pub async fn submit(
        self: &Arc<Self>,
        document: RfpDocument,
        template_id: Option<TemplateId>,
    ) -> Result<WorkflowId, CoreError> {
        let template_id = template_id.unwrap_or_else(|| self.templates.select_for(&document));
        if self.templates.get(&template_id).is_none() {
            return Err(CoreError::NotFound(format!("template {template_id}")));
        }

        let workflow_id = WorkflowId::generate();
        let mut state = WorkflowState::new(workflow_id, document.rfp_id.clone(), template_id.clone());
        state.context.insert("document".to_string(), document.body.clone());
        state.context.insert("priority".to_string(), serde_json::to_value(document.priority)?);
        state.context.insert("estimated_value".to_string(), serde_json::to_value(document.estimated_value)?);
        state.context.insert(
            "is_standard_product".to_string(),
            Value::Bool(document.is_standard_product),
        );
        state.transition(WorkflowStatus::Running)?;
        self.save_state(&state).await?;

        self.progress
            .append_audit(
                workflow_id,
                AuditEventKind::WorkflowStarted,
                serde_json::json!({"template_id": template_id, "rfp_id": state.rfp_id}),
            )
            .await?;
        self.publish_progress(workflow_id, None, WorkflowStatus::Running, 0, "workflow accepted")
            .await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(workflow_id).await;
        });
        Ok(workflow_id)
    }

    /// Re-dispatches every non-terminal workflow found in the key-value
    /// store, resuming at its `current_stage` (re-sending any in-flight
    /// request, since the prior process's retry loop was lost with it).
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]-family errors from the backing store.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, CoreError> {
        let mut resumed = 0;
        for key in self.kv.keys(WORKFLOW_NAMESPACE).await? {
            let Some(value) = self.kv.get(WORKFLOW_NAMESPACE, &key).await? else {
                continue;
            };
            let state: WorkflowState = serde_json::from_value(value)?;
            if state.status.is_terminal() || state.status == WorkflowStatus::Paused {
                continue;
            }
            info!(workflow_id = %state.workflow_id, status = ?state.status, "resuming workflow");
            let engine = Arc::clone(self);
            let workflow_id = state.workflow_id;
            tokio::spawn(async move {
                engine.run(workflow_id).await;
            });
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Cancels `workflow_id` with `reason`, if it has not already reached a
    /// terminal status.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if no such workflow exists, or
    /// [`CoreError::StateConflict`] if it is already terminal.
    pub async fn cancel(&self, workflow_id: WorkflowId, reason: String) -> Result<(), CoreError> {
        let mut state = self
            .load_state(workflow_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_id}")))?;
        state.transition(WorkflowStatus::Cancelled)?;
        state.error = Some(reason.clone());
        self.save_state(&state).await?;
        if let Some(token) = self.cancellations.get(&workflow_id) {
            token.cancel();
        }
        if let Some((_, tx)) = self.approvals.remove(&workflow_id) {
            let _ = tx.send(ApprovalDecision::Rejected);
        }
        self.progress
            .append_audit(workflow_id, AuditEventKind::WorkflowCancelled, serde_json::json!({"reason": reason}))
            .await?;
        self.publish_progress(workflow_id, None, WorkflowStatus::Cancelled, 100, "workflow cancelled")
            .await;
        Ok(())
    }

    /// Records a decision for the approval gate `workflow_id` is currently
    /// waiting at.
    ///
    /// # Errors
    /// Returns [`CoreError::StateConflict`] if the workflow is not
    /// currently waiting on an approval.
    pub async fn submit_approval(
        &self,
        workflow_id: WorkflowId,
        decision: ApprovalDecision,
        decided_by: &str,
    ) -> Result<(), CoreError> {
        let Some((_, tx)) = self.approvals.remove(&workflow_id) else {
            return Err(CoreError::StateConflict(format!(
                "workflow {workflow_id} is not waiting on an approval"
            )));
        };
        self.progress
            .append_audit(
                workflow_id,
                AuditEventKind::ApprovalDecided,
                serde_json::json!({"decision": format!("{decision:?}"), "decided_by": decided_by}),
            )
            .await?;
        let _ = tx.send(decision);
        Ok(())
    }

    /// The current state of `workflow_id`, if it exists.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]-family errors from the backing store.
    pub async fn get(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowState>, CoreError> {
        self.load_state(workflow_id).await
    }

    /// Every workflow instance currently persisted, terminal or not.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]-family errors from the backing store.
    pub async fn list(&self) -> Result<Vec<WorkflowState>, CoreError> {
        let mut states = Vec::new();
        for key in self.kv.keys(WORKFLOW_NAMESPACE).await? {
            if let Some(value) = self.kv.get(WORKFLOW_NAMESPACE, &key).await? {
                states.push(serde_json::from_value(value)?);
            }
        }
        Ok(states)
    }

    /// The underlying fabric's metrics snapshot (§6 `GET /metrics`).
    #[must_use]
    pub fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        self.comm.metrics_snapshot()
    }

    /// Per-agent queue stats for every currently registered agent, keyed
    /// by agent id, for the `core_queue_size` metric family.
    pub async fn queue_snapshots(&self) -> Vec<(String, crate::queue::QueueStats)> {
        let mut snapshots = Vec::new();
        for entry in self.comm.list_agents() {
            let stats = self.comm.queue_stats(&entry.agent_id).await;
            snapshots.push((entry.agent_id.as_ref().to_string(), stats));
        }
        snapshots
    }

    /// The composite health report (§6 `GET /health`).
    pub async fn health_report(&self) -> crate::comm_manager::HealthReport {
        self.comm.health_report().await
    }

    async fn load_state(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowState>, CoreError> {
        let Some(value) = self.kv.get(WORKFLOW_NAMESPACE, &workflow_id.to_string()).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn save_state(&self, state: &WorkflowState) -> Result<(), CoreError> {
        self.kv
            .set(WORKFLOW_NAMESPACE, &state.workflow_id.to_string(), serde_json::to_value(state)?, None)
            .await
    }

    /// Marks `workflow_id` as `waiting_approval` on `stage_name` in the
    /// persisted state, so a crash while waiting is visible to `GET
    /// /workflows/{id}` and to `resume_pending` without requiring the
    /// in-memory `drive` loop's own copy to change: that copy still holds
    /// `running` and overwrites this marker once the gate resolves.
    async fn persist_waiting_approval(&self, workflow_id: WorkflowId, stage_name: &str) -> Result<(), CoreError> {
        if let Some(mut current) = self.load_state(workflow_id).await? {
            current.status = WorkflowStatus::WaitingApproval;
            current.approval_pending = Some(stage_name.to_string());
            self.save_state(&current).await?;
        }
        Ok(())
    }

    async fn publish_progress(
        &self,
        workflow_id: WorkflowId,
        stage: Option<String>,
        status: WorkflowStatus,
        percent: u8,
        message: &str,
    ) {
        let event = ProgressEvent {
            workflow_id,
            stage,
            status,
            percent,
            message: message.to_string(),
            at: Timestamp::now(),
        };
        if let Err(err) = self.progress.record_progress(event).await {
            warn!(workflow_id = %workflow_id, error = %err, "failed to publish progress update");
        }
    }

    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    async fn run(self: Arc<Self>, workflow_id: WorkflowId) {
        let token = self
            .cancellations
            .entry(workflow_id)
            .or_insert_with(CancellationToken::new)
            .clone();

        let outcome = self.drive(workflow_id, &token).await;
        self.cancellations.remove(&workflow_id);
        if let Err(err) = outcome {
            warn!(workflow_id = %workflow_id, error = %err, "workflow execution ended with an error");
        }
    }

    async fn drive(&self, workflow_id: WorkflowId, token: &CancellationToken) -> Result<(), CoreError> {
        loop {
            let mut state = self
                .load_state(workflow_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_id}")))?;
            if state.status.is_terminal() || state.status == WorkflowStatus::Paused {
                return Ok(());
            }
            if token.is_cancelled() {
                return Ok(());
            }

            let template = self
                .templates
                .get(&state.template_id)
                .ok_or_else(|| CoreError::NotFound(format!("template {}", state.template_id)))?
                .clone();
            let batches = batch_stages(&template.stages);
            let start = start_batch_index(&batches, state.current_stage.as_deref());

            if start >= batches.len() {
                self.finish(&mut state, &template).await?;
                return Ok(());
            }

            let batch = &batches[start];
            let resolutions = self.execute_batch(&state, batch, token).await;
            if token.is_cancelled() {
                // An operator cancellation may have resolved this stage's
                // approval gate concurrently; the cancelling caller already
                // persisted the terminal state, so don't clobber it here.
                return Ok(());
            }

            let mut reroute = None;
            let mut failed = None;
            for resolution in resolutions {
                match resolution {
                    StageResolution::Continue { stage_name, result, fields } => {
                        state.record_stage(stage_name.as_ref(), result, fields);
                        state.current_stage = Some(stage_name.as_ref().to_string());
                    }
                    StageResolution::FailWorkflow { reason } => failed = Some(reason),
                    StageResolution::RouteTo { target } => reroute = Some(target),
                }
            }

            if let Some(reason) = failed {
                state.error = Some(reason.clone());
                state.transition(WorkflowStatus::Failed)?;
                self.save_state(&state).await?;
                self.progress
                    .append_audit(workflow_id, AuditEventKind::ErrorOccurred, serde_json::json!({"reason": reason}))
                    .await?;
                self.publish_progress(workflow_id, state.current_stage.clone(), WorkflowStatus::Failed, 100, &reason)
                    .await;
                return Ok(());
            }

            if let Some(target) = reroute {
                state.current_stage = Some(target.as_ref().to_string());
            }

            self.save_state(&state).await?;
            let percent = progress_percent(&batches, start);
            self.publish_progress(
                workflow_id,
                state.current_stage.clone(),
                WorkflowStatus::Running,
                percent,
                "stage batch finished",
            )
            .await;
        }
    }

    async fn execute_batch(
        &self,
        state: &WorkflowState,
        batch: &[Stage],
        token: &CancellationToken,
    ) -> Vec<StageResolution> {
        let mut futures = Vec::with_capacity(batch.len());
        for stage in batch {
            futures.push(self.run_stage(state, stage, token));
        }
        futures::future::join_all(futures).await
    }

    async fn run_stage(&self, state: &WorkflowState, stage: &Stage, token: &CancellationToken) -> StageResolution {
        let workflow_id = state.workflow_id;
        if stage.skip_conditions.iter().any(|c| c.matches(&state.context)) {
            return StageResolution::Continue {
                stage_name: stage.name.clone(),
                result: StageResult {
                    outcome: StageOutcome::Skipped,
                    output: None,
                    attempts: 0,
                    started_at: Timestamp::now(),
                    finished_at: Timestamp::now(),
                },
                fields: HashMap::new(),
            };
        }

        if let Err(err) = self
            .progress
            .append_audit(workflow_id, AuditEventKind::StageStarted, serde_json::json!({"stage": stage.name}))
            .await
        {
            warn!(workflow_id = %workflow_id, error = %err, "failed to append stage-start audit record");
        }

        let started_at = Timestamp::now();
        // `OnErrorPolicy::RetryStage` re-dispatches here rather than
        // relying on an independent counter: the bound is the same
        // `max_attempts` the retry layer itself defaults to, so a stage
        // that keeps failing doesn't redispatch forever.
        let redispatch_limit = crate::retry::RetryPolicy::default().max_attempts.into_inner();
        let mut redispatches = 0u8;
        let mut total_attempts: u32 = 0;

        let resolution = loop {
            match self.dispatch_stage(state, stage).await {
                Ok((output, attempts)) => {
                    total_attempts += u32::from(attempts);
                    if let Err(err) = self
                        .progress
                        .append_audit(
                            workflow_id,
                            AuditEventKind::StageFinished,
                            serde_json::json!({"stage": stage.name, "outcome": "succeeded"}),
                        )
                        .await
                    {
                        warn!(workflow_id = %workflow_id, error = %err, "failed to append stage-finish audit record");
                    }
                    break match self.gate_on_approval(state, stage, token).await {
                        Ok(()) => {
                            let fields = merge_fields(stage, &output);
                            StageResolution::Continue {
                                stage_name: stage.name.clone(),
                                result: StageResult {
                                    outcome: StageOutcome::Succeeded,
                                    output: Some(output),
                                    attempts: total_attempts.min(u32::from(u8::MAX)) as u8,
                                    started_at,
                                    finished_at: Timestamp::now(),
                                },
                                fields,
                            }
                        }
                        Err(reason) => StageResolution::FailWorkflow { reason },
                    };
                }
                Err(err) => {
                    total_attempts += u32::from(error_attempts(&err));
                    if matches!(stage.on_error, OnErrorPolicy::RetryStage) && redispatches < redispatch_limit {
                        redispatches += 1;
                        warn!(
                            stage = %stage.name,
                            error = %err,
                            redispatch = redispatches,
                            "retrying stage after dispatch failure"
                        );
                        continue;
                    }
                    break self.resolve_error(stage, err, started_at, total_attempts.min(u32::from(u8::MAX)) as u8);
                }
            }
        };

        self.comm.record_stage_duration(stage.name.as_ref(), started_at.elapsed_ms());
        resolution
    }

    async fn dispatch_stage(&self, state: &WorkflowState, stage: &Stage) -> Result<(Value, u8), CoreError> {
        let agent_id = self
            .comm
            .select_agent(&stage.handler_agent_type)
            .await
            .ok_or_else(|| CoreError::NoRoute(stage.handler_agent_type.as_ref().to_string()))?;
        let payload = serde_json::json!({
            "rfp_id": state.rfp_id,
            "workflow_id": state.workflow_id,
            "stage": stage.name,
            "context": state.context,
        });
        let envelope = Envelope::new_request(
            engine_agent_id(),
            Recipient::Agent(agent_id),
            payload,
            EnvelopeOptions::default(),
        );
        let (response, attempts) = self.comm.request_with_attempts(envelope, stage.timeout_ms).await?;
        Ok((response.payload().clone(), attempts))
    }

    fn resolve_error(&self, stage: &Stage, err: CoreError, started_at: Timestamp, attempts: u8) -> StageResolution {
        warn!(stage = %stage.name, error = %err, "stage dispatch failed");
        match &stage.on_error {
            OnErrorPolicy::FailWorkflow => StageResolution::FailWorkflow { reason: err.to_string() },
            OnErrorPolicy::SkipStage => StageResolution::Continue {
                stage_name: stage.name.clone(),
                result: StageResult {
                    outcome: StageOutcome::Skipped,
                    output: None,
                    attempts,
                    started_at,
                    finished_at: Timestamp::now(),
                },
                fields: HashMap::new(),
            },
            OnErrorPolicy::RetryStage => StageResolution::Continue {
                stage_name: stage.name.clone(),
                result: StageResult {
                    outcome: StageOutcome::Failed,
                    output: None,
                    attempts,
                    started_at,
                    finished_at: Timestamp::now(),
                },
                fields: HashMap::new(),
            },
            OnErrorPolicy::RouteTo { stage: target } => StageResolution::RouteTo { target: target.clone() },
        }
    }

    /// Waits for the approval decision a just-succeeded stage requires, if
    /// any. Returns `Err` with the failure reason if the stage should fail
    /// the workflow (explicit rejection, or a timeout under the `reject`
    /// policy).
    async fn gate_on_approval(&self, state: &WorkflowState, stage: &Stage, token: &CancellationToken) -> Result<(), String> {
        if !stage.requires_approval {
            return Ok(());
        }
        let workflow_id = state.workflow_id;
        let (tx, rx) = oneshot::channel();
        self.approvals.insert(workflow_id, tx);

        if let Err(err) = self
            .progress
            .append_audit(workflow_id, AuditEventKind::ApprovalRequested, serde_json::json!({"stage": stage.name}))
            .await
        {
            warn!(workflow_id = %workflow_id, error = %err, "failed to append approval-requested audit record");
        }
        self.publish_progress(
            workflow_id,
            Some(stage.name.as_ref().to_string()),
            WorkflowStatus::WaitingApproval,
            50,
            "waiting on approval",
        )
        .await;
        if let Err(err) = self.persist_waiting_approval(workflow_id, stage.name.as_ref()).await {
            warn!(workflow_id = %workflow_id, error = %err, "failed to persist waiting_approval status");
        }

        let decision = match stage.approval_timeout_policy {
            crate::workflow::template::ApprovalTimeoutPolicy::Escalate => {
                tokio::select! {
                    result = rx => result.unwrap_or(ApprovalDecision::Rejected),
                    () = token.cancelled() => return Err("workflow cancelled while awaiting approval".to_string()),
                }
            }
            _ => {
                let deadline = std::time::Duration::from_millis(stage.approval_timeout_ms);
                tokio::select! {
                    result = tokio::time::timeout(deadline, rx) => match result {
                        Ok(Ok(decision)) => decision,
                        Ok(Err(_)) => ApprovalDecision::Rejected,
                        Err(_) => match stage.approval_timeout_policy {
                            crate::workflow::template::ApprovalTimeoutPolicy::AutoApprove => ApprovalDecision::Approved,
                            _ => ApprovalDecision::Rejected,
                        },
                    },
                    () = token.cancelled() => return Err("workflow cancelled while awaiting approval".to_string()),
                }
            }
        };
        self.approvals.remove(&workflow_id);

        match decision {
            ApprovalDecision::Approved => Ok(()),
            ApprovalDecision::Rejected => Err(format!("approval rejected for stage {}", stage.name)),
        }
    }

    async fn finish(&self, state: &mut WorkflowState, template: &crate::workflow::template::WorkflowTemplate) -> Result<(), CoreError> {
        let response = match &template.response_builder_stage {
            Some(stage_name) => state
                .stage_results
                .get(stage_name.as_ref())
                .and_then(|result| result.output.clone())
                .unwrap_or_else(|| serde_json::to_value(&state.context).unwrap_or(Value::Null)),
            None => serde_json::to_value(&state.context).unwrap_or(Value::Null),
        };
        state.response = Some(response);
        state.transition(WorkflowStatus::Completed)?;
        self.save_state(state).await?;
        self.progress
            .append_audit(state.workflow_id, AuditEventKind::WorkflowCompleted, Value::Null)
            .await?;
        self.publish_progress(state.workflow_id, None, WorkflowStatus::Completed, 100, "workflow completed")
            .await;
        Ok(())
    }
}

fn batch_stages(stages: &[Stage]) -> Vec<Vec<Stage>> {
    let mut batches: Vec<Vec<Stage>> = Vec::new();
    for stage in stages {
        let joins_last = match (&stage.parallel_group, batches.last()) {
            (Some(group), Some(last)) => last.last().is_some_and(|s: &Stage| s.parallel_group.as_ref() == Some(group)),
            _ => false,
        };
        if joins_last {
            batches.last_mut().expect("joins_last implies a prior batch exists").push(stage.clone());
        } else {
            batches.push(vec![stage.clone()]);
        }
    }
    batches
}

fn start_batch_index(batches: &[Vec<Stage>], current_stage: Option<&str>) -> usize {
    let Some(current) = current_stage else {
        return 0;
    };
    for (index, batch) in batches.iter().enumerate() {
        if batch.iter().any(|s| s.name.as_ref() == current) {
            return index + 1;
        }
    }
    0
}

fn progress_percent(batches: &[Vec<Stage>], completed_through: usize) -> u8 {
    if batches.is_empty() {
        return 100;
    }
    let done = (completed_through + 1).min(batches.len());
    ((done as f64 / batches.len() as f64) * 100.0) as u8
}

/// How many attempts a dispatch failure represents: the retry layer's own
/// count if it ran one to exhaustion, one otherwise (the error came from
/// something that never reached `request_with_attempts`, like an absent
/// route).
fn error_attempts(err: &CoreError) -> u8 {
    match err {
        CoreError::Exhausted { attempts, .. } => *attempts,
        _ => 1,
    }
}

fn merge_fields(stage: &Stage, output: &Value) -> HashMap<String, Value> {
    if stage.output_mapping.is_empty() {
        let mut fields = HashMap::new();
        fields.insert(stage.name.as_ref().to_string(), output.clone());
        return fields;
    }
    let mut fields = HashMap::new();
    for (response_field, context_field) in &stage.output_mapping {
        if let Some(value) = output.get(response_field) {
            fields.insert(context_field.clone(), value.clone());
        }
    }
    fields
}
