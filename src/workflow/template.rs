//! Workflow template schema and the document-predicate language used to
//! select one (§4.8 "Submission").
//!
//! The donor has no direct counterpart for a staged orchestration schema;
//! this is authored fresh in `message_router/config.rs`'s builder-pattern
//! idiom, the donor's closest precedent for a declarative, nutype-validated
//! configuration surface.

use crate::domain_types::{AgentType, ParallelGroup, RfpId, StageName, TemplateId, TimeoutMs};
use crate::envelope::Priority;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Coarse complexity tier a submitted RFP document is tagged with, used by
/// `TemplatePredicate::Complexity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Boilerplate, single-product RFPs.
    Low,
    /// Multi-line-item RFPs with some customization.
    Medium,
    /// Bespoke, multi-stakeholder RFPs.
    High,
}

/// The document a submitted RFP is represented as, evaluated against
/// template predicates and carried as the workflow's initial context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfpDocument {
    /// The RFP this document describes.
    pub rfp_id: RfpId,
    /// Declared or inferred urgency.
    pub priority: Priority,
    /// Declared or inferred complexity tier.
    pub complexity: Complexity,
    /// Estimated deal value, used by the `estimated_value` predicate.
    pub estimated_value: Decimal,
    /// Whether this RFP matches a standard, pre-priced product line.
    pub is_standard_product: bool,
    /// The submitted document body, available to stages as context.
    pub body: Value,
}

/// The fixed predicate language §4.8 names for template selection:
/// `priority`, `complexity`, `estimated_value`, `is_standard_product`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum TemplatePredicate {
    /// Matches when the document's priority is at least `at_least`.
    Priority {
        /// Minimum priority to match.
        at_least: Priority,
    },
    /// Matches when the document's complexity is at least `at_least`.
    Complexity {
        /// Minimum complexity to match.
        at_least: Complexity,
    },
    /// Matches when the estimated value is at least `at_least`.
    EstimatedValue {
        /// Minimum estimated value to match.
        at_least: Decimal,
    },
    /// Matches the document's `is_standard_product` flag exactly.
    IsStandardProduct {
        /// The flag value to match.
        equals: bool,
    },
    /// Matches when every nested predicate matches.
    All(Vec<TemplatePredicate>),
    /// Matches when any nested predicate matches.
    Any(Vec<TemplatePredicate>),
}

impl TemplatePredicate {
    /// Evaluates this predicate against `document`.
    #[must_use]
    pub fn matches(&self, document: &RfpDocument) -> bool {
        match self {
            Self::Priority { at_least } => document.priority >= *at_least,
            Self::Complexity { at_least } => document.complexity >= *at_least,
            Self::EstimatedValue { at_least } => document.estimated_value >= *at_least,
            Self::IsStandardProduct { equals } => document.is_standard_product == *equals,
            Self::All(predicates) => predicates.iter().all(|p| p.matches(document)),
            Self::Any(predicates) => predicates.iter().any(|p| p.matches(document)),
        }
    }
}

/// Comparison a [`SkipCondition`] applies to a workflow-context field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipOp {
    /// The field equals `value`.
    Equals,
    /// The field does not equal `value`.
    NotEquals,
}

/// A single condition under which a stage is skipped, checked against a
/// top-level field of the workflow's running context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipCondition {
    /// The context field to read.
    pub field: String,
    /// How to compare it.
    pub op: SkipOp,
    /// The value to compare against.
    pub value: Value,
}

impl SkipCondition {
    /// Whether this condition matches the given workflow context.
    #[must_use]
    pub fn matches(&self, context: &HashMap<String, Value>) -> bool {
        let found = context.get(&self.field);
        match self.op {
            SkipOp::Equals => found == Some(&self.value),
            SkipOp::NotEquals => found != Some(&self.value),
        }
    }
}

/// What to do when a stage's dispatch fails terminally (§4.8 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Fail the whole workflow (default).
    FailWorkflow,
    /// Mark the stage `skipped` and continue.
    SkipStage,
    /// Re-dispatch the stage (bounded by the Retry & Breaker layer's own
    /// `max_attempts`, not an independent counter).
    RetryStage,
    /// Jump to `stage` instead of the template's declared next stage.
    RouteTo {
        /// The stage to continue at.
        stage: StageName,
    },
}

impl Default for OnErrorPolicy {
    fn default() -> Self {
        Self::FailWorkflow
    }
}

/// What happens when an approval gate's timeout elapses unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTimeoutPolicy {
    /// Treat the timeout as a rejection.
    Reject,
    /// Treat the timeout as an approval.
    AutoApprove,
    /// Hand off to an escalation path outside this engine's scope; the
    /// workflow remains `waiting_approval` until a decision arrives.
    Escalate,
}

impl Default for ApprovalTimeoutPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

/// One stage of a [`WorkflowTemplate`] (§3 "Workflow template").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// The stage's name, unique within its template.
    pub name: StageName,
    /// The agent type dispatched to run this stage.
    pub handler_agent_type: AgentType,
    /// Deadline for the stage's request/response round trip.
    pub timeout_ms: TimeoutMs,
    /// Conditions under which this stage is skipped entirely.
    #[serde(default)]
    pub skip_conditions: Vec<SkipCondition>,
    /// Stages sharing a `parallel_group` dispatch concurrently.
    #[serde(default)]
    pub parallel_group: Option<ParallelGroup>,
    /// Whether completing this stage requires an explicit approval.
    #[serde(default)]
    pub requires_approval: bool,
    /// Roles permitted to decide this stage's approval, if required.
    #[serde(default)]
    pub approver_roles: Vec<String>,
    /// What happens if the approval gate's timeout elapses.
    #[serde(default)]
    pub approval_timeout_policy: ApprovalTimeoutPolicy,
    /// Timeout for an outstanding approval, in milliseconds.
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
    /// Policy applied if this stage's dispatch fails terminally.
    #[serde(default)]
    pub on_error: OnErrorPolicy,
    /// Maps response payload fields to workflow-context field names.
    /// An empty mapping merges the whole response object under the stage
    /// name.
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
}

fn default_approval_timeout_ms() -> u64 {
    86_400_000
}

/// The declarative schema driving the engine (§3 "Workflow template").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// This template's id.
    pub template_id: TemplateId,
    /// A human-readable name.
    pub name: String,
    /// The ordered stage list (parallel groups aside, dispatch order
    /// follows this vector).
    pub stages: Vec<Stage>,
    /// The predicate the engine evaluates against a submitted document to
    /// decide whether this template applies, when no `template_id` was
    /// requested explicitly. `None` means this template is never
    /// auto-selected (only usable by explicit id).
    pub selection_predicate: Option<TemplatePredicate>,
    /// The stage, if any, whose output becomes the workflow's final
    /// response payload.
    pub response_builder_stage: Option<StageName>,
}

impl WorkflowTemplate {
    /// A minimal template usable as the universal fallback: a single
    /// `intake` stage dispatched to the `generalist` agent type, no
    /// approval gate, no selection predicate (only reachable by explicit
    /// `template_id = "standard"` or as the selection fallback).
    #[must_use]
    pub fn standard() -> Self {
        Self {
            template_id: TemplateId::standard(),
            name: "Standard RFP handling".to_string(),
            stages: vec![Stage {
                name: StageName::try_new("intake").expect("\"intake\" is a valid StageName"),
                handler_agent_type: AgentType::try_new("generalist")
                    .expect("\"generalist\" is a valid AgentType"),
                timeout_ms: TimeoutMs::default(),
                skip_conditions: Vec::new(),
                parallel_group: None,
                requires_approval: false,
                approver_roles: Vec::new(),
                approval_timeout_policy: ApprovalTimeoutPolicy::default(),
                approval_timeout_ms: default_approval_timeout_ms(),
                on_error: OnErrorPolicy::default(),
                output_mapping: HashMap::new(),
            }],
            selection_predicate: None,
            response_builder_stage: None,
        }
    }

    /// Stages sharing `group`, in template order.
    #[must_use]
    pub fn stages_in_group<'a>(&'a self, group: &'a ParallelGroup) -> Vec<&'a Stage> {
        self.stages
            .iter()
            .filter(|stage| stage.parallel_group.as_ref() == Some(group))
            .collect()
    }
}

/// What happened when a stage ran, recorded in a workflow's
/// `stage_results`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The handler responded successfully.
    Succeeded,
    /// A `skip_conditions` entry matched; the stage never dispatched.
    Skipped,
    /// The handler failed terminally (after retries/breaker policy).
    Failed,
}

/// A registered set of templates, queried by id or selected by predicate.
///
/// Preserves registration order so predicate-based selection is
/// deterministic: the first registered template whose predicate matches
/// wins, falling back to `standard` if none do.
pub struct TemplateStore {
    order: Vec<TemplateId>,
    by_id: HashMap<TemplateId, WorkflowTemplate>,
}

impl TemplateStore {
    /// Builds a store from `templates`, always ensuring a `standard`
    /// fallback exists (inserting [`WorkflowTemplate::standard`] if the
    /// caller didn't supply one).
    #[must_use]
    pub fn new(templates: Vec<WorkflowTemplate>) -> Self {
        let mut store = Self {
            order: Vec::new(),
            by_id: HashMap::new(),
        };
        for template in templates {
            store.insert(template);
        }
        if !store.by_id.contains_key(&TemplateId::standard()) {
            store.insert(WorkflowTemplate::standard());
        }
        store
    }

    /// Registers or replaces `template`.
    pub fn insert(&mut self, template: WorkflowTemplate) {
        if !self.by_id.contains_key(&template.template_id) {
            self.order.push(template.template_id.clone());
        }
        self.by_id.insert(template.template_id.clone(), template);
    }

    /// Looks up a template by id.
    #[must_use]
    pub fn get(&self, template_id: &TemplateId) -> Option<&WorkflowTemplate> {
        self.by_id.get(template_id)
    }

    /// Selects a template for `document` per §4.8: the first registered
    /// template (in registration order) whose `selection_predicate`
    /// matches, falling back to `standard` if none do.
    #[must_use]
    pub fn select_for(&self, document: &RfpDocument) -> TemplateId {
        for template_id in &self.order {
            if let Some(template) = self.by_id.get(template_id) {
                if let Some(predicate) = &template.selection_predicate {
                    if predicate.matches(document) {
                        return template_id.clone();
                    }
                }
            }
        }
        TemplateId::standard()
    }
}
