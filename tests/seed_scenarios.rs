//! End-to-end seed scenarios (happy path, parallel group, retry then
//! succeed, priority overtake, approval wait across a restart), each
//! exercising a `CommunicationManager`/`WorkflowEngine` pair wired the same
//! way `workflow::engine`'s own test module does.

use rfp_core::comm_manager::{CommManagerConfig, CommunicationManager};
use rfp_core::domain_types::{AgentId, AgentType, RfpId, StageName, TemplateId, TimeoutMs};
use rfp_core::envelope::{Envelope, EnvelopeOptions, Priority, Recipient};
use rfp_core::kv::memory::MemoryKvStore;
use rfp_core::kv::KvStore;
use rfp_core::progress::ProgressTracker;
use rfp_core::retry::{BackoffStrategy, RetryPolicy};
use rfp_core::workflow::template::{Complexity, OnErrorPolicy, Stage};
use rfp_core::workflow::{RfpDocument, TemplateStore, WorkflowEngine, WorkflowStatus, WorkflowTemplate};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn document() -> RfpDocument {
    RfpDocument {
        rfp_id: RfpId::try_new("RFP-1".to_string()).unwrap(),
        priority: Priority::Normal,
        complexity: Complexity::Low,
        estimated_value: rust_decimal::Decimal::from(100_000),
        is_standard_product: false,
        body: json!({}),
    }
}

fn stage(name: &str, agent_type: &str, timeout_ms: u64) -> Stage {
    Stage {
        name: StageName::try_new(name.to_string()).unwrap(),
        handler_agent_type: AgentType::try_new(agent_type.to_string()).unwrap(),
        timeout_ms: TimeoutMs::try_new(timeout_ms).unwrap(),
        skip_conditions: vec![],
        parallel_group: None,
        requires_approval: false,
        approver_roles: vec![],
        approval_timeout_policy: rfp_core::workflow::template::ApprovalTimeoutPolicy::Reject,
        approval_timeout_ms: 1_000,
        on_error: OnErrorPolicy::FailWorkflow,
        output_mapping: HashMap::new(),
    }
}

async fn setup(kv: Arc<dyn KvStore>, templates: Vec<WorkflowTemplate>) -> (Arc<WorkflowEngine>, Arc<CommunicationManager>) {
    let (comm, _rx) = CommunicationManager::new(CommManagerConfig::default(), Arc::clone(&kv));
    let progress = Arc::new(ProgressTracker::new(Arc::clone(&comm), Arc::clone(&kv)));
    let store = Arc::new(TemplateStore::new(templates));
    let engine = WorkflowEngine::new(Arc::clone(&comm), kv, progress, store);
    (engine, comm)
}

async fn respond_once(comm: &Arc<CommunicationManager>, agent_id: &str, agent_type: &str, payload: serde_json::Value) {
    comm.register_agent(
        AgentId::try_new(agent_id.to_string()).unwrap(),
        AgentType::try_new(agent_type.to_string()).unwrap(),
        vec![],
        serde_json::Value::Null,
    );
    let comm = Arc::clone(comm);
    let agent = AgentId::try_new(agent_id.to_string()).unwrap();
    tokio::spawn(async move {
        let received = comm.receive(&agent, Instant::now() + Duration::from_secs(5)).await.unwrap();
        let response = Envelope::new_response(&received, payload);
        comm.send(response).await.unwrap();
    });
}

async fn wait_for_terminal(engine: &Arc<WorkflowEngine>, workflow_id: rfp_core::domain_types::WorkflowId) -> rfp_core::workflow::WorkflowState {
    for _ in 0..200 {
        let current = engine.get(workflow_id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow did not reach a terminal status in time");
}

#[tokio::test]
async fn happy_path_sequential_template_completes_in_order() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new("/tmp/seed-happy-path.ndjson"));
    let names = ["parse", "sales", "technical", "pricing", "respond"];
    let template = WorkflowTemplate {
        template_id: TemplateId::try_new("sequential".to_string()).unwrap(),
        name: "sequential".to_string(),
        stages: names.iter().map(|n| stage(n, n, 2_000)).collect(),
        selection_predicate: None,
        response_builder_stage: None,
    };
    let (engine, comm) = setup(kv, vec![template]).await;
    for name in names {
        respond_once(&comm, &format!("{name}-1"), name, json!({"status": "success"})).await;
    }

    let workflow_id = engine
        .submit(document(), Some(TemplateId::try_new("sequential".to_string()).unwrap()))
        .await
        .unwrap();
    let state = wait_for_terminal(&engine, workflow_id).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.completed_stages, names.to_vec());
    assert!(state.response.is_some());
}

#[tokio::test]
async fn parallel_group_stages_run_concurrently() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new("/tmp/seed-parallel-group.ndjson"));
    let group = rfp_core::domain_types::ParallelGroup::try_new("valpack".to_string()).unwrap();
    let mut technical = stage("technical", "technical", 2_000);
    technical.parallel_group = Some(group.clone());
    let mut pricing = stage("pricing", "pricing", 2_000);
    pricing.parallel_group = Some(group);
    let respond = stage("respond", "respond", 2_000);
    let template = WorkflowTemplate {
        template_id: TemplateId::try_new("parallel".to_string()).unwrap(),
        name: "parallel".to_string(),
        stages: vec![technical, pricing, respond],
        selection_predicate: None,
        response_builder_stage: None,
    };
    let (engine, comm) = setup(kv, vec![template]).await;

    for (agent, agent_type) in [("technical-1", "technical"), ("pricing-1", "pricing")] {
        comm.register_agent(
            AgentId::try_new(agent.to_string()).unwrap(),
            AgentType::try_new(agent_type.to_string()).unwrap(),
            vec![],
            serde_json::Value::Null,
        );
        let comm = Arc::clone(&comm);
        let agent_id = AgentId::try_new(agent.to_string()).unwrap();
        tokio::spawn(async move {
            let received = comm.receive(&agent_id, Instant::now() + Duration::from_secs(5)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let response = Envelope::new_response(&received, json!({"status": "success"}));
            comm.send(response).await.unwrap();
        });
    }
    respond_once(&comm, "respond-1", "respond", json!({"status": "success"})).await;

    let started = Instant::now();
    let workflow_id = engine
        .submit(document(), Some(TemplateId::try_new("parallel".to_string()).unwrap()))
        .await
        .unwrap();
    let state = wait_for_terminal(&engine, workflow_id).await;
    let elapsed = started.elapsed();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!(elapsed < Duration::from_millis(350), "parallel stages should overlap, took {elapsed:?}");
    let technical_pos = state.completed_stages.iter().position(|s| s == "technical").unwrap();
    let pricing_pos = state.completed_stages.iter().position(|s| s == "pricing").unwrap();
    let respond_pos = state.completed_stages.iter().position(|s| s == "respond").unwrap();
    assert!(respond_pos > technical_pos && respond_pos > pricing_pos);
}

#[tokio::test]
async fn retry_then_succeed_resolves_on_the_second_attempt() {
    // `comm_manager.rs`'s own retry loop lives below the workflow engine
    // (stages don't carry a per-stage retry policy — only the envelope
    // does), so this drives `CommunicationManager::request` directly, the
    // same way `comm_manager.rs::tests::request_resolves_once_matching_response_sent`
    // does, but with the first attempt left to time out before the
    // responder answers the retried attempt.
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new("/tmp/seed-retry-succeed.ndjson"));
    let (comm, _rx) = CommunicationManager::new(CommManagerConfig::default(), kv);
    let agent_id = AgentId::try_new("technical-1".to_string()).unwrap();
    comm.register_agent(agent_id.clone(), AgentType::try_new("technical".to_string()).unwrap(), vec![], json!(null));

    let responder = Arc::clone(&comm);
    let responder_agent = agent_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        let received = responder.receive(&responder_agent, Instant::now() + Duration::from_secs(5)).await.unwrap();
        let response = Envelope::new_response(&received, json!({"status": "success"}));
        responder.send(response).await.unwrap();
    });

    let request = Envelope::new_request(
        AgentId::try_new("engine".to_string()).unwrap(),
        Recipient::Agent(agent_id),
        json!({}),
        EnvelopeOptions {
            retry_policy: Some(RetryPolicy {
                strategy: BackoffStrategy::Exponential {
                    base_ms: rfp_core::retry::BaseDelayMs::try_new(10).unwrap(),
                    factor: rfp_core::retry::BackoffFactor::try_new(2.0).unwrap(),
                    cap_ms: rfp_core::retry::CapMs::try_new(1_000).unwrap(),
                },
                max_attempts: rfp_core::domain_types::MaxAttempts::try_new(3).unwrap(),
            }),
            ..Default::default()
        },
    );

    let (response, attempts) = comm.request_with_attempts(request, TimeoutMs::try_new(60).unwrap()).await.unwrap();
    assert_eq!(response.payload(), &json!({"status": "success"}));
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn priority_overtake_returns_urgent_ahead_of_queued_normals() {
    let queue = rfp_core::queue::QueueLayer::new(rfp_core::domain_types::QueueCapacity::try_new(200).unwrap());
    let agent_id = AgentId::try_new("slow".to_string()).unwrap();
    let sender = AgentId::try_new("producer".to_string()).unwrap();

    for _ in 0..100 {
        let envelope = Envelope::new_request(
            sender.clone(),
            Recipient::Agent(agent_id.clone()),
            json!({}),
            EnvelopeOptions { priority: Priority::Normal, ..Default::default() },
        );
        queue.enqueue(&agent_id, envelope, Instant::now() + Duration::from_secs(1)).await.unwrap();
    }
    let urgent = Envelope::new_request(
        sender.clone(),
        Recipient::Agent(agent_id.clone()),
        json!({"marker": "urgent"}),
        EnvelopeOptions { priority: Priority::Urgent, ..Default::default() },
    );
    queue.enqueue(&agent_id, urgent, Instant::now() + Duration::from_secs(1)).await.unwrap();

    let first = queue.dequeue(&agent_id, Instant::now() + Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.priority(), Priority::Urgent);

    for _ in 0..100 {
        let next = queue.dequeue(&agent_id, Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(next.priority(), Priority::Normal);
    }
}

#[tokio::test]
async fn approval_wait_resumes_and_completes_after_restart() {
    let path = "/tmp/seed-approval-restart.ndjson";
    let _ = std::fs::remove_file(path);
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new(path));

    let mut approval_stage = stage("approval", "approval", 2_000);
    approval_stage.requires_approval = true;
    approval_stage.approval_timeout_ms = 60_000;
    let respond = stage("respond", "respond", 2_000);
    let template = WorkflowTemplate {
        template_id: TemplateId::try_new("with-approval".to_string()).unwrap(),
        name: "with-approval".to_string(),
        stages: vec![approval_stage, respond],
        selection_predicate: None,
        response_builder_stage: None,
    };

    let workflow_id = {
        let (engine, comm) = setup(Arc::clone(&kv), vec![template.clone()]).await;
        respond_once(&comm, "approval-1", "approval", json!({"status": "success"})).await;
        let workflow_id = engine
            .submit(document(), Some(TemplateId::try_new("with-approval".to_string()).unwrap()))
            .await
            .unwrap();

        let mut waiting = false;
        for _ in 0..200 {
            let current = engine.get(workflow_id).await.unwrap().unwrap();
            if current.status == WorkflowStatus::WaitingApproval {
                waiting = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(waiting, "workflow should reach waiting_approval before the simulated restart");
        workflow_id
    };

    // Simulated restart: a fresh engine rebuilt over the same kv store.
    // `resume_pending` re-dispatches the approval stage from scratch (the
    // prior process's in-flight request and its `approvals` oneshot were
    // both lost with it), so both handlers need registering again.
    let (engine, comm) = setup(Arc::clone(&kv), vec![template]).await;
    respond_once(&comm, "approval-1", "approval", json!({"status": "success"})).await;
    respond_once(&comm, "respond-1", "respond", json!({"status": "success"})).await;
    engine.resume_pending().await.unwrap();

    let mut waiting_again = false;
    for _ in 0..200 {
        let current = engine.get(workflow_id).await.unwrap().unwrap();
        if current.status == WorkflowStatus::WaitingApproval {
            waiting_again = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(waiting_again, "resumed workflow should reach waiting_approval again before deciding");

    engine
        .submit_approval(workflow_id, rfp_core::workflow::ApprovalDecision::Approved, "operator")
        .await
        .unwrap();

    let state = wait_for_terminal(&engine, workflow_id).await;
    assert_eq!(state.status, WorkflowStatus::Completed);
}
