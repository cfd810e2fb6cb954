//! RFP coordination core: a messaging fabric (typed envelopes, per-agent
//! priority queues, registry, retry/circuit-breaker, tracing/metrics,
//! pluggable key-value persistence) topped with a workflow engine that
//! drives staged RFP-response orchestration end to end.
//!
//! [`CoreRuntime`] is the composition root: it wires every component
//! together from one [`config::CoreConfig`] and is the only type most
//! callers need to hold onto.

pub mod breaker;
pub mod comm_manager;
pub mod config;
pub mod domain_types;
pub mod envelope;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod server;
pub mod tracer;
pub mod workflow;

use crate::comm_manager::CommunicationManager;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::kv::memory::MemoryKvStore;
use crate::kv::sqlite::SqliteKvStore;
use crate::kv::KvStore;
use crate::progress::ProgressTracker;
use crate::workflow::{TemplateStore, WorkflowEngine, WorkflowTemplate};
use std::sync::Arc;
use tracing::info;

/// The fully-wired coordination core: fabric, workflow engine, and the
/// configuration they were built from.
///
/// Construct with [`CoreRuntime::new`], then build an `axum::Router` over
/// [`CoreRuntime::engine`] with [`server::create_router`].
pub struct CoreRuntime {
    /// The configuration this runtime was built from.
    pub config: CoreConfig,
    /// The messaging fabric every agent and the workflow engine talk to.
    pub comm: Arc<CommunicationManager>,
    /// The workflow engine driving RFP processing.
    pub engine: Arc<WorkflowEngine>,
}

impl CoreRuntime {
    /// Builds every component from `config`, registers `templates` (a
    /// `standard` fallback is always ensured even if empty), and resumes
    /// any non-terminal workflows left behind by a prior process.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]/[`CoreError::Migration`] if the
    /// persistent store can't be opened, or whatever
    /// [`WorkflowEngine::resume_pending`] surfaces while reloading state.
    pub async fn new(
        config: CoreConfig,
        templates: Vec<WorkflowTemplate>,
    ) -> Result<Arc<Self>, CoreError> {
        let kv: Arc<dyn KvStore> = if config.enable_persistence {
            let path = config
                .storage_path
                .as_ref()
                .ok_or_else(|| CoreError::StateConflict("enable_persistence requires storage_path".to_string()))?;
            Arc::new(SqliteKvStore::connect(&path.to_string_lossy()).await?)
        } else {
            Arc::new(MemoryKvStore::new("./data/core-snapshot.ndjson"))
        };

        let (comm, _registry_notifications) =
            CommunicationManager::new(config.comm_manager_config(), Arc::clone(&kv));
        let progress = Arc::new(ProgressTracker::new(Arc::clone(&comm), Arc::clone(&kv)));
        let template_store = Arc::new(TemplateStore::new(templates));
        let engine = WorkflowEngine::new(Arc::clone(&comm), kv, progress, template_store);

        let resumed = engine.resume_pending().await?;
        info!(resumed, "workflow engine ready");

        Ok(Arc::new(Self {
            config,
            comm,
            engine,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runtime_builds_and_resumes_with_no_prior_state() {
        let runtime = CoreRuntime::new(CoreConfig::testing(), Vec::new()).await.unwrap();
        assert!(runtime.engine.list().await.unwrap().is_empty());
    }
}
