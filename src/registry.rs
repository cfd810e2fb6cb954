//! Agent Registry (§4.3).
//!
//! Grounded in the donor's `AgentRegistryImpl` (`message_router/router.rs`):
//! a `DashMap` for O(1) lookup by id plus a secondary capability index, and
//! a background sweep task modeled on `lifecycle.rs`'s
//! `run_health_monitor` loop.

use crate::domain_types::{AgentId, AgentType, CapabilityName};
use crate::error::CoreError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, instrument};

/// Lifecycle status of a registered agent (§3 "Agent registry entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered but not yet ready to receive work.
    Starting,
    /// Healthy and eligible for dispatch.
    Ready,
    /// Healthy but at capacity; still eligible, deprioritized by the
    /// workflow engine's tie-break rule.
    Busy,
    /// Heartbeating but reporting reduced health.
    Degraded,
    /// Heartbeat stale past `stale_after_ms`; excluded from lookups.
    Unavailable,
}

/// A single entry in the agent directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// The agent's id.
    pub agent_id: AgentId,
    /// The agent's declared type (used by stage dispatch).
    pub agent_type: AgentType,
    /// Capabilities the agent advertises.
    pub capabilities: Vec<CapabilityName>,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Free-form metadata supplied at registration.
    pub metadata: Value,
    #[serde(skip, default = "Instant::now")]
    last_heartbeat: Instant,
}

/// Event emitted on the internal `system/registry` topic.
#[derive(Debug, Clone)]
pub enum RegistryNotification {
    /// An id was registered while already present; the prior entry was
    /// replaced.
    ReRegistered(AgentId),
    /// An agent's heartbeat went stale and it was marked `unavailable`.
    WentStale(AgentId),
}

/// The agent directory: the single source of truth for routing.
pub struct AgentRegistry {
    entries: DashMap<AgentId, RegistryEntry>,
    by_capability: DashMap<CapabilityName, HashSet<AgentId>>,
    stale_after: Duration,
    notifications: mpsc::UnboundedSender<RegistryNotification>,
}

impl AgentRegistry {
    /// Builds a registry; `stale_after` is the heartbeat age past which an
    /// entry flips to `unavailable`. Returns the registry plus the receiver
    /// end of its `system/registry` notification channel.
    #[must_use]
    pub fn new(stale_after: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                entries: DashMap::new(),
                by_capability: DashMap::new(),
                stale_after,
                notifications: tx,
            }),
            rx,
        )
    }

    /// Registers `agent_id`. Replacing an existing entry emits
    /// [`RegistryNotification::ReRegistered`] on the internal topic.
    #[instrument(skip(self, metadata), fields(agent_id = %agent_id))]
    pub fn register(
        &self,
        agent_id: AgentId,
        agent_type: AgentType,
        capabilities: Vec<CapabilityName>,
        metadata: Value,
    ) {
        let replaced = self.entries.contains_key(&agent_id);
        for cap in &capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(agent_id.clone());
        }
        self.entries.insert(
            agent_id.clone(),
            RegistryEntry {
                agent_id: agent_id.clone(),
                agent_type,
                capabilities,
                status: AgentStatus::Starting,
                metadata,
                last_heartbeat: Instant::now(),
            },
        );
        if replaced {
            info!("agent re-registered");
            let _ = self
                .notifications
                .send(RegistryNotification::ReRegistered(agent_id));
        }
    }

    /// Removes `agent_id` from the directory and its capability index.
    pub fn unregister(&self, agent_id: &AgentId) {
        if let Some((_, entry)) = self.entries.remove(agent_id) {
            for cap in &entry.capabilities {
                if let Some(mut set) = self.by_capability.get_mut(cap) {
                    set.remove(agent_id);
                }
            }
        }
    }

    /// Records a heartbeat for `agent_id`, promoting it out of
    /// `unavailable` if it was stale.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `agent_id` is not registered.
    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<(), CoreError> {
        let mut entry = self
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.as_ref().to_string()))?;
        entry.last_heartbeat = Instant::now();
        if entry.status == AgentStatus::Unavailable || entry.status == AgentStatus::Starting {
            entry.status = AgentStatus::Ready;
        }
        Ok(())
    }

    /// Marks `agent_id`'s busy/ready/degraded status explicitly (distinct
    /// from the heartbeat-driven `unavailable` transition).
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `agent_id` is not registered.
    pub fn set_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<(), CoreError> {
        let mut entry = self
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.as_ref().to_string()))?;
        entry.status = status;
        Ok(())
    }

    /// Looks up every `ready`/`busy`/`degraded` agent advertising `cap`,
    /// excluding `unavailable` entries.
    #[must_use]
    pub fn lookup_by_capability(&self, cap: &CapabilityName) -> Vec<RegistryEntry> {
        self.by_capability
            .get(cap)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.entries.get(id))
                    .filter(|e| e.status != AgentStatus::Unavailable)
                    .map(|e| e.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Looks up every non-`unavailable` agent of the given type (used by
    /// the workflow engine's stage dispatch).
    #[must_use]
    pub fn lookup_by_type(&self, agent_type: &AgentType) -> Vec<RegistryEntry> {
        self.entries
            .iter()
            .filter(|e| &e.agent_type == agent_type && e.status != AgentStatus::Unavailable)
            .map(|e| e.clone())
            .collect()
    }

    /// The current status of `agent_id`.
    #[must_use]
    pub fn status(&self, agent_id: &AgentId) -> Option<AgentStatus> {
        self.entries.get(agent_id).map(|e| e.status)
    }

    /// All registered entries, including `unavailable` ones.
    #[must_use]
    pub fn list(&self) -> Vec<RegistryEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    /// Sweeps every entry, flipping any whose heartbeat is older than
    /// `stale_after` to `unavailable` and emitting
    /// [`RegistryNotification::WentStale`] for each.
    pub fn sweep_stale(&self) {
        let now = Instant::now();
        let mut went_stale = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.status != AgentStatus::Unavailable
                && now.duration_since(entry.last_heartbeat) > self.stale_after
            {
                entry.status = AgentStatus::Unavailable;
                went_stale.push(entry.agent_id.clone());
            }
        }
        for id in went_stale {
            let _ = self.notifications.send(RegistryNotification::WentStale(id));
        }
    }

    /// Spawns the background sweep task on `interval`, running for the
    /// lifetime of the returned handle.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep_stale();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(entries: &[RegistryEntry]) -> Vec<String> {
        let mut ids: Vec<String> = entries.iter().map(|e| e.agent_id.as_ref().to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn register_then_lookup_by_type() {
        let (registry, _rx) = AgentRegistry::new(Duration::from_secs(15));
        registry.register(
            AgentId::try_new("pricing-1".to_string()).unwrap(),
            AgentType::try_new("pricing".to_string()).unwrap(),
            vec![],
            Value::Null,
        );
        let found = registry.lookup_by_type(&AgentType::try_new("pricing".to_string()).unwrap());
        assert_eq!(ids(&found), vec!["pricing-1"]);
    }

    #[test]
    fn unavailable_agents_excluded_from_lookups() {
        let (registry, _rx) = AgentRegistry::new(Duration::from_secs(15));
        let id = AgentId::try_new("pricing-1".to_string()).unwrap();
        registry.register(id.clone(), AgentType::try_new("pricing".to_string()).unwrap(), vec![], Value::Null);
        registry.set_status(&id, AgentStatus::Unavailable).unwrap();
        let found = registry.lookup_by_type(&AgentType::try_new("pricing".to_string()).unwrap());
        assert!(found.is_empty());
    }

    #[test]
    fn re_registration_replaces_and_notifies() {
        let (registry, mut rx) = AgentRegistry::new(Duration::from_secs(15));
        let id = AgentId::try_new("pricing-1".to_string()).unwrap();
        registry.register(id.clone(), AgentType::try_new("pricing".to_string()).unwrap(), vec![], Value::Null);
        registry.register(id.clone(), AgentType::try_new("pricing".to_string()).unwrap(), vec![], Value::Null);
        match rx.try_recv().unwrap() {
            RegistryNotification::ReRegistered(notified) => assert_eq!(notified, id),
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn sweep_marks_stale_heartbeats_unavailable() {
        let (registry, mut rx) = AgentRegistry::new(Duration::from_millis(10));
        let id = AgentId::try_new("pricing-1".to_string()).unwrap();
        registry.register(id.clone(), AgentType::try_new("pricing".to_string()).unwrap(), vec![], Value::Null);
        registry.heartbeat(&id).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        registry.sweep_stale();
        assert_eq!(registry.status(&id), Some(AgentStatus::Unavailable));
        match rx.try_recv().unwrap() {
            RegistryNotification::WentStale(notified) => assert_eq!(notified, id),
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn lookup_by_capability_finds_registered_agents() {
        let (registry, _rx) = AgentRegistry::new(Duration::from_secs(15));
        let id = AgentId::try_new("technical-1".to_string()).unwrap();
        let cap = CapabilityName::try_new("extract-boq".to_string()).unwrap();
        registry.register(id, AgentType::try_new("technical".to_string()).unwrap(), vec![cap.clone()], Value::Null);
        assert_eq!(registry.lookup_by_capability(&cap).len(), 1);
    }
}
