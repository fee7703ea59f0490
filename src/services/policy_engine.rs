//! Policy engine: named condition → action rules evaluated per leaf.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainResult, PersistenceError, PolicyError};
use crate::domain::models::{Context, Policy, PolicyAction, PolicyApplication, PolicyCondition};
use crate::domain::ports::PersistenceAdapter;

const POLICIES_KEY: &str = "policies/all";

/// Applications kept per policy unless configured otherwise
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

pub struct PolicyEngine {
    /// Kept in registration order
    policies: RwLock<Vec<Policy>>,
    next_sequence: AtomicU64,
    history_limit: usize,
    persistence: Arc<dyn PersistenceAdapter>,
}

impl PolicyEngine {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(0),
            history_limit: DEFAULT_HISTORY_LIMIT,
            persistence,
        }
    }

    /// Cap the per-policy application history. Every application still
    /// goes to the event log.
    #[must_use]
    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub async fn initialize(&self) -> DomainResult<()> {
        self.restore().await?;
        info!(policies = self.policies.read().await.len(), "Policy engine initialized");
        Ok(())
    }

    /// Register a policy. Names are unique across the engine.
    pub async fn add_policy(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        condition: PolicyCondition,
        action: PolicyAction,
    ) -> Result<Policy, PolicyError> {
        let mut policy = Policy::new(name, description, category, condition, action);
        let mut policies = self.policies.write().await;
        if policies.iter().any(|p| p.name == policy.name) {
            return Err(PolicyError::DuplicatePolicy(policy.name));
        }
        policy.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        info!(policy = %policy.name, action = policy.action.kind(), "Policy added");
        policies.push(policy.clone());
        Ok(policy)
    }

    /// Enabled policies whose condition holds for `context`, most specific
    /// first, registration order among equals.
    pub async fn get_applicable_policies(&self, context: &Context) -> Vec<Policy> {
        let policies = self.policies.read().await;
        let mut matched: Vec<(usize, &Policy)> = policies
            .iter()
            .filter(|p| p.enabled && p.condition.matches(context))
            .map(|p| (p.condition.specificity(context), p))
            .collect();
        matched.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| a.sequence.cmp(&b.sequence)));
        matched.into_iter().map(|(_, p)| p.clone()).collect()
    }

    pub async fn get(&self, name: &str) -> Option<Policy> {
        self.policies
            .read()
            .await
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Every policy in registration order.
    pub async fn policies(&self) -> Vec<Policy> {
        self.policies.read().await.clone()
    }

    /// Toggle a policy. Its application history is kept either way.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<Policy, PolicyError> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| PolicyError::PolicyNotFound(name.to_string()))?;
        policy.enabled = enabled;
        policy.updated_at = Utc::now();
        info!(policy = %name, enabled, "Policy toggled");
        Ok(policy.clone())
    }

    pub async fn enable(&self, name: &str) -> Result<Policy, PolicyError> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> Result<Policy, PolicyError> {
        self.set_enabled(name, false).await
    }

    /// Append to a policy's bounded application history and the event log.
    pub async fn record_application(
        &self,
        name: &str,
        task_id: Option<Uuid>,
    ) -> Result<(), PolicyError> {
        let application = PolicyApplication {
            task_id,
            applied_at: Utc::now(),
        };
        {
            let mut policies = self.policies.write().await;
            let policy = policies
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| PolicyError::PolicyNotFound(name.to_string()))?;
            policy.record(application.clone(), self.history_limit);
        }
        debug!(policy = %name, task_id = ?task_id, "Policy applied");

        let line = serde_json::json!({
            "kind": "policy_applied",
            "policy": name,
            "application": application,
        });
        match serde_json::to_vec(&line) {
            Ok(bytes) => {
                if let Err(e) = self.persistence.append_log(bytes).await {
                    warn!(error = %e, policy = %name, "Failed to append policy event");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize policy event"),
        }
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.policies.read().await.iter().filter(|p| p.enabled).count()
    }

    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let policies = self.policies.read().await.clone();
        self.persistence
            .put(POLICIES_KEY, serde_json::to_vec(&policies)?)
            .await?;
        debug!(policies = policies.len(), "Policies persisted");
        Ok(())
    }

    /// Replace in-memory policies with the persisted snapshot, if any.
    pub async fn restore(&self) -> Result<(), PersistenceError> {
        let Some(bytes) = self.persistence.get(POLICIES_KEY).await? else {
            return Ok(());
        };
        let mut loaded: Vec<Policy> = serde_json::from_slice(&bytes)?;
        loaded.sort_by_key(|p| p.sequence);
        let next = loaded.last().map_or(0, |p| p.sequence + 1);
        self.next_sequence.store(next, Ordering::SeqCst);
        *self.policies.write().await = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::persistence::InMemoryPersistence;
    use serde_json::json;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Arc::new(InMemoryPersistence::new()))
    }

    fn block(reason: &str) -> PolicyAction {
        PolicyAction::Block {
            reason: reason.to_string(),
        }
    }

    fn context(pairs: &[(&str, serde_json::Value)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_duplicate_policy_rejected() {
        let engine = engine();
        engine
            .add_policy("p", "", "safety", PolicyCondition::Always, block("no"))
            .await
            .unwrap();
        let err = engine
            .add_policy("p", "", "safety", PolicyCondition::Always, block("no"))
            .await
            .unwrap_err();
        assert_eq!(err, PolicyError::DuplicatePolicy("p".to_string()));
    }

    #[tokio::test]
    async fn test_applicable_policies_ordered_by_specificity_then_registration() {
        let engine = engine();
        engine
            .add_policy("general", "", "c", PolicyCondition::Always, block("a"))
            .await
            .unwrap();
        engine
            .add_policy("first-env", "", "c", PolicyCondition::equals("env", "prod"), block("b"))
            .await
            .unwrap();
        engine
            .add_policy(
                "env-and-tool",
                "",
                "c",
                PolicyCondition::all(vec![
                    PolicyCondition::equals("env", "prod"),
                    PolicyCondition::exists("tool_category"),
                ]),
                block("c"),
            )
            .await
            .unwrap();
        engine
            .add_policy("second-env", "", "c", PolicyCondition::exists("env"), block("d"))
            .await
            .unwrap();
        engine
            .add_policy("staging", "", "c", PolicyCondition::equals("env", "staging"), block("e"))
            .await
            .unwrap();

        let ctx = context(&[("env", json!("prod")), ("tool_category", json!("deploy"))]);
        let names: Vec<String> = engine
            .get_applicable_policies(&ctx)
            .await
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["env-and-tool", "first-env", "second-env", "general"]);
    }

    #[tokio::test]
    async fn test_disable_keeps_history() {
        let engine = engine();
        engine
            .add_policy("p", "", "c", PolicyCondition::Always, block("x"))
            .await
            .unwrap();
        engine.record_application("p", Some(Uuid::new_v4())).await.unwrap();
        engine.disable("p").await.unwrap();

        assert!(engine.get_applicable_policies(&Context::new()).await.is_empty());
        assert_eq!(engine.active_count().await, 0);
        assert_eq!(engine.get("p").await.unwrap().applications.len(), 1);

        engine.enable("p").await.unwrap();
        assert_eq!(engine.active_count().await, 1);
        assert!(matches!(
            engine.disable("missing").await,
            Err(PolicyError::PolicyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persist_and_restore_keeps_sequence() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let engine = PolicyEngine::new(persistence.clone());
        engine
            .add_policy("a", "", "c", PolicyCondition::Always, block("x"))
            .await
            .unwrap();
        engine
            .add_policy("b", "", "c", PolicyCondition::Always, block("y"))
            .await
            .unwrap();
        engine.persist().await.unwrap();

        let fresh = PolicyEngine::new(persistence);
        fresh.restore().await.unwrap();
        let c = fresh
            .add_policy("c", "", "c", PolicyCondition::Always, block("z"))
            .await
            .unwrap();
        assert_eq!(c.sequence, 2);
        assert_eq!(fresh.policies().await.len(), 3);
    }

    #[tokio::test]
    async fn test_application_history_is_bounded() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let engine = PolicyEngine::new(persistence.clone()).with_history_limit(10);
        engine
            .add_policy("p", "", "c", PolicyCondition::Always, block("x"))
            .await
            .unwrap();

        let mut last = None;
        for _ in 0..200 {
            let id = Uuid::new_v4();
            engine.record_application("p", Some(id)).await.unwrap();
            last = Some(id);
        }
        engine.persist().await.unwrap();

        let policy = engine.get("p").await.unwrap();
        assert_eq!(policy.applications.len(), 10);
        assert_eq!(policy.application_count, 200);
        assert_eq!(policy.applications[9].task_id, last);
        assert_eq!(persistence.log_entries().await.len(), 200);

        let fresh = PolicyEngine::new(persistence);
        fresh.restore().await.unwrap();
        let restored = fresh.get("p").await.unwrap();
        assert_eq!(restored.applications.len(), 10);
        assert_eq!(restored.application_count, 200);
    }
}
