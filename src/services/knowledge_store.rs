//! Knowledge store: confidence-scored facts, workflow patterns and user
//! preferences, all updated in place by key.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainResult, PersistenceError};
use crate::domain::models::{
    clamp_confidence, KnowledgeCategory, KnowledgeEntry, KnowledgeStatistics, Provenance,
    UserPreference, WorkflowPattern, WorkflowStep,
};
use crate::domain::ports::PersistenceAdapter;

const ENTRIES_KEY: &str = "knowledge/entries";
const PATTERNS_KEY: &str = "knowledge/patterns";
const PREFERENCES_KEY: &str = "knowledge/preferences";

type EntryKey = (KnowledgeCategory, String);
type PreferenceKey = (String, String, String);

pub struct KnowledgeStore {
    entries: RwLock<HashMap<EntryKey, KnowledgeEntry>>,
    patterns: RwLock<HashMap<String, WorkflowPattern>>,
    preferences: RwLock<HashMap<PreferenceKey, UserPreference>>,
    persistence: Arc<dyn PersistenceAdapter>,
}

impl KnowledgeStore {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            patterns: RwLock::new(HashMap::new()),
            preferences: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    pub async fn initialize(&self) -> DomainResult<()> {
        self.restore().await?;
        let stats = self.statistics(0).await;
        info!(
            entries = stats.knowledge_entries,
            patterns = stats.patterns,
            preferences = stats.preferences,
            "Knowledge store initialized"
        );
        Ok(())
    }

    /// Add or revise the entry for (`category`, `topic`).
    ///
    /// An existing entry is blended with the new observation under the
    /// write lock, so concurrent learners never lose an update.
    pub async fn add_knowledge(
        &self,
        category: KnowledgeCategory,
        topic: impl Into<String>,
        content: serde_json::Value,
        confidence: f64,
        provenance: Option<Provenance>,
    ) -> KnowledgeEntry {
        let topic = topic.into();
        let provenance = provenance.unwrap_or_default();
        let mut entries = self.entries.write().await;

        match entries.get_mut(&(category, topic.clone())) {
            Some(entry) => {
                let before = entry.confidence;
                entry.blend(content, confidence, provenance);
                debug!(
                    category = %category,
                    topic = %topic,
                    before,
                    after = entry.confidence,
                    "Knowledge entry revised"
                );
                entry.clone()
            }
            None => {
                let entry =
                    KnowledgeEntry::new(category, topic.clone(), content, confidence, provenance);
                debug!(category = %category, topic = %topic, confidence = entry.confidence, "Knowledge entry added");
                entries.insert((category, topic), entry.clone());
                entry
            }
        }
    }

    pub async fn get(&self, category: KnowledgeCategory, topic: &str) -> Option<KnowledgeEntry> {
        self.entries
            .read()
            .await
            .get(&(category, topic.to_string()))
            .cloned()
    }

    /// Keyword search over topic and content, most confident first.
    ///
    /// The term is split on whitespace; an entry matches when any keyword
    /// occurs in it. A blank term matches every entry in scope.
    pub async fn query(
        &self,
        search_term: &str,
        category: Option<KnowledgeCategory>,
    ) -> Vec<KnowledgeEntry> {
        let keywords: Vec<String> = search_term
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let mut results: Vec<KnowledgeEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .filter(|e| e.matches_keywords(&keywords))
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        results
    }

    /// Delete entries last updated more than `older_than` ago whose
    /// confidence sits below `below_confidence`. Returns the count removed.
    pub async fn expire_knowledge(&self, older_than: Duration, below_confidence: f64) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !(e.updated_at < cutoff && e.confidence < below_confidence));
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, below_confidence, "Expired stale knowledge entries");
        }
        removed
    }

    /// Record a use of the named workflow, folding it into the running mean.
    pub async fn record_workflow_pattern(
        &self,
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
        execution_time_ms: u64,
    ) -> WorkflowPattern {
        let name = name.into();
        let mut patterns = self.patterns.write().await;
        let pattern = patterns
            .entry(name.clone())
            .and_modify(|p| p.record_use(steps.clone(), execution_time_ms))
            .or_insert_with(|| WorkflowPattern::new(name.clone(), steps, execution_time_ms));
        debug!(
            pattern = %name,
            usage_count = pattern.usage_count,
            average_ms = pattern.average_execution_ms,
            "Workflow pattern recorded"
        );
        pattern.clone()
    }

    pub async fn workflow_pattern(&self, name: &str) -> Option<WorkflowPattern> {
        self.patterns.read().await.get(name).cloned()
    }

    pub async fn workflow_patterns(&self) -> Vec<WorkflowPattern> {
        let mut patterns: Vec<_> = self.patterns.read().await.values().cloned().collect();
        patterns.sort_by(|a, b| b.usage_count.cmp(&a.usage_count).then_with(|| a.name.cmp(&b.name)));
        patterns
    }

    /// Administrative reset of a pattern's usage statistics.
    pub async fn reset_workflow_statistics(&self, name: &str) -> Option<WorkflowPattern> {
        let mut patterns = self.patterns.write().await;
        let pattern = patterns.get_mut(name)?;
        pattern.usage_count = 0;
        pattern.average_execution_ms = 0.0;
        warn!(pattern = %name, "Workflow pattern statistics reset");
        Some(pattern.clone())
    }

    /// Upsert a preference. A repeat observation replaces the value and
    /// averages the confidence.
    pub async fn learn_user_preference(
        &self,
        user_id: impl Into<String>,
        category: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
        confidence: f64,
        learned_from: impl Into<String>,
    ) -> UserPreference {
        let (user_id, category, key) = (user_id.into(), category.into(), key.into());
        let learned_from = learned_from.into();
        let confidence = clamp_confidence(confidence);
        let now = Utc::now();

        let mut preferences = self.preferences.write().await;
        let preference = preferences
            .entry((user_id.clone(), category.clone(), key.clone()))
            .and_modify(|p| {
                p.value = value.clone();
                p.confidence = clamp_confidence((p.confidence + confidence) / 2.0);
                p.learned_from = learned_from.clone();
                p.updated_at = now;
            })
            .or_insert_with(|| UserPreference {
                user_id: user_id.clone(),
                category: category.clone(),
                key: key.clone(),
                value: value.clone(),
                confidence,
                learned_from: learned_from.clone(),
                created_at: now,
                updated_at: now,
            });
        debug!(user = %user_id, category = %category, key = %key, "User preference learned");
        preference.clone()
    }

    /// A user's preferences, optionally narrowed to one category, most
    /// confident first.
    pub async fn get_user_preferences(
        &self,
        user_id: &str,
        category: Option<&str>,
    ) -> Vec<UserPreference> {
        let mut prefs: Vec<UserPreference> = self
            .preferences
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .filter(|p| category.map_or(true, |c| p.category == c))
            .cloned()
            .collect();
        prefs.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.key.cmp(&b.key))
        });
        prefs
    }

    /// Counters for this store; `active_policies` comes from the policy engine.
    pub async fn statistics(&self, active_policies: usize) -> KnowledgeStatistics {
        KnowledgeStatistics {
            knowledge_entries: self.entries.read().await.len(),
            active_policies,
            patterns: self.patterns.read().await.len(),
            preferences: self.preferences.read().await.len(),
        }
    }

    /// Snapshot all three collections to the persistence adapter.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let entries: Vec<KnowledgeEntry> = self.entries.read().await.values().cloned().collect();
        let patterns: Vec<WorkflowPattern> = self.patterns.read().await.values().cloned().collect();
        let preferences: Vec<UserPreference> =
            self.preferences.read().await.values().cloned().collect();

        self.persistence
            .put(ENTRIES_KEY, serde_json::to_vec(&entries)?)
            .await?;
        self.persistence
            .put(PATTERNS_KEY, serde_json::to_vec(&patterns)?)
            .await?;
        self.persistence
            .put(PREFERENCES_KEY, serde_json::to_vec(&preferences)?)
            .await?;
        debug!(
            entries = entries.len(),
            patterns = patterns.len(),
            preferences = preferences.len(),
            "Knowledge persisted"
        );
        Ok(())
    }

    /// Replace in-memory state with the persisted snapshot, if any.
    pub async fn restore(&self) -> Result<(), PersistenceError> {
        if let Some(bytes) = self.persistence.get(ENTRIES_KEY).await? {
            let loaded: Vec<KnowledgeEntry> = serde_json::from_slice(&bytes)?;
            *self.entries.write().await = loaded
                .into_iter()
                .map(|e| ((e.category, e.topic.clone()), e))
                .collect();
        }
        if let Some(bytes) = self.persistence.get(PATTERNS_KEY).await? {
            let loaded: Vec<WorkflowPattern> = serde_json::from_slice(&bytes)?;
            *self.patterns.write().await = loaded.into_iter().map(|p| (p.name.clone(), p)).collect();
        }
        if let Some(bytes) = self.persistence.get(PREFERENCES_KEY).await? {
            let loaded: Vec<UserPreference> = serde_json::from_slice(&bytes)?;
            *self.preferences.write().await = loaded
                .into_iter()
                .map(|p| ((p.user_id.clone(), p.category.clone(), p.key.clone()), p))
                .collect();
        }
        Ok(())
    }
}
