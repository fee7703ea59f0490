//! Knowledge domain model.
//!
//! Learned facts, workflow patterns and user preferences. Entries are
//! keyed so that repeated learning revises a belief instead of
//! duplicating it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Clamp a confidence score into [0, 1]. NaN collapses to 0.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Knowledge category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    BestPractice,
    WorkflowPattern,
    SystemFact,
    UserPreference,
    Troubleshooting,
}

impl KnowledgeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BestPractice => "best_practice",
            Self::WorkflowPattern => "workflow_pattern",
            Self::SystemFact => "system_fact",
            Self::UserPreference => "user_preference",
            Self::Troubleshooting => "troubleshooting",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "best_practice" => Some(Self::BestPractice),
            "workflow_pattern" => Some(Self::WorkflowPattern),
            "system_fact" => Some(Self::SystemFact),
            "user_preference" => Some(Self::UserPreference),
            "troubleshooting" => Some(Self::Troubleshooting),
            _ => None,
        }
    }
}

impl fmt::Display for KnowledgeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a piece of knowledge came from. The weight decides which side
/// dominates when two observations of the same key are blended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    UserProvided,
    ExecutionOutcome,
    Inferred,
    Imported,
}

impl Default for Provenance {
    fn default() -> Self {
        Self::Inferred
    }
}

impl Provenance {
    pub fn weight(&self) -> f64 {
        match self {
            Self::UserProvided => 1.0,
            Self::ExecutionOutcome => 0.8,
            Self::Inferred => 0.5,
            Self::Imported => 0.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserProvided => "user_provided",
            Self::ExecutionOutcome => "execution_outcome",
            Self::Inferred => "inferred",
            Self::Imported => "imported",
        }
    }
}

/// A stored fact, preference or pattern with a confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub category: KnowledgeCategory,
    /// Short lookup key, unique within the category
    pub topic: String,
    /// Free text (a JSON string) or a structured payload
    pub content: serde_json::Value,
    /// Always within [0, 1]
    pub confidence: f64,
    pub provenance: Provenance,
    /// Number of times this entry has been revised
    pub revisions: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn new(
        category: KnowledgeCategory,
        topic: impl Into<String>,
        content: serde_json::Value,
        confidence: f64,
        provenance: Provenance,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            category,
            topic: topic.into(),
            content,
            confidence: clamp_confidence(confidence),
            provenance,
            revisions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Content flattened to text for keyword matching and display.
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Fold a new observation of the same key into this entry.
    ///
    /// Confidence becomes the provenance-weighted mean of both sides; the
    /// content and provenance of the heavier side survive.
    pub fn blend(&mut self, content: serde_json::Value, confidence: f64, provenance: Provenance) {
        let w_old = self.provenance.weight();
        let w_new = provenance.weight();
        let blended = self
            .confidence
            .mul_add(w_old, clamp_confidence(confidence) * w_new)
            / (w_old + w_new);
        self.confidence = clamp_confidence(blended);

        if w_new >= w_old {
            self.content = content;
            self.provenance = provenance;
        }
        self.revisions += 1;
        self.updated_at = Utc::now();
    }

    /// Case-insensitive keyword match over topic and content.
    pub fn matches_keywords(&self, keywords: &[String]) -> bool {
        if keywords.is_empty() {
            return true;
        }
        let topic = self.topic.to_lowercase();
        let content = self.content_text().to_lowercase();
        keywords
            .iter()
            .any(|k| topic.contains(k.as_str()) || content.contains(k.as_str()))
    }
}

/// One step of a workflow pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub tool: String,
    /// Parameter template the step was invoked with
    pub parameters: serde_json::Value,
    pub expected_outputs: Vec<String>,
}

impl WorkflowStep {
    pub fn new(tool: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            parameters,
            expected_outputs: Vec::new(),
        }
    }

    pub fn expecting(mut self, output: impl Into<String>) -> Self {
        self.expected_outputs.push(output.into());
        self
    }
}

/// A named, reusable sequence of tool steps with usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPattern {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    /// Running mean over every recorded use
    pub average_execution_ms: f64,
    /// Only ever increases, except on an explicit administrative reset
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl WorkflowPattern {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>, execution_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            steps,
            average_execution_ms: execution_ms as f64,
            usage_count: 1,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Record another use, updating the running mean.
    pub fn record_use(&mut self, steps: Vec<WorkflowStep>, execution_ms: u64) {
        self.usage_count += 1;
        let n = self.usage_count as f64;
        self.average_execution_ms += (execution_ms as f64 - self.average_execution_ms) / n;
        if !steps.is_empty() {
            self.steps = steps;
        }
        self.last_used_at = Utc::now();
    }
}

/// Something learned about how a particular user likes things done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: String,
    pub category: String,
    pub key: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub learned_from: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters over the knowledge store and policy engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeStatistics {
    pub knowledge_entries: usize,
    pub active_policies: usize,
    pub patterns: usize,
    pub preferences: usize,
}
