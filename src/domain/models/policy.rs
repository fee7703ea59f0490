//! Policy domain model: condition → action rules evaluated against a
//! planning context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::request::Context;

/// A predicate over a context mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PolicyCondition {
    Always,
    Equals { key: String, value: serde_json::Value },
    Exists { key: String },
    /// Case-insensitive substring for strings, membership for arrays
    Contains { key: String, needle: String },
    All { conditions: Vec<PolicyCondition> },
    Any { conditions: Vec<PolicyCondition> },
    Not { condition: Box<PolicyCondition> },
}

impl PolicyCondition {
    pub fn equals(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    pub fn contains(key: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            key: key.into(),
            needle: needle.into(),
        }
    }

    pub fn all(conditions: Vec<PolicyCondition>) -> Self {
        Self::All { conditions }
    }

    pub fn any(conditions: Vec<PolicyCondition>) -> Self {
        Self::Any { conditions }
    }

    pub fn negate(condition: PolicyCondition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    pub fn matches(&self, context: &Context) -> bool {
        match self {
            Self::Always => true,
            Self::Equals { key, value } => context.get(key) == Some(value),
            Self::Exists { key } => context.contains_key(key),
            Self::Contains { key, needle } => {
                let needle = needle.to_lowercase();
                match context.get(key) {
                    Some(serde_json::Value::String(s)) => s.to_lowercase().contains(&needle),
                    Some(serde_json::Value::Array(items)) => items.iter().any(|item| {
                        item.as_str()
                            .is_some_and(|s| s.to_lowercase() == needle)
                    }),
                    _ => false,
                }
            }
            Self::All { conditions } => conditions.iter().all(|c| c.matches(context)),
            Self::Any { conditions } => conditions.iter().any(|c| c.matches(context)),
            Self::Not { condition } => !condition.matches(context),
        }
    }

    /// Every context key this condition looks at.
    pub fn referenced_keys(&self) -> BTreeSet<&str> {
        let mut keys = BTreeSet::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys<'a>(&'a self, keys: &mut BTreeSet<&'a str>) {
        match self {
            Self::Always => {}
            Self::Equals { key, .. } | Self::Exists { key } | Self::Contains { key, .. } => {
                keys.insert(key.as_str());
            }
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.collect_keys(keys);
                }
            }
            Self::Not { condition } => condition.collect_keys(keys),
        }
    }

    /// Number of referenced keys present in the context.
    pub fn specificity(&self, context: &Context) -> usize {
        self.referenced_keys()
            .into_iter()
            .filter(|k| context.contains_key(*k))
            .count()
    }
}

/// Effect a matching policy has on planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyAction {
    /// Fail the task without invoking a tool
    Block { reason: String },
    /// Bias tool selection toward `tool`
    PreferTool { tool: String, weight: f64 },
    /// Write a metadata annotation onto the task
    Annotate { key: String, value: serde_json::Value },
    /// Hold the task until the context carries `approved: true`
    RequireApproval { prompt: String },
    /// Re-invoke a failed tool with exponential backoff
    RetryWithBackoff {
        max_retries: u32,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
    },
}

impl PolicyAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Block { .. } => "block",
            Self::PreferTool { .. } => "prefer_tool",
            Self::Annotate { .. } => "annotate",
            Self::RequireApproval { .. } => "require_approval",
            Self::RetryWithBackoff { .. } => "retry_with_backoff",
        }
    }
}

/// One recorded application of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyApplication {
    pub task_id: Option<Uuid>,
    pub applied_at: DateTime<Utc>,
}

/// A named condition → action rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique across the engine
    pub name: String,
    pub description: String,
    pub category: String,
    pub condition: PolicyCondition,
    pub action: PolicyAction,
    pub enabled: bool,
    /// Registration order, used to break specificity ties
    pub sequence: u64,
    /// Most recent applications, oldest first. Survives disabling.
    pub applications: Vec<PolicyApplication>,
    /// Total applications, including those trimmed from `applications`
    #[serde(default)]
    pub application_count: u64,
    #[serde(default)]
    pub last_applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Record an application, keeping at most `history_limit` entries.
    pub fn record(&mut self, application: PolicyApplication, history_limit: usize) {
        self.application_count += 1;
        self.last_applied_at = Some(application.applied_at);
        self.applications.push(application);
        if self.applications.len() > history_limit {
            let excess = self.applications.len() - history_limit;
            self.applications.drain(..excess);
        }
    }

    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        condition: PolicyCondition,
        action: PolicyAction,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: description.into(),
            category: category.into(),
            condition,
            action,
            enabled: true,
            sequence: 0,
            applications: Vec::new(),
            application_count: 0,
            last_applied_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_condition_evaluation() {
        let context = ctx(&[
            ("tool_category", json!("shell")),
            ("tags", json!(["prod", "urgent"])),
            ("path", json!("/etc/Passwd")),
        ]);

        assert!(PolicyCondition::equals("tool_category", "shell").matches(&context));
        assert!(!PolicyCondition::equals("tool_category", "http").matches(&context));
        assert!(PolicyCondition::contains("tags", "PROD").matches(&context));
        assert!(PolicyCondition::contains("path", "passwd").matches(&context));
        assert!(PolicyCondition::negate(PolicyCondition::exists("approved")).matches(&context));
        assert!(PolicyCondition::any(vec![
            PolicyCondition::exists("missing"),
            PolicyCondition::exists("path"),
        ])
        .matches(&context));
        assert!(!PolicyCondition::all(vec![
            PolicyCondition::exists("missing"),
            PolicyCondition::exists("path"),
        ])
        .matches(&context));
    }

    #[test]
    fn test_specificity_counts_present_keys() {
        let context = ctx(&[("a", json!(1)), ("b", json!(2))]);
        let cond = PolicyCondition::all(vec![
            PolicyCondition::exists("a"),
            PolicyCondition::exists("b"),
            PolicyCondition::negate(PolicyCondition::exists("c")),
        ]);
        assert_eq!(cond.specificity(&context), 2);
        assert_eq!(PolicyCondition::Always.specificity(&context), 0);
    }

    #[test]
    fn test_policy_serde_shape() {
        let action = PolicyAction::RetryWithBackoff {
            max_retries: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "retry_with_backoff");
        let cond: PolicyCondition =
            serde_json::from_value(json!({"op": "equals", "key": "k", "value": true})).unwrap();
        assert_eq!(cond, PolicyCondition::equals("k", true));
    }

    #[test]
    fn test_record_trims_history_but_keeps_count() {
        let action = PolicyAction::Block {
            reason: "x".to_string(),
        };
        let mut policy = Policy::new("p", "", "c", PolicyCondition::Always, action);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            policy.record(
                PolicyApplication {
                    task_id: Some(*id),
                    applied_at: Utc::now(),
                },
                3,
            );
        }

        assert_eq!(policy.application_count, 5);
        assert_eq!(policy.applications.len(), 3);
        assert_eq!(policy.applications[0].task_id, Some(ids[2]));
        assert_eq!(policy.applications[2].task_id, Some(ids[4]));
        assert_eq!(policy.last_applied_at, Some(policy.applications[2].applied_at));
    }
}
