//! Tool capability domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::Context;

/// Reliability assigned to a newly registered tool.
pub const DEFAULT_RELIABILITY: f64 = 0.9;

/// Bound a reliability score to [0, 1]; NaN falls back to the default.
pub fn clamp_reliability(reliability: f64) -> f64 {
    if reliability.is_nan() {
        DEFAULT_RELIABILITY
    } else {
        reliability.clamp(0.0, 1.0)
    }
}

/// Declared type of a tool parameter or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParameterType {
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => !matches!(value, Value::Null),
        }
    }
}

/// One input parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub param_type: ParameterType,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: ParameterType,
        default: Option<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default,
        }
    }

    /// Whether a value for this parameter can be produced from `context`.
    pub fn satisfiable_from(&self, context: &Context) -> bool {
        match context.get(&self.name) {
            Some(value) => self.param_type.accepts(value),
            None => !self.required || self.default.is_some(),
        }
    }
}

/// One declared output of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub param_type: ParameterType,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
        }
    }
}

/// Resources a single invocation is expected to need.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub memory_mb: u64,
    pub cpu_intensive: bool,
    pub network_intensive: bool,
}

/// Latest reading from the resource monitor feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_available_mb: u64,
    /// Fraction of CPU in use, 0.0-1.0
    pub cpu_load: f64,
    pub network_available: bool,
    pub captured_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(memory_available_mb: u64, cpu_load: f64, network_available: bool) -> Self {
        Self {
            memory_available_mb,
            cpu_load: cpu_load.clamp(0.0, 1.0),
            network_available,
            captured_at: Utc::now(),
        }
    }

    /// A host with room for anything.
    pub fn unconstrained() -> Self {
        Self::new(u64::MAX, 0.0, true)
    }
}

/// Bias toward a particular tool during selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPreference {
    pub tool: String,
    /// Added to the score multiplier: score * (1 + weight)
    pub weight: f64,
}

impl ToolPreference {
    pub fn new(tool: impl Into<String>, weight: f64) -> Self {
        Self {
            tool: tool.into(),
            weight,
        }
    }
}

/// A registered, invocable action with a declared contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCapability {
    /// Unique within a registry
    pub name: String,
    pub category: String,
    pub description: String,
    pub inputs: Vec<ParameterSpec>,
    pub outputs: Vec<OutputSpec>,
    pub estimated_execution_ms: u64,
    pub resources: ResourceRequirement,
    /// Exponentially smoothed success rate, 0.0-1.0
    pub reliability: f64,
    /// Number of outcomes folded into `reliability`
    pub executions: u64,
}

impl ToolCapability {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            estimated_execution_ms: 1_000,
            resources: ResourceRequirement::default(),
            reliability: DEFAULT_RELIABILITY,
            executions: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, spec: ParameterSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn with_output(mut self, spec: OutputSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn with_estimated_time(mut self, ms: u64) -> Self {
        self.estimated_execution_ms = ms;
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirement) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = clamp_reliability(reliability);
        self
    }

    /// `reliability' = reliability * (1 - alpha) + success * alpha`
    pub fn apply_outcome(&mut self, success: bool, alpha: f64) -> f64 {
        let observed = if success { 1.0 } else { 0.0 };
        self.reliability = self
            .reliability
            .mul_add(1.0 - alpha, observed * alpha)
            .clamp(0.0, 1.0);
        self.executions += 1;
        self.reliability
    }

    /// Whether the host can take an invocation right now.
    pub fn fits_within(&self, snapshot: &ResourceSnapshot, cpu_ceiling: f64) -> bool {
        if self.resources.memory_mb > snapshot.memory_available_mb {
            return false;
        }
        if self.resources.cpu_intensive && snapshot.cpu_load > cpu_ceiling {
            return false;
        }
        if self.resources.network_intensive && !snapshot.network_available {
            return false;
        }
        true
    }

    /// 1.0 when every input is satisfiable from `context`; tools with
    /// unsatisfiable inputs keep half credit plus a share for what is.
    pub fn fitness(&self, context: &Context) -> f64 {
        if self.inputs.is_empty() {
            return 1.0;
        }
        let satisfied = self
            .inputs
            .iter()
            .filter(|spec| spec.satisfiable_from(context))
            .count();
        if satisfied == self.inputs.len() {
            1.0
        } else {
            0.5 * (satisfied as f64 / self.inputs.len() as f64)
        }
    }

    /// Concrete parameters for an invocation: context values for declared
    /// inputs, falling back to declared defaults.
    pub fn bind_parameters(&self, context: &Context) -> Context {
        let mut params = Context::new();
        for spec in &self.inputs {
            if let Some(value) = context.get(&spec.name) {
                params.insert(spec.name.clone(), value.clone());
            } else if let Some(default) = &spec.default {
                params.insert(spec.name.clone(), default.clone());
            }
        }
        params
    }
}
