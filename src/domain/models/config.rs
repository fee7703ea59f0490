use serde::{Deserialize, Serialize};

/// Main configuration structure for Waypoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WaypointConfig {
    /// Task arena configuration
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Tool capability registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Planning loop configuration
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Knowledge store configuration
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Persistence backend configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Task arena configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskConfig {
    /// Ceiling on retained task nodes before oldest finished trees are evicted
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

const fn default_max_retained() -> usize {
    10_000
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retained: default_max_retained(),
        }
    }
}

/// Tool capability registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegistryConfig {
    /// Smoothing constant for reliability updates, (0, 1]
    #[serde(default = "default_smoothing")]
    pub reliability_smoothing: f64,

    /// CPU load above which cpu-intensive tools are excluded
    #[serde(default = "default_cpu_ceiling")]
    pub cpu_ceiling: f64,

    /// CPU load at or above which the host counts as under pressure
    #[serde(default = "default_pressure_cpu")]
    pub pressure_cpu_load: f64,

    /// Available memory below which the host counts as under pressure
    #[serde(default = "default_pressure_memory_mb")]
    pub pressure_min_memory_mb: u64,
}

const fn default_smoothing() -> f64 {
    0.2
}

const fn default_cpu_ceiling() -> f64 {
    0.85
}

const fn default_pressure_cpu() -> f64 {
    0.9
}

const fn default_pressure_memory_mb() -> u64 {
    256
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reliability_smoothing: default_smoothing(),
            cpu_ceiling: default_cpu_ceiling(),
            pressure_cpu_load: default_pressure_cpu(),
            pressure_min_memory_mb: default_pressure_memory_mb(),
        }
    }
}

/// Planning loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlannerConfig {
    /// Deadline for a whole planning loop when the request sets none
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// Maximum leaf invocations running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Keep re-routing blocked leaves until the deadline
    #[serde(default = "default_true")]
    pub await_blocked_leaves: bool,

    /// Pause between re-routing passes
    #[serde(default = "default_reroute_interval_ms")]
    pub reroute_interval_ms: u64,

    /// Hold low-priority leaves while the host is under pressure
    #[serde(default = "default_true")]
    pub defer_low_priority: bool,

    /// Confidence written for a plan that fully succeeded
    #[serde(default = "default_success_confidence")]
    pub success_confidence: f64,

    /// Confidence written for an observed tool failure
    #[serde(default = "default_failure_confidence")]
    pub failure_confidence: f64,

    /// Selection bonus for a tool a user has been seen to prefer
    #[serde(default = "default_preference_weight")]
    pub user_preference_weight: f64,
}

const fn default_deadline_ms() -> u64 {
    30_000
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_true() -> bool {
    true
}

const fn default_reroute_interval_ms() -> u64 {
    250
}

const fn default_success_confidence() -> f64 {
    0.7
}

const fn default_failure_confidence() -> f64 {
    0.6
}

const fn default_preference_weight() -> f64 {
    0.25
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: default_deadline_ms(),
            max_concurrency: default_max_concurrency(),
            await_blocked_leaves: true,
            reroute_interval_ms: default_reroute_interval_ms(),
            defer_low_priority: true,
            success_confidence: default_success_confidence(),
            failure_confidence: default_failure_confidence(),
            user_preference_weight: default_preference_weight(),
        }
    }
}

/// Knowledge store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KnowledgeConfig {
    /// Entries older than this many days are candidates for expiry
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,

    /// Only entries below this confidence expire
    #[serde(default = "default_expiry_confidence")]
    pub expiry_below_confidence: f64,

    /// Applications kept per policy; older ones live only in the event log
    #[serde(default = "default_policy_history")]
    pub policy_history_limit: usize,
}

const fn default_expiry_days() -> i64 {
    90
}

const fn default_expiry_confidence() -> f64 {
    0.2
}

const fn default_policy_history() -> usize {
    100
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            expiry_days: default_expiry_days(),
            expiry_below_confidence: default_expiry_confidence(),
            policy_history_limit: default_policy_history(),
        }
    }
}

/// Which persistence adapter backs the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Sqlite,
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PersistenceConfig {
    #[serde(default = "default_backend")]
    pub backend: PersistenceBackend,

    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

const fn default_backend() -> PersistenceBackend {
    PersistenceBackend::Sqlite
}

fn default_database_path() -> String {
    ".waypoint/waypoint.db".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_database_path(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Log file rotation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    #[default]
    Daily,
    Hourly,
    Never,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Directory for log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default)]
    pub rotation: RotationPolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: RotationPolicy::default(),
        }
    }
}
