//! Task state manager: owns the task arena and every status write.
//!
//! Tasks live in per-root trees, each behind its own mutex, so status
//! writes and the cascading completion check are serialized per tree
//! while unrelated requests proceed in parallel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainResult, PersistenceError, TaskError};
use crate::domain::models::task::{reason, META_DECOMPOSED};
use crate::domain::models::{
    ExecutionRecord, StatusChange, SubtaskSpec, TaskConfig, TaskNode, TaskPriority,
    TaskStatistics, TaskStatus, TaskType,
};
use crate::domain::ports::PersistenceAdapter;

const INDEX_KEY: &str = "tasks/index";

fn tree_key(root_id: Uuid) -> String {
    format!("tasks/{root_id}")
}

/// Status a composite should hold given its children's statuses.
pub fn derive_composite_status(children: &[TaskStatus]) -> TaskStatus {
    if children.iter().all(|s| *s == TaskStatus::Completed) {
        TaskStatus::Completed
    } else if children.iter().all(TaskStatus::is_settled) {
        if children.contains(&TaskStatus::Failed) {
            TaskStatus::Failed
        } else {
            TaskStatus::Blocked
        }
    } else if children.iter().all(|s| *s == TaskStatus::Pending) {
        TaskStatus::Pending
    } else {
        TaskStatus::InProgress
    }
}

/// All nodes sharing one root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTree {
    pub root_id: Uuid,
    pub nodes: HashMap<Uuid, TaskNode>,
}

impl TaskTree {
    fn new(root: TaskNode) -> Self {
        let root_id = root.id;
        let mut nodes = HashMap::new();
        nodes.insert(root_id, root);
        Self { root_id, nodes }
    }

    pub fn root(&self) -> Option<&TaskNode> {
        self.nodes.get(&self.root_id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leaves in depth-first subtask order.
    pub fn leaves(&self) -> Vec<&TaskNode> {
        let mut out = Vec::new();
        let mut stack = vec![self.root_id];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.is_composite() {
                stack.extend(node.subtasks.iter().rev().copied());
            } else {
                out.push(node);
            }
        }
        out
    }

    fn derived_status(&self, id: Uuid) -> Option<TaskStatus> {
        let node = self.nodes.get(&id)?;
        if node.subtasks.is_empty() {
            return None;
        }
        let statuses: Vec<TaskStatus> = node
            .subtasks
            .iter()
            .filter_map(|child| self.nodes.get(child))
            .map(|child| child.status)
            .collect();
        Some(derive_composite_status(&statuses))
    }

    /// Re-evaluate ancestors starting at `start`, stopping at the first
    /// one whose status does not change. Bounded by tree depth.
    fn cascade_from(&mut self, start: Option<Uuid>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        let mut current = start;
        let mut hops = 0;

        while let Some(id) = current {
            hops += 1;
            if hops > self.nodes.len() {
                warn!(task_id = %id, "Cascade exceeded tree size, parent links form a cycle");
                break;
            }
            let Some(target) = self.derived_status(id) else {
                break;
            };
            let Some(node) = self.nodes.get_mut(&id) else {
                break;
            };
            let from = node.status;
            if !node.settle_to(target) {
                break;
            }
            node.status_reason = match target {
                TaskStatus::Failed => Some(reason::SUBTASK_FAILED.to_string()),
                TaskStatus::Blocked => Some(reason::SUBTASK_BLOCKED.to_string()),
                _ => None,
            };
            events.push(StatusEvent::new(id, Some(from), target, node.status_reason.clone()));
            current = node.parent_id;
        }

        events
    }
}

/// One line of the task event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusEvent {
    task_id: Uuid,
    from: Option<TaskStatus>,
    to: TaskStatus,
    reason: Option<String>,
    at: DateTime<Utc>,
}

impl StatusEvent {
    fn new(task_id: Uuid, from: Option<TaskStatus>, to: TaskStatus, reason: Option<String>) -> Self {
        Self {
            task_id,
            from,
            to,
            reason,
            at: Utc::now(),
        }
    }
}

/// Owner of the task graph.
pub struct TaskStateManager {
    trees: RwLock<HashMap<Uuid, Arc<Mutex<TaskTree>>>>,
    /// task id -> root id
    index: RwLock<HashMap<Uuid, Uuid>>,
    /// Roots in creation order, for eviction
    roots: Mutex<VecDeque<Uuid>>,
    persist_lock: Mutex<()>,
    persistence: Arc<dyn PersistenceAdapter>,
    config: TaskConfig,
}

impl TaskStateManager {
    pub fn new(config: TaskConfig, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            roots: Mutex::new(VecDeque::new()),
            persist_lock: Mutex::new(()),
            persistence,
            config,
        }
    }

    /// Reload persisted trees.
    pub async fn initialize(&self) -> DomainResult<()> {
        let restored = self.restore().await?;
        info!(trees = restored, "Task state manager initialized");
        Ok(())
    }

    async fn tree_of(&self, task_id: Uuid) -> Option<(Uuid, Arc<Mutex<TaskTree>>)> {
        let root_id = *self.index.read().await.get(&task_id)?;
        let tree = self.trees.read().await.get(&root_id).cloned()?;
        Some((root_id, tree))
    }

    /// Create a task, as a new root or as a child of `parent_id`.
    pub async fn create_task(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        task_type: TaskType,
        priority: TaskPriority,
        parent_id: Option<Uuid>,
    ) -> Result<TaskNode, TaskError> {
        let mut node = TaskNode::new(title, description)
            .with_type(task_type)
            .with_priority(priority);

        if let Some(parent_id) = parent_id {
            let (root_id, tree) = self
                .tree_of(parent_id)
                .await
                .ok_or(TaskError::InvalidParent(parent_id))?;
            {
                let mut tree = tree.lock().await;
                let parent = tree
                    .nodes
                    .get_mut(&parent_id)
                    .ok_or(TaskError::InvalidParent(parent_id))?;
                if parent.is_terminal() {
                    return Err(TaskError::TerminalTask {
                        id: parent_id,
                        status: parent.status,
                    });
                }
                node.parent_id = Some(parent_id);
                parent.subtasks.push(node.id);
                parent.touch();
                // Indexed before the tree lock drops so readers that see
                // the child can always resolve it.
                self.index.write().await.insert(node.id, root_id);
                tree.nodes.insert(node.id, node.clone());
            }
        } else {
            let root_id = node.id;
            let mut trees = self.trees.write().await;
            self.index.write().await.insert(root_id, root_id);
            trees.insert(root_id, Arc::new(Mutex::new(TaskTree::new(node.clone()))));
            drop(trees);
            self.roots.lock().await.push_back(root_id);
        }

        debug!(task_id = %node.id, parent_id = ?node.parent_id, task_type = %node.task_type, "Task created");
        self.evict_if_needed().await;
        Ok(node)
    }

    /// Atomically create `specs` as subtasks of `task_id` and mark it as a
    /// decomposition goal.
    pub async fn decompose_task(
        &self,
        task_id: Uuid,
        specs: Vec<SubtaskSpec>,
    ) -> Result<TaskNode, TaskError> {
        let (root_id, tree) = self
            .tree_of(task_id)
            .await
            .ok_or(TaskError::TaskNotFound(task_id))?;

        let (parent, child_ids) = {
            let mut tree = tree.lock().await;
            let parent = tree
                .nodes
                .get(&task_id)
                .ok_or(TaskError::TaskNotFound(task_id))?;
            if parent.is_decomposed() {
                return Err(TaskError::AlreadyDecomposed(task_id));
            }
            if parent.is_terminal() {
                return Err(TaskError::TerminalTask {
                    id: task_id,
                    status: parent.status,
                });
            }
            if specs.is_empty() {
                return Err(TaskError::EmptySubtaskList(task_id));
            }
            for (index, spec) in specs.iter().enumerate() {
                if let Some(&dependency) = spec.depends_on.iter().find(|&&d| d >= index) {
                    return Err(TaskError::InvalidSubtaskDependency { index, dependency });
                }
            }
            let parent_priority = parent.priority;

            let mut children = Vec::with_capacity(specs.len());
            let mut dependencies = Vec::with_capacity(specs.len());
            for spec in specs {
                let task_type = spec
                    .task_type
                    .unwrap_or_else(|| TaskType::infer(&spec.description));
                let mut child = TaskNode::new(spec.title, spec.description)
                    .with_type(task_type)
                    .with_priority(spec.priority.unwrap_or(parent_priority))
                    .with_parent(task_id);
                child.metadata = spec.metadata;
                dependencies.push(spec.depends_on);
                children.push(child);
            }

            let child_ids: Vec<Uuid> = children.iter().map(|c| c.id).collect();
            for (child, deps) in children.iter_mut().zip(&dependencies) {
                if !deps.is_empty() {
                    let prerequisites: Vec<Uuid> = deps.iter().map(|&d| child_ids[d]).collect();
                    child.set_prerequisites(&prerequisites);
                }
            }

            let parent = tree
                .nodes
                .get_mut(&task_id)
                .ok_or(TaskError::TaskNotFound(task_id))?;
            parent.subtasks.extend(child_ids.iter().copied());
            parent
                .metadata
                .insert(META_DECOMPOSED.to_string(), serde_json::Value::Bool(true));
            parent.task_type = TaskType::DecompositionGoal;
            parent.touch();
            let snapshot = parent.clone();

            {
                let mut index = self.index.write().await;
                for id in &child_ids {
                    index.insert(*id, root_id);
                }
            }
            for child in children {
                tree.nodes.insert(child.id, child);
            }
            (snapshot, child_ids)
        };

        info!(task_id = %task_id, subtasks = child_ids.len(), "Task decomposed");
        self.evict_if_needed().await;
        Ok(parent)
    }

    /// Change a task's status. `Ok(None)` when the task is unknown.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        outputs: Option<serde_json::Value>,
    ) -> Result<Option<TaskNode>, TaskError> {
        let mut change = StatusChange::to(status);
        change.outputs = outputs;
        self.transition(task_id, change).await
    }

    /// Validate and apply a status change, then re-evaluate ancestors.
    ///
    /// A blocked task may be re-blocked to refresh its reason.
    pub async fn transition(
        &self,
        task_id: Uuid,
        change: StatusChange,
    ) -> Result<Option<TaskNode>, TaskError> {
        let Some((root_id, tree)) = self.tree_of(task_id).await else {
            debug!(task_id = %task_id, "Status update for unknown task");
            return Ok(None);
        };

        let (updated, events) = {
            let mut tree = tree.lock().await;
            let (from, parent_id) = {
                let Some(node) = tree.nodes.get(&task_id) else {
                    return Ok(None);
                };
                let from = node.status;
                if from.is_terminal() {
                    return Err(TaskError::TerminalTask {
                        id: task_id,
                        status: from,
                    });
                }
                let reblock = from == TaskStatus::Blocked && change.status == TaskStatus::Blocked;
                if !reblock && !from.can_transition_to(change.status) {
                    return Err(TaskError::InvalidStateTransition {
                        id: task_id,
                        from,
                        to: change.status,
                    });
                }
                if change.status == TaskStatus::Completed && node.is_composite() {
                    let pending = node
                        .subtasks
                        .iter()
                        .filter(|id| {
                            tree.nodes
                                .get(id)
                                .map_or(true, |c| c.status != TaskStatus::Completed)
                        })
                        .count();
                    if pending > 0 {
                        return Err(TaskError::IncompleteSubtasks { id: task_id, pending });
                    }
                }
                (from, node.parent_id)
            };

            let node = tree
                .nodes
                .get_mut(&task_id)
                .ok_or(TaskError::TaskNotFound(task_id))?;
            if from == change.status {
                node.touch();
            } else {
                node.apply_status(change.status);
            }
            node.status_reason = change.reason;
            if let Some(outputs) = change.outputs {
                node.outputs = Some(outputs);
            }
            let updated = node.clone();

            let mut events = vec![StatusEvent::new(
                task_id,
                Some(from),
                updated.status,
                updated.status_reason.clone(),
            )];
            events.extend(tree.cascade_from(parent_id));
            (updated, events)
        };

        debug!(
            task_id = %task_id,
            status = %updated.status,
            reason = ?updated.status_reason,
            cascaded = events.len() - 1,
            "Task status updated"
        );
        self.log_events(root_id, &events).await;
        Ok(Some(updated))
    }

    /// Append an execution record. Ignored (and logged) for unknown or
    /// terminal tasks; returns whether it was recorded.
    pub async fn add_execution_record(
        &self,
        task_id: Uuid,
        tool_name: &str,
        inputs: serde_json::Value,
        outputs: Option<serde_json::Value>,
        success: bool,
        duration_ms: u64,
    ) -> bool {
        let Some((_, tree)) = self.tree_of(task_id).await else {
            warn!(task_id = %task_id, tool = tool_name, "Execution record for unknown task ignored");
            return false;
        };
        let mut tree = tree.lock().await;
        let Some(node) = tree.nodes.get_mut(&task_id) else {
            warn!(task_id = %task_id, tool = tool_name, "Execution record for unknown task ignored");
            return false;
        };
        if node.is_terminal() {
            warn!(
                task_id = %task_id,
                tool = tool_name,
                status = %node.status,
                "Execution record for terminal task ignored"
            );
            return false;
        }
        node.executions.push(ExecutionRecord::new(
            tool_name,
            inputs,
            outputs,
            success,
            duration_ms,
        ));
        node.touch();
        true
    }

    /// Merge a planner annotation into the task's metadata.
    pub async fn annotate(
        &self,
        task_id: Uuid,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<TaskNode> {
        let (_, tree) = self.tree_of(task_id).await?;
        let mut tree = tree.lock().await;
        let node = tree.nodes.get_mut(&task_id)?;
        node.metadata.insert(key.into(), value);
        node.touch();
        Some(node.clone())
    }

    pub async fn get_task(&self, task_id: Uuid) -> Option<TaskNode> {
        let (_, tree) = self.tree_of(task_id).await?;
        let tree = tree.lock().await;
        tree.nodes.get(&task_id).cloned()
    }

    /// Direct children in subtask order.
    pub async fn subtasks(&self, task_id: Uuid) -> Vec<TaskNode> {
        let Some((_, tree)) = self.tree_of(task_id).await else {
            return Vec::new();
        };
        let tree = tree.lock().await;
        tree.nodes
            .get(&task_id)
            .map(|node| {
                node.subtasks
                    .iter()
                    .filter_map(|id| tree.nodes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn root_of(&self, task_id: Uuid) -> Option<Uuid> {
        self.index.read().await.get(&task_id).copied()
    }

    /// Snapshot of a whole tree.
    pub async fn tree(&self, root_id: Uuid) -> Option<TaskTree> {
        let tree = self.trees.read().await.get(&root_id).cloned()?;
        let tree = tree.lock().await;
        Some(tree.clone())
    }

    async fn all_trees(&self) -> Vec<Arc<Mutex<TaskTree>>> {
        self.trees.read().await.values().cloned().collect()
    }

    /// Number of retained task nodes.
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Retained tasks that have not reached a terminal status.
    pub async fn backlog_size(&self) -> usize {
        let mut backlog = 0;
        for tree in self.all_trees().await {
            let tree = tree.lock().await;
            backlog += tree.nodes.values().filter(|n| !n.is_terminal()).count();
        }
        backlog
    }

    pub async fn statistics(&self) -> TaskStatistics {
        let mut stats = TaskStatistics::default();
        let mut completion_total_ms = 0.0;
        let mut completed = 0usize;

        for tree in self.all_trees().await {
            let tree = tree.lock().await;
            for node in tree.nodes.values() {
                stats.total_tasks += 1;
                *stats.by_status.entry(node.status).or_insert(0) += 1;
                *stats.by_type.entry(node.task_type.clone()).or_insert(0) += 1;
                if node.status == TaskStatus::Completed {
                    if let Some(done) = node.completed_at {
                        completion_total_ms +=
                            (done - node.created_at).num_milliseconds().max(0) as f64;
                        completed += 1;
                    }
                }
            }
        }

        if completed > 0 {
            stats.average_completion_time_ms = Some(completion_total_ms / completed as f64);
        }
        stats
    }

    /// Drop the oldest settled trees while the arena exceeds its ceiling.
    async fn evict_if_needed(&self) {
        let total = self.index.read().await.len();
        if total <= self.config.max_retained {
            return;
        }
        let mut excess = total - self.config.max_retained;
        let candidates: Vec<Uuid> = self.roots.lock().await.iter().copied().collect();
        let mut evicted = Vec::new();

        for root_id in candidates {
            if excess == 0 {
                break;
            }
            let Some(tree) = self.trees.read().await.get(&root_id).cloned() else {
                continue;
            };
            let (settled, ids) = {
                let tree = tree.lock().await;
                let settled = tree.root().is_some_and(|r| r.status.is_settled())
                    && tree.nodes.values().all(|n| n.status.is_settled());
                (settled, tree.nodes.keys().copied().collect::<Vec<_>>())
            };
            if !settled {
                continue;
            }
            self.trees.write().await.remove(&root_id);
            {
                let mut index = self.index.write().await;
                for id in &ids {
                    index.remove(id);
                }
            }
            excess = excess.saturating_sub(ids.len());
            evicted.push(root_id);
        }

        if evicted.is_empty() {
            debug!(total, ceiling = self.config.max_retained, "Task arena over ceiling, nothing settled to evict");
        } else {
            self.roots.lock().await.retain(|r| !evicted.contains(r));
            info!(evicted = evicted.len(), "Evicted settled task trees");
        }
    }

    async fn log_events(&self, root_id: Uuid, events: &[StatusEvent]) {
        for event in events {
            let line = serde_json::json!({
                "kind": "task_status",
                "root_id": root_id,
                "event": event,
            });
            let bytes = match serde_json::to_vec(&line) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize task event");
                    continue;
                }
            };
            if let Err(e) = self.persistence.append_log(bytes).await {
                warn!(error = %e, task_id = %event.task_id, "Failed to append task event");
            }
        }
    }

    /// Write a tree to the persistence adapter and record it in the index.
    pub async fn persist_tree(&self, root_id: Uuid) -> Result<(), PersistenceError> {
        let Some(tree) = self.tree(root_id).await else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;

        self.persistence
            .put(&tree_key(root_id), serde_json::to_vec(&tree)?)
            .await?;

        let mut index: Vec<Uuid> = match self.persistence.get(INDEX_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        if !index.contains(&root_id) {
            index.push(root_id);
            self.persistence
                .put(INDEX_KEY, serde_json::to_vec(&index)?)
                .await?;
        }
        debug!(root_id = %root_id, nodes = tree.len(), "Task tree persisted");
        Ok(())
    }

    /// Persist every retained tree. Returns the number written.
    pub async fn persist_all(&self) -> Result<usize, PersistenceError> {
        let roots: Vec<Uuid> = self.roots.lock().await.iter().copied().collect();
        for root_id in &roots {
            self.persist_tree(*root_id).await?;
        }
        Ok(roots.len())
    }

    /// Read a persisted tree without loading it into the arena.
    pub async fn load_tree(&self, root_id: Uuid) -> Result<Option<TaskTree>, PersistenceError> {
        match self.persistence.get(&tree_key(root_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load every persisted tree not already in the arena.
    pub async fn restore(&self) -> Result<usize, PersistenceError> {
        let roots: Vec<Uuid> = match self.persistence.get(INDEX_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Ok(0),
        };

        let mut restored = 0;
        for root_id in roots {
            if self.trees.read().await.contains_key(&root_id) {
                continue;
            }
            let Some(tree) = self.load_tree(root_id).await? else {
                warn!(root_id = %root_id, "Indexed task tree missing from storage");
                continue;
            };
            let mut trees = self.trees.write().await;
            {
                let mut index = self.index.write().await;
                for id in tree.nodes.keys() {
                    index.insert(*id, root_id);
                }
            }
            trees.insert(root_id, Arc::new(Mutex::new(tree)));
            drop(trees);
            self.roots.lock().await.push_back(root_id);
            restored += 1;
        }

        self.evict_if_needed().await;
        Ok(restored)
    }
}
