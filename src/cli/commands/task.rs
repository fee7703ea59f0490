use anyhow::{anyhow, Result};
use uuid::Uuid;

use crate::application::Coordinator;
use crate::cli::output::{list_table, render_list, truncate};

/// Handle task show command
pub async fn show(coordinator: &Coordinator, task_id: Uuid, json: bool) -> Result<()> {
    let tasks = coordinator.tasks();
    let task = tasks
        .get_task(task_id)
        .await
        .ok_or_else(|| anyhow!("Task not found: {task_id}"))?;
    let subtasks = tasks.subtasks(task_id).await;

    if json {
        let payload = serde_json::json!({ "task": task, "subtasks": subtasks });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("\nTask Details:");
    println!("─────────────────────────────────────────");
    println!("ID:          {}", task.id);
    println!("Title:       {}", task.title);
    if let Some(parent) = task.parent_id {
        println!("Parent:      {parent}");
    }
    println!("Type:        {}", task.task_type);
    println!("Priority:    {}", task.priority.as_str());
    println!("Status:      {}", task.status.as_str());
    if let Some(reason) = &task.status_reason {
        println!("Reason:      {reason}");
    }
    println!("Created at:  {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(done) = task.completed_at {
        println!("Finished at: {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if !task.description.is_empty() {
        println!("\nDescription:\n{}", task.description);
    }
    if let Some(outputs) = &task.outputs {
        println!("\nOutputs:\n{}", serde_json::to_string_pretty(outputs)?);
    }

    if !task.executions.is_empty() {
        let mut table = list_table(&["tool", "success", "duration ms", "at"]);
        for record in &task.executions {
            table.add_row(vec![
                record.tool_name.clone(),
                record.success.to_string(),
                record.duration_ms.to_string(),
                record.timestamp.format("%H:%M:%S").to_string(),
            ]);
        }
        println!("\n{}", render_list(("execution", "executions"), &table, task.executions.len()));
    }

    if task.is_composite() {
        let mut table = list_table(&["id", "title", "status", "reason"]);
        for sub in &subtasks {
            table.add_row(vec![
                sub.id.to_string(),
                truncate(&sub.title, 40),
                sub.status.as_str().to_string(),
                sub.status_reason.clone().unwrap_or_default(),
            ]);
        }
        println!("\n{}", render_list(("subtask", "subtasks"), &table, subtasks.len()));
    }

    Ok(())
}

/// Handle task stats command
pub async fn stats(coordinator: &Coordinator, json: bool) -> Result<()> {
    let stats = coordinator.task_statistics().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut by_status: Vec<_> = stats.by_status.iter().collect();
    by_status.sort_by_key(|(status, _)| status.as_str());
    let mut table = list_table(&["status", "count"]);
    for (status, count) in by_status {
        table.add_row(vec![status.as_str().to_string(), count.to_string()]);
    }

    println!("Retained tasks: {}", stats.total_tasks);
    println!("{table}");
    if let Some(avg) = stats.average_completion_time_ms {
        println!("Average completion: {avg:.0} ms");
    }
    Ok(())
}
