use anyhow::{Context, Result};

use crate::application::Coordinator;
use crate::cli::output::{list_table, render_list, truncate};

/// Handle policy list command
pub async fn list(coordinator: &Coordinator, json: bool) -> Result<()> {
    let policies = coordinator.policies().policies().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&policies)?);
        return Ok(());
    }

    let mut table = list_table(&["name", "category", "action", "enabled", "applied", "description"]);
    for policy in &policies {
        table.add_row(vec![
            policy.name.clone(),
            policy.category.clone(),
            policy.action.kind().to_string(),
            if policy.enabled { "yes" } else { "no" }.to_string(),
            policy.application_count.to_string(),
            truncate(&policy.description, 50),
        ]);
    }
    println!("{}", render_list(("policy", "policies"), &table, policies.len()));
    Ok(())
}

/// Handle policy enable/disable commands
pub async fn set_enabled(
    coordinator: &Coordinator,
    name: &str,
    enabled: bool,
    json: bool,
) -> Result<()> {
    let policy = coordinator
        .policies()
        .set_enabled(name, enabled)
        .await
        .with_context(|| format!("Failed to update policy {name}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&policy)?);
    } else {
        println!(
            "Policy {} {}",
            policy.name,
            if policy.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}
