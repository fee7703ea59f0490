use anyhow::{anyhow, Result};

use crate::application::Coordinator;
use crate::cli::output::{list_table, render_list, truncate};
use crate::domain::models::{KnowledgeCategory, KnowledgeEntry};

fn content_preview(entry: &KnowledgeEntry) -> String {
    let text = entry
        .content
        .as_str()
        .map_or_else(|| entry.content.to_string(), str::to_string);
    truncate(&text, 60)
}

/// Handle knowledge query command
pub async fn query(
    coordinator: &Coordinator,
    term: &str,
    category: Option<&str>,
    json: bool,
) -> Result<()> {
    let category = category
        .map(|c| {
            KnowledgeCategory::from_str(c).ok_or_else(|| anyhow!("Unknown knowledge category: {c}"))
        })
        .transpose()?;

    let entries = coordinator.knowledge().query(term, category).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let mut table = list_table(&["category", "topic", "confidence", "provenance", "content"]);
    for entry in &entries {
        table.add_row(vec![
            entry.category.to_string(),
            entry.topic.clone(),
            format!("{:.2}", entry.confidence),
            entry.provenance.as_str().to_string(),
            content_preview(entry),
        ]);
    }
    println!("{}", render_list(("entry", "entries"), &table, entries.len()));
    Ok(())
}

/// Handle knowledge patterns command
pub async fn patterns(coordinator: &Coordinator, json: bool) -> Result<()> {
    let patterns = coordinator.knowledge().workflow_patterns().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&patterns)?);
        return Ok(());
    }

    let mut table = list_table(&["name", "steps", "uses", "avg ms", "last used"]);
    for pattern in &patterns {
        table.add_row(vec![
            pattern.name.clone(),
            pattern.steps.len().to_string(),
            pattern.usage_count.to_string(),
            format!("{:.0}", pattern.average_execution_ms),
            pattern.last_used_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    println!("{}", render_list(("pattern", "patterns"), &table, patterns.len()));
    Ok(())
}

/// Handle knowledge expire command
pub async fn expire(coordinator: &Coordinator, json: bool) -> Result<()> {
    let settings = &coordinator.config().knowledge;
    let removed = coordinator
        .knowledge()
        .expire_knowledge(
            chrono::Duration::days(settings.expiry_days),
            settings.expiry_below_confidence,
        )
        .await;

    if json {
        println!("{}", serde_json::json!({ "expired": removed }));
    } else {
        println!(
            "Expired {removed} entr{} older than {} days below confidence {:.2}",
            if removed == 1 { "y" } else { "ies" },
            settings.expiry_days,
            settings.expiry_below_confidence
        );
    }
    Ok(())
}
