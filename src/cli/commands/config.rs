use anyhow::{Context, Result};

use crate::domain::models::WaypointConfig;

/// Handle config show command
pub fn show(config: &WaypointConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        let yaml = serde_yaml::to_string(config).context("Failed to render configuration")?;
        print!("{yaml}");
    }
    Ok(())
}
