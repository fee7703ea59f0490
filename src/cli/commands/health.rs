use anyhow::Result;
use serde::Serialize;

use crate::application::{Coordinator, HealthReport};
use crate::cli::output::{list_table, output, CommandOutput};

#[derive(Serialize)]
struct HealthOutput {
    healthy: bool,
    #[serde(flatten)]
    report: HealthReport,
}

impl CommandOutput for HealthOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["component", "status", "detail"]);
        for (name, status) in &self.report.components {
            let detail = match status {
                crate::application::ComponentStatus::Failed { error } => error.as_str(),
                _ => "",
            };
            table.add_row(vec![name.as_str(), status.as_str(), detail]);
        }

        let reliability = self
            .report
            .average_reliability
            .map_or_else(|| "n/a (no tools registered)".to_string(), |r| format!("{r:.3}"));

        format!(
            "Status: {}\n\n{table}\n\nTask backlog:        {}\nAverage reliability: {reliability}",
            if self.healthy { "healthy" } else { "degraded" },
            self.report.task_backlog_size,
        )
    }
}

/// Handle health command
pub async fn execute(coordinator: &Coordinator, json: bool) -> Result<()> {
    let report = coordinator.health().await;
    output(
        &HealthOutput {
            healthy: report.is_healthy(),
            report,
        },
        json,
    );
    Ok(())
}
