use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::migration::{MigrationRun, MigrationStatus, MigrationStep, RunError};

/// Reporter for summarising migration runs in various formats
pub struct MigrationReporter {
    output_format: ReportFormat,
}

/// Available output formats for migration reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Console,
    Json,
    Yaml,
}

/// Summary of one migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub name: String,
    pub status: MigrationStatus,
    pub dry_run: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub summary: RunSummary,
    pub steps: Vec<StepSummary>,
    pub errors: Vec<RunError>,
    /// Ids recorded for rollback, per entity
    pub rollback_counts: BTreeMap<String, usize>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_records_processed: usize,
    pub total_records_succeeded: usize,
    pub total_records_failed: usize,
    pub total_records_skipped: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub entity: String,
    pub status: MigrationStatus,
    pub records_processed: usize,
    pub records_succeeded: usize,
    pub records_failed: usize,
    pub records_skipped: usize,
    pub error_count: usize,
    pub warnings: Vec<String>,
    pub duration_seconds: Option<f64>,
}

impl From<&MigrationStep> for StepSummary {
    fn from(step: &MigrationStep) -> Self {
        Self {
            name: step.name.clone(),
            entity: step.entity.clone(),
            status: step.status,
            records_processed: step.records_processed,
            records_succeeded: step.records_succeeded,
            records_failed: step.records_failed,
            records_skipped: step.records_skipped,
            error_count: step.errors.len(),
            warnings: step.warnings.clone(),
            duration_seconds: step.duration_seconds(),
        }
    }
}

impl MigrationReporter {
    pub fn new() -> Self {
        Self {
            output_format: ReportFormat::Console,
        }
    }

    pub fn with_format(mut self, format: ReportFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Generate a report from a finished (or failed) run
    pub fn generate_report(&self, run: &MigrationRun) -> MigrationReport {
        let success_rate = if run.total_records_processed == 0 {
            0.0
        } else {
            run.total_records_succeeded as f64 / run.total_records_processed as f64
        };

        MigrationReport {
            run_id: run.id.clone(),
            name: run.name.clone(),
            status: run.status,
            dry_run: run.dry_run,
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_seconds: run.duration_seconds(),
            summary: RunSummary {
                total_records_processed: run.total_records_processed,
                total_records_succeeded: run.total_records_succeeded,
                total_records_failed: run.total_records_failed,
                total_records_skipped: run.total_records_skipped,
                success_rate,
            },
            steps: run.steps.iter().map(StepSummary::from).collect(),
            errors: run.errors.clone(),
            rollback_counts: run
                .rollback_data
                .iter()
                .map(|(entity, ids)| (entity.clone(), ids.len()))
                .collect(),
            recommendations: self.generate_recommendations(run),
        }
    }

    /// Format the report according to the configured output format
    pub fn format_report(&self, report: &MigrationReport) -> Result<String, ReportError> {
        match self.output_format {
            ReportFormat::Console => Ok(self.format_console_report(report)),
            ReportFormat::Json => serde_json::to_string_pretty(report)
                .map_err(|e| ReportError::SerializationError(e.to_string())),
            ReportFormat::Yaml => serde_yaml::to_string(report)
                .map_err(|e| ReportError::SerializationError(e.to_string())),
        }
    }

    fn generate_recommendations(&self, run: &MigrationRun) -> Vec<String> {
        let mut recommendations = Vec::new();

        if let Some(error) = run.errors.last() {
            recommendations.push(format!(
                "Run stopped during {}: {}",
                error.phase, error.message
            ));
        }

        for step in &run.steps {
            if step.warnings.iter().any(|w| w.starts_with("No source data found")) {
                recommendations.push(format!(
                    "Check the source configuration for {}: no records were extracted",
                    step.entity
                ));
            }
            if step.name.starts_with("Validate") && step.records_failed > 0 {
                recommendations.push(format!(
                    "Review the mapping for {}: {} records failed validation and were not loaded",
                    step.entity, step.records_failed
                ));
            }
            if step.name.starts_with("Load") && step.records_failed > 0 {
                recommendations.push(format!(
                    "Retry {} failed {} loads after fixing the reported errors",
                    step.records_failed, step.entity
                ));
            }
        }

        if run.status == MigrationStatus::Completed && run.dry_run {
            recommendations.push(
                "Dry run completed; run again without dry_run to load into the target".to_string(),
            );
        }

        if recommendations.is_empty() {
            recommendations.push("Migration completed successfully".to_string());
        }

        recommendations
    }

    fn format_console_report(&self, report: &MigrationReport) -> String {
        let mut output = String::new();

        output.push_str("=== Migration Report ===\n\n");
        output.push_str(&format!("Run: {} ({})\n", report.name, report.run_id));
        output.push_str(&format!("Status: {}\n", report.status.as_str().to_uppercase()));
        if report.dry_run {
            output.push_str("Mode: dry run\n");
        }
        if let Some(duration) = report.duration_seconds {
            output.push_str(&format!("Duration: {:.1}s\n", duration));
        }

        output.push_str(&format!(
            "\nRecords: {} processed, {} succeeded, {} failed, {} skipped ({:.1}% success)\n",
            report.summary.total_records_processed,
            report.summary.total_records_succeeded,
            report.summary.total_records_failed,
            report.summary.total_records_skipped,
            report.summary.success_rate * 100.0
        ));

        if !report.steps.is_empty() {
            output.push_str("\nSteps:\n");
            for step in &report.steps {
                output.push_str(&format!(
                    "  [{}] {}: {}/{} succeeded",
                    step.status, step.name, step.records_succeeded, step.records_processed
                ));
                if step.records_failed > 0 {
                    output.push_str(&format!(", {} failed", step.records_failed));
                }
                output.push('\n');
            }
        }

        if !report.errors.is_empty() {
            output.push_str("\nErrors:\n");
            for error in &report.errors {
                output.push_str(&format!("  • [{}] {}\n", error.phase, error.message));
            }
        }

        if !report.recommendations.is_empty() {
            output.push_str("\nRecommendations:\n");
            for rec in &report.recommendations {
                output.push_str(&format!("  • {}\n", rec));
            }
        }

        output
    }
}

impl Default for MigrationReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_run() -> MigrationRun {
        let mut run = MigrationRun::new("stripe-to-chargebee");
        for phase in [
            MigrationStatus::Extracting,
            MigrationStatus::Transforming,
            MigrationStatus::Validating,
            MigrationStatus::Loading,
            MigrationStatus::Completed,
        ] {
            run.transition(phase).unwrap();
        }

        let step = run.add_step("Validate customer", "customer");
        step.records_processed = 10;
        step.records_succeeded = 8;
        step.records_failed = 2;
        step.finish(MigrationStatus::Completed);
        let step = run.add_step("Load customer", "customer");
        step.records_processed = 8;
        step.records_succeeded = 8;
        step.finish(MigrationStatus::Completed);
        run.add_rollback_ids("customer", (0..8).map(|i| i.to_string()));
        run.update_totals();
        run
    }

    #[test]
    fn test_reporter_with_format() {
        let reporter = MigrationReporter::new().with_format(ReportFormat::Json);
        assert!(matches!(reporter.output_format, ReportFormat::Json));
    }

    #[test]
    fn test_generate_report() {
        let report = MigrationReporter::new().generate_report(&finished_run());

        assert_eq!(report.status, MigrationStatus::Completed);
        assert_eq!(report.summary.total_records_processed, 18);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.rollback_counts["customer"], 8);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("2 records failed validation"));
    }

    #[test]
    fn test_failed_run_recommendation() {
        let mut run = MigrationRun::new("broken");
        run.record_error(MigrationStatus::Pending, "No migration mapping configured");
        run.transition(MigrationStatus::Failed).unwrap();

        let report = MigrationReporter::new().generate_report(&run);
        assert_eq!(
            report.recommendations,
            vec!["Run stopped during pending: No migration mapping configured"]
        );
    }

    #[test]
    fn test_format_console_report() {
        let reporter = MigrationReporter::new();
        let report = reporter.generate_report(&finished_run());

        let formatted = reporter.format_report(&report).unwrap();
        assert!(formatted.contains("=== Migration Report ==="));
        assert!(formatted.contains("Status: COMPLETED"));
        assert!(formatted.contains("[completed] Load customer: 8/8 succeeded"));
        assert!(formatted.contains("Recommendations:"));
    }

    #[test]
    fn test_format_json_and_yaml() {
        let report = MigrationReporter::new().generate_report(&finished_run());

        let json = MigrationReporter::new()
            .with_format(ReportFormat::Json)
            .format_report(&report)
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "completed");

        let yaml = MigrationReporter::new()
            .with_format(ReportFormat::Yaml)
            .format_report(&report)
            .unwrap();
        assert!(yaml.contains("status: completed"));
    }
}
