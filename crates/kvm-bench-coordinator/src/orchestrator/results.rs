//! Results writing and summary display
//!
//! This module handles writing the run report to a JSON file and printing
//! a summary table to stdout.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use kvm_bench_common::{DurationStats, RunReport};
use tracing::info;

/// Serializable view of a report: run metadata, per-VM entries and flat records
pub fn results_json(report: &RunReport) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id,
        "started_at": report.started_at.to_rfc3339(),
        "finished_at": report.finished_at.to_rfc3339(),
        "elapsed_secs": report.elapsed().num_milliseconds() as f64 / 1000.0,
        "status": report.status,
        "success": report.status == kvm_bench_common::RunStatus::Completed,
        "entries": report.entries,
        "warnings": report.warnings,
        "records": report.records(),
    })
}

/// Write the report as pretty JSON
pub fn write_results(path: &Path, report: &RunReport) -> Result<()> {
    let output = serde_json::to_string_pretty(&results_json(report))?;
    std::fs::write(path, output)
        .with_context(|| format!("Failed to write results to {}", path.display()))?;
    info!(path = %path.display(), "Results written");
    Ok(())
}

/// Build the per-VM summary table
pub fn summary_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("VM Spec"),
            Cell::new("Final State"),
            Cell::new("Steps OK"),
            Cell::new("Min (s)"),
            Cell::new("Avg (s)"),
            Cell::new("Max (s)"),
            Cell::new("Error"),
        ]);

    for entry in &report.entries {
        let stats = DurationStats::from_results(&entry.results);
        let (min, avg, max) = if stats.is_empty() {
            ("-".to_string(), "-".to_string(), "-".to_string())
        } else {
            (
                format!("{:.1}", stats.min.as_secs_f64()),
                format!("{:.1}", stats.avg.as_secs_f64()),
                format!("{:.1}", stats.max.as_secs_f64()),
            )
        };

        table.add_row(vec![
            Cell::new(&entry.vm_spec_id),
            Cell::new(entry.final_state),
            Cell::new(format!("{}/{}", entry.successes(), entry.results.len())),
            Cell::new(min),
            Cell::new(avg),
            Cell::new(max),
            Cell::new(entry.error.as_deref().unwrap_or("")),
        ]);
    }

    table
}

/// Print a summary table of benchmark results to stdout
pub fn print_results_summary(report: &RunReport) {
    if report.is_empty() {
        return;
    }

    println!("\n=== Benchmark Results ({}) ===\n", report.status);
    println!("{}", summary_table(report));

    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  [{}] {}", warning.vm_spec_id, warning.message);
        }
    }
}
