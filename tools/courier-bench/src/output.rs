//! Report formatting.

use colored::Colorize;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// One JSON document.
    Json,
}

/// Result of one benchmark run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub benchmark: &'static str,
    pub operations: u64,
    pub elapsed_ms: f64,
    pub ops_per_sec: f64,
    /// Benchmark-specific measurements, in display order.
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct Metric {
    #[tabled(rename = "metric")]
    pub name: String,
    pub value: String,
}

impl Metric {
    pub fn new(name: &str, value: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

impl Report {
    pub fn new(benchmark: &'static str, operations: u64, elapsed: std::time::Duration) -> Self {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let ops_per_sec = if elapsed.is_zero() {
            0.0
        } else {
            operations as f64 / elapsed.as_secs_f64()
        };
        Self {
            benchmark,
            operations,
            elapsed_ms,
            ops_per_sec,
            metrics: Vec::new(),
        }
    }

    pub fn metric(mut self, name: &str, value: impl ToString) -> Self {
        self.metrics.push(Metric::new(name, value));
        self
    }

    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Json => match serde_json::to_string_pretty(self) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("failed to serialize report: {e}"),
            },
            OutputFormat::Table => {
                let mut rows = vec![
                    Metric::new("operations", self.operations),
                    Metric::new("elapsed_ms", format!("{:.1}", self.elapsed_ms)),
                    Metric::new("ops_per_sec", format!("{:.0}", self.ops_per_sec)),
                ];
                rows.extend(self.metrics.iter().cloned());
                println!("{}", self.benchmark.bold());
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
    }
}

/// Print a top-level error.
pub fn print_error(e: &anyhow::Error) {
    eprintln!("{} {e:#}", "Error:".red().bold());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_report_rates() {
        let report = Report::new("dispatch", 5_000, Duration::from_millis(500)).metric("keys", 8);
        assert_eq!(report.ops_per_sec, 10_000.0);
        assert_eq!(report.elapsed_ms, 500.0);
        assert_eq!(report.metrics[0].value, "8");
    }

    #[test]
    fn test_report_serializes() {
        let report = Report::new("wheel", 10, Duration::ZERO);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["benchmark"], "wheel");
        assert_eq!(json["ops_per_sec"], 0.0);
        assert!(json["metrics"].as_array().unwrap().is_empty());
    }
}
