//! Aggregate validation result artifacts.
//!
//! The primary artifact stays a single PASS/FAIL token so existing pipeline
//! consumers keep working; the structured per-step outcomes go to a sibling
//! JSON report, with full detail in the log.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    steps: Vec<StepOutcome>,
}

impl Report {
    pub fn new() -> Report {
        Report::default()
    }

    /// Records one step outcome. Failures are logged with their full error
    /// chain but never abort the run; sibling steps still execute.
    pub fn record(&mut self, step: &str, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                info!("{step}: PASS");
                self.steps.push(StepOutcome {
                    step: step.to_string(),
                    passed: true,
                    detail: None,
                });
            }
            Err(e) => {
                error!("{step}: FAIL: {e:#}");
                self.steps.push(StepOutcome {
                    step: step.to_string(),
                    passed: false,
                    detail: Some(format!("{e:#}")),
                });
            }
        }
    }

    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.passed)
    }

    pub fn verdict(&self) -> &'static str {
        if self.passed() {
            "PASS"
        } else {
            "FAIL"
        }
    }

    /// Writes the single-line verdict and the structured per-step report.
    pub fn write(&self, result_path: &Path, report_path: &Path) -> Result<()> {
        fs::write(result_path, format!("{}\n", self.verdict()))
            .with_context(|| format!("failed to write result to {result_path:?}"))?;
        fs::write(report_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write report to {report_path:?}"))?;
        Ok(())
    }
}
