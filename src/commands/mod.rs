pub mod batch;
pub mod extract;
pub mod status;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::gate::{RuleStatus, ValidationReport};
use crate::model::{DocumentIdentity, DocumentOutput, RiskSegment, SectionOutput};
use crate::pipeline::DocumentExtraction;
use crate::util::now_utc_string;

/// Identity metadata comes from a `<stem>.meta.json` sidecar when one exists;
/// a missing sidecar is an empty identity, not an error.
pub fn load_identity(input: &Path) -> Result<DocumentIdentity> {
    let sidecar = input.with_extension("meta.json");
    if !sidecar.exists() {
        return Ok(DocumentIdentity::default());
    }

    let raw = fs::read(&sidecar)
        .with_context(|| format!("failed to read identity sidecar: {}", sidecar.display()))?;
    let values: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse identity sidecar: {}", sidecar.display()))?;

    let mut fields = BTreeMap::new();
    for (key, value) in values {
        match value {
            serde_json::Value::String(text) => {
                fields.insert(key, text);
            }
            serde_json::Value::Number(number) => {
                fields.insert(key, number.to_string());
            }
            serde_json::Value::Bool(flag) => {
                fields.insert(key, flag.to_string());
            }
            _ => {}
        }
    }

    Ok(DocumentIdentity { fields })
}

pub fn build_document_output(
    run_id: &str,
    input: &Path,
    fingerprint: &str,
    identity: DocumentIdentity,
    extraction: &DocumentExtraction,
) -> DocumentOutput {
    DocumentOutput {
        output_version: 1,
        generated_at: now_utc_string(),
        run_id: run_id.to_string(),
        source_path: input.display().to_string(),
        source_sha256: fingerprint.to_string(),
        identity,
        sections: extraction
            .sections
            .iter()
            .map(|section| SectionOutput {
                identifier: section.identifier.clone(),
                title: section.title.clone(),
                segment_count: section.segments.len(),
                segments: section.segments.clone(),
            })
            .collect(),
    }
}

pub fn combined_segments(extraction: &DocumentExtraction) -> Vec<RiskSegment> {
    extraction
        .sections
        .iter()
        .flat_map(|section| section.segments.iter().cloned())
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ValidationReportFile<'a> {
    pub generated_at: String,
    pub run_id: &'a str,
    pub input_path: String,
    #[serde(flatten)]
    pub report: &'a ValidationReport,
}

impl<'a> ValidationReportFile<'a> {
    pub fn new(run_id: &'a str, input: &Path, report: &'a ValidationReport) -> Self {
        Self {
            generated_at: now_utc_string(),
            run_id,
            input_path: input.display().to_string(),
            report,
        }
    }
}

/// Plain-text rendering of a failed validation for the quarantine area.
pub fn render_failure_report(input: &Path, report: &ValidationReport) -> String {
    let mut lines = Vec::new();
    lines.push(format!("validation {} for {}", report.status.as_str(), input.display()));
    lines.push(format!(
        "blocking rules: {} total, {} passed, {} warned, {} failed",
        report.blocking.total_blocking,
        report.blocking.passed,
        report.blocking.warned,
        report.blocking.failed
    ));
    lines.push(String::new());

    for result in &report.results {
        if result.status == RuleStatus::Pass {
            continue;
        }
        let actual = result
            .actual
            .map(|value| format!("{value:.4}"))
            .unwrap_or_else(|| "n/a".to_string());
        lines.push(format!(
            "{:<4} [{}] {} ({}): actual {} target {} {}{}",
            format!("{:?}", result.status).to_uppercase(),
            result.category,
            result.display_name,
            result.rule_name,
            actual,
            result.operator,
            result.target,
            if result.blocking { " [blocking]" } else { "" }
        ));
    }

    lines.push(String::new());
    lines.join("\n")
}
