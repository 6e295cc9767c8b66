use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One classifiable unit of section text, emitted by the segmenter and
/// consumed read-only by the quality gate and exporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSegment {
    pub id: u32,
    pub text: String,
    pub word_count: usize,
    pub char_count: usize,
    pub parent_subsection: String,
    pub ancestors: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub oversized: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hard_split: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "FAIL")]
    Fail,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }
}

/// Identity metadata for a source document. The pipeline treats the fields as
/// opaque beyond present/absent checks; they come from a sidecar
/// `<doc>.meta.json` when one exists next to the input file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentIdentity {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl DocumentIdentity {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields
            .get(name)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionOutput {
    pub identifier: String,
    pub title: String,
    pub segment_count: usize,
    pub segments: Vec<RiskSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutput {
    pub output_version: u32,
    pub generated_at: String,
    pub run_id: String,
    pub source_path: String,
    pub source_sha256: String,
    pub identity: DocumentIdentity,
    pub sections: Vec<SectionOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub input_fingerprint: String,
    pub input_path: String,
    pub output_path: String,
    pub run_id: String,
    pub processed_at: String,
    pub validation_status: ValidationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub input_path: String,
    pub partial_output_path: Option<String>,
    pub failure_report: String,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchCounts {
    pub candidates: usize,
    pub processed: usize,
    pub skipped_unchanged: usize,
    pub skipped_checkpoint: usize,
    pub passed: usize,
    pub warned: usize,
    pub quarantined: usize,
    pub timed_out: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub input_path: String,
    pub status: String,
    pub validation_status: Option<ValidationStatus>,
    pub output_path: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPaths {
    pub state_root: String,
    pub output_dir: String,
    pub quarantine_dir: String,
    pub sections_config_path: String,
    pub thresholds_config_path: String,
}

/// Per-run summary manifest, written next to the state manifest after every
/// batch invocation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub paths: BatchPaths,
    pub counts: BatchCounts,
    pub items: Vec<ItemOutcome>,
    pub warnings: Vec<String>,
}
