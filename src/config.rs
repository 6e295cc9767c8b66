use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One named structural section the locator knows how to find. Patterns are
/// matched against title-node text and against raw bytes during pre-seek;
/// aliases are the lowercase text keys for the fallback containment match.
#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub id: String,
    pub title: String,
    pub patterns: Vec<Regex>,
    pub aliases: Vec<String>,
}

impl SectionSpec {
    pub fn matches_title(&self, normalized_text: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.is_match(normalized_text))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmenterConfig {
    #[serde(default = "default_merge_floor")]
    pub merge_floor_words: usize,
    #[serde(default = "default_split_ceiling")]
    pub split_ceiling_words: usize,
    #[serde(default = "default_min_candidate_chars")]
    pub min_candidate_chars: usize,
    #[serde(default = "default_sentence_window_chars")]
    pub sentence_window_chars: usize,
    #[serde(default)]
    pub boilerplate_patterns: Vec<String>,
}

fn default_merge_floor() -> usize {
    20
}

fn default_split_ceiling() -> usize {
    380
}

fn default_min_candidate_chars() -> usize {
    25
}

fn default_sentence_window_chars() -> usize {
    600
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            merge_floor_words: default_merge_floor(),
            split_ceiling_words: default_split_ceiling(),
            min_candidate_chars: default_min_candidate_chars(),
            sentence_window_chars: default_sentence_window_chars(),
            boilerplate_patterns: Vec::new(),
        }
    }
}

impl SegmenterConfig {
    pub fn compiled_boilerplate(&self) -> Result<Vec<Regex>> {
        self.boilerplate_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("invalid boilerplate pattern: {pattern}"))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sections: Vec<SectionSpec>,
    pub segmenter: SegmenterConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read sections config: {}", path.display()))?;
        let file: RawSectionsFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse sections config: {}", path.display()))?;

        if file.sections.is_empty() {
            bail!("sections config {} defines no sections", path.display());
        }

        let mut sections = Vec::with_capacity(file.sections.len());
        for raw_section in file.sections {
            if raw_section.patterns.is_empty() && raw_section.aliases.is_empty() {
                bail!(
                    "section '{}' has neither patterns nor aliases",
                    raw_section.id
                );
            }

            let patterns = raw_section
                .patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).with_context(|| {
                        format!(
                            "invalid pattern for section '{}': {pattern}",
                            raw_section.id
                        )
                    })
                })
                .collect::<Result<Vec<Regex>>>()?;

            sections.push(SectionSpec {
                id: raw_section.id,
                title: raw_section.title,
                patterns,
                aliases: raw_section
                    .aliases
                    .iter()
                    .map(|alias| alias.to_lowercase())
                    .collect(),
            });
        }

        Ok(Self {
            sections,
            segmenter: file.segmentation.unwrap_or_default(),
        })
    }

    pub fn section(&self, id: &str) -> Option<&SectionSpec> {
        self.sections.iter().find(|section| section.id == id)
    }

    /// Sections that follow `id` in configured document order; the slicer uses
    /// the first of these that matches as the end anchor.
    pub fn sections_after(&self, id: &str) -> &[SectionSpec] {
        match self.sections.iter().position(|section| section.id == id) {
            Some(index) => &self.sections[index + 1..],
            None => &[],
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSectionsFile {
    sections: Vec<RawSectionSpec>,
    segmentation: Option<SegmenterConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSectionSpec {
    id: String,
    title: String,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    #[serde(rename = "rate")]
    Rate,
    #[serde(rename = "count")]
    Count,
    #[serde(rename = "score")]
    Score,
    #[serde(rename = "latency")]
    Latency,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "range")]
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl CompareOp {
    pub fn holds(self, actual: f64, target: f64) -> bool {
        match self {
            Self::Ge => actual >= target,
            Self::Gt => actual > target,
            Self::Le => actual <= target,
            Self::Lt => actual < target,
            Self::Eq => (actual - target).abs() < f64::EPSILON,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdDefinition {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub category: String,
    pub metric_type: MetricType,
    pub target: f64,
    pub operator: CompareOp,
    #[serde(default)]
    pub warn_threshold: Option<f64>,
    pub blocking: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawThresholdsFile {
    categories: std::collections::BTreeMap<String, Vec<ThresholdDefinition>>,
}

/// Load threshold definitions grouped by category, flattened with the group
/// key stamped onto each definition.
pub fn load_thresholds(path: &Path) -> Result<Vec<ThresholdDefinition>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read thresholds config: {}", path.display()))?;
    let file: RawThresholdsFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse thresholds config: {}", path.display()))?;

    let mut definitions = Vec::new();
    for (category, mut group) in file.categories {
        for definition in &mut group {
            definition.category = category.clone();
        }
        definitions.extend(group);
    }

    if definitions.is_empty() {
        bail!("thresholds config {} defines no rules", path.display());
    }

    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_sections_and_segmentation() {
        let (_dir, path) = write_config(
            r#"
sections:
  - id: item_1a
    title: "Item 1A. Risk Factors"
    patterns: ['(?i)item\s+1a']
    aliases: ["risk factors"]
segmentation:
  merge_floor_words: 15
  boilerplate_patterns:
    - '(?i)^table of contents$'
"#,
        );

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.sections.len(), 1);
        assert!(config.section("item_1a").is_some());
        assert_eq!(config.segmenter.merge_floor_words, 15);
        assert_eq!(config.segmenter.split_ceiling_words, 380);
        assert_eq!(config.segmenter.compiled_boilerplate().unwrap().len(), 1);
    }

    #[test]
    fn sections_after_preserves_configured_order() {
        let (_dir, path) = write_config(
            r#"
sections:
  - id: item_1
    title: "Item 1. Business"
    patterns: ['(?i)item\s+1\b']
  - id: item_1a
    title: "Item 1A. Risk Factors"
    patterns: ['(?i)item\s+1a\b']
  - id: item_2
    title: "Item 2. Properties"
    patterns: ['(?i)item\s+2\b']
"#,
        );

        let config = PipelineConfig::load(&path).unwrap();
        let after = config.sections_after("item_1a");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "item_2");
        assert!(config.sections_after("item_2").is_empty());
    }

    #[test]
    fn rejects_section_without_patterns_or_aliases() {
        let (_dir, path) = write_config(
            r#"
sections:
  - id: empty
    title: "Empty"
"#,
        );

        assert!(PipelineConfig::load(&path).is_err());
    }

    #[test]
    fn thresholds_inherit_group_category() {
        let (_dir, path) = write_config(
            r#"
categories:
  identity:
    - name: cik_present_rate
      display_name: CIK present
      metric_type: rate
      target: 1.0
      operator: ">="
      blocking: true
  segmentation:
    - name: under_floor_rate
      display_name: Segments under merge floor
      metric_type: rate
      target: 0.05
      operator: "<="
      warn_threshold: 0.02
      blocking: false
      tags: [length]
"#,
        );

        let definitions = load_thresholds(&path).unwrap();
        assert_eq!(definitions.len(), 2);
        let cik = definitions
            .iter()
            .find(|definition| definition.name == "cik_present_rate")
            .unwrap();
        assert_eq!(cik.category, "identity");
        assert!(cik.blocking);
        assert_eq!(cik.operator, CompareOp::Ge);
    }

    #[test]
    fn compare_ops_hold_as_written() {
        assert!(CompareOp::Ge.holds(1.0, 1.0));
        assert!(!CompareOp::Gt.holds(1.0, 1.0));
        assert!(CompareOp::Le.holds(0.01, 0.05));
        assert!(CompareOp::Lt.holds(0.01, 0.05));
        assert!(CompareOp::Eq.holds(2.0, 2.0));
    }
}
