use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::{SegmenterConfig, ThresholdDefinition};
use crate::model::{DocumentIdentity, RiskSegment, ValidationStatus};
use crate::thresholds::ThresholdRegistry;
use crate::util::sha256_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "SKIP")]
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub rule_name: String,
    pub display_name: String,
    pub category: String,
    pub operator: String,
    pub target: f64,
    pub actual: Option<f64>,
    pub status: RuleStatus,
    pub blocking: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockingSummary {
    pub total_blocking: usize,
    pub passed: usize,
    pub failed: usize,
    pub warned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub results: Vec<ValidationResult>,
    pub blocking: BlockingSummary,
}

/// One evaluated document's facts: its identity metadata and the segments it
/// produced. Batch-scope rules aggregate across all inputs.
pub struct GateInput<'a> {
    pub identity: &'a DocumentIdentity,
    pub segments: &'a [RiskSegment],
}

/// Evaluate every registered rule against the batch. Deterministic and
/// side-effect-free: rules are visited in registry load order and the inputs
/// are never mutated.
pub fn evaluate(
    inputs: &[GateInput],
    registry: &ThresholdRegistry,
    segmenter: &SegmenterConfig,
) -> ValidationReport {
    let mut results = Vec::with_capacity(registry.len());
    let mut blocking = BlockingSummary::default();

    for definition in registry.all() {
        let actual = compute_metric(&definition.name, inputs, segmenter);
        let status = classify(definition, actual);

        if definition.blocking {
            blocking.total_blocking += 1;
            match status {
                RuleStatus::Pass => blocking.passed += 1,
                RuleStatus::Warn => blocking.warned += 1,
                RuleStatus::Fail => blocking.failed += 1,
                RuleStatus::Skip => {}
            }
        }

        results.push(ValidationResult {
            rule_name: definition.name.clone(),
            display_name: definition.display_name.clone(),
            category: definition.category.clone(),
            operator: definition.operator.as_str().to_string(),
            target: definition.target,
            actual,
            status,
            blocking: definition.blocking,
        });
    }

    let status = if results.iter().any(|result| result.status == RuleStatus::Fail) {
        ValidationStatus::Fail
    } else if results.iter().any(|result| result.status == RuleStatus::Warn) {
        ValidationStatus::Warn
    } else {
        ValidationStatus::Pass
    };

    ValidationReport {
        status,
        results,
        blocking,
    }
}

pub fn evaluate_document(
    identity: &DocumentIdentity,
    segments: &[RiskSegment],
    registry: &ThresholdRegistry,
    segmenter: &SegmenterConfig,
) -> ValidationReport {
    evaluate(&[GateInput { identity, segments }], registry, segmenter)
}

fn classify(definition: &ThresholdDefinition, actual: Option<f64>) -> RuleStatus {
    let Some(actual) = actual else {
        return RuleStatus::Skip;
    };

    if definition.operator.holds(actual, definition.target) {
        if let Some(warn) = definition.warn_threshold {
            if !definition.operator.holds(actual, warn) {
                return RuleStatus::Warn;
            }
        }
        RuleStatus::Pass
    } else if definition.blocking {
        RuleStatus::Fail
    } else {
        RuleStatus::Warn
    }
}

/// Built-in metrics, resolved by rule name. Identity rules use the
/// `<field>_present` / `<field>_present_rate` naming convention; everything
/// else aggregates over the batch's segments. Unknown names are skipped.
fn compute_metric(name: &str, inputs: &[GateInput], segmenter: &SegmenterConfig) -> Option<f64> {
    if let Some(field) = name
        .strip_suffix("_present_rate")
        .or_else(|| name.strip_suffix("_present"))
    {
        if inputs.is_empty() {
            return None;
        }
        let present = inputs
            .iter()
            .filter(|input| input.identity.has_field(field))
            .count();
        return Some(present as f64 / inputs.len() as f64);
    }

    let total = inputs.iter().map(|input| input.segments.len()).sum::<usize>();

    match name {
        "segment_count" => Some(total as f64),
        "mean_words_per_segment" => {
            if total == 0 {
                return None;
            }
            let words = segments(inputs).map(|segment| segment.word_count).sum::<usize>();
            Some(words as f64 / total as f64)
        }
        "under_floor_rate" => {
            rate(inputs, total, |segment| {
                segment.word_count < segmenter.merge_floor_words
            })
        }
        "over_ceiling_rate" => {
            rate(inputs, total, |segment| {
                segment.word_count > segmenter.split_ceiling_words
            })
        }
        "oversized_rate" => rate(inputs, total, |segment| segment.oversized),
        "hard_split_rate" => rate(inputs, total, |segment| segment.hard_split),
        "empty_ancestors_rate" => rate(inputs, total, |segment| segment.ancestors.is_empty()),
        "duplicate_text_rate" => {
            if total == 0 {
                return None;
            }
            let unique = segments(inputs)
                .map(|segment| sha256_text(&segment.text))
                .collect::<HashSet<String>>()
                .len();
            Some((total - unique) as f64 / total as f64)
        }
        _ => None,
    }
}

fn segments<'a>(inputs: &'a [GateInput<'a>]) -> impl Iterator<Item = &'a RiskSegment> {
    inputs.iter().flat_map(|input| input.segments.iter())
}

fn rate(
    inputs: &[GateInput],
    total: usize,
    predicate: impl Fn(&RiskSegment) -> bool,
) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let hits = segments(inputs).filter(|segment| predicate(segment)).count();
    Some(hits as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompareOp, MetricType};

    fn rule(
        name: &str,
        target: f64,
        operator: CompareOp,
        blocking: bool,
        warn_threshold: Option<f64>,
    ) -> ThresholdDefinition {
        ThresholdDefinition {
            name: name.to_string(),
            display_name: name.replace('_', " "),
            category: "test".to_string(),
            metric_type: MetricType::Rate,
            target,
            operator,
            warn_threshold,
            blocking,
            tags: Vec::new(),
        }
    }

    fn segment(id: u32, words: usize, text: &str) -> RiskSegment {
        RiskSegment {
            id,
            text: text.to_string(),
            word_count: words,
            char_count: text.chars().count(),
            parent_subsection: "Risk Factors".to_string(),
            ancestors: vec!["Risk Factors".to_string()],
            oversized: false,
            hard_split: false,
        }
    }

    fn identity_with_cik(present: bool) -> DocumentIdentity {
        let mut identity = DocumentIdentity::default();
        if present {
            identity
                .fields
                .insert("cik".to_string(), "0000320193".to_string());
        }
        identity
    }

    #[test]
    fn missing_identifier_in_one_of_ten_documents_fails_blocking_rule() {
        let registry = ThresholdRegistry::from_definitions(vec![rule(
            "cik_present_rate",
            1.0,
            CompareOp::Ge,
            true,
            None,
        )])
        .unwrap();

        let identities = (0..10)
            .map(|index| identity_with_cik(index != 3))
            .collect::<Vec<DocumentIdentity>>();
        let segments_store = vec![segment(1, 30, "body")];
        let inputs = identities
            .iter()
            .map(|identity| GateInput {
                identity,
                segments: &segments_store,
            })
            .collect::<Vec<GateInput>>();

        let report = evaluate(&inputs, &registry, &SegmenterConfig::default());

        assert_eq!(report.status, ValidationStatus::Fail);
        let result = &report.results[0];
        assert_eq!(result.actual, Some(0.9));
        assert_eq!(result.status, RuleStatus::Fail);
        assert_eq!(report.blocking.total_blocking, 1);
        assert_eq!(report.blocking.failed, 1);
    }

    #[test]
    fn non_blocking_failure_warns_instead_of_failing() {
        let registry = ThresholdRegistry::from_definitions(vec![rule(
            "under_floor_rate",
            0.0,
            CompareOp::Le,
            false,
            None,
        )])
        .unwrap();

        let identity = DocumentIdentity::default();
        let store = vec![segment(1, 5, "tiny"), segment(2, 30, "fine words")];
        let report = evaluate_document(&identity, &store, &registry, &SegmenterConfig::default());

        assert_eq!(report.status, ValidationStatus::Warn);
        assert_eq!(report.results[0].actual, Some(0.5));
        assert_eq!(report.results[0].status, RuleStatus::Warn);
    }

    #[test]
    fn warn_band_trips_inside_passing_target() {
        let registry = ThresholdRegistry::from_definitions(vec![rule(
            "duplicate_text_rate",
            0.5,
            CompareOp::Le,
            true,
            Some(0.1),
        )])
        .unwrap();

        let identity = DocumentIdentity::default();
        let store = vec![
            segment(1, 30, "repeated body"),
            segment(2, 30, "repeated body"),
            segment(3, 30, "unique body one"),
            segment(4, 30, "unique body two"),
        ];
        let report = evaluate_document(&identity, &store, &registry, &SegmenterConfig::default());

        // 0.25 passes the 0.5 target but exceeds the 0.1 warn band.
        assert_eq!(report.results[0].actual, Some(0.25));
        assert_eq!(report.results[0].status, RuleStatus::Warn);
        assert_eq!(report.status, ValidationStatus::Warn);
        assert_eq!(report.blocking.warned, 1);
    }

    #[test]
    fn unknown_metric_is_skipped_not_failed() {
        let registry = ThresholdRegistry::from_definitions(vec![rule(
            "made_up_metric",
            1.0,
            CompareOp::Ge,
            true,
            None,
        )])
        .unwrap();

        let identity = DocumentIdentity::default();
        let store = vec![segment(1, 30, "body")];
        let report = evaluate_document(&identity, &store, &registry, &SegmenterConfig::default());

        assert_eq!(report.results[0].status, RuleStatus::Skip);
        assert_eq!(report.status, ValidationStatus::Pass);
        assert_eq!(report.blocking.total_blocking, 1);
        assert_eq!(report.blocking.passed, 0);
    }

    #[test]
    fn evaluation_is_deterministic_and_leaves_inputs_unchanged() {
        let registry = ThresholdRegistry::from_definitions(vec![
            rule("segment_count", 1.0, CompareOp::Ge, true, None),
            rule("mean_words_per_segment", 10.0, CompareOp::Ge, false, None),
        ])
        .unwrap();

        let identity = identity_with_cik(true);
        let store = vec![segment(1, 30, "alpha"), segment(2, 50, "beta")];
        let before = store.clone();

        let first = evaluate_document(&identity, &store, &registry, &SegmenterConfig::default());
        let second = evaluate_document(&identity, &store, &registry, &SegmenterConfig::default());

        assert_eq!(store, before);
        assert_eq!(first.status, second.status);
        assert_eq!(first.results.len(), second.results.len());
        assert_eq!(first.results[1].actual, Some(40.0));
    }
}
