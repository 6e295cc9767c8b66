use std::sync::LazyLock;

use regex::Regex;

use crate::config::SegmenterConfig;
use crate::model::RiskSegment;
use crate::pipeline::locator::{AncestorMap, normalize_text};

static SENTENCE_BOUNDARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.!?]["')\]]*\s+"#).unwrap());

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split section body text into size-bounded, context-tagged segments.
///
/// Candidates are cut along paragraph breaks (sentence breaks when the body
/// has no paragraph structure), boilerplate is dropped, small candidates are
/// merged up to the floor without crossing a subsection boundary, oversized
/// units are split back down under the ceiling, and each survivor resolves
/// its breadcrumb against the ancestor map.
pub fn segment(
    body: &str,
    map: &AncestorMap,
    config: &SegmenterConfig,
    boilerplate: &[Regex],
) -> Vec<RiskSegment> {
    let candidates = split_candidates(body);
    let candidates = drop_boilerplate(candidates, config, boilerplate);
    let candidates = resolve_ancestors(candidates, map);
    let merged = merge_small(candidates, config.merge_floor_words);

    let mut segments = Vec::new();
    let mut next_id = 1_u32;
    for unit in merged {
        for piece in split_oversized(&unit.text, config) {
            let word_count = word_count(&piece.text);
            let char_count = piece.text.chars().count();
            segments.push(RiskSegment {
                id: next_id,
                text: piece.text,
                word_count,
                char_count,
                parent_subsection: unit.ancestors.last().cloned().unwrap_or_default(),
                ancestors: unit.ancestors.clone(),
                oversized: piece.oversized,
                hard_split: piece.hard_split,
            });
            next_id += 1;
        }
    }

    segments
}

fn split_candidates(body: &str) -> Vec<String> {
    let paragraphs = body
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(str::to_string)
        .collect::<Vec<String>>();

    if paragraphs.len() > 1 {
        return paragraphs;
    }

    // No paragraph structure; fall back to sentence boundaries.
    let Some(only) = paragraphs.into_iter().next() else {
        return Vec::new();
    };
    let sentences = split_sentences(&only);
    if sentences.len() > 1 { sentences } else { vec![only] }
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0_usize;
    for found in SENTENCE_BOUNDARY_RE.find_iter(text) {
        let sentence = text[start..found.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = found.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn drop_boilerplate(
    candidates: Vec<String>,
    config: &SegmenterConfig,
    boilerplate: &[Regex],
) -> Vec<String> {
    candidates
        .into_iter()
        .filter(|candidate| candidate.chars().count() >= config.min_candidate_chars)
        .filter(|candidate| !boilerplate.iter().any(|pattern| pattern.is_match(candidate)))
        .collect()
}

struct Candidate {
    text: String,
    ancestors: Vec<String>,
}

/// Resolve each candidate's breadcrumb by walking the ancestor map forward
/// with a cursor. A candidate that begins at a node boundary prefix-matches
/// its own node's key; anything else (merged sentences, reflowed text)
/// inherits the nearest preceding entry.
fn resolve_ancestors(candidates: Vec<String>, map: &AncestorMap) -> Vec<Candidate> {
    let mut resolved = Vec::with_capacity(candidates.len());
    let mut cursor = 0_usize;
    let mut seen_any = false;

    for text in candidates {
        let leading = normalize_text(&text);
        let ancestors = match map.resolve_from(&leading, cursor) {
            Some((index, ancestors)) => {
                cursor = index;
                seen_any = true;
                ancestors.to_vec()
            }
            None => {
                if seen_any {
                    map.ancestors_at(cursor)
                        .map(|ancestors| ancestors.to_vec())
                        .unwrap_or_default()
                } else {
                    // Untitled lead-in before any mapped position.
                    map.ancestors_at(0)
                        .map(|ancestors| ancestors.to_vec())
                        .unwrap_or_default()
                }
            }
        };
        resolved.push(Candidate { text, ancestors });
    }

    resolved
}

fn same_subsection(left: &[String], right: &[String]) -> bool {
    left.last() == right.last()
}

/// Greedy forward merge: accumulate while under the floor, flush when the
/// floor is met, a subsection boundary is crossed, or input ends. Never
/// merges across a subsection boundary.
fn merge_small(candidates: Vec<Candidate>, floor: usize) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = Vec::new();
    let mut buffer: Option<Candidate> = None;

    for candidate in candidates {
        match buffer.take() {
            None => buffer = Some(candidate),
            Some(mut held) => {
                if word_count(&held.text) < floor
                    && same_subsection(&held.ancestors, &candidate.ancestors)
                {
                    held.text.push(' ');
                    held.text.push_str(&candidate.text);
                    buffer = Some(held);
                } else {
                    merged.push(held);
                    buffer = Some(candidate);
                }
            }
        }

        if let Some(held) = buffer.take() {
            if word_count(&held.text) >= floor {
                merged.push(held);
            } else {
                buffer = Some(held);
            }
        }
    }

    if let Some(held) = buffer {
        merged.push(held);
    }

    merged
}

struct Piece {
    text: String,
    hard_split: bool,
    oversized: bool,
}

/// Recursively split `text` until every piece is under the ceiling. Prefers
/// the sentence boundary nearest the midpoint; falls back to a hard split at
/// the whitespace nearest the midpoint, recording the fallback on the
/// resulting pieces. A piece with no split point at all is kept oversized
/// and flagged.
fn split_oversized(text: &str, config: &SegmenterConfig) -> Vec<Piece> {
    split_recursive(text, config, false)
}

fn split_recursive(text: &str, config: &SegmenterConfig, inherited_hard: bool) -> Vec<Piece> {
    if word_count(text) <= config.split_ceiling_words {
        return vec![Piece {
            text: text.to_string(),
            hard_split: inherited_hard,
            oversized: false,
        }];
    }

    let midpoint = char_floor(text, text.len() / 2);
    let window = config.sentence_window_chars / 2;

    let boundary = SENTENCE_BOUNDARY_RE
        .find_iter(text)
        .map(|found| found.end())
        .filter(|&end| end > 0 && end < text.len())
        .min_by_key(|&end| end.abs_diff(midpoint));

    if let Some(split_at) = boundary {
        if split_at.abs_diff(midpoint) <= window {
            return split_pair(text, split_at, config, inherited_hard);
        }
    }

    if let Some(split_at) = nearest_whitespace(text, midpoint) {
        return split_pair(text, split_at, config, true);
    }

    vec![Piece {
        text: text.to_string(),
        hard_split: inherited_hard,
        oversized: true,
    }]
}

fn split_pair(text: &str, split_at: usize, config: &SegmenterConfig, hard: bool) -> Vec<Piece> {
    let left = text[..split_at].trim();
    let right = text[split_at..].trim();
    if left.is_empty() || right.is_empty() {
        return vec![Piece {
            text: text.to_string(),
            hard_split: hard,
            oversized: true,
        }];
    }

    let mut pieces = split_recursive(left, config, hard);
    pieces.extend(split_recursive(right, config, hard));
    pieces
}

fn char_floor(text: &str, byte_index: usize) -> usize {
    let mut index = byte_index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn nearest_whitespace(text: &str, midpoint: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut best: Option<usize> = None;
    for (index, byte) in bytes.iter().enumerate() {
        if !byte.is_ascii_whitespace() || index == 0 || index + 1 >= bytes.len() {
            continue;
        }
        match best {
            Some(current) if current.abs_diff(midpoint) <= index.abs_diff(midpoint) => {}
            _ => best = Some(index),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{ContentNode, NodeKind};
    use crate::pipeline::locator::{build_ancestor_map, heading_level_map};

    fn title(text: &str, level: u8) -> ContentNode {
        ContentNode {
            kind: NodeKind::Title,
            text: text.to_string(),
            byte_offset: 0,
            heading_level: Some(level),
        }
    }

    fn body_node(text: &str) -> ContentNode {
        ContentNode {
            kind: NodeKind::Text,
            text: text.to_string(),
            byte_offset: 0,
            heading_level: None,
        }
    }

    fn words(count: usize, stem: &str) -> String {
        (0..count)
            .map(|index| format!("{stem}{index}"))
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn sentence_paragraph(sentences: usize, words_each: usize) -> String {
        (0..sentences)
            .map(|index| format!("Sentence {} {}.", index, words(words_each - 2, "w")))
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn map_for(nodes: &[ContentNode]) -> AncestorMap {
        let level_map = heading_level_map(nodes);
        build_ancestor_map(nodes, "Item 1A. Risk Factors", &level_map)
    }

    #[test]
    fn merges_short_paragraph_into_following_one() {
        // 15-word paragraph then a 300-word paragraph in the same subsection
        // merges into a single unit of ~315 words.
        let short = words(15, "intro");
        let long = words(300, "risk");
        let nodes = vec![
            title("Market Risk", 3),
            body_node(&short),
            body_node(&long),
        ];
        let map = map_for(&nodes);
        let body = format!("{short}\n\n{long}");

        let config = SegmenterConfig::default();
        let segments = segment(&body, &map, &config, &[]);

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].word_count, 315);
        assert_eq!(segments[0].parent_subsection, "Market Risk");
        assert!(!segments[0].oversized);
    }

    #[test]
    fn never_merges_across_subsection_boundary() {
        let short_one = words(10, "alpha");
        let short_two = words(10, "beta");
        let nodes = vec![
            title("Credit Risk", 3),
            body_node(&short_one),
            title("Liquidity Risk", 3),
            body_node(&short_two),
        ];
        let map = map_for(&nodes);
        let body = format!("{short_one}\n\n{short_two}");

        let segments = segment(&body, &map, &SegmenterConfig::default(), &[]);

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].parent_subsection, "Credit Risk");
        assert_eq!(segments[1].parent_subsection, "Liquidity Risk");
    }

    #[test]
    fn hard_splits_unbroken_paragraph_without_oversized_flag() {
        // 600 words, no sentence boundary anywhere: two pieces, both under
        // the ceiling, hard-split recorded, oversized false.
        let body = words(600, "token");
        let segments = segment(&body, &AncestorMap::default(), &SegmenterConfig::default(), &[]);

        assert_eq!(segments.len(), 2);
        for piece in &segments {
            assert!(piece.word_count <= 380);
            assert!(piece.hard_split);
            assert!(!piece.oversized);
        }
    }

    #[test]
    fn splits_long_unit_at_sentence_boundary_near_midpoint() {
        let big = sentence_paragraph(60, 10);
        assert_eq!(word_count(&big), 600);
        let small = words(30, "other");
        let body = format!("{big}\n\n{small}");

        let segments = segment(&body, &AncestorMap::default(), &SegmenterConfig::default(), &[]);

        assert_eq!(segments.len(), 3);
        for piece in &segments[..2] {
            assert!(piece.word_count <= 380, "piece of {} words", piece.word_count);
            assert!(!piece.oversized);
            assert!(!piece.hard_split);
            assert!(piece.text.ends_with('.'));
        }
        assert_eq!(segments[2].word_count, 30);
    }

    #[test]
    fn unsplittable_text_is_kept_and_flagged_oversized() {
        let giant_token = "x".repeat(4000);
        let config = SegmenterConfig {
            split_ceiling_words: 0,
            merge_floor_words: 0,
            ..SegmenterConfig::default()
        };

        let segments = segment(&giant_token, &AncestorMap::default(), &config, &[]);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].oversized);
    }

    #[test]
    fn drops_boilerplate_and_short_candidates() {
        let keep = words(30, "real");
        let body = format!("See below.\n\nTable of Contents\n\n{keep}");
        let boilerplate = vec![Regex::new("(?i)^table of contents$").unwrap()];

        let segments = segment(
            &body,
            &AncestorMap::default(),
            &SegmenterConfig::default(),
            &boilerplate,
        );

        assert_eq!(segments.len(), 1);
        assert!(segments[0].text.starts_with("real0"));
    }

    #[test]
    fn ancestors_last_always_equals_parent_subsection() {
        let lead = words(25, "lead");
        let market = words(25, "market");
        let rates = words(25, "rates");
        let nodes = vec![
            body_node(&lead),
            title("Market Risk", 3),
            body_node(&market),
            title("Interest Rates", 4),
            body_node(&rates),
        ];
        let map = map_for(&nodes);
        let body = format!("{lead}\n\n{market}\n\n{rates}");

        let segments = segment(&body, &map, &SegmenterConfig::default(), &[]);

        assert_eq!(segments.len(), 3);
        for piece in &segments {
            assert!(!piece.ancestors.is_empty());
            assert_eq!(piece.ancestors.last().unwrap(), &piece.parent_subsection);
        }
        assert_eq!(segments[0].parent_subsection, "Item 1A. Risk Factors");
        assert_eq!(
            segments[2].ancestors,
            vec![
                "Item 1A. Risk Factors".to_string(),
                "Market Risk".to_string(),
                "Interest Rates".to_string(),
            ]
        );
    }

    #[test]
    fn ids_are_sequential_in_output_order() {
        let body = (0..5)
            .map(|index| words(40, &format!("p{index}x")))
            .collect::<Vec<String>>()
            .join("\n\n");

        let segments = segment(&body, &AncestorMap::default(), &SegmenterConfig::default(), &[]);
        let ids = segments.iter().map(|piece| piece.id).collect::<Vec<u32>>();
        assert_eq!(ids, (1..=segments.len() as u32).collect::<Vec<u32>>());
    }

    #[test]
    fn sentence_fallback_applies_when_no_paragraph_breaks() {
        let body = sentence_paragraph(8, 10);
        let segments = segment(&body, &AncestorMap::default(), &SegmenterConfig::default(), &[]);

        // Sentences merge back up to the floor rather than arriving whole.
        assert!(segments.len() > 1);
        for piece in &segments[..segments.len() - 1] {
            assert!(piece.word_count >= 20);
        }
    }

    #[test]
    fn final_unit_may_fall_below_floor() {
        let body = format!("{}\n\n{}", words(40, "full"), words(6, "tail"));
        let nodes = vec![
            title("Credit Risk", 3),
            body_node(&words(40, "full")),
            title("Liquidity Risk", 3),
            body_node(&words(6, "tail")),
        ];
        let map = map_for(&nodes);

        let segments = segment(&body, &map, &SegmenterConfig::default(), &[]);
        assert_eq!(segments.len(), 2);
        assert!(segments[1].word_count < 20);
    }
}
