use std::collections::BTreeMap;

use crate::config::{PipelineConfig, SectionSpec};
use crate::parse::ContentNode;

pub const ANCESTOR_DEPTH_CAP: usize = 6;
pub const NODE_KEY_MAX_CHARS: usize = 120;

/// Result of locating a section start in the flattened node stream. The
/// strategy ordinal is kept for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionMatch {
    pub node_index: usize,
    pub section_id: String,
    pub strategy: u8,
}

/// Normalized text key: non-breaking spaces become ordinary spaces,
/// whitespace runs collapse to one space, and the result is trimmed and
/// capped at 120 characters.
pub fn normalize_text(text: &str) -> String {
    let replaced = text.replace('\u{a0}', " ");
    let collapsed = replaced.split_whitespace().collect::<Vec<&str>>().join(" ");
    collapsed.chars().take(NODE_KEY_MAX_CHARS).collect()
}

/// Find the node that begins `section`, trying three strategies in order:
/// top-level section titles by pattern, then any title node by pattern, then
/// an alias containment match against any node. `None` means the section is
/// absent from this document, a common and expected outcome.
pub fn find_section(nodes: &[ContentNode], section: &SectionSpec) -> Option<SectionMatch> {
    for (index, node) in nodes.iter().enumerate() {
        if node.is_top_level_title() && section.matches_title(&normalize_text(&node.text)) {
            return Some(SectionMatch {
                node_index: index,
                section_id: section.id.clone(),
                strategy: 1,
            });
        }
    }

    // Some sections sit beside, not under, the top-level title node in the
    // flattened stream, so generic titles get the same pattern match.
    for (index, node) in nodes.iter().enumerate() {
        if node.is_title() && section.matches_title(&normalize_text(&node.text)) {
            return Some(SectionMatch {
                node_index: index,
                section_id: section.id.clone(),
                strategy: 2,
            });
        }
    }

    if !section.aliases.is_empty() {
        for (index, node) in nodes.iter().enumerate() {
            let key = normalize_text(&node.text).to_lowercase();
            if key.is_empty() {
                continue;
            }
            if section.aliases.iter().any(|alias| key.contains(alias)) {
                return Some(SectionMatch {
                    node_index: index,
                    section_id: section.id.clone(),
                    strategy: 3,
                });
            }
        }
    }

    None
}

/// Index of the first node after `start` that begins another configured
/// section, bounding the current section's node range.
pub fn section_end(nodes: &[ContentNode], start: usize, config: &PipelineConfig) -> usize {
    let current_key = normalize_text(&nodes[start].text);

    for (offset, node) in nodes[start + 1..].iter().enumerate() {
        if !node.is_title() {
            continue;
        }
        let key = normalize_text(&node.text);
        if key == current_key {
            continue;
        }
        if config.sections.iter().any(|section| section.matches_title(&key)) {
            return start + 1 + offset;
        }
    }

    nodes.len()
}

/// Depth index per observed heading level within a section's node range:
/// the shallowest subsection level maps to 0, deeper levels count up.
/// Leveled titles only; styled bold-run titles carry no level and are
/// treated as the deepest observed level.
pub fn heading_level_map(nodes: &[ContentNode]) -> BTreeMap<u8, usize> {
    let mut levels = nodes
        .iter()
        .filter(|node| node.is_title())
        .filter_map(|node| node.heading_level)
        .collect::<Vec<u8>>();
    levels.sort_unstable();
    levels.dedup();

    levels
        .into_iter()
        .enumerate()
        .map(|(index, level)| (level, index))
        .collect()
}

/// Ordered map from normalized node text to the heading stack in effect at
/// that node, outermost first. Preserves document order so callers can walk
/// it with a cursor.
#[derive(Debug, Clone, Default)]
pub struct AncestorMap {
    entries: Vec<(String, Vec<String>)>,
}

impl AncestorMap {
    /// Exact lookup by normalized key; first occurrence wins.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, ancestors)| ancestors.as_slice())
    }

    /// Walk forward from `from` looking for the entry whose key prefix-matches
    /// `leading` (either direction, since both sides are length-capped).
    /// Returns the entry index so the caller can advance its cursor.
    pub fn resolve_from(&self, leading: &str, from: usize) -> Option<(usize, &[String])> {
        if leading.is_empty() {
            return None;
        }
        for (index, (key, ancestors)) in self.entries.iter().enumerate().skip(from) {
            if key.is_empty() {
                continue;
            }
            if leading.starts_with(key.as_str()) || key.starts_with(leading) {
                return Some((index, ancestors.as_slice()));
            }
        }
        None
    }

    pub fn ancestors_at(&self, index: usize) -> Option<&[String]> {
        self.entries
            .get(index)
            .map(|(_, ancestors)| ancestors.as_slice())
    }
}

/// Replay the flat node stream as a heading stack and snapshot it per node.
///
/// The stack is seeded with the section title at index 0 and that entry is
/// never popped. A heading at depth index `d` truncates the stack to
/// `[section_title, ...entries shallower than d]` and then pushes itself.
/// Every node, heading or body, records the current stack capped to the
/// first 6 entries. Single linear pass; heading nodes only precede their
/// body text in document order, they are not structural parents.
pub fn build_ancestor_map(
    nodes: &[ContentNode],
    section_title_text: &str,
    level_map: &BTreeMap<u8, usize>,
) -> AncestorMap {
    let seed = normalize_text(section_title_text);
    let deepest = level_map.len();
    let mut stack: Vec<String> = vec![seed];
    let mut entries: Vec<(String, Vec<String>)> = Vec::with_capacity(nodes.len());

    for node in nodes {
        let key = normalize_text(&node.text);

        if node.is_title() && !key.is_empty() && key != stack[0] {
            let depth = node
                .heading_level
                .and_then(|level| level_map.get(&level).copied())
                .unwrap_or(deepest);
            stack.truncate(1 + depth);
            stack.push(key.clone());
        }

        if key.is_empty() {
            continue;
        }

        let snapshot = stack.iter().take(ANCESTOR_DEPTH_CAP).cloned().collect();
        entries.push((key, snapshot));
    }

    AncestorMap { entries }
}
