use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::config::{PipelineConfig, SectionSpec};

/// Byte-offset anchors for section starts, usually cross-referenced from the
/// document's table of contents.
#[derive(Debug, Clone, Default)]
pub struct AnchorHints {
    offsets: BTreeMap<String, usize>,
}

impl AnchorHints {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, section_id: String, offset: usize) {
        self.offsets.insert(section_id, offset);
    }

    pub fn get(&self, section_id: &str) -> Option<usize> {
        self.offsets.get(section_id).copied()
    }
}

#[derive(Debug)]
pub struct SliceOutcome<'a> {
    pub bytes: &'a [u8],
    pub range: Range<usize>,
    pub narrowed: bool,
}

impl<'a> SliceOutcome<'a> {
    fn full(document: &'a [u8]) -> Self {
        Self {
            bytes: document,
            range: 0..document.len(),
            narrowed: false,
        }
    }
}

/// Narrow `document` to the byte range covering one target section, or return
/// the full document. Slicing is a parse-cost optimization, never a
/// correctness requirement: any resolution failure falls back to the full
/// document. With no target (multi-section processing) the full document is
/// always returned, because the narrowed range deliberately ends where the
/// next section starts.
pub fn slice<'a>(
    document: &'a [u8],
    target: Option<&str>,
    hints: &AnchorHints,
    config: &PipelineConfig,
) -> SliceOutcome<'a> {
    let Some(target) = target else {
        return SliceOutcome::full(document);
    };

    let Some(section) = config.section(target) else {
        debug!(section = target, "unknown section id, skipping pre-seek");
        return SliceOutcome::full(document);
    };

    let Ok(text) = std::str::from_utf8(document) else {
        info!(section = target, "document is not valid utf-8, skipping pre-seek");
        return SliceOutcome::full(document);
    };

    let start = match resolve_start(text, section, hints) {
        Some(offset) => snap_out_of_tag(document, offset),
        None => {
            info!(section = target, "start anchor unresolved, parsing full document");
            return SliceOutcome::full(document);
        }
    };

    let end = resolve_end(text, start, config.sections_after(target))
        .map(|offset| snap_out_of_tag(document, offset))
        .unwrap_or(document.len());

    if start >= end {
        info!(
            section = target,
            start, end, "anchor range is inverted, parsing full document"
        );
        return SliceOutcome::full(document);
    }

    debug!(section = target, start, end, "narrowed document to section range");
    SliceOutcome {
        bytes: &document[start..end],
        range: start..end,
        narrowed: true,
    }
}

/// Start anchor: an explicit hint wins; otherwise scan the raw text with the
/// section's patterns. Section headings usually occur twice (table of
/// contents, then body), so the match at the greatest offset wins.
fn resolve_start(text: &str, section: &SectionSpec, hints: &AnchorHints) -> Option<usize> {
    if let Some(offset) = hints.get(&section.id) {
        if offset < text.len() {
            return Some(offset);
        }
    }

    section
        .patterns
        .iter()
        .flat_map(|pattern| pattern.find_iter(text))
        .map(|found| found.start())
        .max()
}

/// End anchor: the earliest match of any later section's patterns after the
/// start anchor, in configured document order.
fn resolve_end(text: &str, start: usize, later_sections: &[SectionSpec]) -> Option<usize> {
    let search_from = (start + 1).min(text.len());
    let tail = &text[search_from..];

    later_sections
        .iter()
        .flat_map(|section| section.patterns.iter())
        .filter_map(|pattern| pattern.find(tail))
        .map(|found| search_from + found.start())
        .min()
}

/// If `offset` lands inside a markup tag, back up to the `<` that opens it so
/// the narrowed bytes stay parseable.
fn snap_out_of_tag(document: &[u8], offset: usize) -> usize {
    let offset = offset.min(document.len());
    for index in (0..offset).rev() {
        match document[index] {
            b'<' => return index,
            b'>' => return offset,
            _ => {}
        }
    }
    offset
}

static TOC_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']#([^"']+)["'][^>]*>(.*?)</a>"#).unwrap()
});

static INNER_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

/// Cross-reference the table of contents: a link whose text matches a section
/// pattern points at a fragment id, and the fragment's defining tag gives the
/// section's byte-offset anchor.
pub fn toc_hints(document: &[u8], config: &PipelineConfig) -> AnchorHints {
    let mut hints = AnchorHints::empty();
    let Ok(text) = std::str::from_utf8(document) else {
        return hints;
    };

    for captures in TOC_LINK_RE.captures_iter(text) {
        let fragment = &captures[1];
        let link_text = INNER_TAG_RE.replace_all(&captures[2], " ");
        let link_text = link_text.split_whitespace().collect::<Vec<&str>>().join(" ");
        if link_text.is_empty() {
            continue;
        }

        for section in &config.sections {
            if hints.get(&section.id).is_some() || !section.matches_title(&link_text) {
                continue;
            }
            if let Some(offset) = find_fragment(text, fragment) {
                hints.insert(section.id.clone(), offset);
            }
        }
    }

    hints
}

fn find_fragment(text: &str, fragment: &str) -> Option<usize> {
    let pattern = format!(
        r#"(?i)\b(?:id|name)\s*=\s*["']{}["']"#,
        regex::escape(fragment)
    );
    let found = Regex::new(&pattern).ok()?.find(text)?;
    Some(snap_out_of_tag(text.as_bytes(), found.start()))
}
