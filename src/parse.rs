use std::sync::LazyLock;

use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Title,
    Text,
    Table,
    PageHeader,
    PageNumber,
    Empty,
    Other,
}

/// One parsed element of the flattened document stream. Immutable once the
/// parse result is built; owned by that result for the lifetime of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentNode {
    pub kind: NodeKind,
    pub text: String,
    pub byte_offset: usize,
    pub heading_level: Option<u8>,
}

impl ContentNode {
    pub fn is_title(&self) -> bool {
        self.kind == NodeKind::Title
    }

    /// Top-level section titles are the shallow explicit headings; styled
    /// bold-run titles carry no level and never qualify.
    pub fn is_top_level_title(&self) -> bool {
        self.kind == NodeKind::Title && self.heading_level.map(|level| level <= 2).unwrap_or(false)
    }
}

/// The raw-bytes-to-node-stream capability the pipeline builds on. The
/// pipeline and its tests depend only on this seam.
pub trait ElementParser: Send + Sync {
    fn parse(&self, document: &[u8]) -> Result<Vec<ContentNode>>;
}

static PAGE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:page\s+)?(?:[0-9]{1,4}|[ivxlcdm]{1,8})(?:\s+of\s+[0-9]{1,4})?$").unwrap()
});

const BOLD_TITLE_MAX_WORDS: usize = 12;

/// Streaming HTML adapter over quick-xml, tolerant of the tag soup found in
/// real filings (unmatched ends, unclosed inline tags).
pub struct HtmlParser;

impl ElementParser for HtmlParser {
    fn parse(&self, document: &[u8]) -> Result<Vec<ContentNode>> {
        let mut reader = Reader::from_reader(document);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;

        let mut nodes = Vec::new();
        let mut buf = Vec::new();
        let mut block = BlockAccumulator::new(0);
        let mut skip_depth = 0_usize;
        let mut bold_depth = 0_usize;
        let mut table_depth = 0_usize;
        let mut header_depth = 0_usize;
        let mut footer_depth = 0_usize;
        let mut table_text = String::new();
        let mut table_offset = 0_usize;
        let mut heading_level: Option<u8> = None;

        loop {
            let event_offset = reader.buffer_position() as usize;
            let event = reader
                .read_event_into(&mut buf)
                .with_context(|| format!("markup parse error at byte {event_offset}"))?;

            match event {
                Event::Start(start) => {
                    let tag = start.local_name().as_ref().to_ascii_lowercase();
                    match tag.as_slice() {
                        b"script" | b"style" => skip_depth += 1,
                        b"b" | b"strong" => bold_depth += 1,
                        b"br" | b"hr" => {
                            if table_depth > 0 {
                                table_text.push(' ');
                            } else {
                                block.text.push(' ');
                            }
                        }
                        b"table" => {
                            if table_depth == 0 {
                                block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                                table_text.clear();
                                table_offset = event_offset;
                            }
                            table_depth += 1;
                        }
                        b"header" => {
                            block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                            header_depth += 1;
                            block = BlockAccumulator::new(event_offset);
                        }
                        b"footer" => {
                            block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                            footer_depth += 1;
                            block = BlockAccumulator::new(event_offset);
                        }
                        b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6" => {
                            block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                            heading_level = Some(tag[1] - b'0');
                            block = BlockAccumulator::new(event_offset);
                        }
                        tag if is_block_tag(tag) => {
                            if table_depth == 0 {
                                block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                                heading_level = None;
                                block = BlockAccumulator::new(event_offset);
                            } else {
                                // Cell and row boundaries keep table text apart.
                                table_text.push(' ');
                            }
                        }
                        _ => {}
                    }
                    buf.clear();
                }
                Event::End(end) => {
                    let tag = end.local_name().as_ref().to_ascii_lowercase();
                    match tag.as_slice() {
                        b"script" | b"style" => skip_depth = skip_depth.saturating_sub(1),
                        b"b" | b"strong" => bold_depth = bold_depth.saturating_sub(1),
                        b"table" => {
                            table_depth = table_depth.saturating_sub(1);
                            if table_depth == 0 {
                                let text = collapse_whitespace(&table_text);
                                if !text.is_empty() {
                                    nodes.push(ContentNode {
                                        kind: NodeKind::Table,
                                        text,
                                        byte_offset: table_offset,
                                        heading_level: None,
                                    });
                                }
                                table_text.clear();
                            }
                        }
                        b"header" => {
                            block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                            header_depth = header_depth.saturating_sub(1);
                            block = BlockAccumulator::new(event_offset);
                        }
                        b"footer" => {
                            block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                            footer_depth = footer_depth.saturating_sub(1);
                            block = BlockAccumulator::new(event_offset);
                        }
                        b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6" => {
                            block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                            heading_level = None;
                            block = BlockAccumulator::new(event_offset);
                        }
                        tag if is_block_tag(tag) => {
                            if table_depth == 0 {
                                block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                                block = BlockAccumulator::new(event_offset);
                            } else {
                                table_text.push(' ');
                            }
                        }
                        _ => {}
                    }
                    buf.clear();
                }
                Event::Text(text) => {
                    if skip_depth == 0 {
                        let decoded = match text.decode() {
                            Ok(cow) => cow.into_owned(),
                            Err(_) => String::from_utf8_lossy(&text).into_owned(),
                        };
                        if table_depth > 0 {
                            table_text.push_str(&decoded);
                        } else {
                            block.push_fragment(&decoded, bold_depth > 0);
                        }
                    }
                    buf.clear();
                }
                Event::GeneralRef(reference) => {
                    if skip_depth == 0 {
                        let decoded = decode_entity(&reference);
                        if table_depth > 0 {
                            table_text.push_str(&decoded);
                        } else {
                            block.push_fragment(&decoded, bold_depth > 0);
                        }
                    }
                    buf.clear();
                }
                Event::Empty(empty) => {
                    let tag = empty.local_name().as_ref().to_ascii_lowercase();
                    if matches!(tag.as_slice(), b"br" | b"hr") {
                        if table_depth > 0 {
                            table_text.push(' ');
                        } else {
                            block.text.push(' ');
                        }
                    }
                    buf.clear();
                }
                Event::CData(_) | Event::Comment(_) | Event::Decl(_) | Event::PI(_)
                | Event::DocType(_) => {
                    buf.clear();
                }
                Event::Eof => {
                    block.flush(&mut nodes, heading_level, header_depth, footer_depth);
                    break;
                }
            }
        }

        Ok(nodes)
    }
}

fn is_block_tag(tag: &[u8]) -> bool {
    matches!(
        tag,
        b"p" | b"div"
            | b"li"
            | b"tr"
            | b"td"
            | b"th"
            | b"blockquote"
            | b"section"
            | b"article"
            | b"center"
    )
}

fn decode_entity(name: &[u8]) -> String {
    match name.to_ascii_lowercase().as_slice() {
        b"amp" => "&".to_string(),
        b"lt" => "<".to_string(),
        b"gt" => ">".to_string(),
        b"quot" => "\"".to_string(),
        b"apos" => "'".to_string(),
        b"nbsp" => "\u{a0}".to_string(),
        b"mdash" | b"ndash" => "-".to_string(),
        b"rsquo" | b"lsquo" => "'".to_string(),
        b"rdquo" | b"ldquo" => "\"".to_string(),
        other => {
            if let Some(digits) = other.strip_prefix(b"#") {
                let text = String::from_utf8_lossy(digits);
                let code = if let Some(hex) = text.strip_prefix('x') {
                    u32::from_str_radix(hex, 16).ok()
                } else {
                    text.parse::<u32>().ok()
                };
                if let Some(character) = code.and_then(char::from_u32) {
                    return character.to_string();
                }
            }
            String::new()
        }
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Accumulates raw text for the current block element; whitespace is
/// collapsed once at flush so spacing around entities and inline tags
/// survives intact.
struct BlockAccumulator {
    text: String,
    byte_offset: usize,
    all_bold: bool,
    has_text: bool,
}

impl BlockAccumulator {
    fn new(byte_offset: usize) -> Self {
        Self {
            text: String::new(),
            byte_offset,
            all_bold: true,
            has_text: false,
        }
    }

    fn push_fragment(&mut self, fragment: &str, in_bold: bool) {
        if !fragment.trim().is_empty() {
            if !in_bold {
                self.all_bold = false;
            }
            self.has_text = true;
        }
        self.text.push_str(fragment);
    }

    fn flush(
        &mut self,
        nodes: &mut Vec<ContentNode>,
        heading_level: Option<u8>,
        header_depth: usize,
        footer_depth: usize,
    ) {
        let text = collapse_whitespace(&self.text.replace('\u{a0}', " "));
        let byte_offset = self.byte_offset;
        let was_all_bold = self.all_bold && self.has_text;
        self.text.clear();
        self.all_bold = true;
        self.has_text = false;

        if text.is_empty() {
            return;
        }

        let kind = if heading_level.is_some() {
            NodeKind::Title
        } else if header_depth > 0 {
            NodeKind::PageHeader
        } else if footer_depth > 0 {
            NodeKind::Other
        } else if PAGE_NUMBER_RE.is_match(&text) {
            NodeKind::PageNumber
        } else if was_all_bold && text.split_whitespace().count() <= BOLD_TITLE_MAX_WORDS {
            NodeKind::Title
        } else {
            NodeKind::Text
        };

        nodes.push(ContentNode {
            kind,
            text,
            byte_offset,
            heading_level,
        });
    }
}
