pub mod locator;
pub mod segmenter;
pub mod slicer;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, info};

use crate::config::{PipelineConfig, SectionSpec};
use crate::model::RiskSegment;
use crate::parse::{ContentNode, ElementParser, HtmlParser, NodeKind};
use crate::pipeline::locator::{SectionMatch, normalize_text};
use crate::pipeline::slicer::AnchorHints;

/// The two entry modes are explicit and mutually exclusive: pre-seeking is
/// only sound when exactly one section is wanted, so it is never inferred
/// from a nullable parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionRequest {
    Single(String),
    All,
}

/// Worker-local pipeline state: configuration, compiled boilerplate patterns,
/// and a parser instance. Built once per worker and owned by its task loop,
/// never shared as a process-wide singleton.
pub struct PipelineContext {
    pub config: PipelineConfig,
    boilerplate: Vec<Regex>,
    parser: Box<dyn ElementParser>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_parser(config, Box::new(HtmlParser))
    }

    pub fn with_parser(config: PipelineConfig, parser: Box<dyn ElementParser>) -> Result<Self> {
        let boilerplate = config.segmenter.compiled_boilerplate()?;
        Ok(Self {
            config,
            boilerplate,
            parser,
        })
    }

    /// Assemble from already-validated parts; used by worker init hooks so
    /// per-worker construction cannot fail mid-batch.
    pub fn from_parts(
        config: PipelineConfig,
        boilerplate: Vec<Regex>,
        parser: Box<dyn ElementParser>,
    ) -> Self {
        Self {
            config,
            boilerplate,
            parser,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SectionExtraction {
    pub identifier: String,
    pub title: String,
    pub strategy: u8,
    pub segments: Vec<RiskSegment>,
}

#[derive(Debug, Clone)]
pub struct DocumentExtraction {
    pub sections: Vec<SectionExtraction>,
    pub absent: Vec<String>,
    pub narrowed: bool,
}

/// Run one document through slice -> parse -> locate -> segment. Absent
/// sections are reported, not errors; a parse failure fails the document.
pub fn process_document(
    context: &PipelineContext,
    document: &[u8],
    request: &SectionRequest,
) -> Result<DocumentExtraction> {
    let target = match request {
        SectionRequest::Single(id) => {
            if context.config.section(id).is_none() {
                bail!("section id '{id}' is not configured");
            }
            Some(id.as_str())
        }
        SectionRequest::All => None,
    };

    let hints = match target {
        Some(_) => slicer::toc_hints(document, &context.config),
        None => AnchorHints::empty(),
    };
    let sliced = slicer::slice(document, target, &hints, &context.config);

    let nodes = context
        .parser
        .parse(sliced.bytes)
        .context("failed to parse document into content nodes")?;
    debug!(
        nodes = nodes.len(),
        narrowed = sliced.narrowed,
        slice_start = sliced.range.start,
        slice_end = sliced.range.end,
        "parsed document stream"
    );

    let wanted: Vec<&str> = match target {
        Some(id) => vec![id],
        None => context
            .config
            .sections
            .iter()
            .map(|section| section.id.as_str())
            .collect(),
    };

    let mut sections = Vec::new();
    let mut absent = Vec::new();
    for id in wanted {
        let Some(spec) = context.config.section(id) else {
            continue;
        };
        match locator::find_section(&nodes, spec) {
            Some(found) => {
                debug!(
                    section = id,
                    node = found.node_index,
                    strategy = found.strategy,
                    "section located"
                );
                sections.push(extract_section(context, &nodes, spec, &found));
            }
            None => {
                info!(section = id, "section absent in document");
                absent.push(id.to_string());
            }
        }
    }

    Ok(DocumentExtraction {
        sections,
        absent,
        narrowed: sliced.narrowed,
    })
}

fn extract_section(
    context: &PipelineContext,
    nodes: &[ContentNode],
    spec: &SectionSpec,
    found: &SectionMatch,
) -> SectionExtraction {
    let start = found.node_index;
    let end = locator::section_end(nodes, start, &context.config);
    let section_nodes = &nodes[start..end];
    let title_node = &section_nodes[0];

    // An alias match can land on a body node; the configured title is the
    // section label then, not that node's text.
    let title = if title_node.is_title() {
        normalize_text(&title_node.text)
    } else {
        spec.title.clone()
    };

    let level_map = locator::heading_level_map(&section_nodes[1..]);
    let ancestor_map = locator::build_ancestor_map(section_nodes, &title, &level_map);

    let body = section_nodes[1..]
        .iter()
        .filter(|node| node.kind == NodeKind::Text)
        .map(|node| node.text.as_str())
        .collect::<Vec<&str>>()
        .join("\n\n");

    let segments = segmenter::segment(
        &body,
        &ancestor_map,
        &context.config.segmenter,
        &context.boilerplate,
    );

    SectionExtraction {
        identifier: found.section_id.clone(),
        title,
        strategy: found.strategy,
        segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> PipelineContext {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sections.yaml");
        std::fs::write(
            &path,
            r#"
sections:
  - id: item_1a
    title: "Item 1A. Risk Factors"
    patterns: ['(?i)item\s+1a\.\s*risk\s+factors']
    aliases: ["risk factors"]
  - id: item_2
    title: "Item 2. Properties"
    patterns: ['(?i)item\s+2\.\s*properties']
segmentation:
  merge_floor_words: 5
  boilerplate_patterns:
    - '(?i)^table of contents$'
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        PipelineContext::new(config).unwrap()
    }

    fn filing() -> String {
        let para = |stem: &str| {
            (0..30)
                .map(|index| format!("{stem}{index}"))
                .collect::<Vec<String>>()
                .join(" ")
        };
        format!(
            "<html><body>\
             <p><a href=\"#ra\">Item 1A. Risk Factors</a></p>\
             <h2 id=\"ra\">Item 1A. Risk Factors</h2>\
             <p>{lead}</p>\
             <h3>Market Risk</h3>\
             <p>{market}</p>\
             <h2>Item 2. Properties</h2>\
             <p>{props}</p>\
             </body></html>",
            lead = para("lead"),
            market = para("market"),
            props = para("props"),
        )
    }

    #[test]
    fn single_section_mode_narrows_and_extracts() {
        let context = test_context();
        let document = filing();

        let extraction = process_document(
            &context,
            document.as_bytes(),
            &SectionRequest::Single("item_1a".to_string()),
        )
        .unwrap();

        assert!(extraction.narrowed);
        assert!(extraction.absent.is_empty());
        assert_eq!(extraction.sections.len(), 1);

        let section = &extraction.sections[0];
        assert_eq!(section.identifier, "item_1a");
        assert_eq!(section.title, "Item 1A. Risk Factors");
        assert_eq!(section.segments.len(), 2);
        assert_eq!(section.segments[0].parent_subsection, "Item 1A. Risk Factors");
        assert_eq!(section.segments[1].parent_subsection, "Market Risk");
        // Item 2 body never reaches the segmenter in narrowed mode.
        for segment in &section.segments {
            assert!(!segment.text.contains("props0"));
        }
    }

    #[test]
    fn all_sections_mode_parses_full_document() {
        let context = test_context();
        let document = filing();

        let extraction =
            process_document(&context, document.as_bytes(), &SectionRequest::All).unwrap();

        assert!(!extraction.narrowed);
        assert_eq!(extraction.sections.len(), 2);
        assert_eq!(extraction.sections[1].identifier, "item_2");
        assert_eq!(extraction.sections[1].segments.len(), 1);
    }

    #[test]
    fn missing_section_is_reported_absent() {
        let context = test_context();
        let document = "<html><body><h2>Item 2. Properties</h2>\
                        <p>just some property text that is long enough to keep</p>\
                        </body></html>";

        let extraction =
            process_document(&context, document.as_bytes(), &SectionRequest::All).unwrap();

        assert_eq!(extraction.absent, vec!["item_1a".to_string()]);
        assert_eq!(extraction.sections.len(), 1);
    }

    #[test]
    fn alias_match_on_body_node_uses_configured_title() {
        let context = test_context();
        let para = (0..30)
            .map(|index| format!("risk{index}"))
            .collect::<Vec<String>>()
            .join(" ");
        let document = format!(
            "<html><body>\
             <p>The risk factors below may affect our results of operations.</p>\
             <p>{para}</p>\
             </body></html>"
        );

        let extraction =
            process_document(&context, document.as_bytes(), &SectionRequest::All).unwrap();

        let section = &extraction.sections[0];
        assert_eq!(section.strategy, 3);
        assert_eq!(section.title, "Item 1A. Risk Factors");
        assert_eq!(section.segments.len(), 1);
        assert_eq!(section.segments[0].parent_subsection, "Item 1A. Risk Factors");
    }

    #[test]
    fn pipeline_depends_only_on_the_parser_seam() {
        struct FixedNodes(Vec<ContentNode>);

        impl crate::parse::ElementParser for FixedNodes {
            fn parse(&self, _document: &[u8]) -> anyhow::Result<Vec<ContentNode>> {
                Ok(self.0.clone())
            }
        }

        let body = (0..30)
            .map(|index| format!("risk{index}"))
            .collect::<Vec<String>>()
            .join(" ");
        let nodes = vec![
            ContentNode {
                kind: crate::parse::NodeKind::Title,
                text: "Item 1A. Risk Factors".to_string(),
                byte_offset: 0,
                heading_level: Some(2),
            },
            ContentNode {
                kind: crate::parse::NodeKind::Text,
                text: body,
                byte_offset: 64,
                heading_level: None,
            },
        ];

        let config = test_context().config;
        let context = PipelineContext::with_parser(config, Box::new(FixedNodes(nodes))).unwrap();

        let extraction =
            process_document(&context, b"ignored", &SectionRequest::All).unwrap();
        assert_eq!(extraction.sections.len(), 1);
        assert_eq!(extraction.sections[0].segments.len(), 1);
    }

    #[test]
    fn unknown_single_section_id_is_an_error() {
        let context = test_context();
        let result = process_document(
            &context,
            b"<p>anything</p>",
            &SectionRequest::Single("item_9z".to_string()),
        );
        assert!(result.is_err());
    }
}
