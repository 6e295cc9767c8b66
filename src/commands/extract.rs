use std::fs;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::info;

use crate::cli::ExtractArgs;
use crate::commands::{
    ValidationReportFile, build_document_output, combined_segments, load_identity,
};
use crate::config::PipelineConfig;
use crate::gate;
use crate::model::ValidationStatus;
use crate::pipeline::{self, PipelineContext, SectionRequest};
use crate::thresholds::ThresholdRegistry;
use crate::util::{sha256_file, utc_compact_string, write_json_pretty};

pub fn run(args: ExtractArgs) -> Result<()> {
    let run_id = format!("extract-{}", utc_compact_string(Utc::now()));

    let config = PipelineConfig::load(&args.sections_config)?;
    let registry = ThresholdRegistry::load(&args.thresholds_config)?;
    let segmenter = config.segmenter.clone();
    let context = PipelineContext::new(config)?;

    let request = match &args.section {
        Some(id) => SectionRequest::Single(id.clone()),
        None => SectionRequest::All,
    };

    let document = fs::read(&args.input)
        .with_context(|| format!("failed to read input: {}", args.input.display()))?;
    let fingerprint = sha256_file(&args.input)?;
    let identity = load_identity(&args.input)?;

    info!(
        input = %args.input.display(),
        bytes = document.len(),
        mode = match &request {
            SectionRequest::Single(id) => id.as_str(),
            SectionRequest::All => "all-sections",
        },
        "starting extraction"
    );

    let extraction = pipeline::process_document(&context, &document, &request)?;
    let segments = combined_segments(&extraction);
    let report = gate::evaluate_document(&identity, &segments, &registry, &segmenter);

    let output = build_document_output(&run_id, &args.input, &fingerprint, identity, &extraction);

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("segments.json"));
    let report_path = args
        .report
        .clone()
        .unwrap_or_else(|| args.input.with_extension("validation.json"));

    write_json_pretty(&output_path, &output)?;
    write_json_pretty(
        &report_path,
        &ValidationReportFile::new(&run_id, &args.input, &report),
    )?;

    info!(
        sections = extraction.sections.len(),
        absent = extraction.absent.len(),
        segments = segments.len(),
        narrowed = extraction.narrowed,
        status = report.status.as_str(),
        output = %output_path.display(),
        report = %report_path.display(),
        "extraction completed"
    );

    if args.fail_on_validation && report.status == ValidationStatus::Fail {
        bail!(
            "validation failed for {} ({} blocking rule(s) failed)",
            args.input.display(),
            report.blocking.failed
        );
    }

    Ok(())
}
