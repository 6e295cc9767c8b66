use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::cli::BatchArgs;
use crate::commands::{
    ValidationReportFile, build_document_output, combined_segments, load_identity,
    render_failure_report,
};
use crate::config::{PipelineConfig, SegmenterConfig};
use crate::gate;
use crate::manifest::StateManifest;
use crate::model::{
    BatchCounts, BatchPaths, BatchRunManifest, ItemOutcome, ManifestEntry, QuarantineRecord,
    ValidationStatus,
};
use crate::parse::HtmlParser;
use crate::pipeline::{self, PipelineContext, SectionRequest};
use crate::pool::{PoolOptions, TaskStatus, WorkItem, WorkerPool};
use crate::thresholds::ThresholdRegistry;
use crate::util::{ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty};

const CHECKPOINT_FILENAME: &str = "batch_checkpoint.json";
const QUARANTINE_RECORD_FILENAME: &str = "quarantine_record.json";
const FAILURE_REPORT_FILENAME: &str = "failure_report.txt";

/// Quarantine attempts at which single-section pre-seeking is abandoned in
/// favor of a full-document parse for that input.
const DEGRADED_MODE_ATTEMPTS: u32 = 2;

#[derive(Debug)]
struct BatchItem {
    path: PathBuf,
    fingerprint: String,
}

#[derive(Debug)]
struct ProcessResult {
    fingerprint: String,
    validation_status: ValidationStatus,
    output_path: PathBuf,
    quarantined: bool,
}

pub fn run(args: BatchArgs) -> Result<BatchCounts> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    ensure_directory(&args.state_root)?;
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| args.state_root.join("outputs"));
    let quarantine_dir = args.state_root.join("quarantine");
    ensure_directory(&output_dir)?;
    ensure_directory(&quarantine_dir)?;

    let config = PipelineConfig::load(&args.sections_config)?;
    let registry = Arc::new(ThresholdRegistry::load(&args.thresholds_config)?);
    let boilerplate = config.segmenter.compiled_boilerplate()?;
    let segmenter = config.segmenter.clone();

    let request = match &args.section {
        Some(id) => {
            if config.section(id).is_none() {
                bail!("section id '{id}' is not configured");
            }
            SectionRequest::Single(id.clone())
        }
        None => SectionRequest::All,
    };

    let extensions = args
        .extensions
        .split(',')
        .map(|extension| extension.trim().to_ascii_lowercase())
        .filter(|extension| !extension.is_empty())
        .collect::<BTreeSet<String>>();
    let inputs = discover_inputs(&args.input_dir, &extensions)?;

    info!(
        run_id = %run_id,
        input_dir = %args.input_dir.display(),
        candidates = inputs.len(),
        "starting batch"
    );

    let mut manifest = StateManifest::load(&args.state_root)?;
    let mut counts = BatchCounts {
        candidates: inputs.len(),
        ..BatchCounts::default()
    };

    let mut work = Vec::new();
    for path in inputs {
        let (needed, fingerprint) = if args.reprocess_all {
            (true, sha256_file(&path)?)
        } else {
            manifest.needs_processing(&path)?
        };

        if needed {
            work.push(WorkItem {
                id: path.display().to_string(),
                payload: BatchItem { path, fingerprint },
            });
        } else {
            counts.skipped_unchanged += 1;
        }
    }

    let checkpoint_path = args.state_root.join(CHECKPOINT_FILENAME);
    let mut item_outcomes: Vec<ItemOutcome> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    if !work.is_empty() {
        let progress = if args.no_progress {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(work.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        };

        let pool = WorkerPool::new(PoolOptions {
            max_workers: args.max_workers,
            per_task_timeout: Duration::from_secs(args.task_timeout_secs),
            checkpoint_every_n: args.checkpoint_every,
            tasks_per_worker: args.tasks_per_worker,
            checkpoint_path: Some(checkpoint_path.clone()),
        });

        let worker_config = config.clone();
        let worker_boilerplate = boilerplate.clone();
        let init = move || {
            PipelineContext::from_parts(
                worker_config.clone(),
                worker_boilerplate.clone(),
                Box::new(HtmlParser),
            )
        };

        let task_registry = Arc::clone(&registry);
        let task_segmenter = segmenter.clone();
        let task_request = request.clone();
        let task_output_dir = output_dir.clone();
        let task_quarantine_dir = quarantine_dir.clone();
        let task_run_id = run_id.clone();
        let task = move |context: &mut PipelineContext, item: &WorkItem<BatchItem>| {
            process_item(
                context,
                &item.payload,
                &task_request,
                &task_registry,
                &task_segmenter,
                &task_output_dir,
                &task_quarantine_dir,
                &task_run_id,
            )
        };

        let outcome = pool.run(work, init, task, |report| {
            progress.inc(1);
            counts.processed += 1;

            match (report.status, report.result.as_ref()) {
                (TaskStatus::Ok, Some(result)) => {
                    match result.validation_status {
                        ValidationStatus::Pass => counts.passed += 1,
                        ValidationStatus::Warn => counts.warned += 1,
                        ValidationStatus::Fail => {}
                    }
                    if result.quarantined {
                        counts.quarantined += 1;
                    }
                    let entry = ManifestEntry {
                        input_fingerprint: result.fingerprint.clone(),
                        input_path: report.item_id.clone(),
                        output_path: result.output_path.display().to_string(),
                        run_id: run_id.clone(),
                        processed_at: now_utc_string(),
                        validation_status: result.validation_status,
                    };
                    if let Err(error) = manifest.record(entry).and_then(|_| manifest.save()) {
                        warn!(item = %report.item_id, error = %error, "failed to update manifest");
                        warnings.push(format!(
                            "manifest update failed for {}: {error:#}",
                            report.item_id
                        ));
                    }
                }
                (TaskStatus::Failed, _) => {
                    counts.failed += 1;
                    let error = report.error.as_deref().unwrap_or("unknown error");
                    warn!(item = %report.item_id, error, "item failed");
                    if let Err(quarantine_error) =
                        write_error_quarantine(&quarantine_dir, &report.item_id, error)
                    {
                        warnings.push(format!(
                            "quarantine record failed for {}: {quarantine_error:#}",
                            report.item_id
                        ));
                    }
                }
                (TaskStatus::TimedOut, _) => {
                    counts.timed_out += 1;
                    warn!(item = %report.item_id, "item timed out, eligible on next run");
                }
                (TaskStatus::Ok, None) => {}
            }

            item_outcomes.push(ItemOutcome {
                input_path: report.item_id.clone(),
                status: status_label(report.status).to_string(),
                validation_status: report.result.as_ref().map(|result| result.validation_status),
                output_path: report
                    .result
                    .as_ref()
                    .map(|result| result.output_path.display().to_string()),
                duration_ms: report.duration.as_millis() as u64,
                error: report.error.clone(),
            });
        })?;

        progress.finish_and_clear();
        counts.skipped_checkpoint = outcome.skipped_from_checkpoint.len();
    }

    // The checkpoint only matters for crash recovery inside one invocation;
    // a completed batch starts the next invocation from the manifest.
    if checkpoint_path.exists() {
        fs::remove_file(&checkpoint_path).with_context(|| {
            format!("failed to remove checkpoint: {}", checkpoint_path.display())
        })?;
    }

    let run_manifest = BatchRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_batch_command(&args),
        paths: BatchPaths {
            state_root: args.state_root.display().to_string(),
            output_dir: output_dir.display().to_string(),
            quarantine_dir: quarantine_dir.display().to_string(),
            sections_config_path: args.sections_config.display().to_string(),
            thresholds_config_path: args.thresholds_config.display().to_string(),
        },
        counts: counts.clone(),
        items: item_outcomes,
        warnings,
    };
    let run_manifest_path = args.state_root.join("runs").join(format!("{run_id}.json"));
    write_json_pretty(&run_manifest_path, &run_manifest)?;

    info!(
        run_id = %run_id,
        processed = counts.processed,
        skipped_unchanged = counts.skipped_unchanged,
        skipped_checkpoint = counts.skipped_checkpoint,
        passed = counts.passed,
        warned = counts.warned,
        quarantined = counts.quarantined,
        failed = counts.failed,
        timed_out = counts.timed_out,
        "batch completed"
    );

    if args.fail_on_validation && counts.quarantined > 0 {
        bail!(
            "{} document(s) failed validation and were quarantined",
            counts.quarantined
        );
    }

    Ok(counts)
}

fn discover_inputs(dir: &Path, extensions: &BTreeSet<String>) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    collect_inputs(dir, extensions, &mut inputs)?;
    inputs.sort();
    Ok(inputs)
}

fn collect_inputs(dir: &Path, extensions: &BTreeSet<String>, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read input directory: {}", dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_inputs(&path, extensions, out)?;
            continue;
        }
        let Some(extension) = path.extension().and_then(|extension| extension.to_str()) else {
            continue;
        };
        if extensions.contains(&extension.to_ascii_lowercase()) {
            out.push(path);
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_item(
    context: &mut PipelineContext,
    item: &BatchItem,
    request: &SectionRequest,
    registry: &ThresholdRegistry,
    segmenter: &SegmenterConfig,
    output_dir: &Path,
    quarantine_dir: &Path,
    run_id: &str,
) -> Result<ProcessResult> {
    let document = fs::read(&item.path)
        .with_context(|| format!("failed to read input: {}", item.path.display()))?;

    let stem = file_stem(&item.path);
    let item_quarantine_dir = quarantine_dir.join(&stem);
    let previous_attempts = recorded_attempts(&item_quarantine_dir);

    let effective_request = if previous_attempts >= DEGRADED_MODE_ATTEMPTS
        && matches!(request, SectionRequest::Single(_))
    {
        info!(
            input = %item.path.display(),
            attempts = previous_attempts,
            "repeated quarantine, degrading to full-document parse"
        );
        &SectionRequest::All
    } else {
        request
    };

    let extraction = pipeline::process_document(context, &document, effective_request)?;
    let identity = load_identity(&item.path)?;
    let segments = combined_segments(&extraction);
    let report = gate::evaluate_document(&identity, &segments, registry, segmenter);
    let output = build_document_output(run_id, &item.path, &item.fingerprint, identity, &extraction);

    if report.status == ValidationStatus::Fail {
        ensure_directory(&item_quarantine_dir)?;

        let output_path = item_quarantine_dir.join(format!("{stem}.segments.json"));
        write_json_pretty(&output_path, &output)?;
        write_json_pretty(
            &item_quarantine_dir.join(format!("{stem}.validation.json")),
            &ValidationReportFile::new(run_id, &item.path, &report),
        )?;

        let failure_report_path = item_quarantine_dir.join(FAILURE_REPORT_FILENAME);
        fs::write(&failure_report_path, render_failure_report(&item.path, &report))
            .with_context(|| {
                format!("failed to write failure report: {}", failure_report_path.display())
            })?;

        write_json_pretty(
            &item_quarantine_dir.join(QUARANTINE_RECORD_FILENAME),
            &QuarantineRecord {
                input_path: item.path.display().to_string(),
                partial_output_path: Some(output_path.display().to_string()),
                failure_report: failure_report_path.display().to_string(),
                attempt_count: previous_attempts + 1,
            },
        )?;

        info!(
            input = %item.path.display(),
            segments = segments.len(),
            failed_rules = report.blocking.failed,
            "document quarantined"
        );

        return Ok(ProcessResult {
            fingerprint: item.fingerprint.clone(),
            validation_status: ValidationStatus::Fail,
            output_path,
            quarantined: true,
        });
    }

    let output_path = output_dir.join(format!("{stem}.segments.json"));
    write_json_pretty(&output_path, &output)?;
    write_json_pretty(
        &output_dir.join(format!("{stem}.validation.json")),
        &ValidationReportFile::new(run_id, &item.path, &report),
    )?;

    info!(
        input = %item.path.display(),
        segments = segments.len(),
        absent = extraction.absent.len(),
        status = report.status.as_str(),
        "document processed"
    );

    Ok(ProcessResult {
        fingerprint: item.fingerprint.clone(),
        validation_status: report.status,
        output_path,
        quarantined: false,
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string())
}

fn recorded_attempts(item_quarantine_dir: &Path) -> u32 {
    let record_path = item_quarantine_dir.join(QUARANTINE_RECORD_FILENAME);
    let Ok(raw) = fs::read(&record_path) else {
        return 0;
    };
    serde_json::from_slice::<QuarantineRecord>(&raw)
        .map(|record| record.attempt_count)
        .unwrap_or(0)
}

fn write_error_quarantine(quarantine_dir: &Path, input_path: &str, error: &str) -> Result<()> {
    let stem = file_stem(Path::new(input_path));
    let item_quarantine_dir = quarantine_dir.join(&stem);
    ensure_directory(&item_quarantine_dir)?;

    let failure_report_path = item_quarantine_dir.join(FAILURE_REPORT_FILENAME);
    fs::write(
        &failure_report_path,
        format!("processing error for {input_path}\n\n{error}\n"),
    )
    .with_context(|| {
        format!("failed to write failure report: {}", failure_report_path.display())
    })?;

    let attempt_count = recorded_attempts(&item_quarantine_dir) + 1;
    write_json_pretty(
        &item_quarantine_dir.join(QUARANTINE_RECORD_FILENAME),
        &QuarantineRecord {
            input_path: input_path.to_string(),
            partial_output_path: None,
            failure_report: failure_report_path.display().to_string(),
            attempt_count,
        },
    )
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Ok => "ok",
        TaskStatus::Failed => "failed",
        TaskStatus::TimedOut => "timed_out",
    }
}

fn render_batch_command(args: &BatchArgs) -> String {
    let mut command = format!(
        "edgar-risk batch --input-dir {} --state-root {}",
        args.input_dir.display(),
        args.state_root.display()
    );
    if let Some(section) = &args.section {
        command.push_str(&format!(" --section {section}"));
    }
    if args.reprocess_all {
        command.push_str(" --reprocess-all");
    }
    if args.fail_on_validation {
        command.push_str(" --fail-on-validation");
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_configs(dir: &Path, require_cik: bool) -> (PathBuf, PathBuf) {
        let sections = dir.join("sections.yaml");
        fs::write(
            &sections,
            r#"
sections:
  - id: item_1a
    title: "Item 1A. Risk Factors"
    patterns: ['(?i)item\s+1a\.\s*risk\s+factors']
    aliases: ["risk factors"]
segmentation:
  merge_floor_words: 5
"#,
        )
        .unwrap();

        let rule = if require_cik {
            r#"
categories:
  identity:
    - name: cik_present
      display_name: CIK present
      metric_type: boolean
      target: 1.0
      operator: ">="
      blocking: true
"#
        } else {
            r#"
categories:
  segmentation:
    - name: segment_count
      display_name: Segment count
      metric_type: count
      target: 1.0
      operator: ">="
      blocking: true
"#
        };
        let thresholds = dir.join("thresholds.yaml");
        fs::write(&thresholds, rule).unwrap();

        (sections, thresholds)
    }

    fn write_filing(input_dir: &Path, name: &str, with_meta: bool) -> PathBuf {
        let paragraph = (0..40)
            .map(|index| format!("{name}w{index}"))
            .collect::<Vec<String>>()
            .join(" ");
        let path = input_dir.join(format!("{name}.html"));
        fs::write(
            &path,
            format!(
                "<html><body><h2>Item 1A. Risk Factors</h2><p>{paragraph}</p></body></html>"
            ),
        )
        .unwrap();
        if with_meta {
            fs::write(
                input_dir.join(format!("{name}.meta.json")),
                r#"{"cik": "0001018724"}"#,
            )
            .unwrap();
        }
        path
    }

    fn test_args(root: &Path, require_cik: bool) -> BatchArgs {
        let input_dir = root.join("inputs");
        fs::create_dir_all(&input_dir).unwrap();
        let (sections_config, thresholds_config) = write_configs(root, require_cik);
        BatchArgs {
            input_dir,
            extensions: "html,htm".to_string(),
            state_root: root.join("state"),
            output_dir: None,
            section: None,
            sections_config,
            thresholds_config,
            max_workers: 2,
            task_timeout_secs: 60,
            checkpoint_every: 2,
            tasks_per_worker: 10,
            reprocess_all: false,
            fail_on_validation: false,
            no_progress: true,
        }
    }

    #[test]
    fn processes_then_skips_unchanged_then_reprocesses_edits() {
        let root = tempfile::tempdir().unwrap();
        let args = test_args(root.path(), false);
        let doc1 = write_filing(&args.input_dir, "alpha", true);
        write_filing(&args.input_dir, "beta", true);

        let first = run(args.clone()).unwrap();
        assert_eq!(first.candidates, 2);
        assert_eq!(first.processed, 2);
        assert_eq!(first.passed, 2);
        assert_eq!(first.skipped_unchanged, 0);
        assert!(args.state_root.join("outputs/alpha.segments.json").exists());
        assert!(args.state_root.join("outputs/beta.validation.json").exists());
        assert!(args.state_root.join("state_manifest.json").exists());
        assert!(!args.state_root.join(CHECKPOINT_FILENAME).exists());

        // Unchanged inputs are skipped wholesale on the second run.
        let second = run(args.clone()).unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped_unchanged, 2);

        // Editing one file makes exactly that file eligible again.
        fs::write(
            &doc1,
            "<html><body><h2>Item 1A. Risk Factors</h2>\
             <p>entirely new risk narrative that is long enough to survive filtering</p>\
             </body></html>",
        )
        .unwrap();
        let third = run(args).unwrap();
        assert_eq!(third.processed, 1);
        assert_eq!(third.skipped_unchanged, 1);
    }

    #[test]
    fn failing_validation_quarantines_and_stays_eligible() {
        let root = tempfile::tempdir().unwrap();
        let args = test_args(root.path(), true);
        write_filing(&args.input_dir, "gamma", false);

        let first = run(args.clone()).unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.quarantined, 1);
        assert_eq!(first.passed, 0);

        let quarantine = args.state_root.join("quarantine/gamma");
        assert!(quarantine.join("gamma.segments.json").exists());
        assert!(quarantine.join(FAILURE_REPORT_FILENAME).exists());
        let record: QuarantineRecord = serde_json::from_slice(
            &fs::read(quarantine.join(QUARANTINE_RECORD_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(record.attempt_count, 1);
        assert!(record.partial_output_path.is_some());

        // A FAIL entry never counts as done: the same input runs again and
        // the attempt count climbs.
        let second = run(args.clone()).unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.skipped_unchanged, 0);
        let record: QuarantineRecord = serde_json::from_slice(
            &fs::read(quarantine.join(QUARANTINE_RECORD_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(record.attempt_count, 2);

        let mut strict = args;
        strict.fail_on_validation = true;
        assert!(run(strict).is_err());
    }

    #[test]
    fn run_manifest_is_written_per_invocation() {
        let root = tempfile::tempdir().unwrap();
        let args = test_args(root.path(), false);
        write_filing(&args.input_dir, "delta", true);

        run(args.clone()).unwrap();

        let runs_dir = args.state_root.join("runs");
        let runs = fs::read_dir(&runs_dir).unwrap().count();
        assert_eq!(runs, 1);

        let entry = fs::read_dir(&runs_dir).unwrap().next().unwrap().unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(entry.path()).unwrap()).unwrap();
        assert_eq!(manifest["status"], "completed");
        assert_eq!(manifest["counts"]["processed"], 1);
        assert_eq!(manifest["items"].as_array().unwrap().len(), 1);
    }
}
