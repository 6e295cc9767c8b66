use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::manifest::StateManifest;
use crate::model::ValidationStatus;

pub fn run(args: StatusArgs) -> Result<()> {
    info!(state_root = %args.state_root.display(), "status requested");

    if !args.state_root.exists() {
        warn!(path = %args.state_root.display(), "state root does not exist");
        return Ok(());
    }

    let manifest = StateManifest::load(&args.state_root)?;
    let passed = manifest
        .entries()
        .filter(|entry| entry.validation_status == ValidationStatus::Pass)
        .count();
    let warned = manifest
        .entries()
        .filter(|entry| entry.validation_status == ValidationStatus::Warn)
        .count();
    let failed = manifest
        .entries()
        .filter(|entry| entry.validation_status == ValidationStatus::Fail)
        .count();

    info!(
        entries = manifest.len(),
        passed,
        warned,
        failed,
        "state manifest summary"
    );

    report_last_run(&args.state_root.join("runs"))?;

    let quarantine_dir = args.state_root.join("quarantine");
    if quarantine_dir.exists() {
        let quarantined = fs::read_dir(&quarantine_dir)
            .with_context(|| format!("failed to read {}", quarantine_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .count();
        info!(path = %quarantine_dir.display(), items = quarantined, "quarantine occupancy");
    } else {
        info!("quarantine area is empty");
    }

    Ok(())
}

fn report_last_run(runs_dir: &Path) -> Result<()> {
    if !runs_dir.exists() {
        warn!(path = %runs_dir.display(), "no batch runs recorded yet");
        return Ok(());
    }

    let mut run_files = fs::read_dir(runs_dir)
        .with_context(|| format!("failed to read {}", runs_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|extension| extension.to_str()) == Some("json"))
        .collect::<Vec<std::path::PathBuf>>();
    run_files.sort();

    let Some(latest) = run_files.last() else {
        warn!(path = %runs_dir.display(), "no batch runs recorded yet");
        return Ok(());
    };

    let raw = fs::read(latest)
        .with_context(|| format!("failed to read {}", latest.display()))?;
    let manifest: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", latest.display()))?;

    info!(
        run_id = %manifest["run_id"].as_str().unwrap_or_default(),
        status = %manifest["status"].as_str().unwrap_or_default(),
        updated_at = %manifest["updated_at"].as_str().unwrap_or_default(),
        processed = manifest["counts"]["processed"].as_u64().unwrap_or(0),
        skipped_unchanged = manifest["counts"]["skipped_unchanged"].as_u64().unwrap_or(0),
        quarantined = manifest["counts"]["quarantined"].as_u64().unwrap_or(0),
        timed_out = manifest["counts"]["timed_out"].as_u64().unwrap_or(0),
        "latest batch run"
    );

    Ok(())
}
