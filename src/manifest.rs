use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{ManifestEntry, ValidationStatus};
use crate::util::{now_utc_string, sha256_file, utc_compact_string, write_json_atomic};

const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILENAME: &str = "state_manifest.json";
const HISTORY_FILENAME: &str = "manifest_history.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    manifest_version: u32,
    updated_at: String,
    entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Serialize)]
struct HistoryLine<'a> {
    recorded_at: &'a str,
    #[serde(flatten)]
    entry: &'a ManifestEntry,
}

/// Persistent map from input path to the fingerprint and output of its last
/// processing attempt. Used to skip unchanged inputs across runs; all writers
/// must go through one owner (the batch coordinator serializes updates).
#[derive(Debug)]
pub struct StateManifest {
    path: PathBuf,
    history_path: PathBuf,
    entries: BTreeMap<String, ManifestEntry>,
}

impl StateManifest {
    /// Load the manifest under `state_root`. A missing file starts empty; an
    /// unreadable or malformed file is preserved under a backup name and the
    /// manifest starts empty, so every input is treated as needing work
    /// rather than silently losing state.
    pub fn load(state_root: &Path) -> Result<Self> {
        let path = state_root.join(MANIFEST_FILENAME);
        let history_path = state_root.join(HISTORY_FILENAME);

        if !path.exists() {
            return Ok(Self {
                path,
                history_path,
                entries: BTreeMap::new(),
            });
        }

        let raw = fs::read(&path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;

        match serde_json::from_slice::<ManifestFile>(&raw) {
            Ok(file) if file.manifest_version == MANIFEST_VERSION => {
                info!(
                    path = %path.display(),
                    entries = file.entries.len(),
                    "loaded state manifest"
                );
                Ok(Self {
                    path,
                    history_path,
                    entries: file.entries,
                })
            }
            Ok(file) => {
                let backup = Self::backup_corrupt(&path)?;
                warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    found_version = file.manifest_version,
                    "unsupported manifest version, reprocessing all inputs"
                );
                Ok(Self {
                    path,
                    history_path,
                    entries: BTreeMap::new(),
                })
            }
            Err(error) => {
                let backup = Self::backup_corrupt(&path)?;
                warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %error,
                    "corrupt manifest, reprocessing all inputs"
                );
                Ok(Self {
                    path,
                    history_path,
                    entries: BTreeMap::new(),
                })
            }
        }
    }

    fn backup_corrupt(path: &Path) -> Result<PathBuf> {
        let backup = path.with_file_name(format!(
            "{}.corrupt-{}",
            MANIFEST_FILENAME,
            utc_compact_string(Utc::now())
        ));
        fs::rename(path, &backup).with_context(|| {
            format!(
                "failed to preserve corrupt manifest {} as {}",
                path.display(),
                backup.display()
            )
        })?;
        Ok(backup)
    }

    /// Hash the file and decide whether it needs processing. Absent or
    /// changed fingerprints need work; so do entries whose last attempt
    /// failed validation, so a FAIL is never silently skipped as done.
    /// Returns the fingerprint so callers hash each input once.
    pub fn needs_processing(&self, input_path: &Path) -> Result<(bool, String)> {
        let fingerprint = sha256_file(input_path)?;
        let needed = match self.entries.get(&path_key(input_path)) {
            None => true,
            Some(entry) => {
                entry.input_fingerprint != fingerprint
                    || entry.validation_status == ValidationStatus::Fail
            }
        };
        Ok((needed, fingerprint))
    }

    pub fn lookup(&self, input_path: &Path) -> Option<&ManifestEntry> {
        self.entries.get(&path_key(input_path))
    }

    /// Upsert the current-state entry and append it to the history log.
    pub fn record(&mut self, entry: ManifestEntry) -> Result<()> {
        self.append_history(&entry)?;
        self.entries.insert(entry.input_path.clone(), entry);
        Ok(())
    }

    fn append_history(&self, entry: &ManifestEntry) -> Result<()> {
        if let Some(parent) = self.history_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory: {}", parent.display())
            })?;
        }

        let recorded_at = now_utc_string();
        let line = serde_json::to_string(&HistoryLine {
            recorded_at: &recorded_at,
            entry,
        })
        .context("failed to serialize manifest history line")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .with_context(|| {
                format!("failed to open history log: {}", self.history_path.display())
            })?;
        writeln!(file, "{line}").with_context(|| {
            format!("failed to append history log: {}", self.history_path.display())
        })?;

        Ok(())
    }

    /// Persist the current-state view via write-then-atomic-rename.
    pub fn save(&self) -> Result<()> {
        let file = ManifestFile {
            manifest_version: MANIFEST_VERSION,
            updated_at: now_utc_string(),
            entries: self.entries.clone(),
        };
        write_json_atomic(&self.path, &file)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }
}

fn path_key(path: &Path) -> String {
    path.display().to_string()
}
