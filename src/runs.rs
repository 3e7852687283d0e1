//! Build run manifests.
//!
//! Every build writes a `run-manifest.json` under `<store>/runs/<run_id>/`
//! recording what was built, whether it succeeded, and which layers were
//! produced. Runs can be listed and pruned.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunManifest {
    pub run_id: String,
    pub status: String,
    pub image: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    /// Name of the step that failed, for failed runs.
    pub failed_step: Option<String>,
    /// Layer ids produced, in step order.
    pub layers: Vec<String>,
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Allocate a fresh run directory. The run id is timestamp-based with the
/// pid appended, so concurrent invocations cannot collide.
pub fn allocate_run_dir(runs_root: &Path) -> Result<(String, PathBuf)> {
    let run_id = format!("{}-{}", now_utc_compact(), std::process::id());
    let run_dir = runs_root.join(&run_id);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory '{}'", run_dir.display()))?;
    Ok((run_id, run_dir))
}

pub fn write_run_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    write_json_atomic(path, manifest)
        .with_context(|| format!("writing run manifest '{}'", path.display()))
}

pub fn load_runs(runs_root: &Path) -> Result<Vec<RunManifest>> {
    if !runs_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_root)
        .with_context(|| format!("reading runs directory '{}'", runs_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading run manifest '{}'", path.display()))?;
        let parsed: RunManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
        runs.push(parsed);
    }
    Ok(runs)
}

pub fn latest_successful_run_id(runs_root: &Path) -> Result<Option<String>> {
    let mut runs = load_runs(runs_root)?;
    runs.retain(|run| run.status == STATUS_SUCCESS);
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs.first().map(|r| r.run_id.clone()))
}

/// Remove run directories beyond the newest `keep`.
pub fn prune_old_runs(runs_root: &Path, keep: usize) -> Result<usize> {
    let mut runs = load_runs(runs_root)?;
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    let mut removed = 0usize;
    for run in runs.into_iter().skip(keep) {
        let path = runs_root.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

/// Compact UTC timestamp, e.g. `20260830T142501Z`.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn run_sort_key(run: &RunManifest) -> String {
    run.finished_at_utc
        .clone()
        .unwrap_or_else(|| run.created_at_utc.clone())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).with_context(|| "serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
