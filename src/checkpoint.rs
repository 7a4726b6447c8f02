//! Checkpoint files on disk
//!
//! A checkpoint is the serialized context wrapped in a versioned envelope,
//! written atomically (temp file in the target directory, then rename) so a
//! crash mid-write never leaves a torn checkpoint behind. One file exists
//! per task; successive checkpoints for the same task overwrite it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::context::EtlContext;
use crate::error::{Error, Result};

const CHECKPOINT_PREFIX: &str = "etl_checkpoint_";

/// Path of the checkpoint file for a task.
pub fn checkpoint_path(output_dir: &Path, task_id: &str) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}{task_id}.json"))
}

/// Write the context to its checkpoint file atomically.
pub fn save(context: &EtlContext) -> Result<PathBuf> {
    let output_dir = context
        .config
        .output_dir
        .as_deref()
        .ok_or_else(|| Error::Checkpoint("no output directory configured".to_string()))?;
    let output_dir = Path::new(output_dir);
    fs::create_dir_all(output_dir)?;

    let bytes = context.serialize()?;
    let path = checkpoint_path(output_dir, &context.task_id);

    // Temp file must live in the same directory for the rename to be atomic
    let mut tmp = NamedTempFile::new_in(output_dir)
        .map_err(|e| Error::Checkpoint(format!("failed to create temp file: {e}")))?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.persist(&path)
        .map_err(|e| Error::Checkpoint(format!("failed to persist checkpoint: {e}")))?;

    tracing::info!(path = %path.display(), task_id = %context.task_id, "Checkpoint saved");
    Ok(path)
}

/// Load a context back from a checkpoint file.
pub fn load(path: &Path) -> Result<EtlContext> {
    let bytes = fs::read(path)
        .map_err(|e| Error::Checkpoint(format!("cannot read {}: {e}", path.display())))?;
    EtlContext::deserialize(&bytes)
}

/// Checkpoint files in a directory, newest first by modification time.
pub fn list(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut checkpoints: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(CHECKPOINT_PREFIX) || !name.ends_with(".json") {
            continue;
        }
        let mtime = entry
            .metadata()?
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        checkpoints.push((entry.path(), mtime));
    }

    checkpoints.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(checkpoints.into_iter().map(|(path, _)| path).collect())
}

/// Delete all but the `keep` most recent checkpoint files.
pub fn prune(output_dir: &Path, keep: usize) -> Result<()> {
    for stale in list(output_dir)?.into_iter().skip(keep) {
        if let Err(e) = fs::remove_file(&stale) {
            tracing::warn!(path = %stale.display(), error = %e, "Failed to prune checkpoint");
        }
    }
    Ok(())
}
