use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Write `content` via a sibling temp file and an atomic rename.
///
/// Readers observe either the old or the new complete file, never a
/// partial write. Parent directories are created as needed.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let tmp = tmp_sibling(path);
    fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("renaming over {}", path.display()));
    }
    Ok(())
}

/// Temp-file name next to `path` so the final rename stays on one filesystem.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}

/// Parse a JSON file, returning None when missing or malformed.
pub fn safe_json_load(path: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Like safe_json_load but defaults to an empty object.
pub fn read_json_or_empty(path: &Path) -> serde_json::Value {
    safe_json_load(path).unwrap_or_else(|| serde_json::json!({}))
}

pub fn write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("serializing JSON")?;
    atomic_write(path, format!("{body}\n").as_bytes())
}
