use crate::config::IgnoreConfig;
use crate::fsutil::{ensure_dir, write_json_pretty};
use crate::transcript::TranscriptSnapshot;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

pub const ARCHIVE_NAME: &str = "snapshot.tar.gz";
pub const METADATA_NAME: &str = "metadata.json";

/// Sidecar record for one checkpoint directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointMetadata {
    pub name: String,
    pub timestamp: String,
    pub description: String,
    pub file_count: u64,
    pub total_size: u64,
    pub session_id: Option<String>,
    pub has_transcript: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<TranscriptSnapshot>,
}

impl CheckpointMetadata {
    /// Stand-in for a directory whose metadata is missing-in-action.
    fn minimal(name: &str) -> CheckpointMetadata {
        CheckpointMetadata {
            name: name.to_string(),
            timestamp: name.to_string(),
            ..CheckpointMetadata::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub name: String,
    pub file_count: u64,
}

/// Workspace snapshot storage: one directory per checkpoint, named by a
/// millisecond timestamp so names sort in creation order. A checkpoint is
/// complete only once `metadata.json` exists; any creation failure rolls
/// the directory back.
pub struct CheckpointStore {
    storage_dir: PathBuf,
    project_root: PathBuf,
    ignore: IgnoreConfig,
}

impl CheckpointStore {
    pub fn new(storage_dir: PathBuf, project_root: PathBuf, ignore: IgnoreConfig) -> Result<Self> {
        ensure_dir(&storage_dir)?;
        Ok(CheckpointStore {
            storage_dir,
            project_root,
            ignore,
        })
    }

    pub fn checkpoint_dir(&self, name: &str) -> PathBuf {
        self.storage_dir.join(name)
    }

    /// Create a checkpoint of the project tree.
    ///
    /// On a name collision (two checkpoints inside the same millisecond)
    /// the name advances to the next millisecond and retries.
    pub fn create(&self, description: &str, session_id: Option<&str>) -> Result<CreateOutcome> {
        let (name, timestamp) = self.allocate_name()?;
        let checkpoint_dir = self.storage_dir.join(&name);

        let result = self.create_in(&checkpoint_dir, &name, &timestamp, description, session_id);
        if result.is_err() {
            let _ = fs::remove_dir_all(&checkpoint_dir);
        }
        result
    }

    fn allocate_name(&self) -> Result<(String, DateTime<Local>)> {
        let mut timestamp = Local::now();
        for _ in 0..1000 {
            let name = timestamp.format("%Y%m%d_%H%M%S_%3f").to_string();
            if !self.storage_dir.join(&name).exists() {
                return Ok((name, timestamp));
            }
            timestamp += chrono::Duration::milliseconds(1);
        }
        bail!("could not allocate a unique checkpoint name")
    }

    fn create_in(
        &self,
        checkpoint_dir: &Path,
        name: &str,
        timestamp: &DateTime<Local>,
        description: &str,
        session_id: Option<&str>,
    ) -> Result<CreateOutcome> {
        ensure_dir(checkpoint_dir)?;

        let files = self.collect_files();
        if files.is_empty() {
            bail!("No files to checkpoint");
        }

        let archive_path = checkpoint_dir.join(ARCHIVE_NAME);
        let file = File::create(&archive_path)
            .with_context(|| format!("creating {}", archive_path.display()))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut total_size = 0u64;
        for path in &files {
            let rel = path
                .strip_prefix(&self.project_root)
                .context("file outside project root")?;
            builder
                .append_path_with_name(path, rel)
                .with_context(|| format!("archiving {}", rel.display()))?;
            total_size += fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        }
        builder
            .into_inner()
            .context("finishing archive")?
            .finish()
            .context("flushing gzip stream")?;

        // Metadata last: its presence is what marks the checkpoint complete.
        let metadata = CheckpointMetadata {
            name: name.to_string(),
            timestamp: timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            description: description.to_string(),
            file_count: files.len() as u64,
            total_size,
            session_id: session_id.map(|s| s.to_string()),
            has_transcript: false,
            transcript: None,
        };
        self.write_metadata(checkpoint_dir, &metadata)?;

        Ok(CreateOutcome {
            name: name.to_string(),
            file_count: files.len() as u64,
        })
    }

    /// Files to archive, with ignored directories pruned before descent.
    fn collect_files(&self) -> Vec<PathBuf> {
        let root = self.project_root.clone();
        let ignore = self.ignore.clone();
        WalkDir::new(&self.project_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let rel = match entry.path().strip_prefix(&root) {
                    Ok(rel) => rel,
                    Err(_) => return true,
                };
                if rel.as_os_str().is_empty() {
                    return true;
                }
                !ignore.should_ignore(&rel.to_string_lossy().replace('\\', "/"))
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_path_buf())
            .collect()
    }

    /// Restore a checkpoint's files over the working tree.
    ///
    /// Not a mirror: files present in the workspace but absent from the
    /// archive are left alone. With `backup`, a safety checkpoint is taken
    /// first and its failure aborts the restore.
    pub fn restore(&self, name: &str, backup: bool) -> Result<u64> {
        let checkpoint_dir = self.storage_dir.join(name);
        let archive_path = checkpoint_dir.join(ARCHIVE_NAME);
        if !archive_path.exists() {
            bail!("Checkpoint not found: {name}");
        }

        if backup {
            self.create(&format!("Backup before restore to {name}"), None)
                .context("Failed to create backup")?;
        }

        let tmp_root = std::env::temp_dir().join(format!("rewind-extract-{}", Uuid::new_v4()));
        ensure_dir(&tmp_root)?;
        let result = self.extract_and_copy(&archive_path, &tmp_root);
        let _ = fs::remove_dir_all(&tmp_root);
        result
    }

    fn extract_and_copy(&self, archive_path: &Path, tmp_root: &Path) -> Result<u64> {
        let file = File::open(archive_path)
            .with_context(|| format!("opening {}", archive_path.display()))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_mtime(true);

        for entry in archive.entries().context("reading archive")? {
            let mut entry = entry.context("reading archive entry")?;
            let entry_path = entry.path().context("decoding entry path")?.into_owned();

            if entry_path.is_absolute()
                || entry_path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                bail!("archive entry escapes extraction root: {}", entry_path.display());
            }

            // Only plain files and directories come out of our own archives;
            // links, devices and fifos in a tampered archive are dropped.
            let kind = entry.header().entry_type();
            if !kind.is_file() && !kind.is_dir() {
                continue;
            }

            entry
                .unpack_in(tmp_root)
                .with_context(|| format!("extracting {}", entry_path.display()))?;
        }

        let mut file_count = 0u64;
        for entry in WalkDir::new(tmp_root).follow_links(false) {
            let entry = entry.context("walking extracted tree")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(tmp_root)
                .context("file outside extraction root")?;
            let dst = self.project_root.join(rel);
            if let Some(parent) = dst.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &dst)
                .with_context(|| format!("restoring {}", rel.display()))?;
            copy_mtime(entry.path(), &dst);
            file_count += 1;
        }

        Ok(file_count)
    }

    /// All checkpoints, newest first. Directories with unreadable metadata
    /// yield a minimal record named after the directory.
    pub fn list(&self) -> Vec<CheckpointMetadata> {
        let mut checkpoints = Vec::new();

        let Ok(entries) = fs::read_dir(&self.storage_dir) else {
            return checkpoints;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata_path = path.join(METADATA_NAME);
            if !metadata_path.exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = fs::read_to_string(&metadata_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<CheckpointMetadata>(&raw).ok())
                .unwrap_or_else(|| CheckpointMetadata::minimal(&name));
            checkpoints.push(metadata);
        }

        checkpoints.sort_by(|a, b| b.name.cmp(&a.name));
        checkpoints
    }

    pub fn get(&self, name: &str) -> Option<CheckpointMetadata> {
        let metadata_path = self.storage_dir.join(name).join(METADATA_NAME);
        let raw = fs::read_to_string(metadata_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Returns whether the directory existed.
    pub fn delete(&self, name: &str) -> bool {
        let checkpoint_dir = self.storage_dir.join(name);
        if !checkpoint_dir.exists() {
            return false;
        }
        fs::remove_dir_all(&checkpoint_dir).is_ok()
    }

    /// Keep the `keep` newest checkpoints, delete the rest.
    pub fn prune(&self, keep: usize) -> usize {
        let checkpoints = self.list();
        if checkpoints.len() <= keep {
            return 0;
        }
        checkpoints[keep..]
            .iter()
            .filter(|cp| self.delete(&cp.name))
            .count()
    }

    /// Read-modify-write of a checkpoint's metadata.
    pub fn update_metadata(
        &self,
        name: &str,
        update: impl FnOnce(&mut CheckpointMetadata),
    ) -> Result<()> {
        let mut metadata = self
            .get(name)
            .with_context(|| format!("checkpoint metadata not found: {name}"))?;
        update(&mut metadata);
        self.write_metadata(&self.storage_dir.join(name), &metadata)
    }

    fn write_metadata(&self, checkpoint_dir: &Path, metadata: &CheckpointMetadata) -> Result<()> {
        let value = serde_json::to_value(metadata).context("serializing metadata")?;
        write_json_pretty(&checkpoint_dir.join(METADATA_NAME), &value)
    }
}

fn copy_mtime(src: &Path, dst: &Path) {
    let Ok(modified) = fs::metadata(src).and_then(|m| m.modified()) else {
        return;
    };
    if let Ok(file) = File::options().write(true).open(dst) {
        let _ = file.set_modified(modified);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_project(dir: &Path) -> PathBuf {
        let project = dir.join("project");
        fs::create_dir_all(project.join("src")).expect("mkdir src");
        fs::write(project.join("app.py"), "print('hello')").expect("write app.py");
        fs::write(project.join("README.md"), "# Test").expect("write README");
        fs::write(project.join("src/main.py"), "def main(): pass").expect("write main.py");
        fs::create_dir_all(project.join("node_modules")).expect("mkdir node_modules");
        fs::write(project.join("node_modules/pkg.js"), "ignored").expect("write pkg.js");
        fs::create_dir_all(project.join(".git")).expect("mkdir .git");
        fs::write(project.join(".git/config"), "ignored").expect("write git config");
        project
    }

    fn test_store(dir: &Path) -> CheckpointStore {
        let project = seeded_project(dir);
        CheckpointStore::new(dir.join("storage"), project, IgnoreConfig::default())
            .expect("store")
    }

    #[test]
    fn create_archives_non_ignored_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        let outcome = store.create("Test checkpoint", None).expect("create");
        assert!(!outcome.name.is_empty());
        assert_eq!(outcome.file_count, 3);

        let meta = store.get(&outcome.name).expect("metadata");
        assert_eq!(meta.description, "Test checkpoint");
        assert_eq!(meta.file_count, 3);
        assert!(meta.total_size > 0);
        assert!(!meta.has_transcript);
    }

    #[test]
    fn rapid_creates_get_distinct_sorted_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        let a = store.create("first", None).expect("create a");
        let b = store.create("second", None).expect("create b");
        let c = store.create("third", None).expect("create c");
        assert!(a.name < b.name);
        assert!(b.name < c.name);
    }

    #[test]
    fn list_is_newest_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        store.create("First", None).expect("create");
        store.create("Second", None).expect("create");

        let checkpoints = store.list();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].description, "Second");
        assert_eq!(checkpoints[1].description, "First");
    }

    #[test]
    fn restore_round_trip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        let project = dir.path().join("project");

        let outcome = store.create("Before change", None).expect("create");
        fs::write(project.join("app.py"), "print('changed')").expect("mutate");

        let restored = store.restore(&outcome.name, false).expect("restore");
        assert_eq!(restored, 3);
        assert_eq!(
            fs::read_to_string(project.join("app.py")).expect("read"),
            "print('hello')"
        );
    }

    #[test]
    fn restore_does_not_delete_extra_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        let project = dir.path().join("project");

        let outcome = store.create("base", None).expect("create");
        fs::write(project.join("extra.txt"), "kept").expect("write extra");

        store.restore(&outcome.name, false).expect("restore");
        assert!(project.join("extra.txt").exists());
    }

    #[test]
    fn restore_with_backup_creates_checkpoint_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        let outcome = store.create("base", None).expect("create");
        store.restore(&outcome.name, true).expect("restore");

        let checkpoints = store.list();
        assert_eq!(checkpoints.len(), 2);
        assert!(checkpoints[0]
            .description
            .starts_with("Backup before restore to "));
    }

    #[test]
    fn restore_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        let err = store.restore("19990101_000000_000", false).unwrap_err();
        assert!(err.to_string().contains("Checkpoint not found"));
    }

    #[cfg(unix)]
    #[test]
    fn restore_preserves_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        let project = dir.path().join("project");

        let script = project.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let outcome = store.create("exec bit", None).expect("create");
        fs::remove_file(&script).expect("remove");

        store.restore(&outcome.name, false).expect("restore");
        let mode = fs::metadata(&script).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn restore_preserves_mtime_best_effort() {
        use filetime::FileTime;

        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        let project = dir.path().join("project");

        let stamp = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(project.join("app.py"), stamp).expect("set mtime");

        let outcome = store.create("mtime", None).expect("create");
        fs::remove_file(project.join("app.py")).expect("remove");

        store.restore(&outcome.name, false).expect("restore");
        let restored = FileTime::from_last_modification_time(
            &fs::metadata(project.join("app.py")).expect("stat"),
        );
        assert_eq!(restored.unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn restore_rejects_escaping_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        // Hand-build a checkpoint whose archive tries to climb out of the
        // extraction root.
        let name = "20990101_000000_000";
        let cp_dir = dir.path().join("storage").join(name);
        fs::create_dir_all(&cp_dir).expect("mkdir");

        let file = File::create(cp_dir.join(ARCHIVE_NAME)).expect("create archive");
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"evil";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        let path = b"sub/../../escape.txt";
        header.as_old_mut().name[..path.len()].copy_from_slice(path);
        header.set_cksum();
        builder.append(&header, &data[..]).expect("append");
        builder.into_inner().expect("finish").finish().expect("flush");

        let err = store.restore(name, false).unwrap_err();
        assert!(err.to_string().contains("escapes extraction root"));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn restore_skips_link_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        let project = dir.path().join("project");

        let name = "20990101_000000_001";
        let cp_dir = dir.path().join("storage").join(name);
        fs::create_dir_all(&cp_dir).expect("mkdir");

        let file = File::create(cp_dir.join(ARCHIVE_NAME)).expect("create archive");
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        link.set_cksum();
        builder
            .append_link(&mut link, "evil-link", "/etc/passwd")
            .expect("append link");

        let data = b"ok";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "safe.txt", &data[..])
            .expect("append file");
        builder.into_inner().expect("finish").finish().expect("flush");

        let restored = store.restore(name, false).expect("restore");
        assert_eq!(restored, 1);
        assert_eq!(
            fs::read_to_string(project.join("safe.txt")).expect("read"),
            "ok"
        );
        assert!(!project.join("evil-link").exists());
    }

    #[test]
    fn delete_removes_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        let outcome = store.create("To delete", None).expect("create");
        assert_eq!(store.list().len(), 1);

        assert!(store.delete(&outcome.name));
        assert!(store.list().is_empty());
        assert!(!store.delete(&outcome.name));
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        let mut names = Vec::new();
        for i in 0..5 {
            names.push(store.create(&format!("Checkpoint {i}"), None).expect("create").name);
        }

        let deleted = store.prune(2);
        assert_eq!(deleted, 3);

        let remaining: Vec<String> = store.list().into_iter().map(|cp| cp.name).collect();
        names.reverse();
        assert_eq!(remaining, names[..2].to_vec());
    }

    #[test]
    fn prune_noop_when_under_limit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        store.create("only", None).expect("create");
        assert_eq!(store.prune(10), 0);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn corrupt_metadata_yields_minimal_record() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        let outcome = store.create("ok", None).expect("create");
        let metadata_path = dir
            .path()
            .join("storage")
            .join(&outcome.name)
            .join(METADATA_NAME);
        fs::write(&metadata_path, "{ not json").expect("corrupt");

        let checkpoints = store.list();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].name, outcome.name);
        assert_eq!(checkpoints[0].timestamp, outcome.name);
        assert_eq!(checkpoints[0].file_count, 0);
    }

    #[test]
    fn directories_without_metadata_are_not_listed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());
        fs::create_dir_all(dir.path().join("storage/20990101_000000_000")).expect("mkdir");
        assert!(store.list().is_empty());
    }

    #[test]
    fn empty_project_fails_with_no_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let project = dir.path().join("empty");
        fs::create_dir_all(&project).expect("mkdir");
        let store = CheckpointStore::new(
            dir.path().join("storage"),
            project,
            IgnoreConfig::default(),
        )
        .expect("store");

        let err = store.create("nothing", None).unwrap_err();
        assert!(err.to_string().contains("No files to checkpoint"));
        // Failed creation rolls back its directory.
        assert_eq!(fs::read_dir(dir.path().join("storage")).expect("read").count(), 0);
    }

    #[test]
    fn update_metadata_merges_fields() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = test_store(dir.path());

        let outcome = store.create("base", None).expect("create");
        store
            .update_metadata(&outcome.name, |meta| {
                meta.has_transcript = true;
            })
            .expect("update");

        let meta = store.get(&outcome.name).expect("get");
        assert!(meta.has_transcript);
        assert_eq!(meta.description, "base");
    }
}
