use crate::config::{RewindConfig, StorageMode};
use crate::fmt::debug_log;
use crate::fsutil::{atomic_write, ensure_dir, safe_json_load};
use crate::paths;
use crate::store::{CheckpointMetadata, CheckpointStore, ARCHIVE_NAME, METADATA_NAME};
use crate::transcript::TranscriptManager;
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    All,
    Code,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRestoreMode {
    Fork,
    InPlace,
}

/// Advisory per-project session record, written by the hook dispatcher and
/// read back to resolve the current transcript.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionInfo {
    pub version: u32,
    pub transcript_path: String,
    pub session_id: String,
    pub agent: String,
    pub project_root: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOutcome {
    pub name: String,
    pub file_count: u64,
    pub has_transcript: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub name: String,
    pub code_restored: bool,
    pub file_count: u64,
    pub context_requested: bool,
    pub context_restored: bool,
    pub fork_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindBackOutcome {
    pub n: usize,
    pub prompts: Vec<String>,
    pub boundary_offset: u64,
    pub code_restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_checkpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub fork_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_session_id: Option<String>,
    pub chat_rewritten: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoOutcome {
    pub restore: RestoreOutcome,
    pub deleted_checkpoint: String,
}

#[derive(Debug, Clone)]
pub struct RewindStatus {
    pub initialized: bool,
    pub storage_mode: String,
    pub checkpoint_count: usize,
    pub latest_checkpoint: Option<String>,
    pub project_root: String,
    pub rewind_dir: String,
    pub tier: String,
    pub agent: String,
}

#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// The single orchestration surface: binds the checkpoint store and the
/// transcript manager, owns session.json and restore-history.json.
pub struct RewindController {
    project_root: PathBuf,
    config: RewindConfig,
    transcripts: TranscriptManager,
}

impl RewindController {
    pub fn new(project_root: PathBuf) -> RewindController {
        let config = RewindConfig::load(&project_root);
        RewindController {
            project_root,
            config,
            transcripts: TranscriptManager::new(),
        }
    }

    pub fn rewind_dir(&self) -> PathBuf {
        match self.config.storage_mode {
            StorageMode::Global => paths::global_rewind_dir(),
            StorageMode::Project => paths::project_rewind_dir(&self.project_root),
        }
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        match self.config.storage_mode {
            StorageMode::Global => paths::global_storage_dir()
                .join(paths::project_hash(&self.project_root))
                .join("checkpoints"),
            StorageMode::Project => self.rewind_dir().join("checkpoints"),
        }
    }

    fn store(&self) -> Result<CheckpointStore> {
        CheckpointStore::new(
            self.checkpoints_dir(),
            self.project_root.clone(),
            self.config.ignore.clone(),
        )
    }

    pub fn session_file(&self) -> PathBuf {
        self.rewind_dir().join("session.json")
    }

    pub fn load_session_info(&self) -> Option<SessionInfo> {
        let value = safe_json_load(&self.session_file())?;
        serde_json::from_value(value).ok()
    }

    /// Best-effort: session info is advisory, a failed write never fails
    /// the operation that triggered it.
    pub fn save_session_info(
        &self,
        transcript_path: Option<&str>,
        session_id: Option<&str>,
        agent: Option<&str>,
        env_file: Option<&str>,
    ) {
        let info = SessionInfo {
            version: 1,
            transcript_path: transcript_path.unwrap_or("").to_string(),
            session_id: session_id.unwrap_or("").to_string(),
            agent: agent.unwrap_or("unknown").to_string(),
            project_root: self.project_root.to_string_lossy().into_owned(),
            updated_at: now_iso(),
            env_file: env_file.map(|s| s.to_string()),
        };
        let Ok(body) = serde_json::to_string_pretty(&info) else {
            return;
        };
        if let Err(e) = atomic_write(&self.session_file(), body.as_bytes()) {
            debug_log(&format!("session info write failed: {e}"));
        }
    }

    /// Initialize the rewind directories, optionally pinning a storage mode.
    pub fn init(&mut self, mode: Option<StorageMode>) -> Result<(PathBuf, String)> {
        let rewind_dir = self.rewind_dir();
        ensure_dir(&rewind_dir)?;

        if let Some(mode) = mode {
            self.config.storage_mode = mode;
            self.config.save(&self.project_root, "project")?;
            self.config = RewindConfig::load(&self.project_root);
        }

        ensure_dir(&self.checkpoints_dir())?;
        Ok((rewind_dir, self.config.storage_mode.as_str().to_string()))
    }

    /// Create a checkpoint: archive the tree, then attach a transcript
    /// snapshot when a transcript can be resolved. A transcript failure
    /// downgrades to `has_transcript = false` instead of failing the
    /// checkpoint.
    pub fn create_checkpoint(
        &self,
        description: &str,
        session_id: Option<&str>,
        transcript_path: Option<&str>,
    ) -> Result<CheckpointOutcome> {
        ensure_dir(&self.rewind_dir())?;
        let store = self.store()?;

        let created = store.create(description, session_id)?;
        let checkpoint_dir = store.checkpoint_dir(&created.name);

        let session_info = self.load_session_info();
        let effective_path = transcript_path
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                session_info
                    .as_ref()
                    .map(|info| info.transcript_path.clone())
                    .filter(|s| !s.is_empty())
            });

        let mut has_transcript = false;
        if let Some(path) = effective_path {
            let tp = paths::expand_user(&path);
            if tp.exists() {
                let agent_hint = session_info
                    .as_ref()
                    .map(|info| info.agent.as_str())
                    .filter(|a| !a.is_empty() && *a != "unknown");
                match self
                    .transcripts
                    .snapshot_into_checkpoint(&tp, &checkpoint_dir, agent_hint)
                {
                    Ok(snapshot) => {
                        has_transcript = true;
                        store.update_metadata(&created.name, |meta| {
                            meta.has_transcript = true;
                            meta.transcript = Some(snapshot);
                        })?;
                    }
                    Err(e) => {
                        debug_log(&format!("transcript snapshot skipped: {e}"));
                    }
                }
            }
        }

        Ok(CheckpointOutcome {
            name: created.name,
            file_count: created.file_count,
            has_transcript,
        })
    }

    /// Restore code and/or conversation context from a checkpoint.
    ///
    /// Code errors abort the operation; context errors ride along as
    /// `context_error` next to an otherwise successful result.
    pub fn restore(
        &self,
        name: &str,
        mode: RestoreMode,
        skip_backup: bool,
        transcript_restore: TranscriptRestoreMode,
    ) -> Result<RestoreOutcome> {
        let checkpoint_dir = self.checkpoints_dir().join(name);
        if !checkpoint_dir.exists() {
            bail!("Checkpoint not found: {name}");
        }

        let mut outcome = RestoreOutcome {
            name: name.to_string(),
            ..RestoreOutcome::default()
        };

        if matches!(mode, RestoreMode::All | RestoreMode::Code) {
            let store = self.store()?;
            outcome.file_count = store.restore(name, !skip_backup)?;
            outcome.code_restored = true;
        }

        if matches!(mode, RestoreMode::All | RestoreMode::Context) {
            outcome.context_requested = true;
            self.restore_transcript(&checkpoint_dir, transcript_restore, &mut outcome);
        }

        Ok(outcome)
    }

    fn restore_transcript(
        &self,
        checkpoint_dir: &Path,
        transcript_restore: TranscriptRestoreMode,
        outcome: &mut RestoreOutcome,
    ) {
        let name = checkpoint_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Ok(store) = self.store() else { return };
        let Some(meta) = store.get(&name) else { return };
        let Some(snapshot) = meta.transcript else { return };

        // Prefer the live session's transcript; fall back to where the
        // snapshot came from.
        let current_path = self
            .load_session_info()
            .map(|info| info.transcript_path)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| snapshot.original_path.clone());
        if current_path.is_empty() {
            return;
        }
        let current = paths::expand_user(&current_path);

        let snapshot_gz = checkpoint_dir.join(&snapshot.snapshot);
        let snapshot_gz = snapshot_gz.exists().then_some(snapshot_gz);
        let agent = Some(snapshot.agent.as_str()).filter(|a| !a.is_empty() && *a != "unknown");

        match transcript_restore {
            TranscriptRestoreMode::Fork => {
                match self.transcripts.create_fork_session(
                    &snapshot.cursor,
                    snapshot_gz.as_deref(),
                    &current,
                    None,
                    agent,
                ) {
                    Ok(fork_path) => {
                        self.append_restore_history(serde_json::json!({
                            "timestamp": now_iso(),
                            "checkpoint": name,
                            "transcript": {
                                "mode": "fork",
                                "original": current.to_string_lossy(),
                                "fork": fork_path.to_string_lossy(),
                            },
                        }));
                        outcome.context_restored = true;
                        outcome.fork_created = true;
                        outcome.fork_path = Some(fork_path.to_string_lossy().into_owned());
                    }
                    Err(e) => outcome.context_error = Some(e.to_string()),
                }
            }
            TranscriptRestoreMode::InPlace => {
                match self.restore_transcript_in_place(&snapshot.cursor, snapshot_gz.as_deref(), &current)
                {
                    Ok(()) => {
                        self.append_restore_history(serde_json::json!({
                            "timestamp": now_iso(),
                            "checkpoint": name,
                            "transcript": {
                                "mode": "in_place",
                                "path": current.to_string_lossy(),
                            },
                        }));
                        outcome.context_restored = true;
                    }
                    Err(e) => outcome.context_error = Some(e.to_string()),
                }
            }
        }
    }

    fn restore_transcript_in_place(
        &self,
        cursor: &crate::transcript::TranscriptCursor,
        snapshot_gz: Option<&Path>,
        current: &Path,
    ) -> Result<()> {
        // Safety copy of whatever is live right now.
        let backup_dir = self.rewind_dir().join("transcript-backup");
        ensure_dir(&backup_dir)?;
        if current.exists() {
            let backup_path =
                backup_dir.join(format!("{}.jsonl", chrono::Local::now().format("%Y%m%d_%H%M%S")));
            if let Err(e) = fs::copy(current, &backup_path) {
                debug_log(&format!("transcript backup failed: {e}"));
            }
        }

        if current.exists() && self.transcripts.prefix_matches(current, &cursor.prefix_sha256) {
            let file = OpenOptions::new()
                .write(true)
                .open(current)
                .with_context(|| format!("opening {}", current.display()))?;
            file.set_len(cursor.byte_offset_end)
                .with_context(|| format!("truncating {}", current.display()))?;
            return Ok(());
        }

        let Some(gz) = snapshot_gz else {
            bail!("No checkpoint transcript snapshot available");
        };
        crate::transcript::inflate_gz(gz, current)
    }

    /// Rewind by the last `n` user prompts.
    pub fn rewind_back(&self, n: usize, both: bool, in_place: bool) -> Result<RewindBackOutcome> {
        if n == 0 {
            bail!("n must be >= 1");
        }

        let session_info = self.load_session_info();
        let transcript_path = std::env::var("REWIND_TRANSCRIPT_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                session_info
                    .as_ref()
                    .map(|info| info.transcript_path.clone())
                    .filter(|s| !s.is_empty())
            });

        let Some(transcript_path) = transcript_path else {
            bail!(
                "No transcript path available (run inside an agent session or ensure hooks wrote session.json)"
            );
        };

        let agent = session_info
            .as_ref()
            .map(|info| info.agent.clone())
            .filter(|a| !a.is_empty() && a != "unknown");

        let tp = paths::expand_user(&transcript_path);
        if !tp.exists() {
            bail!("Transcript not found: {}", tp.display());
        }

        let boundary = self.transcripts.find_boundary_by_user_prompts(&tp, n)?;

        let mut outcome = RewindBackOutcome {
            n,
            prompts: boundary.prompts,
            boundary_offset: boundary.boundary_offset,
            code_restored: false,
            code_checkpoint: None,
            note: None,
            fork_created: false,
            fork_path: None,
            fork_session_id: None,
            chat_rewritten: false,
            backup_path: None,
        };

        if both {
            let checkpoints = self.list_checkpoints();
            match select_checkpoint_for_boundary(
                &checkpoints,
                &tp.to_string_lossy(),
                boundary.boundary_offset,
            ) {
                Some(checkpoint) => {
                    let name = checkpoint.name.clone();
                    self.restore(&name, RestoreMode::Code, false, TranscriptRestoreMode::Fork)
                        .context("Failed to restore code")?;
                    outcome.code_restored = true;
                    outcome.code_checkpoint = Some(name);
                }
                None => {
                    outcome.note = Some(
                        "No code checkpoint matched this rewind boundary; created chat rewind only"
                            .to_string(),
                    );
                }
            }
        }

        if in_place {
            let backup_dir = self.rewind_dir().join("transcript-backup");
            let backup_path = self.transcripts.rewrite_in_place_at_offset(
                &tp,
                boundary.boundary_offset,
                &backup_dir,
            )?;
            outcome.chat_rewritten = true;
            outcome.backup_path = Some(backup_path.to_string_lossy().into_owned());
            return Ok(outcome);
        }

        let fork_path =
            self.transcripts
                .create_fork_at_offset(&tp, boundary.boundary_offset, None, agent.as_deref())?;
        outcome.fork_created = true;
        outcome.fork_session_id = fork_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
        outcome.fork_path = Some(fork_path.to_string_lossy().into_owned());
        Ok(outcome)
    }

    /// Restore the second-newest checkpoint and drop the newest.
    pub fn undo(&self) -> Result<UndoOutcome> {
        let checkpoints = self.list_checkpoints();
        if checkpoints.len() < 2 {
            bail!("Not enough checkpoints to undo");
        }

        let previous = &checkpoints[1];
        let restore = self.restore(
            &previous.name,
            RestoreMode::All,
            true,
            TranscriptRestoreMode::Fork,
        )?;

        let newest = checkpoints[0].name.clone();
        self.store()?.delete(&newest);

        Ok(UndoOutcome {
            restore,
            deleted_checkpoint: newest,
        })
    }

    pub fn list_checkpoints(&self) -> Vec<CheckpointMetadata> {
        match self.store() {
            Ok(store) => store.list(),
            Err(_) => Vec::new(),
        }
    }

    pub fn prune(&self, keep: usize) -> Result<usize> {
        Ok(self.store()?.prune(keep))
    }

    pub fn get_status(&self) -> RewindStatus {
        let rewind_dir = self.rewind_dir();
        let initialized = rewind_dir.exists();

        let checkpoints = if initialized {
            self.list_checkpoints()
        } else {
            Vec::new()
        };

        let agent = self
            .load_session_info()
            .map(|info| info.agent)
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        RewindStatus {
            initialized,
            storage_mode: self.config.storage_mode.as_str().to_string(),
            checkpoint_count: checkpoints.len(),
            latest_checkpoint: checkpoints.first().map(|cp| cp.name.clone()),
            project_root: self.project_root.to_string_lossy().into_owned(),
            rewind_dir: rewind_dir.to_string_lossy().into_owned(),
            tier: self.config.tier.tier.clone(),
            agent,
        }
    }

    /// Structural health check: missing directories, checkpoints without
    /// archives, archive-only orphans left behind by killed processes.
    pub fn validate_system(&self) -> Validation {
        let mut issues = Vec::new();

        let rewind_dir = self.rewind_dir();
        if !rewind_dir.exists() {
            issues.push("Rewind not initialized (run 'rewind init')".to_string());
        }

        let checkpoints_dir = self.checkpoints_dir();
        if !checkpoints_dir.exists() {
            issues.push("Checkpoints directory missing".to_string());
        } else {
            if let Ok(entries) = fs::read_dir(&checkpoints_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let has_archive = path.join(ARCHIVE_NAME).exists();
                    let has_metadata = path.join(METADATA_NAME).exists();
                    if has_metadata && !has_archive {
                        issues.push(format!("Checkpoint {name} missing archive"));
                    } else if has_archive && !has_metadata {
                        issues.push(format!("Checkpoint {name} is an orphan (no metadata)"));
                    }
                }
            }
        }

        Validation {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Best-effort append to the restore history log. The exclusive lock
    /// serializes concurrent appends; a failed write is only logged.
    fn append_restore_history(&self, entry: Value) {
        let path = self.rewind_dir().join("restore-history.json");
        if let Err(e) = append_history_entry(&path, entry) {
            debug_log(&format!("restore history write failed: {e}"));
        }
    }
}

fn append_history_entry(path: &Path, entry: Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.lock_exclusive().context("locking restore history")?;

    let mut content = String::new();
    file.read_to_string(&mut content).context("reading restore history")?;
    let mut history: Vec<Value> = serde_json::from_str(&content).unwrap_or_default();
    history.push(entry);

    let body = serde_json::to_string_pretty(&history).context("serializing restore history")?;
    file.seek(SeekFrom::Start(0)).context("rewinding restore history")?;
    file.set_len(0).context("truncating restore history")?;
    file.write_all(body.as_bytes()).context("writing restore history")?;
    let _ = file.unlock();
    Ok(())
}

/// Pick the newest checkpoint for the same transcript whose cursor sits
/// at-or-before the boundary. `checkpoints` must be newest-first.
pub fn select_checkpoint_for_boundary<'a>(
    checkpoints: &'a [CheckpointMetadata],
    transcript_path: &str,
    boundary_offset: u64,
) -> Option<&'a CheckpointMetadata> {
    let wanted = paths::expand_user(transcript_path);

    checkpoints.iter().find(|cp| {
        let Some(snapshot) = &cp.transcript else {
            return false;
        };
        if snapshot.original_path.is_empty() {
            return false;
        }
        if paths::expand_user(&snapshot.original_path) != wanted {
            return false;
        }
        snapshot.cursor.byte_offset_end <= boundary_offset
    })
}

fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}
