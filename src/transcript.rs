use crate::agents::AgentRegistry;
use crate::fsutil::ensure_dir;
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const PREFIX_HASH_BYTES: u64 = 64 * 1024;
const TAIL_HASH_BYTES: u64 = 64 * 1024;
const NEWLINE_SCAN_CHUNK: u64 = 64 * 1024;
const BOUNDARY_SCAN_CHUNK: u64 = 128 * 1024;
const COPY_CHUNK: usize = 1024 * 1024;
const TITLE_SCAN_LINES: usize = 50;

pub const FORK_TITLE_PREFIX: &str = "[Fork] ";

/// Byte-precise identification of a transcript state.
///
/// `byte_offset_end` points just past the last complete newline-terminated
/// record; the prefix/tail hashes cover the first and last 64 KiB and let a
/// later fork decide whether the live file still shares this history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TranscriptCursor {
    pub byte_offset_end: u64,
    pub last_event_id: Option<String>,
    pub prefix_sha256: String,
    pub tail_sha256: String,
}

/// What a checkpoint records about the transcript it snapshotted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSnapshot {
    pub agent: String,
    pub original_path: String,
    /// Relative filename of the gzip snapshot inside the checkpoint dir.
    pub snapshot: String,
    pub cursor: TranscriptCursor,
}

pub const SNAPSHOT_NAME: &str = "transcript.jsonl.gz";

#[derive(Debug, Clone)]
pub struct BoundaryResult {
    /// Byte offset of the first byte of the Nth-most-recent user line.
    pub boundary_offset: u64,
    /// Extracted prompt texts, chronological.
    pub prompts: Vec<String>,
}

/// Streaming transcript primitives: cursor computation, snapshot capture,
/// prompt-boundary search and fork creation. Owns no persistent state.
pub struct TranscriptManager {
    registry: AgentRegistry,
}

impl Default for TranscriptManager {
    fn default() -> Self {
        TranscriptManager::new()
    }
}

impl TranscriptManager {
    pub fn new() -> Self {
        TranscriptManager {
            registry: AgentRegistry::bundled(),
        }
    }

    /// Best-effort agent detection from the transcript location, falling
    /// back to sniffing id fields in the first lines.
    pub fn detect_agent(&self, transcript_path: &Path) -> String {
        let path_str = transcript_path.to_string_lossy();

        for profile in self.registry.all() {
            for pattern in profile.path_regexes() {
                if let Ok(re) = regex::Regex::new(&pattern) {
                    if re.is_match(&path_str) {
                        return profile.id.clone();
                    }
                }
            }
        }

        if let Ok(file) = File::open(transcript_path) {
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(|l| l.ok()).take(20) {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(obj) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                let Some(map) = obj.as_object() else { continue };
                if map.contains_key("uuid") || map.contains_key("parentUuid") {
                    return "claude".to_string();
                }
                if map.contains_key("id") || map.contains_key("parentId") {
                    return "droid".to_string();
                }
            }
        }

        "unknown".to_string()
    }

    /// Compute the cursor for a transcript. Deterministic for an unchanged
    /// file.
    pub fn compute_cursor(
        &self,
        transcript_path: &Path,
        id_fields: Option<&[String]>,
    ) -> Result<TranscriptCursor> {
        let size = fs::metadata(transcript_path)
            .with_context(|| format!("unable to stat transcript {}", transcript_path.display()))?
            .len();

        let prefix_sha256 = hash_prefix(transcript_path)?;
        let tail_sha256 = hash_tail(transcript_path, size)?;

        if size == 0 {
            return Ok(TranscriptCursor {
                byte_offset_end: 0,
                last_event_id: None,
                prefix_sha256,
                tail_sha256,
            });
        }

        let mut file = File::open(transcript_path)
            .with_context(|| format!("unable to read transcript {}", transcript_path.display()))?;
        let byte_offset_end = find_last_complete_line_end(&mut file, size)?;

        let default_fields = ["uuid".to_string(), "id".to_string()];
        let fields = id_fields.unwrap_or(&default_fields);
        let last_event_id = read_last_event_id(&mut file, byte_offset_end, fields)?;

        Ok(TranscriptCursor {
            byte_offset_end,
            last_event_id,
            prefix_sha256,
            tail_sha256,
        })
    }

    /// Capture the transcript into `<checkpoint_dir>/transcript.jsonl.gz`
    /// together with its cursor.
    pub fn snapshot_into_checkpoint(
        &self,
        transcript_path: &Path,
        checkpoint_dir: &Path,
        agent_hint: Option<&str>,
    ) -> Result<TranscriptSnapshot> {
        let agent = match agent_hint {
            Some(hint) if !hint.is_empty() => hint.to_string(),
            _ => self.detect_agent(transcript_path),
        };
        let id_fields = self
            .registry
            .get(&agent)
            .and_then(|profile| profile.last_event_id_fields());

        let cursor = self.compute_cursor(transcript_path, id_fields.as_deref())?;

        ensure_dir(checkpoint_dir)?;
        let snapshot_path = checkpoint_dir.join(SNAPSHOT_NAME);
        deflate_into(transcript_path, &snapshot_path)
            .with_context(|| format!("failed to snapshot {}", transcript_path.display()))?;

        Ok(TranscriptSnapshot {
            agent,
            original_path: transcript_path.to_string_lossy().into_owned(),
            snapshot: SNAPSHOT_NAME.to_string(),
            cursor,
        })
    }

    /// Find the rewind boundary by counting the last `n` user prompts.
    ///
    /// Scans backward in 128 KiB chunks so multi-gigabyte transcripts never
    /// load into memory. Blank lines, non-object lines and malformed JSON
    /// are skipped; CRLF line endings are tolerated.
    pub fn find_boundary_by_user_prompts(
        &self,
        transcript_path: &Path,
        n: usize,
    ) -> Result<BoundaryResult> {
        if n == 0 {
            bail!("n must be >= 1");
        }

        let size = fs::metadata(transcript_path)
            .with_context(|| format!("unable to stat transcript {}", transcript_path.display()))?
            .len();
        if size == 0 {
            bail!("Transcript is empty");
        }

        let mut file = File::open(transcript_path)
            .with_context(|| format!("unable to read transcript {}", transcript_path.display()))?;

        let mut prompts_newest_first: Vec<String> = Vec::new();
        let mut boundary_offset: Option<u64> = None;

        let mut buf: Vec<u8> = Vec::new();
        let mut buf_start_offset = size;
        let mut end_offset = size;

        let mut consume_line = |line: &[u8], line_start: u64| {
            let line = trim_cr(line);
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                return None;
            }
            let Ok(obj) = serde_json::from_slice::<Value>(line) else {
                return None;
            };
            if !is_user_message(&obj) {
                return None;
            }
            prompts_newest_first.push(extract_prompt_text(&obj));
            if prompts_newest_first.len() == n {
                return Some(line_start);
            }
            None
        };

        while end_offset > 0 && boundary_offset.is_none() {
            let start_offset = end_offset.saturating_sub(BOUNDARY_SCAN_CHUNK);
            let read_size = (end_offset - start_offset) as usize;
            file.seek(SeekFrom::Start(start_offset)).context("seeking transcript")?;
            let mut chunk = vec![0u8; read_size];
            file.read_exact(&mut chunk).context("reading transcript chunk")?;

            chunk.extend_from_slice(&buf);
            buf = chunk;
            buf_start_offset = start_offset;
            end_offset = start_offset;

            // Split off trailing lines while the buffer still holds newlines.
            while boundary_offset.is_none() {
                let Some(idx) = buf.iter().rposition(|b| *b == b'\n') else {
                    break;
                };
                let line_start = buf_start_offset + idx as u64 + 1;
                let line = buf.split_off(idx + 1);
                buf.pop(); // the newline itself
                boundary_offset = consume_line(&line, line_start);
            }
        }

        if boundary_offset.is_none() && !buf.is_empty() {
            boundary_offset = consume_line(&buf, buf_start_offset);
        }

        let Some(boundary_offset) = boundary_offset else {
            bail!(
                "Not enough user prompts (requested {n}, found {})",
                prompts_newest_first.len()
            );
        };

        prompts_newest_first.reverse();
        Ok(BoundaryResult {
            boundary_offset,
            prompts: prompts_newest_first,
        })
    }

    /// Fork the live transcript at a byte boundary into a fresh session file.
    pub fn create_fork_at_offset(
        &self,
        transcript_path: &Path,
        boundary_offset: u64,
        fork_dir: Option<&Path>,
        agent: Option<&str>,
    ) -> Result<PathBuf> {
        let fork_path = self.allocate_fork_path(transcript_path, fork_dir)?;
        copy_prefix(transcript_path, &fork_path, boundary_offset)?;
        ensure_trailing_newline(&fork_path);
        self.apply_title_prefix(&fork_path, agent);
        Ok(fork_path)
    }

    /// Fork from a checkpoint cursor.
    ///
    /// Fast path: the live transcript still shares the checkpoint's first
    /// 64 KiB, so the fork is a byte-count truncation of the live file.
    /// Slow path: inflate the stored gzip snapshot.
    pub fn create_fork_session(
        &self,
        checkpoint_cursor: &TranscriptCursor,
        checkpoint_snapshot_gz: Option<&Path>,
        current_transcript_path: &Path,
        fork_dir: Option<&Path>,
        agent: Option<&str>,
    ) -> Result<PathBuf> {
        let fork_path = self.allocate_fork_path(current_transcript_path, fork_dir)?;

        if self.prefix_matches(current_transcript_path, &checkpoint_cursor.prefix_sha256) {
            copy_prefix(
                current_transcript_path,
                &fork_path,
                checkpoint_cursor.byte_offset_end,
            )?;
        } else {
            let Some(snapshot_gz) = checkpoint_snapshot_gz else {
                bail!("Transcript prefix mismatch and no checkpoint snapshot available");
            };
            inflate_gz(snapshot_gz, &fork_path)?;
        }

        ensure_trailing_newline(&fork_path);
        self.apply_title_prefix(&fork_path, agent);
        Ok(fork_path)
    }

    /// Rewrite the live transcript in place, truncated at the boundary.
    /// A timestamped backup of the full file lands in `backup_dir` first.
    pub fn rewrite_in_place_at_offset(
        &self,
        transcript_path: &Path,
        boundary_offset: u64,
        backup_dir: &Path,
    ) -> Result<PathBuf> {
        ensure_dir(backup_dir)?;
        let backup_path = backup_dir.join(format!(
            "{}_{}.jsonl",
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            Uuid::new_v4()
        ));

        if transcript_path.exists() {
            fs::copy(transcript_path, &backup_path)
                .with_context(|| format!("backing up {}", transcript_path.display()))?;
        }

        let tmp_path = PathBuf::from(format!("{}.tmp", transcript_path.display()));
        copy_prefix(transcript_path, &tmp_path, boundary_offset)?;
        ensure_trailing_newline(&tmp_path);
        fs::rename(&tmp_path, transcript_path)
            .with_context(|| format!("replacing {}", transcript_path.display()))?;

        Ok(backup_path)
    }

    /// Recompute the prefix hash and compare against a recorded one.
    pub fn prefix_matches(&self, transcript_path: &Path, expected: &str) -> bool {
        hash_prefix(transcript_path)
            .map(|h| h == expected)
            .unwrap_or(false)
    }

    fn allocate_fork_path(
        &self,
        transcript_path: &Path,
        fork_dir: Option<&Path>,
    ) -> Result<PathBuf> {
        let parent = match fork_dir {
            Some(dir) => dir.to_path_buf(),
            None => transcript_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        ensure_dir(&parent)?;
        Ok(parent.join(format!("{}.jsonl", Uuid::new_v4())))
    }

    fn title_prefix_enabled(&self, agent: Option<&str>) -> bool {
        agent
            .and_then(|id| self.registry.get(id))
            .map(|profile| profile.title_prefix_enabled())
            .unwrap_or(false)
    }

    /// Best-effort: fork creation never fails because of the title.
    fn apply_title_prefix(&self, fork_path: &Path, agent: Option<&str>) {
        if !self.title_prefix_enabled(agent) {
            return;
        }
        if let Err(e) = prefix_first_title_field(fork_path, FORK_TITLE_PREFIX) {
            crate::fmt::debug_log(&format!("title prefix skipped: {e}"));
        }
    }
}

fn is_user_message(obj: &Value) -> bool {
    obj.get("role").and_then(|r| r.as_str()) == Some("user")
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// The prompt payload of a user record: a plain string `content`, the
/// joined text blocks of an array `content`, or the whole record as JSON
/// when neither yields text.
fn extract_prompt_text(obj: &Value) -> String {
    match obj.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if parts.is_empty() {
                obj.to_string()
            } else {
                parts.join("\n").trim().to_string()
            }
        }
        _ => obj.to_string(),
    }
}

fn hash_prefix(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to hash prefix of {}", path.display()))?;
    hash_reader(file.take(PREFIX_HASH_BYTES))
}

fn hash_tail(path: &Path, size: u64) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to hash tail of {}", path.display()))?;
    let start = size.saturating_sub(TAIL_HASH_BYTES);
    file.seek(SeekFrom::Start(start)).context("seeking tail")?;
    hash_reader(file)
}

fn hash_reader(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf).context("hashing transcript bytes")?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Offset immediately after the last complete newline-terminated line.
/// A file without any newline counts as one (possibly incomplete) line.
fn find_last_complete_line_end(file: &mut File, size: u64) -> Result<u64> {
    if size == 0 {
        return Ok(0);
    }

    file.seek(SeekFrom::Start(size - 1)).context("seeking last byte")?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).context("reading last byte")?;
    if last[0] == b'\n' {
        return Ok(size);
    }

    let mut pos = size;
    while pos > 0 {
        let read_size = NEWLINE_SCAN_CHUNK.min(pos);
        pos -= read_size;
        file.seek(SeekFrom::Start(pos)).context("seeking newline scan")?;
        let mut chunk = vec![0u8; read_size as usize];
        file.read_exact(&mut chunk).context("reading newline scan chunk")?;
        if let Some(idx) = chunk.iter().rposition(|b| *b == b'\n') {
            return Ok(pos + idx as u64 + 1);
        }
    }

    Ok(size)
}

/// First non-null id field of the last complete record, stringified.
fn read_last_event_id(
    file: &mut File,
    byte_offset_end: u64,
    fields: &[String],
) -> Result<Option<String>> {
    if byte_offset_end == 0 {
        return Ok(None);
    }

    let start = byte_offset_end.saturating_sub(NEWLINE_SCAN_CHUNK);
    file.seek(SeekFrom::Start(start)).context("seeking last record")?;
    let mut buf = vec![0u8; (byte_offset_end - start) as usize];
    file.read_exact(&mut buf).context("reading last record")?;

    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }

    let last_line = match buf.iter().rposition(|b| *b == b'\n') {
        Some(idx) => &buf[idx + 1..],
        None => &buf[..],
    };
    let last_line = trim_cr(last_line);
    if last_line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    let Ok(obj) = serde_json::from_slice::<Value>(last_line) else {
        return Ok(None);
    };
    let Some(map) = obj.as_object() else {
        return Ok(None);
    };

    for field in fields {
        if field.is_empty() {
            continue;
        }
        match map.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return Ok(Some(s.clone())),
            Some(other) => return Ok(Some(other.to_string())),
        }
    }
    Ok(None)
}

fn copy_prefix(src: &Path, dst: &Path, byte_count: u64) -> Result<()> {
    let src_file =
        File::open(src).with_context(|| format!("failed to open {}", src.display()))?;
    let mut reader = src_file.take(byte_count);
    let mut writer =
        File::create(dst).with_context(|| format!("failed to create {}", dst.display()))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let read = reader.read(&mut buf).context("copying transcript prefix")?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buf[..read])
            .context("writing transcript prefix")?;
    }
    Ok(())
}

fn deflate_into(src: &Path, gz_dst: &Path) -> Result<()> {
    let mut reader =
        File::open(src).with_context(|| format!("failed to open {}", src.display()))?;
    let out =
        File::create(gz_dst).with_context(|| format!("failed to create {}", gz_dst.display()))?;
    let mut encoder = GzEncoder::new(out, Compression::default());

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let read = reader.read(&mut buf).context("reading transcript")?;
        if read == 0 {
            break;
        }
        encoder.write_all(&buf[..read]).context("compressing transcript")?;
    }
    encoder.finish().context("finishing transcript snapshot")?;
    Ok(())
}

pub(crate) fn inflate_gz(gz_src: &Path, dst: &Path) -> Result<()> {
    let file =
        File::open(gz_src).with_context(|| format!("failed to open {}", gz_src.display()))?;
    let mut decoder = GzDecoder::new(file);
    let mut writer =
        File::create(dst).with_context(|| format!("failed to create {}", dst.display()))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let read = decoder.read(&mut buf).context("inflating snapshot")?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).context("writing inflated snapshot")?;
    }
    Ok(())
}

/// Best-effort: a fork always ends with a newline so the agent can append.
fn ensure_trailing_newline(path: &Path) {
    let Ok(meta) = fs::metadata(path) else { return };
    let size = meta.len();
    if size == 0 {
        return;
    }
    let Ok(mut file) = File::options().read(true).write(true).open(path) else {
        return;
    };
    if file.seek(SeekFrom::Start(size - 1)).is_err() {
        return;
    }
    let mut last = [0u8; 1];
    if file.read_exact(&mut last).is_err() {
        return;
    }
    if last[0] != b'\n' {
        let _ = file.seek(SeekFrom::Start(size));
        let _ = file.write_all(b"\n");
    }
}

/// Rename the first titled record within the head of the fork file,
/// streaming the rest through a temp file and an atomic rename.
fn prefix_first_title_field(path: &Path, prefix: &str) -> Result<()> {
    let src = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(src);

    let tmp_path = crate::fsutil::tmp_sibling(path);
    let mut writer = File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut replaced = false;
    for _ in 0..TITLE_SCAN_LINES {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line).context("reading fork line")?;
        if read == 0 {
            break;
        }
        if replaced {
            writer.write_all(&line).context("copying fork line")?;
            continue;
        }

        let stripped: &[u8] = {
            let mut s = line.as_slice();
            while matches!(s.last(), Some(b'\n') | Some(b'\r')) {
                s = &s[..s.len() - 1];
            }
            s
        };
        if stripped.iter().all(|b| b.is_ascii_whitespace()) {
            writer.write_all(&line).context("copying fork line")?;
            continue;
        }

        match serde_json::from_slice::<Value>(stripped) {
            Ok(Value::Object(mut map)) => {
                let title = map.get("title").and_then(|t| t.as_str()).map(|t| t.to_string());
                match title {
                    Some(title) => {
                        if !title.starts_with(prefix) {
                            map.insert("title".to_string(), Value::String(format!("{prefix}{title}")));
                        }
                        let new_line = serde_json::to_string(&Value::Object(map))
                            .context("re-serializing titled record")?;
                        writer
                            .write_all(new_line.as_bytes())
                            .and_then(|_| writer.write_all(b"\n"))
                            .context("writing titled record")?;
                        replaced = true;
                    }
                    None => writer.write_all(&line).context("copying fork line")?,
                }
            }
            _ => writer.write_all(&line).context("copying fork line")?,
        }
    }

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let read = reader.read(&mut buf).context("copying fork remainder")?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).context("writing fork remainder")?;
    }
    drop(writer);

    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript_lines() -> Vec<Vec<u8>> {
        vec![
            br#"{"type":"session_start","title":"T"}"#.to_vec(),
            br#"{"role":"user","content":[{"type":"text","text":"first"}]}"#.to_vec(),
            br#"{"role":"assistant","content":[{"type":"text","text":"a"}]}"#.to_vec(),
            br#"{"role":"user","content":[{"type":"text","text":"second"}]}"#.to_vec(),
            br#"{"role":"assistant","content":[{"type":"text","text":"b"}]}"#.to_vec(),
        ]
    }

    fn write_transcript(path: &Path) -> Vec<usize> {
        let lines = transcript_lines();
        let mut body = Vec::new();
        let mut lens = Vec::new();
        for line in &lines {
            body.extend_from_slice(line);
            body.push(b'\n');
            lens.push(line.len() + 1);
        }
        fs::write(path, body).expect("write transcript");
        lens
    }

    #[test]
    fn cursor_of_empty_file_is_zeroed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        fs::write(&path, b"").expect("write");

        let mgr = TranscriptManager::new();
        let cursor = mgr.compute_cursor(&path, None).expect("cursor");
        assert_eq!(cursor.byte_offset_end, 0);
        assert_eq!(cursor.last_event_id, None);
        // sha256 of the empty string
        assert_eq!(
            cursor.prefix_sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(cursor.prefix_sha256, cursor.tail_sha256);
    }

    #[test]
    fn cursor_is_deterministic() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);

        let mgr = TranscriptManager::new();
        let a = mgr.compute_cursor(&path, None).expect("cursor");
        let b = mgr.compute_cursor(&path, None).expect("cursor");
        assert_eq!(a, b);
    }

    #[test]
    fn cursor_points_to_file_end_when_newline_terminated() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);
        let size = fs::metadata(&path).expect("stat").len();

        let mgr = TranscriptManager::new();
        let cursor = mgr.compute_cursor(&path, None).expect("cursor");
        assert_eq!(cursor.byte_offset_end, size);
    }

    #[test]
    fn cursor_excludes_trailing_partial_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        let line1 = br#"{"uuid":"e1","role":"user","content":"hi"}"#;
        let partial = br#"{"uuid":"e2","role":"assist"#;
        let mut body = line1.to_vec();
        body.push(b'\n');
        body.extend_from_slice(partial);
        fs::write(&path, &body).expect("write");

        let mgr = TranscriptManager::new();
        let cursor = mgr.compute_cursor(&path, None).expect("cursor");
        assert_eq!(cursor.byte_offset_end, (line1.len() + 1) as u64);
        assert_eq!(cursor.last_event_id.as_deref(), Some("e1"));
    }

    #[test]
    fn cursor_treats_newline_free_file_as_one_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        let body = br#"{"uuid":"only"}"#;
        fs::write(&path, body).expect("write");

        let mgr = TranscriptManager::new();
        let cursor = mgr.compute_cursor(&path, None).expect("cursor");
        assert_eq!(cursor.byte_offset_end, body.len() as u64);
        assert_eq!(cursor.last_event_id.as_deref(), Some("only"));
    }

    #[test]
    fn last_event_id_respects_field_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        fs::write(&path, "{\"uuid\":\"u1\",\"id\":7}\n").expect("write");

        let mgr = TranscriptManager::new();
        let cursor = mgr.compute_cursor(&path, None).expect("cursor");
        assert_eq!(cursor.last_event_id.as_deref(), Some("u1"));

        let fields = vec!["id".to_string()];
        let cursor = mgr.compute_cursor(&path, Some(&fields)).expect("cursor");
        assert_eq!(cursor.last_event_id.as_deref(), Some("7"));
    }

    #[test]
    fn boundary_n1_lands_on_last_user_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        let lens = write_transcript(&path);

        let mgr = TranscriptManager::new();
        let boundary = mgr.find_boundary_by_user_prompts(&path, 1).expect("boundary");
        assert_eq!(
            boundary.boundary_offset,
            (lens[0] + lens[1] + lens[2]) as u64
        );
        assert_eq!(boundary.prompts, vec!["second".to_string()]);
    }

    #[test]
    fn boundary_n2_lands_on_first_user_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        let lens = write_transcript(&path);

        let mgr = TranscriptManager::new();
        let boundary = mgr.find_boundary_by_user_prompts(&path, 2).expect("boundary");
        assert_eq!(boundary.boundary_offset, lens[0] as u64);
        assert_eq!(
            boundary.prompts,
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn boundary_fails_when_not_enough_prompts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);

        let mgr = TranscriptManager::new();
        let err = mgr.find_boundary_by_user_prompts(&path, 3).unwrap_err();
        assert!(err.to_string().contains("Not enough user prompts"));

        let err = mgr.find_boundary_by_user_prompts(&path, 0).unwrap_err();
        assert!(err.to_string().contains("n must be >= 1"));
    }

    #[test]
    fn boundary_skips_blank_crlf_and_malformed_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        let mut body = Vec::new();
        body.extend_from_slice(b"not json at all\n");
        body.extend_from_slice(b"\n");
        body.extend_from_slice(b"[1,2,3]\n");
        let user = br#"{"role":"user","content":"hello"}"#;
        let user_start = body.len();
        body.extend_from_slice(user);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(b"{\"role\":\"assistant\"}\r\n");
        fs::write(&path, &body).expect("write");

        let mgr = TranscriptManager::new();
        let boundary = mgr.find_boundary_by_user_prompts(&path, 1).expect("boundary");
        assert_eq!(boundary.boundary_offset, user_start as u64);
        assert_eq!(boundary.prompts, vec!["hello".to_string()]);
    }

    #[test]
    fn boundary_works_across_chunk_boundaries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("big.jsonl");

        // First a user line, then enough assistant filler to push it well
        // past one 128 KiB reverse-scan chunk.
        let user = br#"{"role":"user","content":"needle"}"#;
        let mut body = user.to_vec();
        body.push(b'\n');
        let filler = format!(
            "{{\"role\":\"assistant\",\"content\":\"{}\"}}\n",
            "x".repeat(500)
        );
        while body.len() < 400 * 1024 {
            body.extend_from_slice(filler.as_bytes());
        }
        fs::write(&path, &body).expect("write");

        let mgr = TranscriptManager::new();
        let boundary = mgr.find_boundary_by_user_prompts(&path, 1).expect("boundary");
        assert_eq!(boundary.boundary_offset, 0);
        assert_eq!(boundary.prompts, vec!["needle".to_string()]);
    }

    #[test]
    fn boundary_handles_missing_final_newline() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        let mut body = br#"{"role":"assistant","content":"a"}"#.to_vec();
        body.push(b'\n');
        let user_start = body.len();
        body.extend_from_slice(br#"{"role":"user","content":"tail"}"#);
        fs::write(&path, &body).expect("write");

        let mgr = TranscriptManager::new();
        let boundary = mgr.find_boundary_by_user_prompts(&path, 1).expect("boundary");
        assert_eq!(boundary.boundary_offset, user_start as u64);
        assert_eq!(boundary.prompts, vec!["tail".to_string()]);
    }

    #[test]
    fn prompt_extraction_falls_back_to_raw_record() {
        let obj: Value = serde_json::from_str(r#"{"role":"user","content":{"k":1}}"#).unwrap();
        let text = extract_prompt_text(&obj);
        assert!(text.contains("\"role\""));

        let obj: Value =
            serde_json::from_str(r#"{"role":"user","content":[{"type":"image"}]}"#).unwrap();
        assert!(extract_prompt_text(&obj).contains("image"));

        let obj: Value = serde_json::from_str(r#"{"role":"user","content":"plain"}"#).unwrap();
        assert_eq!(extract_prompt_text(&obj), "plain");
    }

    #[test]
    fn fork_at_offset_truncates_and_ends_with_newline() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);

        let mgr = TranscriptManager::new();
        let boundary = mgr.find_boundary_by_user_prompts(&path, 1).expect("boundary");
        let fork = mgr
            .create_fork_at_offset(&path, boundary.boundary_offset, Some(dir.path()), None)
            .expect("fork");

        let text = fs::read_to_string(&fork).expect("read fork");
        assert!(text.contains("first"));
        assert!(!text.contains("second"));
        assert!(text.ends_with('\n'));

        let full = fs::read(&path).expect("read original");
        let fork_bytes = fs::read(&fork).expect("read fork bytes");
        assert_eq!(fork_bytes, full[..boundary.boundary_offset as usize]);
    }

    #[test]
    fn fork_session_fast_path_truncates_live_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        let lens = write_transcript(&path);

        let mgr = TranscriptManager::new();
        let full_cursor = mgr.compute_cursor(&path, None).expect("cursor");
        let cursor = TranscriptCursor {
            byte_offset_end: lens[0] as u64,
            ..full_cursor
        };

        let fork = mgr
            .create_fork_session(&cursor, None, &path, Some(dir.path()), Some("droid"))
            .expect("fork");

        let text = fs::read_to_string(&fork).expect("read fork");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let first: Value = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(first["title"], "[Fork] T");
        assert!(!text.contains("first"));
    }

    #[test]
    fn fork_session_slow_path_inflates_snapshot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);

        let mgr = TranscriptManager::new();
        let snapshot = mgr
            .snapshot_into_checkpoint(&path, &dir.path().join("cp"), Some("claude"))
            .expect("snapshot");

        // Diverge the live transcript so the prefix no longer matches.
        fs::write(&path, b"{\"role\":\"user\",\"content\":\"rewritten\"}\n").expect("rewrite");

        let gz = dir.path().join("cp").join(&snapshot.snapshot);
        let fork = mgr
            .create_fork_session(&snapshot.cursor, Some(&gz), &path, Some(dir.path()), None)
            .expect("fork");

        let text = fs::read_to_string(&fork).expect("read fork");
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        assert!(!text.contains("rewritten"));
    }

    #[test]
    fn fork_session_without_snapshot_fails_on_mismatch() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);

        let mgr = TranscriptManager::new();
        let cursor = TranscriptCursor {
            byte_offset_end: 10,
            last_event_id: None,
            prefix_sha256: "0".repeat(64),
            tail_sha256: "0".repeat(64),
        };
        let err = mgr
            .create_fork_session(&cursor, None, &path, Some(dir.path()), None)
            .unwrap_err();
        assert!(err.to_string().contains("prefix mismatch"));
    }

    #[test]
    fn snapshot_round_trips_through_gzip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);

        let mgr = TranscriptManager::new();
        let cp_dir = dir.path().join("cp");
        let snapshot = mgr
            .snapshot_into_checkpoint(&path, &cp_dir, Some("claude"))
            .expect("snapshot");
        assert_eq!(snapshot.agent, "claude");
        assert_eq!(snapshot.snapshot, SNAPSHOT_NAME);

        let inflated = dir.path().join("inflated.jsonl");
        inflate_gz(&cp_dir.join(&snapshot.snapshot), &inflated).expect("inflate");
        assert_eq!(
            fs::read(&inflated).expect("read inflated"),
            fs::read(&path).expect("read original")
        );
    }

    #[test]
    fn rewrite_in_place_backs_up_and_truncates() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.jsonl");
        write_transcript(&path);

        let mgr = TranscriptManager::new();
        let boundary = mgr.find_boundary_by_user_prompts(&path, 1).expect("boundary");
        let backup_dir = dir.path().join("backup");
        let backup = mgr
            .rewrite_in_place_at_offset(&path, boundary.boundary_offset, &backup_dir)
            .expect("rewrite");

        assert!(backup.exists());
        assert!(fs::read_to_string(&backup).expect("read backup").contains("second"));

        let rewritten = fs::read_to_string(&path).expect("read rewritten");
        assert!(!rewritten.contains("second"));
        assert!(rewritten.ends_with('\n'));
    }

    #[test]
    fn detect_agent_from_path_and_sniff() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mgr = TranscriptManager::new();

        let claude_dir = dir.path().join(".claude/projects/x");
        fs::create_dir_all(&claude_dir).expect("mkdir");
        let claude = claude_dir.join("abc.jsonl");
        fs::write(&claude, b"{}\n").expect("write");
        assert_eq!(mgr.detect_agent(&claude), "claude");

        let sniffed = dir.path().join("session.jsonl");
        fs::write(&sniffed, b"{\"parentUuid\":null,\"uuid\":\"u\"}\n").expect("write");
        assert_eq!(mgr.detect_agent(&sniffed), "claude");

        let droid = dir.path().join("d.jsonl");
        fs::write(&droid, b"{\"id\":\"m1\"}\n").expect("write");
        assert_eq!(mgr.detect_agent(&droid), "droid");

        let unknown = dir.path().join("u.jsonl");
        fs::write(&unknown, b"plain text\n").expect("write");
        assert_eq!(mgr.detect_agent(&unknown), "unknown");
    }

    #[test]
    fn title_prefix_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("fork.jsonl");
        fs::write(&path, b"{\"title\":\"[Fork] Old\"}\n{\"id\":\"m\"}\n").expect("write");

        prefix_first_title_field(&path, FORK_TITLE_PREFIX).expect("prefix");
        let text = fs::read_to_string(&path).expect("read");
        let first: Value = serde_json::from_str(text.lines().next().unwrap()).expect("parse");
        assert_eq!(first["title"], "[Fork] Old");
    }

    #[test]
    fn title_prefix_only_rewrites_first_titled_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("fork.jsonl");
        fs::write(
            &path,
            b"not json\n{\"title\":\"A\"}\n{\"title\":\"B\"}\n",
        )
        .expect("write");

        prefix_first_title_field(&path, FORK_TITLE_PREFIX).expect("prefix");
        let text = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "not json");
        let a: Value = serde_json::from_str(lines[1]).expect("parse a");
        let b: Value = serde_json::from_str(lines[2]).expect("parse b");
        assert_eq!(a["title"], "[Fork] A");
        assert_eq!(b["title"], "B");
    }
}
