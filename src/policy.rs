use crate::paths::expand_user;
use crate::store::CheckpointMetadata;

/// How a SessionStart hook was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStartSource {
    Startup,
    Resume,
    Clear,
    Compact,
}

impl SessionStartSource {
    pub fn parse(s: &str) -> SessionStartSource {
        match s {
            "resume" => SessionStartSource::Resume,
            "clear" => SessionStartSource::Clear,
            "compact" => SessionStartSource::Compact,
            _ => SessionStartSource::Startup,
        }
    }
}

pub fn session_start_description(source: SessionStartSource) -> &'static str {
    match source {
        SessionStartSource::Startup => "Session start",
        SessionStartSource::Resume => "Session resume",
        SessionStartSource::Clear => "Session clear",
        SessionStartSource::Compact => "Session compact",
    }
}

fn normalize_path(path: Option<&str>) -> Option<String> {
    let path = path?.trim();
    if path.is_empty() {
        return None;
    }
    Some(expand_user(path).to_string_lossy().into_owned())
}

pub fn checkpoint_transcript_path(checkpoint: &CheckpointMetadata) -> Option<String> {
    normalize_path(checkpoint.transcript.as_ref().map(|t| t.original_path.as_str()))
}

pub fn has_checkpoint_for_transcript(
    checkpoints: &[CheckpointMetadata],
    transcript_path: Option<&str>,
) -> bool {
    let Some(wanted) = normalize_path(transcript_path) else {
        return false;
    };
    checkpoints
        .iter()
        .any(|cp| checkpoint_transcript_path(cp).as_deref() == Some(&wanted))
}

/// Decide whether a SessionStart should create a baseline checkpoint.
///
/// Startup always baselines. Resume/clear/compact baseline only when no
/// checkpoint covers this transcript yet, so re-entering a session does
/// not pile up duplicates.
pub fn should_create_session_start_baseline(
    source: SessionStartSource,
    transcript_path: Option<&str>,
    checkpoints: &[CheckpointMetadata],
) -> (bool, Vec<String>) {
    let mut warnings = Vec::new();

    if source == SessionStartSource::Startup {
        return (true, warnings);
    }

    if source == SessionStartSource::Resume && normalize_path(transcript_path).is_none() {
        warnings.push(
            "[rewind] Resume detected but transcript path is unavailable; cannot verify checkpoint coverage"
                .to_string(),
        );
        return (false, warnings);
    }

    if has_checkpoint_for_transcript(checkpoints, transcript_path) {
        return (false, warnings);
    }

    if source == SessionStartSource::Resume {
        warnings.push("[rewind] No existing checkpoint for this transcript; created baseline".to_string());
    }

    (true, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{TranscriptCursor, TranscriptSnapshot};

    fn checkpoint_for(path: &str) -> CheckpointMetadata {
        CheckpointMetadata {
            name: "20260101_000000_000".to_string(),
            timestamp: "2026-01-01T00:00:00".to_string(),
            description: "baseline".to_string(),
            file_count: 1,
            total_size: 1,
            session_id: None,
            has_transcript: true,
            transcript: Some(TranscriptSnapshot {
                agent: "claude".to_string(),
                original_path: path.to_string(),
                snapshot: "transcript.jsonl.gz".to_string(),
                cursor: TranscriptCursor::default(),
            }),
        }
    }

    #[test]
    fn startup_always_baselines() {
        let (create, warnings) =
            should_create_session_start_baseline(SessionStartSource::Startup, None, &[]);
        assert!(create);
        assert!(warnings.is_empty());
    }

    #[test]
    fn resume_without_transcript_warns_and_skips() {
        let (create, warnings) =
            should_create_session_start_baseline(SessionStartSource::Resume, None, &[]);
        assert!(!create);
        assert!(warnings.iter().any(|w| w.contains("transcript path is unavailable")));

        let (create, _) =
            should_create_session_start_baseline(SessionStartSource::Resume, Some("  "), &[]);
        assert!(!create);
    }

    #[test]
    fn resume_without_coverage_baselines_and_warns() {
        let (create, warnings) = should_create_session_start_baseline(
            SessionStartSource::Resume,
            Some("/tmp/t.jsonl"),
            &[],
        );
        assert!(create);
        assert!(warnings.iter().any(|w| w.contains("created baseline")));
    }

    #[test]
    fn resume_with_coverage_skips_quietly() {
        let checkpoints = vec![checkpoint_for("/tmp/t.jsonl")];
        let (create, warnings) = should_create_session_start_baseline(
            SessionStartSource::Resume,
            Some("/tmp/t.jsonl"),
            &checkpoints,
        );
        assert!(!create);
        assert!(warnings.is_empty());
    }

    #[test]
    fn clear_without_coverage_baselines_without_warning() {
        let (create, warnings) = should_create_session_start_baseline(
            SessionStartSource::Clear,
            Some("/tmp/t.jsonl"),
            &[],
        );
        assert!(create);
        assert!(warnings.is_empty());
    }

    #[test]
    fn source_parse_defaults_to_startup() {
        assert_eq!(SessionStartSource::parse("startup"), SessionStartSource::Startup);
        assert_eq!(SessionStartSource::parse("resume"), SessionStartSource::Resume);
        assert_eq!(SessionStartSource::parse("anything"), SessionStartSource::Startup);
    }

    #[test]
    fn coverage_check_matches_normalized_paths() {
        let checkpoints = vec![checkpoint_for("/tmp/t.jsonl")];
        assert!(has_checkpoint_for_transcript(&checkpoints, Some("/tmp/t.jsonl")));
        assert!(!has_checkpoint_for_transcript(&checkpoints, Some("/tmp/other.jsonl")));
        assert!(!has_checkpoint_for_transcript(&checkpoints, None));
    }
}
