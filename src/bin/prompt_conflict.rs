//! UserPromptSubmit hook that flags oversized prompts for conflict review.
//!
//! Long prompts tend to accumulate contradictory instructions. When a
//! prompt crosses the token threshold this hook blocks submission (exit 2),
//! saves the prompt under /tmp/prompt-conflicts/, and tells the user to ask
//! the agent to analyze the saved file instead.
//!
//! Deliberately standalone: no coupling to the rewind core, works the same
//! under Claude Code and Factory Droid.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::PathBuf;

/// Rough chars-per-token ratio for English prose and code.
const CHARS_PER_TOKEN: usize = 4;
const DEFAULT_TOKEN_THRESHOLD: usize = 2000;

fn token_threshold() -> usize {
    std::env::var("PROMPT_CONFLICT_THRESHOLD")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_TOKEN_THRESHOLD)
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

fn conflicts_dir() -> PathBuf {
    std::env::temp_dir().join("prompt-conflicts")
}

fn prompt_file_name(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("prompt_{hex}.txt")
}

fn main() {
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() {
        return;
    }

    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&input) else {
        return;
    };
    let prompt = payload
        .get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let tokens = estimate_tokens(prompt);
    let threshold = token_threshold();
    if tokens <= threshold {
        // Short enough; let it through.
        return;
    }

    let dir = conflicts_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("prompt-conflict: could not create {}: {e}", dir.display());
        return;
    }
    let saved = dir.join(prompt_file_name(prompt));
    if let Err(e) = std::fs::write(&saved, prompt) {
        eprintln!("prompt-conflict: could not save prompt: {e}");
        return;
    }

    eprintln!(
        "Prompt is ~{tokens} tokens (threshold {threshold}); saved to {}.",
        saved.display()
    );
    eprintln!("Long prompts often carry conflicting instructions. Submit a short message like:");
    eprintln!("  analyze {} for conflicting instructions, then follow it", saved.display());
    // Exit 2 blocks the submission and surfaces stderr to the agent.
    std::process::exit(2);
}
