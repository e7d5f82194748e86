use crate::agents::{self, AgentRegistry, HookEnvelope};
use crate::config::{self, TierConfig};
use crate::controller::RewindController;
use crate::fmt::debug_log;
use crate::fsutil::{atomic_write, safe_json_load};
use crate::paths;
use crate::policy::{self, SessionStartSource};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tools whose PreToolUse hook triggers a checkpoint.
const CHECKPOINT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit", "Create"];

const STATE_FILE: &str = "hook-state.json";

/// What a handled hook produced. Context lines go to stdout (SessionStart
/// context injection); warnings go to stderr.
#[derive(Debug, Default)]
pub struct HookOutcome {
    pub checkpoint_created: bool,
    pub context_messages: Vec<String>,
    pub warnings: Vec<String>,
}

/// Process one hook payload from stdin.
///
/// The hook never blocks the agent: malformed input is ignored, checkpoint
/// failures are reported on stderr, and the exit code stays 0.
pub fn run() -> Result<()> {
    if atty::is(atty::Stream::Stdin) {
        eprintln!("rewind: 'rewind hook' reads a hook payload from stdin.");
        eprintln!("It is meant to be called by your agent — see 'rewind setup'.");
        return Ok(());
    }

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let Ok(payload) = serde_json::from_str::<Value>(&input) else {
        // Not our payload shape; stay out of the agent's way.
        return Ok(());
    };
    if !payload.is_object() {
        return Ok(());
    }

    let registry = AgentRegistry::bundled();
    let env: HashMap<String, String> = std::env::vars().collect();
    let resolution = registry.resolve(&payload, &env);

    debug_log(&format!(
        "received {} hook (agent={})",
        resolution.envelope.hook_event_name, resolution.context.agent
    ));
    if let Some(forced) = &resolution.overrides.agent {
        debug_log(&format!("agent forced by config: {forced}"));
    }

    let project_root = resolution
        .context
        .project_root
        .as_deref()
        .map(paths::expand_user)
        .or_else(|| {
            Some(resolution.envelope.cwd.as_str())
                .filter(|s| !s.is_empty())
                .map(paths::expand_user)
        })
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let controller = RewindController::new(project_root.clone());

    // Session metadata for later CLI restores.
    controller.save_session_info(
        resolution.context.transcript_path.as_deref(),
        resolution.context.session_id.as_deref(),
        Some(resolution.context.agent.as_str()),
        resolution.context.env_file.as_deref(),
    );

    if resolution.envelope.hook_event_name == "SessionStart" {
        if let Some(env_file) = &resolution.context.env_file {
            write_session_env(
                &paths::expand_user(env_file),
                &resolution.context.agent,
                &project_root,
                resolution.context.transcript_path.as_deref(),
                &env,
            );
        }
    }

    let merged = config::load_merged_value(Some(&project_root));
    let tier = TierConfig::load(None, &merged);

    let outcome = handle_event(&controller, &tier, &resolution.envelope);

    for warning in &outcome.warnings {
        eprintln!("{warning}");
    }
    for message in &outcome.context_messages {
        // Stdout is reserved for SessionStart context injection.
        println!("{message}");
    }

    Ok(())
}

/// Decide whether this event checkpoints, and do it.
pub fn handle_event(
    controller: &RewindController,
    tier: &TierConfig,
    envelope: &HookEnvelope,
) -> HookOutcome {
    match envelope.hook_event_name.as_str() {
        "SessionStart" => handle_session_start(controller, envelope),
        "PreToolUse" => handle_pre_tool_use(controller, tier, envelope),
        "PostToolUse" => handle_post_tool_use(controller, tier, envelope),
        "UserPromptSubmit" => handle_user_prompt_submit(controller, tier, envelope),
        "Stop" => handle_stop(controller, envelope),
        other => {
            debug_log(&format!("unhandled hook event: {other}"));
            HookOutcome::default()
        }
    }
}

fn handle_session_start(controller: &RewindController, envelope: &HookEnvelope) -> HookOutcome {
    let source = envelope
        .raw
        .get("source")
        .and_then(|v| v.as_str())
        .map(SessionStartSource::parse)
        .unwrap_or(SessionStartSource::Startup);

    let transcript_path = Some(envelope.transcript_path.as_str()).filter(|s| !s.is_empty());
    let checkpoints = controller.list_checkpoints();
    let (should_create, warnings) =
        policy::should_create_session_start_baseline(source, transcript_path, &checkpoints);

    // A fresh session always deserves an immediate first checkpoint.
    reset_anti_spam_state(controller);

    let mut outcome = HookOutcome {
        warnings,
        ..HookOutcome::default()
    };
    if !should_create {
        debug_log("session start: baseline not needed");
        return outcome;
    }

    match create(controller, policy::session_start_description(source), envelope) {
        Ok(()) => {
            outcome.checkpoint_created = true;
            outcome
                .context_messages
                .push("[rewind] Checkpoint created on session start".to_string());
        }
        Err(e) => outcome.warnings.push(format!("[rewind] Checkpoint failed: {e}")),
    }
    outcome
}

fn handle_pre_tool_use(
    controller: &RewindController,
    tier: &TierConfig,
    envelope: &HookEnvelope,
) -> HookOutcome {
    let mut outcome = HookOutcome::default();
    let Some(tool_name) = envelope.tool_name.as_deref() else {
        return outcome;
    };
    if !CHECKPOINT_TOOLS.contains(&tool_name) {
        debug_log(&format!("skipping non-checkpoint tool: {tool_name}"));
        return outcome;
    }
    if !should_checkpoint(controller, tier) {
        debug_log("anti-spam: skipping checkpoint (too soon)");
        return outcome;
    }

    let target = envelope
        .tool_input
        .as_ref()
        .and_then(|input| {
            input
                .get("file_path")
                .or_else(|| input.get("path"))
                .and_then(|v| v.as_str())
        })
        .map(|p| {
            Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let description = format!("Before {tool_name}: {target}");
    match create(controller, &description, envelope) {
        Ok(()) => {
            update_checkpoint_time(controller);
            outcome.checkpoint_created = true;
        }
        Err(e) => outcome.warnings.push(format!("[rewind] Checkpoint failed: {e}")),
    }
    outcome
}

fn handle_post_tool_use(
    controller: &RewindController,
    tier: &TierConfig,
    envelope: &HookEnvelope,
) -> HookOutcome {
    let mut outcome = HookOutcome::default();
    if envelope.tool_name.as_deref() != Some("Bash") {
        return outcome;
    }
    let command = envelope
        .tool_input
        .as_ref()
        .and_then(|input| input.get("command"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if !is_destructive_command(command) {
        return outcome;
    }
    if !should_checkpoint(controller, tier) {
        return outcome;
    }

    let description = format!("After Bash: {}...", truncated(command, 50));
    match create(controller, &description, envelope) {
        Ok(()) => {
            update_checkpoint_time(controller);
            outcome.checkpoint_created = true;
        }
        Err(e) => outcome.warnings.push(format!("[rewind] Checkpoint failed: {e}")),
    }
    outcome
}

fn handle_user_prompt_submit(
    controller: &RewindController,
    tier: &TierConfig,
    envelope: &HookEnvelope,
) -> HookOutcome {
    let mut outcome = HookOutcome::default();
    let prompt = envelope
        .raw
        .get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let prompt_lower = prompt.to_lowercase();
    let destructive = ["delete", "remove", "refactor", "rewrite", "replace all"];
    if !destructive.iter().any(|kw| prompt_lower.contains(kw)) {
        return outcome;
    }
    if !should_checkpoint(controller, tier) {
        return outcome;
    }

    let description = format!("Before prompt: {}...", truncated(prompt, 30));
    match create(controller, &description, envelope) {
        Ok(()) => {
            update_checkpoint_time(controller);
            outcome.checkpoint_created = true;
        }
        Err(e) => outcome.warnings.push(format!("[rewind] Checkpoint failed: {e}")),
    }
    outcome
}

fn handle_stop(controller: &RewindController, envelope: &HookEnvelope) -> HookOutcome {
    let mut outcome = HookOutcome::default();
    debug_log("session stop: creating final checkpoint");
    match create(controller, "Session end", envelope) {
        Ok(()) => outcome.checkpoint_created = true,
        Err(e) => outcome.warnings.push(format!("[rewind] Checkpoint failed: {e}")),
    }
    outcome
}

fn create(controller: &RewindController, description: &str, envelope: &HookEnvelope) -> Result<()> {
    let session_id = Some(envelope.session_id.as_str()).filter(|s| !s.is_empty());
    let transcript_path = Some(envelope.transcript_path.as_str()).filter(|s| !s.is_empty());
    controller.create_checkpoint(description, session_id, transcript_path)?;
    Ok(())
}

fn is_destructive_command(command: &str) -> bool {
    let patterns = [
        "rm ", "rm\t", "rmdir", "mv ", "mv\t", "git reset", "git checkout", "git clean",
        "pip uninstall", "npm uninstall", "> ", ">>",
    ];
    let command_lower = command.to_lowercase();
    patterns.iter().any(|p| command_lower.contains(p))
}

fn truncated(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Anti-spam state ──────────────────────────────────────────────────────────
//
// `<rewind_dir>/hook-state.json` carries the last checkpoint time across
// hook invocations, which are separate short-lived processes.

fn state_path(controller: &RewindController) -> PathBuf {
    controller.rewind_dir().join(STATE_FILE)
}

fn load_last_checkpoint_time(controller: &RewindController) -> Option<f64> {
    safe_json_load(&state_path(controller))?
        .get("last_checkpoint_time")?
        .as_f64()
}

fn update_checkpoint_time(controller: &RewindController) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let body = serde_json::json!({ "last_checkpoint_time": now });
    if let Err(e) = atomic_write(&state_path(controller), body.to_string().as_bytes()) {
        debug_log(&format!("hook state write failed: {e}"));
    }
}

fn reset_anti_spam_state(controller: &RewindController) {
    let body = serde_json::json!({ "last_checkpoint_time": null });
    if let Err(e) = atomic_write(&state_path(controller), body.to_string().as_bytes()) {
        debug_log(&format!("hook state reset failed: {e}"));
    }
}

fn should_checkpoint(controller: &RewindController, tier: &TierConfig) -> bool {
    if !tier.anti_spam.enabled {
        return true;
    }
    let Some(last) = load_last_checkpoint_time(controller) else {
        return true;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    now - last >= tier.anti_spam.min_interval_seconds as f64
}

fn write_session_env(
    env_file: &Path,
    agent: &str,
    project_root: &Path,
    transcript_path: Option<&str>,
    env: &HashMap<String, String>,
) {
    let mut exports = vec![
        ("REWIND_AGENT_KIND".to_string(), agent.to_string()),
        (
            "REWIND_PROJECT_ROOT".to_string(),
            project_root.to_string_lossy().into_owned(),
        ),
    ];
    if let Some(tp) = transcript_path {
        exports.push(("REWIND_TRANSCRIPT_PATH".to_string(), tp.to_string()));
    }

    // The PATH is written expanded because env files may be parsed rather
    // than sourced; make sure the user-local bin dir reaches subprocesses.
    let current_path = env
        .get("PATH")
        .cloned()
        .unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string());
    let bin_dir = paths::home_dir().join(".local/bin");
    let bin_dir = bin_dir.to_string_lossy();
    if !current_path.split(':').any(|p| p == bin_dir) {
        exports.push(("PATH".to_string(), format!("{bin_dir}:{current_path}")));
    }

    if let Err(e) = agents::write_env_exports(env_file, &exports) {
        debug_log(&format!("env file write failed: {e}"));
    }
}
