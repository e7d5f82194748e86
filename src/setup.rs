use crate::agents::AgentRegistry;
use crate::config::{self, DEFAULT_TIER, TIER_NAMES};
use crate::fsutil::{read_json_or_empty, write_json_pretty};
use crate::paths;
use anyhow::{bail, Result};
use serde_json::Value;
use std::io::{self, Write};
use std::path::PathBuf;

/// Hook entries belong to rewind when their command mentions this string.
const REWIND_HOOK_IDENTIFIER: &str = "rewind hook";

pub fn run(tier: &str, remove: bool) -> Result<()> {
    if !TIER_NAMES.contains(&tier) {
        bail!("unknown tier '{tier}' (expected one of: {})", TIER_NAMES.join(", "));
    }

    println!("\nrewind setup\n");

    let tier_hooks = match remove {
        true => None,
        false => Some(
            config::tier_hooks(tier)
                .ok_or_else(|| anyhow::anyhow!("bundled tier '{tier}' has no hooks table"))?,
        ),
    };

    let registry = AgentRegistry::bundled();
    let mut configured = 0;
    for profile in registry.all() {
        let Some(settings_rel) = profile.settings_path() else {
            continue;
        };
        let settings_path = paths::home_dir().join(settings_rel);

        if !agent_detected(&settings_path) {
            println!("  {} — not detected, skipping", profile.display_name);
            continue;
        }

        let action = if remove {
            format!("Remove rewind hooks from ~/{settings_rel}?")
        } else {
            format!("Install {tier} hooks into ~/{settings_rel}?")
        };
        println!("  {} detected ✓", profile.display_name);
        if !prompt_yn(&action, true)? {
            continue;
        }

        match apply_to_settings(&settings_path, tier_hooks.as_ref()) {
            Ok(()) => {
                println!("      ✓ ~/{settings_rel}");
                configured += 1;
            }
            Err(e) => eprintln!("      ! Error: {e}"),
        }
    }

    if configured == 0 {
        println!("\n  Nothing configured.");
        if !remove {
            println!("  You can still add the hooks manually — see README.");
        }
        println!();
        return Ok(());
    }

    if remove {
        println!("\n  Rewind hooks removed.\n");
    } else {
        println!("\n  Done. Start an agent session in a project, then try:");
        println!("    rewind list");
        println!("    rewind back 1\n");
        println!("  To verify your setup:");
        println!("    rewind doctor\n");
    }
    Ok(())
}

/// Read-merge-write one settings file.
fn apply_to_settings(settings_path: &PathBuf, tier_hooks: Option<&Value>) -> Result<()> {
    let mut settings = read_json_or_empty(settings_path);
    merge_rewind_hooks(&mut settings, tier_hooks);
    write_json_pretty(settings_path, &settings)
}

/// Merge rewind's tier hooks into a settings object, touching nothing else.
///
/// Existing rewind entries are removed first so tier changes stay
/// idempotent; foreign hook entries and non-list `hooks` values are left
/// in place. With `tier_hooks = None` the merge only removes.
pub fn merge_rewind_hooks(settings: &mut Value, tier_hooks: Option<&Value>) {
    if !settings.is_object() {
        return;
    }
    if !settings.get("hooks").map(|v| v.is_object()).unwrap_or(false) {
        settings["hooks"] = serde_json::json!({});
    }
    let hooks = settings["hooks"].as_object_mut().expect("hooks is an object");

    // Strip our entries from any list-valued event, drop emptied events.
    let keys: Vec<String> = hooks.keys().cloned().collect();
    for key in keys {
        let Some(list) = hooks.get(&key).and_then(|v| v.as_array()) else {
            continue;
        };
        let filtered: Vec<Value> = list.iter().filter(|h| !is_rewind_hook(h)).cloned().collect();
        if filtered.len() == list.len() {
            continue;
        }
        if filtered.is_empty() {
            hooks.remove(&key);
        } else {
            hooks.insert(key, Value::Array(filtered));
        }
    }

    if let Some(tier_hooks) = tier_hooks.and_then(|v| v.as_object()) {
        for (event, tier_list) in tier_hooks {
            let Some(tier_list) = tier_list.as_array() else {
                continue;
            };
            let mut merged: Vec<Value> = hooks
                .get(event)
                .and_then(|v| v.as_array())
                .map(|list| list.iter().filter(|h| !is_rewind_hook(h)).cloned().collect())
                .unwrap_or_default();
            merged.extend(tier_list.iter().cloned());
            hooks.insert(event.clone(), Value::Array(merged));
        }
    }

    if hooks.is_empty() {
        if let Some(map) = settings.as_object_mut() {
            map.remove("hooks");
        }
    }
}

pub(crate) fn is_rewind_hook(entry: &Value) -> bool {
    entry
        .get("hooks")
        .and_then(|v| v.as_array())
        .map(|hooks| {
            hooks.iter().any(|h| {
                h.get("command")
                    .and_then(|c| c.as_str())
                    .map(|c| c.contains(REWIND_HOOK_IDENTIFIER))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Whether any event list in a settings `hooks` object carries our entry.
pub(crate) fn rewind_hook_installed(hooks: &Value) -> bool {
    hooks
        .as_object()
        .map(|map| {
            map.values().any(|list| {
                list.as_array()
                    .map(|arr| arr.iter().any(is_rewind_hook))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn agent_detected(settings_path: &PathBuf) -> bool {
    settings_path
        .parent()
        .map(|dir| dir.exists())
        .unwrap_or(false)
}

fn prompt_yn(question: &str, default_yes: bool) -> Result<bool> {
    let hint = if default_yes { "Y/n" } else { "y/N" };
    print!("      {question} [{hint}]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(match input.trim().to_lowercase().as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default_yes,
    })
}
