use crate::fsutil::{safe_json_load, write_json_pretty};
use crate::paths;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Where checkpoints are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// `<project_root>/.agent/rewind/`
    Project,
    /// `~/.rewind/storage/<project-hash>/`
    Global,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Project => "project",
            StorageMode::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<StorageMode> {
        match s {
            "project" => Some(StorageMode::Project),
            "global" => Some(StorageMode::Global),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AntiSpamConfig {
    pub enabled: bool,
    pub min_interval_seconds: u64,
}

impl Default for AntiSpamConfig {
    fn default() -> Self {
        AntiSpamConfig {
            enabled: true,
            min_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignificanceConfig {
    pub enabled: bool,
    pub min_change_size: u64,
    pub critical_files: Vec<String>,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        SignificanceConfig {
            enabled: true,
            min_change_size: 50,
            critical_files: [
                "package.json",
                "requirements.txt",
                "Dockerfile",
                "docker-compose.yml",
                "tsconfig.json",
                "pyproject.toml",
                "Cargo.toml",
                "go.mod",
                "*.config.js",
                "*.config.ts",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Per-tier runtime knobs. `significance` is parsed and carried for
/// forward compatibility; only `anti_spam` gates checkpoint creation.
#[derive(Debug, Clone, Default)]
pub struct TierConfig {
    pub tier: String,
    pub anti_spam: AntiSpamConfig,
    pub significance: SignificanceConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RuntimeKnobs {
    anti_spam: AntiSpamConfig,
    significance: SignificanceConfig,
}

pub const TIER_NAMES: &[&str] = &["minimal", "balanced", "aggressive"];
pub const DEFAULT_TIER: &str = "balanced";

fn coerce_tier(val: Option<&str>) -> String {
    match val {
        Some(t) if TIER_NAMES.contains(&t) => t.to_string(),
        _ => DEFAULT_TIER.to_string(),
    }
}

impl TierConfig {
    fn from_parts(tier: &str, runtime: Option<&Value>) -> TierConfig {
        let knobs: RuntimeKnobs = runtime
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        TierConfig {
            tier: coerce_tier(Some(tier)),
            anti_spam: knobs.anti_spam,
            significance: knobs.significance,
        }
    }

    /// Load a tier's runtime knobs. A merged config's `runtime` section
    /// wins; otherwise the bundled tier definition supplies them.
    pub fn load(tier_name: Option<&str>, merged: &Value) -> TierConfig {
        let tier = coerce_tier(
            tier_name.or_else(|| merged.get("preset").and_then(|v| v.as_str())),
        );

        if let Some(runtime) = merged.get("runtime").filter(|v| v.is_object()) {
            return TierConfig::from_parts(&tier, Some(runtime));
        }

        if let Some(raw) = bundled_tier(&tier) {
            if let Ok(data) = serde_json::from_str::<Value>(raw) {
                return TierConfig::from_parts(&tier, data.get("runtime"));
            }
        }

        TierConfig {
            tier,
            ..TierConfig::default()
        }
    }
}

/// Patterns for files excluded from checkpoints.
///
/// Matching is shell-style globbing on forward-slash paths: a pattern
/// ignores a path when it matches the full relative path, the path inside
/// any slash-bounded scope, or any single path component. `force_include`
/// wins over everything.
#[derive(Debug, Clone)]
pub struct IgnoreConfig {
    pub patterns: Vec<String>,
    pub additional_ignores: Vec<String>,
    pub force_include: Vec<String>,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        IgnoreConfig {
            patterns: [
                ".git",
                ".agent",
                ".claude",
                ".factory",
                "node_modules",
                "__pycache__",
                ".pytest_cache",
                "dist",
                "build",
                "coverage",
                "out",
                "tmp",
                "temp",
                "*.log",
                "*.tmp",
                "*.pyc",
                ".cache",
                ".next",
                ".nuxt",
                "*.swp",
                "*.bak",
                ".venv",
                "venv",
                ".env",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            additional_ignores: Vec::new(),
            force_include: vec![".env.example".to_string()],
        }
    }
}

/// Malformed patterns never match.
fn glob_match(pattern: &str, text: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(text))
        .unwrap_or(false)
}

impl IgnoreConfig {
    pub fn from_value(data: &Value) -> IgnoreConfig {
        let def = IgnoreConfig::default();
        IgnoreConfig {
            patterns: string_list(data.get("ignorePatterns")).unwrap_or(def.patterns),
            additional_ignores: string_list(data.get("additionalIgnores")).unwrap_or_default(),
            force_include: string_list(data.get("forceInclude")).unwrap_or(def.force_include),
        }
    }

    pub fn should_ignore(&self, path: &str) -> bool {
        let path = path.replace('\\', "/");

        for pattern in &self.force_include {
            if glob_match(pattern, &path) {
                return false;
            }
        }

        for pattern in self.patterns.iter().chain(&self.additional_ignores) {
            if glob_match(pattern, &path)
                || glob_match(&format!("*/{pattern}"), &path)
                || glob_match(&format!("{pattern}/*"), &path)
            {
                return true;
            }
            if path.split('/').any(|part| glob_match(pattern, part)) {
                return true;
            }
        }

        false
    }
}

fn string_list(val: Option<&Value>) -> Option<Vec<String>> {
    val?.as_array().map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}

#[derive(Debug, Clone)]
pub struct RewindConfig {
    pub storage_mode: StorageMode,
    pub tier: TierConfig,
    pub ignore: IgnoreConfig,
}

impl RewindConfig {
    /// Load the merged config for a project.
    ///
    /// Priority: project config (`<root>/.agent/rewind/config.json`) over
    /// global config (`~/.rewind/config.json`) over defaults.
    pub fn load(project_root: &Path) -> RewindConfig {
        let merged = load_merged_value(Some(project_root));
        RewindConfig::from_value(&merged)
    }

    pub fn from_value(merged: &Value) -> RewindConfig {
        let mode = merged
            .get("storage")
            .and_then(|s| s.get("mode"))
            .and_then(|m| m.as_str())
            .and_then(StorageMode::parse)
            .unwrap_or(StorageMode::Project);

        let ignore = merged
            .get("ignore")
            .map(IgnoreConfig::from_value)
            .unwrap_or_default();

        RewindConfig {
            storage_mode: mode,
            tier: TierConfig::load(None, merged),
            ignore,
        }
    }

    /// Persist the storage mode choice at the given scope.
    pub fn save(&self, project_root: &Path, scope: &str) -> Result<PathBuf> {
        let config_path = match scope {
            "global" => paths::global_rewind_dir().join("config.json"),
            "project" => paths::project_rewind_dir(project_root).join("config.json"),
            other => bail!("unknown config scope: {other}"),
        };

        let data = serde_json::json!({
            "storage": { "mode": self.storage_mode.as_str() }
        });
        write_json_pretty(&config_path, &data)
            .with_context(|| format!("saving config to {}", config_path.display()))?;
        Ok(config_path)
    }
}

/// Deep-merge of global then project config.json, project winning.
pub fn load_merged_value(project_root: Option<&Path>) -> Value {
    let mut merged = serde_json::json!({});

    let global_path = paths::global_rewind_dir().join("config.json");
    if let Some(data) = safe_json_load(&global_path) {
        merged = deep_merge(merged, data);
    }

    if let Some(root) = project_root {
        let project_path = paths::project_rewind_dir(root).join("config.json");
        if let Some(data) = safe_json_load(&project_path) {
            merged = deep_merge(merged, data);
        }
    }

    merged
}

fn deep_merge(base: Value, override_val: Value) -> Value {
    match (base, override_val) {
        (Value::Object(mut base_map), Value::Object(override_map)) => {
            for (key, value) in override_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}

/// Bundled tier definitions (runtime knobs + hook tables for the installer).
pub fn bundled_tier(name: &str) -> Option<&'static str> {
    match name {
        "minimal" => Some(include_str!("../assets/tiers/minimal.json")),
        "balanced" => Some(include_str!("../assets/tiers/balanced.json")),
        "aggressive" => Some(include_str!("../assets/tiers/aggressive.json")),
        _ => None,
    }
}

/// The `hooks` table of a bundled tier, for the settings installer.
pub fn tier_hooks(name: &str) -> Option<Value> {
    let raw = bundled_tier(name)?;
    let data: Value = serde_json::from_str(raw).ok()?;
    data.get("hooks").cloned().filter(|h| h.is_object())
}
