use crate::config;
use crate::paths;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Agent profiles are data, not subclasses: everything the core needs to
/// know about an agent (detection rules, hook payload paths, transcript
/// conventions) lives in a bundled JSON record.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub id: String,
    pub display_name: String,
    data: Value,
}

impl AgentProfile {
    fn from_value(data: Value) -> Option<AgentProfile> {
        let id = data.get("id")?.as_str()?.trim().to_string();
        if id.is_empty() {
            return None;
        }
        let display_name = data
            .get("display_name")
            .and_then(|v| v.as_str())
            .unwrap_or(&id)
            .to_string();
        Some(AgentProfile {
            id,
            display_name,
            data,
        })
    }

    fn transcript(&self) -> Option<&Value> {
        self.data.get("transcript")
    }

    pub fn path_regexes(&self) -> Vec<String> {
        self.transcript()
            .and_then(|t| t.get("path_regexes"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_event_id_fields(&self) -> Option<Vec<String>> {
        let fields = self
            .transcript()?
            .get("last_event_id_fields")?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(|s| s.to_string()))
            .collect::<Option<Vec<String>>>()?;
        Some(fields)
    }

    /// Title prefixing applies only when the profile opts in and uses the
    /// plain `$.title` location.
    pub fn title_prefix_enabled(&self) -> bool {
        let Some(tp) = self.transcript().and_then(|t| t.get("title_prefix")) else {
            return false;
        };
        if tp.get("enabled").and_then(|v| v.as_bool()) == Some(false) {
            return false;
        }
        tp.get("json_path").and_then(|v| v.as_str()).unwrap_or("$.title") == "$.title"
    }

    pub fn env_file_var(&self) -> Option<&str> {
        self.data.get("env")?.get("env_file_var")?.as_str()
    }

    pub fn project_dir_var(&self) -> Option<&str> {
        self.data.get("env")?.get("project_dir_var")?.as_str()
    }

    /// Home-relative settings.json path for the installer.
    pub fn settings_path(&self) -> Option<&str> {
        self.data.get("settings_path")?.as_str()
    }

    fn hook_paths(&self, key: &str) -> Vec<&str> {
        self.data
            .get("hooks")
            .and_then(|h| h.get(key))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    fn event_name_map(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let Some(map) = self
            .data
            .get("hooks")
            .and_then(|h| h.get("event_name_map"))
            .and_then(|v| v.as_object())
        else {
            return out;
        };
        for (k, v) in map {
            if let Some(v) = v.as_str() {
                out.insert(k.to_lowercase(), v.to_string());
            }
        }
        out
    }

    fn min_score(&self) -> i64 {
        self.data
            .get("detection")
            .and_then(|d| d.get("min_score"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    fn score(&self, payload: &Value, env: &HashMap<String, String>) -> i64 {
        let Some(rules) = self
            .data
            .get("detection")
            .and_then(|d| d.get("score_rules"))
            .and_then(|v| v.as_array())
        else {
            return 0;
        };

        let mut score = 0;
        for rule in rules {
            let Some(when) = rule.get("when") else { continue };
            let points = rule.get("score").and_then(|v| v.as_i64()).unwrap_or(0);

            if let Some(path) = when.get("json_path_exists").and_then(|v| v.as_str()) {
                if get_path(payload, path).is_some() {
                    score += points;
                }
                continue;
            }

            if let Some(spec) = when.get("json_path_matches").and_then(|v| v.as_array()) {
                if let (Some(path), Some(pattern)) =
                    (spec.first().and_then(|v| v.as_str()), spec.get(1).and_then(|v| v.as_str()))
                {
                    let matched = get_path(payload, path)
                        .and_then(|v| v.as_str())
                        .zip(regex::Regex::new(pattern).ok())
                        .map(|(val, re)| re.is_match(val))
                        .unwrap_or(false);
                    if matched {
                        score += points;
                    }
                }
                continue;
            }

            if let Some(key) = when.get("env_exists").and_then(|v| v.as_str()) {
                if env.get(key).map(|v| !v.is_empty()).unwrap_or(false) {
                    score += points;
                }
            }
        }

        score
    }
}

/// Config-driven overrides: any field may be absent.
#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub agent: Option<String>,
    pub project_root: Option<String>,
    pub transcript_path: Option<String>,
}

/// Accept a plain string `"agent"` or an object with kind + path overrides.
pub fn extract_agent_overrides(cfg: &Value) -> AgentOverrides {
    let mut overrides = AgentOverrides::default();

    match cfg.get("agent") {
        Some(Value::String(s)) => overrides.agent = non_empty(s),
        Some(Value::Object(obj)) => {
            overrides.agent = obj
                .get("kind")
                .or_else(|| obj.get("agent"))
                .and_then(|v| v.as_str())
                .and_then(non_empty);
            overrides.transcript_path = obj
                .get("transcript_path")
                .or_else(|| obj.get("transcriptPath"))
                .and_then(|v| v.as_str())
                .and_then(non_empty);
            overrides.project_root = obj
                .get("project_root")
                .or_else(|| obj.get("projectRoot"))
                .and_then(|v| v.as_str())
                .and_then(non_empty);
        }
        _ => {}
    }

    if overrides.transcript_path.is_none() {
        overrides.transcript_path = cfg
            .get("transcript_path")
            .and_then(|v| v.as_str())
            .and_then(non_empty);
    }
    if overrides.project_root.is_none() {
        overrides.project_root = cfg
            .get("project_root")
            .and_then(|v| v.as_str())
            .and_then(non_empty);
    }

    overrides
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Canonical hook payload, agent-independent.
#[derive(Debug, Clone)]
pub struct HookEnvelope {
    pub hook_event_name: String,
    pub session_id: String,
    pub transcript_path: String,
    pub cwd: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent: String,
    pub project_root: Option<String>,
    pub transcript_path: Option<String>,
    pub session_id: Option<String>,
    pub env_file: Option<String>,
}

pub struct Resolution<'a> {
    pub envelope: HookEnvelope,
    pub context: AgentContext,
    pub profile: Option<&'a AgentProfile>,
    pub overrides: AgentOverrides,
}

pub struct AgentRegistry {
    profiles: Vec<AgentProfile>,
}

impl AgentRegistry {
    /// Profiles compiled into the binary.
    pub fn bundled() -> AgentRegistry {
        let raw = [
            include_str!("../assets/agents/claude.json"),
            include_str!("../assets/agents/droid.json"),
        ];
        let profiles = raw
            .iter()
            .filter_map(|text| serde_json::from_str::<Value>(text).ok())
            .filter_map(AgentProfile::from_value)
            .collect();
        AgentRegistry { profiles }
    }

    pub fn all(&self) -> &[AgentProfile] {
        &self.profiles
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        let wanted = agent_id.trim().to_lowercase();
        self.profiles.iter().find(|p| p.id.to_lowercase() == wanted)
    }

    fn select<'a>(
        &'a self,
        overrides: &AgentOverrides,
        payload: &Value,
        env: &HashMap<String, String>,
    ) -> Option<&'a AgentProfile> {
        if let Some(forced) = &overrides.agent {
            return self.get(forced);
        }

        let mut scored: Vec<(i64, &AgentProfile)> = self
            .profiles
            .iter()
            .map(|p| (p.score(payload, env), p))
            .filter(|(score, p)| *score >= p.min_score())
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.first().map(|(_, p)| *p)
    }

    /// Resolve profile, config overrides and the canonical envelope from a
    /// raw hook payload.
    pub fn resolve(&self, payload: &Value, env: &HashMap<String, String>) -> Resolution<'_> {
        // Seed the project root from agent env vars, then the payload cwd.
        let mut seed_dir: Option<PathBuf> = None;
        for profile in &self.profiles {
            if let Some(var) = profile.project_dir_var() {
                if let Some(val) = env.get(var).filter(|v| !v.is_empty()) {
                    seed_dir = Some(paths::expand_user(val));
                    break;
                }
            }
        }
        if seed_dir.is_none() {
            if let Some(cwd) = payload.get("cwd").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
                seed_dir = Some(paths::expand_user(cwd));
            }
        }
        let seed_dir =
            seed_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let guessed_root = paths::find_git_root(&seed_dir).unwrap_or_else(|| seed_dir.clone());
        let cfg = config::load_merged_value(Some(&guessed_root));
        let overrides = extract_agent_overrides(&cfg);

        let profile = self.select(&overrides, payload, env);

        let mut event_name = raw_str(payload, &["hook_event_name", "hookEventName"]);
        let mut session_id = raw_str(payload, &["session_id", "sessionId"]);
        let mut transcript_path = raw_str(payload, &["transcript_path", "transcriptPath"]);
        let mut cwd = raw_str(payload, &["cwd"]);
        let mut tool_name = raw_str(payload, &["tool_name"]);
        let mut tool_input = payload.get("tool_input").filter(|v| v.is_object()).cloned();

        if let Some(profile) = profile {
            if let Some(v) = first_present_str(payload, &profile.hook_paths("event_name_paths")) {
                event_name = Some(v);
            }
            if let Some(v) = first_present_str(payload, &profile.hook_paths("session_id_paths")) {
                session_id = Some(v);
            }
            if let Some(v) = first_present_str(payload, &profile.hook_paths("transcript_path_paths")) {
                transcript_path = Some(v);
            }
            if let Some(v) = first_present_str(payload, &profile.hook_paths("cwd_paths")) {
                cwd = Some(v);
            }
            if let Some(v) = first_present_str(payload, &profile.hook_paths("tool_name_paths")) {
                tool_name = Some(v);
            }
            if let Some(v) = first_present(payload, &profile.hook_paths("tool_input_paths")) {
                if v.is_object() {
                    tool_input = Some(v.clone());
                }
            }

            if let Some(name) = &event_name {
                let map = profile.event_name_map();
                if let Some(canonical) = map.get(&name.to_lowercase()) {
                    event_name = Some(canonical.clone());
                }
            }
        }

        if let Some(forced) = &overrides.transcript_path {
            transcript_path = Some(forced.clone());
        }
        if let Some(forced) = &overrides.project_root {
            cwd = Some(forced.clone());
        }

        let mut env_file = None;
        let mut project_dir = None;
        if let Some(profile) = profile {
            if let Some(var) = profile.env_file_var() {
                env_file = env.get(var).filter(|v| !v.is_empty()).cloned();
            }
            if let Some(var) = profile.project_dir_var() {
                project_dir = env.get(var).filter(|v| !v.is_empty()).cloned();
            }
        }

        let project_root = match &overrides.project_root {
            Some(root) => Some(root.clone()),
            None => {
                let seed = project_dir
                    .as_deref()
                    .map(paths::expand_user)
                    .or_else(|| cwd.as_deref().map(paths::expand_user))
                    .unwrap_or(guessed_root);
                Some(
                    paths::find_git_root(&seed)
                        .unwrap_or(seed)
                        .to_string_lossy()
                        .into_owned(),
                )
            }
        };

        let envelope = HookEnvelope {
            hook_event_name: event_name.unwrap_or_default(),
            session_id: session_id.clone().unwrap_or_default(),
            transcript_path: transcript_path.clone().unwrap_or_default(),
            cwd: cwd.clone().unwrap_or_default(),
            tool_name: tool_name.filter(|s| !s.is_empty()),
            tool_input,
            raw: payload.clone(),
        };

        let context = AgentContext {
            agent: profile.map(|p| p.id.clone()).unwrap_or_else(|| "unknown".to_string()),
            project_root,
            transcript_path: transcript_path.filter(|s| !s.is_empty()),
            session_id: session_id.filter(|s| !s.is_empty()),
            env_file,
        };

        Resolution {
            envelope,
            context,
            profile,
            overrides,
        }
    }
}

fn raw_str(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Minimal JSON-path getter: dotted object traversal only (`$.a.b.c`).
/// JSON null counts as absent.
pub fn get_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("$.").unwrap_or(trimmed);

    let mut cur = data;
    for part in trimmed.split('.').filter(|p| !p.is_empty()) {
        cur = cur.as_object()?.get(part)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

pub fn first_present<'a>(data: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths.iter().find_map(|p| get_path(data, p))
}

fn first_present_str(data: &Value, paths: &[&str]) -> Option<String> {
    first_present(data, paths)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Quote env-file values for broad compatibility: some agents parse env
/// files instead of shell-sourcing them, and double quotes are handled by
/// more of those parsers. Shell-expansion characters are escaped so the
/// line stays safe if sourced.
fn env_quote(val: &str) -> String {
    let escaped = val
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`");
    format!("\"{escaped}\"")
}

/// Append export lines to an env file.
///
/// Append-only on purpose: other hooks may write to the same file, and the
/// last assignment wins when sourced.
pub fn write_env_exports(env_file: &Path, exports: &[(String, String)]) -> Result<()> {
    if let Some(parent) = env_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let needs_leading_newline = std::fs::read(env_file)
        .map(|existing| !existing.is_empty() && !existing.ends_with(b"\n"))
        .unwrap_or(false);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(env_file)
        .with_context(|| format!("opening {}", env_file.display()))?;

    let mut body = String::new();
    if needs_leading_newline {
        body.push('\n');
    }
    body.push_str("# Added by rewind\n");
    for (key, val) in exports {
        body.push_str(&format!("export {key}={}\n", env_quote(val)));
    }
    file.write_all(body.as_bytes())
        .with_context(|| format!("appending to {}", env_file.display()))?;
    Ok(())
}
