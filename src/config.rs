use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::presence::PresenceSettings;
use crate::queue::DEFAULT_DRAIN_MAX;
use crate::tailer::DEFAULT_POLL_INTERVAL;
use crate::timeout::TimeoutSettings;

const CONFIG_SCHEMA_VERSION: u32 = 2;
const MIN_POLL_MS: u64 = 100;
const DEFAULT_DEBOUNCE_SECS: u64 = 110;
const DEFAULT_DUPLICATE_ONLINE_WINDOW_MS: u64 = 1000;
const DEFAULT_TIMEOUT_THRESHOLD_MS: u64 = 3000;
const DEFAULT_JOIN_GRACE_SECS: u64 = 120;
const DEFAULT_WARMUP_SECS: u64 = 20;
const DEFAULT_TIMEOUT_TICK_MS: u64 = 500;
const MAX_DEBOUNCE_SECS: u64 = 86_400;
const MAX_TIMEOUT_TICK_MS: u64 = 60_000;
const VRCHAT_STEAM_APP_ID: &str = "438100";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub schema_version: u32,
    /// Overrides the detected client log directory.
    pub log_dir: Option<String>,
    /// Display name of the local player, used to skip self in reports.
    pub local_user: Option<String>,
    pub presence: PresenceTuning,
    pub timeouts: TimeoutTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PresenceTuning {
    pub debounce_secs: u64,
    pub duplicate_online_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutTuning {
    pub enabled: bool,
    pub threshold_ms: u64,
    pub join_grace_secs: u64,
    pub warmup_secs: u64,
    pub tick_ms: u64,
    /// User ids to report; empty reports everyone.
    pub watch_list: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub drain_max: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            log_dir: None,
            local_user: None,
            presence: PresenceTuning::default(),
            timeouts: TimeoutTuning::default(),
        }
    }
}

impl Default for PresenceTuning {
    fn default() -> Self {
        Self {
            debounce_secs: DEFAULT_DEBOUNCE_SECS,
            duplicate_online_window_ms: DEFAULT_DUPLICATE_ONLINE_WINDOW_MS,
        }
    }
}

impl Default for TimeoutTuning {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: DEFAULT_TIMEOUT_THRESHOLD_MS,
            join_grace_secs: DEFAULT_JOIN_GRACE_SECS,
            warmup_secs: DEFAULT_WARMUP_SECS,
            tick_ms: DEFAULT_TIMEOUT_TICK_MS,
            watch_list: Vec::new(),
        }
    }
}

impl TrackerConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(cfg_path: &Path) -> Result<Self> {
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        if cfg_path.exists() {
            let raw = fs::read_to_string(cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: TrackerConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(cfg_path)?;
            }
            Ok(parsed)
        } else {
            let cfg = TrackerConfig::default();
            cfg.save_to(cfg_path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Configured log directory, else [`default_log_dir`].
    pub fn effective_log_dir(&self) -> PathBuf {
        match self.log_dir.as_deref() {
            Some(dir) => PathBuf::from(dir),
            None => default_log_dir(),
        }
    }

    pub fn presence_settings(&self) -> PresenceSettings {
        PresenceSettings {
            debounce: Duration::from_secs(self.presence.debounce_secs),
            duplicate_online_window: Duration::from_millis(self.presence.duplicate_online_window_ms),
        }
    }

    pub fn timeout_settings(&self) -> TimeoutSettings {
        TimeoutSettings {
            threshold: Duration::from_millis(self.timeouts.threshold_ms),
            join_grace: Duration::from_secs(self.timeouts.join_grace_secs),
            warmup: Duration::from_secs(self.timeouts.warmup_secs),
            tick_interval: Duration::from_millis(self.timeouts.tick_ms),
            watch_list: self.timeouts.watch_list.iter().cloned().collect(),
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        for item in [&mut self.log_dir, &mut self.local_user] {
            if normalize_optional_string(item) {
                changed = true;
            }
        }

        let defaults = PresenceTuning::default();
        if self.presence.debounce_secs == 0 {
            self.presence.debounce_secs = defaults.debounce_secs;
            changed = true;
        }
        if self.presence.duplicate_online_window_ms == 0 {
            self.presence.duplicate_online_window_ms = defaults.duplicate_online_window_ms;
            changed = true;
        }

        let defaults = TimeoutTuning::default();
        for (value, default) in [
            (&mut self.timeouts.threshold_ms, defaults.threshold_ms),
            (&mut self.timeouts.warmup_secs, defaults.warmup_secs),
            (&mut self.timeouts.tick_ms, defaults.tick_ms),
        ] {
            if *value == 0 {
                *value = default;
                changed = true;
            }
        }
        for (value, max) in [
            (&mut self.presence.debounce_secs, MAX_DEBOUNCE_SECS),
            (&mut self.timeouts.tick_ms, MAX_TIMEOUT_TICK_MS),
        ] {
            if *value > max {
                *value = max;
                changed = true;
            }
        }
        if normalize_watch_list(&mut self.timeouts.watch_list) {
            changed = true;
        }

        changed
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    RuntimeSettings {
        poll_interval: Duration::from_millis(
            env_u64("VRC_PRESENCE_POLL_MS", DEFAULT_POLL_INTERVAL.as_millis() as u64).max(MIN_POLL_MS),
        ),
        drain_max: env_u64("VRC_PRESENCE_DRAIN_MAX", DEFAULT_DRAIN_MAX as u64) as usize,
    }
}

pub fn app_home() -> PathBuf {
    if let Ok(custom) = env::var("VRC_PRESENCE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vrc-log-presence")
}

pub fn config_path() -> PathBuf {
    app_home().join("config.json")
}

/// First detected log directory that exists, else the most likely one.
pub fn default_log_dir() -> PathBuf {
    let candidates = log_dir_candidates();
    candidates
        .iter()
        .find(|candidate| candidate.is_dir())
        .or_else(|| candidates.first())
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Places the client writes `output_log_*.txt`, most likely first.
pub fn log_dir_candidates() -> Vec<PathBuf> {
    let mut ordered: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    #[cfg(windows)]
    {
        if let Some(local_low) = windows_local_low() {
            push_unique_path(&mut ordered, &mut seen, local_low.join("VRChat").join("VRChat"));
        }
    }

    #[cfg(all(unix, not(windows)))]
    {
        for candidate in proton_log_dir_candidates() {
            push_unique_path(&mut ordered, &mut seen, candidate);
        }
    }

    ordered
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    if let Some(item) = value.as_mut() {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            *value = None;
            return true;
        }
        if *item != trimmed {
            *item = trimmed;
            return true;
        }
    }
    false
}

fn normalize_watch_list(list: &mut Vec<String>) -> bool {
    let mut seen = HashSet::new();
    let normalized: Vec<String> = list
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.clone()))
        .collect();
    if *list != normalized {
        *list = normalized;
        return true;
    }
    false
}

fn push_unique_path(paths: &mut Vec<PathBuf>, seen: &mut HashSet<String>, candidate: PathBuf) {
    if candidate.as_os_str().is_empty() {
        return;
    }
    let key = path_key(&candidate);
    if seen.insert(key) {
        paths.push(candidate);
    }
}

fn path_key(path: &Path) -> String {
    #[cfg(windows)]
    {
        path.to_string_lossy()
            .replace('\\', "/")
            .to_ascii_lowercase()
    }

    #[cfg(not(windows))]
    {
        path.to_string_lossy().to_string()
    }
}

#[cfg(windows)]
fn windows_local_low() -> Option<PathBuf> {
    if let Ok(profile) = env::var("USERPROFILE") {
        let profile = profile.trim();
        if !profile.is_empty() {
            return Some(PathBuf::from(profile).join("AppData").join("LocalLow"));
        }
    }
    dirs::home_dir().map(|home| home.join("AppData").join("LocalLow"))
}

#[cfg(all(unix, not(windows)))]
fn proton_log_dir_candidates() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let mut steam_roots = vec![
        home.join(".steam").join("steam"),
        home.join(".local").join("share").join("Steam"),
        home.join(".var")
            .join("app")
            .join("com.valvesoftware.Steam")
            .join(".local")
            .join("share")
            .join("Steam"),
    ];
    if let Some(data) = dirs::data_dir() {
        steam_roots.push(data.join("Steam"));
    }

    steam_roots
        .into_iter()
        .map(|root| {
            root.join("steamapps")
                .join("compatdata")
                .join(VRCHAT_STEAM_APP_ID)
                .join("pfx")
                .join("drive_c")
                .join("users")
                .join("steamuser")
                .join("AppData")
                .join("LocalLow")
                .join("VRChat")
                .join("VRChat")
        })
        .collect()
}
