use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

pub const DEFAULT_FLAG_KEY: &str = "word_search_difficulty_v2";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SupabaseSettings {
    pub url: String,
    pub anon_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostHogSettings {
    pub host: String,
    pub api_key: String,
    pub flag_key: String,
}

impl Default for PostHogSettings {
    fn default() -> Self {
        Self {
            host: "https://us.i.posthog.com".into(),
            api_key: String::new(),
            flag_key: DEFAULT_FLAG_KEY.into(),
        }
    }
}

/// Timings of one puzzle attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GameSettings {
    pub countdown_secs: u32,
    /// Pause between the countdown's "Go!" and the start of the hunt.
    pub go_delay_ms: u64,
    pub round_duration_ms: u64,
    pub tick_interval_ms: u64,
    pub miss_revert_ms: u64,
    pub leaderboard_limit: u32,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            countdown_secs: 5,
            go_delay_ms: 400,
            round_duration_ms: 60_000,
            tick_interval_ms: 100,
            miss_revert_ms: 1_000,
            leaderboard_limit: 10,
        }
    }
}

impl GameSettings {
    pub fn round_duration(&self) -> Duration {
        Duration::from_millis(self.round_duration_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn go_delay(&self) -> Duration {
        Duration::from_millis(self.go_delay_ms)
    }

    pub fn miss_revert(&self) -> Duration {
        Duration::from_millis(self.miss_revert_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DashboardSettings {
    pub floor_ms: u64,
    pub ceiling_ms: u64,
    pub recent_limit: u32,
    pub kde_resolution: usize,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            floor_ms: 3_000,
            ceiling_ms: 60_000,
            recent_limit: 50,
            kde_resolution: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub retry_delay_ms: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self { retry_delay_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SimulatorSettings {
    pub supabase: SupabaseSettings,
    pub posthog: PostHogSettings,
    pub game: GameSettings,
    pub dashboard: DashboardSettings,
    pub identity: IdentitySettings,
}

impl SimulatorSettings {
    /// Environment variables win over whatever the settings file holds.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("AB_SIM_SUPABASE_URL") {
            self.supabase.url = url;
        }
        if let Ok(key) = env::var("AB_SIM_SUPABASE_KEY") {
            self.supabase.anon_key = key;
        }
        if let Ok(host) = env::var("AB_SIM_POSTHOG_HOST") {
            self.posthog.host = host;
        }
        if let Ok(key) = env::var("AB_SIM_POSTHOG_KEY") {
            self.posthog.api_key = key;
        }
    }
}

pub fn debug_mode() -> bool {
    env::var("AB_SIM_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Where the settings file and device store live.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var("AB_SIM_DATA_DIR") {
        return PathBuf::from(dir);
    }
    env::var("HOME")
        .map(|home| PathBuf::from(home).join(".ab-simulator"))
        .unwrap_or_else(|_| PathBuf::from(".ab-simulator"))
}

/// File-backed settings. Environment overrides are layered on at read time
/// and never written back to disk.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<SimulatorSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data: SimulatorSettings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(parsed) => parsed,
                Err(err) => {
                    log::warn!(
                        "Ignoring malformed settings at {}: {err}",
                        path.display()
                    );
                    SimulatorSettings::default()
                }
            }
        } else {
            SimulatorSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn current(&self) -> SimulatorSettings {
        let mut settings = self.read().clone();
        settings.apply_env_overrides();
        settings
    }

    pub fn game(&self) -> GameSettings {
        self.read().game.clone()
    }

    pub fn dashboard(&self) -> DashboardSettings {
        self.read().dashboard.clone()
    }

    pub fn update_game(&self, settings: GameSettings) -> Result<()> {
        let mut guard = self.write();
        guard.game = settings;
        self.persist(&guard)
    }

    pub fn update_dashboard(&self, settings: DashboardSettings) -> Result<()> {
        let mut guard = self.write();
        guard.dashboard = settings;
        self.persist(&guard)
    }

    fn read(&self) -> RwLockReadGuard<'_, SimulatorSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SimulatorSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &SimulatorSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir()
            .join(format!("ab-sim-settings-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(temp_path("settings.json")).unwrap();
        let game = store.game();
        assert_eq!(game.countdown_secs, 5);
        assert_eq!(game.round_duration_ms, 60_000);
        assert_eq!(store.dashboard().floor_ms, 3_000);
        assert_eq!(store.current().posthog.flag_key, DEFAULT_FLAG_KEY);
    }

    #[test]
    fn partial_file_fills_remaining_fields() {
        let path = temp_path("settings.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{ "game": { "round_duration_ms": 30000 } }"#).unwrap();

        let store = SettingsStore::new(path).unwrap();
        let game = store.game();
        assert_eq!(game.round_duration_ms, 30_000);
        assert_eq!(game.tick_interval_ms, 100);
    }

    #[test]
    fn updates_are_persisted() {
        let path = temp_path("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();
        let mut dashboard = store.dashboard();
        dashboard.ceiling_ms = 120_000;
        store.update_dashboard(dashboard).unwrap();

        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(reloaded.dashboard().ceiling_ms, 120_000);
    }

    #[test]
    fn env_credentials_are_read_but_never_saved() {
        let path = temp_path("settings.json");
        env::set_var("AB_SIM_SUPABASE_KEY", "key-from-env");
        let store = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(store.current().supabase.anon_key, "key-from-env");

        let mut game = store.game();
        game.countdown_secs = 3;
        store.update_game(game).unwrap();
        env::remove_var("AB_SIM_SUPABASE_KEY");

        let saved = fs::read_to_string(&path).unwrap();
        assert!(!saved.contains("key-from-env"));
        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(reloaded.current().supabase.anon_key, "");
        assert_eq!(reloaded.game().countdown_secs, 3);
    }
}
