//! Application settings management

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::preset::RssProfile;
use crate::persistence::Database;

/// Games monitored out of the box
const DEFAULT_GAMES: &[&str] = &[
    "cs2.exe",
    "dota2.exe",
    "valorant.exe",
    "valorant-win64-shipping.exe",
    "r5apex.exe",
    "cod.exe",
    "mw2.exe",
    "pubg.exe",
    "rainbowsix.exe",
    "gta5.exe",
    "fortniteclient-win64-shipping.exe",
    "overwatch.exe",
];

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Manual override
    /// Hand control to the user; the autopilot applies nothing
    pub manual_mode: bool,
    /// First RSS processor for the manual preset
    pub manual_base: u32,
    /// Processor count (and queue count) for the manual preset
    pub manual_max: u32,
    /// RSS profile for the manual preset
    pub manual_profile: RssProfile,

    // Automation
    /// Process names that trigger gaming mode
    pub games_list: Vec<String>,

    // Advanced
    /// Enable debug logging
    pub debug_logging: bool,
    /// Keep mode history for N days (0 = forever)
    pub history_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            manual_mode: false,
            manual_base: 0,
            manual_max: 8,
            manual_profile: RssProfile::Closest,

            games_list: DEFAULT_GAMES.iter().map(|g| g.to_string()).collect(),

            debug_logging: false,
            history_retention_days: 30,
        }
    }
}

impl Settings {
    /// Get the data directory
    pub fn data_directory() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("RSSSentinel")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.manual_max = self.manual_max.max(1);

        let mut seen = std::collections::HashSet::new();
        self.games_list = self
            .games_list
            .iter()
            .map(|g| g.trim().to_lowercase())
            .filter(|g| !g.is_empty() && seen.insert(g.clone()))
            .collect();
    }

    /// Lower-cased game names for one poll
    pub fn game_set(&self) -> std::collections::HashSet<String> {
        self.games_list.iter().map(|g| g.to_lowercase()).collect()
    }

    /// Read a single setting by key
    pub fn get(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get(key).cloned(),
            _ => None,
        }
    }

    /// Replace a single setting by key, validating the result
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let mut map = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => anyhow::bail!("Settings did not serialize to an object"),
        };
        if !map.contains_key(key) {
            anyhow::bail!("Unknown setting '{}'", key);
        }
        map.insert(key.to_string(), value);

        let mut updated: Settings = serde_json::from_value(Value::Object(map))
            .with_context(|| format!("Invalid value for '{}'", key))?;
        updated.validate();
        *self = updated;
        Ok(())
    }

    /// Add a game to the monitoring list. Returns false if already present.
    pub fn add_game(&mut self, game_exe: &str) -> bool {
        let game = game_exe.trim().to_lowercase();
        if game.is_empty() || self.games_list.contains(&game) {
            return false;
        }
        self.games_list.push(game);
        true
    }

    /// Remove a game from the monitoring list. Returns false if not found.
    pub fn remove_game(&mut self, game_exe: &str) -> bool {
        let game = game_exe.trim().to_lowercase();
        let before = self.games_list.len();
        self.games_list.retain(|g| *g != game);
        self.games_list.len() != before
    }
}

/// Immutable view of the settings taken at one point in time
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub version: u64,
    pub settings: Arc<Settings>,
}

struct Versioned {
    version: u64,
    settings: Arc<Settings>,
    /// Last observed `PRAGMA data_version` of the backing store
    store_version: Option<i64>,
}

/// Shared, synchronized settings store.
///
/// Cloned into every consumer. Writes go through [`SettingsHandle::update`];
/// readers take snapshots, which pick up changes committed by other
/// processes through the database.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Versioned>>,
    database: Option<Arc<Database>>,
}

impl SettingsHandle {
    /// In-memory settings with no backing store
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 0,
                settings: Arc::new(settings),
                store_version: None,
            })),
            database: None,
        }
    }

    /// Load settings from the database, falling back to defaults
    pub fn load(database: Arc<Database>) -> Result<Self> {
        let store_version = database.data_version().ok();
        let settings = database.load_settings()?.unwrap_or_default();
        info!("Settings loaded ({} monitored games)", settings.games_list.len());

        Ok(Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 0,
                settings: Arc::new(settings),
                store_version,
            })),
            database: Some(database),
        })
    }

    /// Take a fresh snapshot, reloading if the store changed underneath us
    pub fn snapshot(&self) -> SettingsSnapshot {
        self.sync_from_store();
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        SettingsSnapshot {
            version: guard.version,
            settings: Arc::clone(&guard.settings),
        }
    }

    /// Read a single setting by key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.snapshot().settings.get(key)
    }

    /// Set a single setting by key and persist
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.try_update(|s| s.set(key, value))
    }

    /// Add a game and persist. Returns false if already present.
    pub fn add_game(&self, game_exe: &str) -> Result<bool> {
        let mut added = false;
        self.update(|s| added = s.add_game(game_exe))?;
        Ok(added)
    }

    /// Remove a game and persist. Returns false if not found.
    pub fn remove_game(&self, game_exe: &str) -> Result<bool> {
        let mut removed = false;
        self.update(|s| removed = s.remove_game(game_exe))?;
        Ok(removed)
    }

    /// Apply an infallible change
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        self.try_update(|s| {
            f(s);
            Ok(())
        })
    }

    /// The single mutation point: validate, bump the version, persist
    pub fn try_update(&self, f: impl FnOnce(&mut Settings) -> Result<()>) -> Result<()> {
        self.sync_from_store();
        let mut guard = self
            .inner
            .write()
            .map_err(|e| anyhow::anyhow!("Settings lock poisoned: {}", e))?;

        let mut settings = (*guard.settings).clone();
        f(&mut settings)?;
        settings.validate();

        if let Some(db) = &self.database {
            db.save_settings(&settings)?;
            guard.store_version = db.data_version().ok();
        }

        guard.settings = Arc::new(settings);
        guard.version += 1;
        debug!("Settings updated to version {}", guard.version);
        Ok(())
    }

    fn sync_from_store(&self) {
        let Some(db) = &self.database else {
            return;
        };

        let current = match db.data_version() {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not check settings store version: {}", e);
                return;
            }
        };

        let Ok(mut guard) = self.inner.write() else {
            return;
        };
        if guard.store_version == Some(current) {
            return;
        }

        match db.load_settings() {
            Ok(Some(settings)) => {
                if *guard.settings != settings {
                    guard.settings = Arc::new(settings);
                    guard.version += 1;
                    debug!("Settings reloaded from store (version {})", guard.version);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to reload settings: {}", e),
        }
        guard.store_version = Some(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_shipped_config() {
        let settings = Settings::default();
        assert!(!settings.manual_mode);
        assert_eq!(settings.manual_base, 0);
        assert_eq!(settings.manual_max, 8);
        assert_eq!(settings.manual_profile, RssProfile::Closest);
        assert!(settings.games_list.contains(&"cs2.exe".to_string()));
    }

    #[test]
    fn get_and_set_by_key() {
        let mut settings = Settings::default();
        settings.set("manual_base", json!(4)).unwrap();
        settings.set("manual_profile", json!("NUMAStatic")).unwrap();
        assert_eq!(settings.get("manual_base"), Some(json!(4)));
        assert_eq!(settings.manual_profile, RssProfile::NumaStatic);
        assert!(settings.get("no_such_key").is_none());
    }

    #[test]
    fn set_rejects_unknown_keys_and_bad_types() {
        let mut settings = Settings::default();
        assert!(settings.set("autostart", json!(true)).is_err());
        assert!(settings.set("manual_mode", json!("yes")).is_err());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn validate_normalizes_game_list() {
        let mut settings = Settings {
            games_list: vec![" CS2.exe ".into(), "cs2.exe".into(), "".into()],
            manual_max: 0,
            ..Settings::default()
        };
        settings.validate();
        assert_eq!(settings.games_list, vec!["cs2.exe".to_string()]);
        assert_eq!(settings.manual_max, 1);
    }

    #[test]
    fn add_and_remove_games() {
        let mut settings = Settings::default();
        assert!(settings.add_game("Quake.exe"));
        assert!(!settings.add_game("quake.exe"));
        assert!(settings.game_set().contains("quake.exe"));
        assert!(settings.remove_game("QUAKE.EXE"));
        assert!(!settings.remove_game("quake.exe"));
    }

    #[test]
    fn handle_updates_bump_version() {
        let handle = SettingsHandle::new(Settings::default());
        let before = handle.snapshot();
        handle.set("manual_mode", json!(true)).unwrap();
        let after = handle.snapshot();

        assert!(after.version > before.version);
        assert!(!before.settings.manual_mode);
        assert!(after.settings.manual_mode);
    }

    #[test]
    fn failed_update_leaves_settings_untouched() {
        let handle = SettingsHandle::new(Settings::default());
        assert!(handle.set("manual_base", json!(-3)).is_err());
        assert_eq!(handle.snapshot().version, 0);
        assert_eq!(handle.get("manual_base"), Some(json!(0)));
    }

    #[test]
    fn handle_sees_changes_from_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.db");

        let daemon_db = Arc::new(Database::open(&path).unwrap());
        daemon_db.initialize().unwrap();
        let daemon = SettingsHandle::load(daemon_db).unwrap();
        assert!(!daemon.snapshot().settings.manual_mode);

        let cli_db = Arc::new(Database::open(&path).unwrap());
        let cli = SettingsHandle::load(cli_db).unwrap();
        cli.set("manual_mode", json!(true)).unwrap();

        assert!(daemon.snapshot().settings.manual_mode);
    }
}
