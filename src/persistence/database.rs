//! SQLite database implementation for persistent storage

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info};

use crate::core::autopilot::StatusEvent;
use crate::core::transaction::{BackupStore, NetworkConfigBackup};
use crate::core::Settings;

/// One row of the mode history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub time: DateTime<Utc>,
    pub state: String,
    pub message: String,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database in the application data directory
    pub fn new() -> Result<Self> {
        let db_path = Self::get_database_path();

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Self::open(&db_path)
    }

    /// Open (or create) a database file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .context(format!("Failed to open database at {:?}", path))?;

        // WAL lets the CLI write settings while the daemon reads them
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=2000;")?;

        debug!("Database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the database file path
    pub fn get_database_path() -> PathBuf {
        Settings::data_directory().join("rss-sentinel.db")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Most recent registry backup (single row)
            CREATE TABLE IF NOT EXISTS network_backup (
                slot TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Mode transitions and rollbacks
            CREATE TABLE IF NOT EXISTS mode_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_time TEXT NOT NULL,
                state TEXT NOT NULL,
                message TEXT NOT NULL
            );
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    /// Counter that changes whenever another connection commits
    pub fn data_version(&self) -> Result<i64> {
        let conn = self.lock()?;
        let version = conn.query_row("PRAGMA data_version", [], |row| row.get(0))?;
        Ok(version)
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'app_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('app_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === History ===

    /// Record a status event
    pub fn record_event(&self, event: &StatusEvent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO mode_history (event_time, state, message) VALUES (?1, ?2, ?3)",
            params![
                event.timestamp.to_rfc3339(),
                event.state.label(),
                event.message,
            ],
        )?;
        Ok(())
    }

    /// Most recent history entries, newest first
    pub fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_time, state, message FROM mode_history ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (time_str, state, message) = row?;
            let time = DateTime::parse_from_rfc3339(&time_str)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            result.push(HistoryEntry {
                time,
                state,
                message,
            });
        }

        Ok(result)
    }

    /// Clean up old history entries
    pub fn cleanup_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.lock()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM mode_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }
}

impl BackupStore for Database {
    fn save_backup(&self, backup: &NetworkConfigBackup) -> Result<()> {
        let conn = self.lock()?;
        let data = serde_json::to_string(backup)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO network_backup (slot, id, data, state, created_at)
            VALUES ('current', ?1, ?2, ?3, ?4)
            "#,
            params![
                backup.id.to_string(),
                data,
                format!("{:?}", backup.state),
                backup.created_at.to_rfc3339(),
            ],
        )?;
        debug!("Backup {} saved ({:?})", backup.id, backup.state);
        Ok(())
    }

    fn load_backup(&self) -> Result<Option<NetworkConfigBackup>> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM network_backup WHERE slot = 'current'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => match serde_json::from_str(&json) {
                Ok(backup) => Ok(Some(backup)),
                Err(e) => {
                    error!("Failed to deserialize network backup: {}", e);
                    Err(e).context("Corrupt network backup record")
                }
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::autopilot::AutopilotState;
    use crate::core::controller::{RegistryValues, REG_MAX_NUM_RSS_QUEUES};
    use crate::core::transaction::BackupState;

    fn temp_db() -> (tempfile::TempDir, PathBuf, Database) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.db");
        let db = Database::open(&path).unwrap();
        db.initialize().unwrap();
        (dir, path, db)
    }

    #[test]
    fn database_lives_in_data_directory() {
        let path = Database::get_database_path();
        assert_eq!(path.parent(), Some(Settings::data_directory().as_path()));
        assert_eq!(path.file_name().unwrap(), "rss-sentinel.db");
    }

    #[test]
    fn settings_round_trip() {
        let (_dir, _path, db) = temp_db();
        assert!(db.load_settings().unwrap().is_none());

        let mut settings = Settings::default();
        settings.manual_mode = true;
        settings.add_game("quake.exe");
        db.save_settings(&settings).unwrap();

        assert_eq!(db.load_settings().unwrap(), Some(settings));
    }

    #[test]
    fn backup_survives_reopen() {
        let (_dir, path, db) = temp_db();
        let mut values = RegistryValues::new();
        values.insert(REG_MAX_NUM_RSS_QUEUES.into(), 8);
        let backup = NetworkConfigBackup::new("GAMING", values);
        db.save_backup(&backup).unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        let loaded = reopened.load_backup().unwrap().unwrap();
        assert_eq!(loaded, backup);
        assert_eq!(loaded.state, BackupState::Pending);
    }

    #[test]
    fn newer_backup_overwrites_older() {
        let (_dir, _path, db) = temp_db();
        let first = NetworkConfigBackup::new("GAMING", RegistryValues::new());
        let mut second = NetworkConfigBackup::new("DESKTOP", RegistryValues::new());
        second.state = BackupState::Committed;

        db.save_backup(&first).unwrap();
        db.save_backup(&second).unwrap();
        assert_eq!(db.load_backup().unwrap(), Some(second));
    }

    #[test]
    fn history_is_newest_first_and_prunable() {
        let (_dir, _path, db) = temp_db();
        let mut old = StatusEvent::new("DESKTOP MODE (Throughput)", "#2ecc71", AutopilotState::Desktop);
        old.timestamp = Utc::now() - chrono::TimeDelta::days(90);
        db.record_event(&old).unwrap();
        db.record_event(&StatusEvent::new("GAMING MODE (4Q)", "#e74c3c", AutopilotState::Gaming))
            .unwrap();

        let history = db.recent_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, "GAMING");

        assert_eq!(db.cleanup_history(30).unwrap(), 1);
        assert_eq!(db.cleanup_history(0).unwrap(), 0);
        assert_eq!(db.recent_history(10).unwrap().len(), 1);
    }
}
