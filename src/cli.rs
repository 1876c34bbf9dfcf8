//! Command Line Interface
//!
//! The daemon is the default command; everything else inspects or edits the
//! shared database and exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use crate::core::transaction::BackupStore;
use crate::core::{
    CoreTopology, ModePreset, PollutedCoreSet, Presets, RssProfile, SafeApplyTransaction,
    SettingsHandle, TopologyProbe,
};
use crate::persistence::Database;
use crate::platform;

/// Number of history rows shown by `status`
const STATUS_HISTORY_ROWS: usize = 10;

#[derive(Parser)]
#[command(name = "rss-sentinel")]
#[command(version)]
#[command(about = "RSS Sentinel - game-aware RSS and interrupt tuning for Windows")]
#[command(long_about = "RSS Sentinel - game-aware RSS and interrupt tuning for Windows

Watches for running games and moves network receive processing onto clean
CPU cores while one is active. Every change is verified against the default
gateway and rolled back if connectivity is lost.

EXAMPLES:
    rss-sentinel                          Run the autopilot (default)
    rss-sentinel status                   Show topology, presets and history
    rss-sentinel games add quake.exe      Monitor another game
    rss-sentinel settings set manual_max 4
    rss-sentinel force gaming             Pin the gaming preset as manual override
    rss-sentinel auto                     Return control to the autopilot

ENVIRONMENT VARIABLES:
    RUST_LOG=rss_sentinel=debug           Enable debug logging")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the autopilot daemon (default)
    Run,

    /// Show topology, presets, the last backup and recent mode history
    Status,

    /// Settings management
    #[command(subcommand, about = "View and modify settings")]
    Settings(SettingsCommands),

    /// Monitored game management
    #[command(subcommand, about = "Manage the monitored game list")]
    Games(GameCommands),

    /// Switch to manual override with the computed parameters of a mode
    Force {
        #[arg(value_enum)]
        mode: ForceMode,
    },

    /// Leave manual override and let the autopilot decide
    Auto,

    /// Apply the manual preset once, with connectivity rollback
    Apply,

    /// Restore the backup of an interrupted transaction
    Recover,
}

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Show all settings as JSON
    Show,
    /// Get a single setting
    Get {
        /// Setting key (e.g. manual_base)
        key: String,
    },
    /// Set a single setting
    Set {
        /// Setting key
        key: String,
        /// New value, as JSON or a bare string
        value: String,
    },
}

#[derive(Subcommand)]
pub enum GameCommands {
    /// List monitored games
    List,
    /// Add a game executable
    Add { name: String },
    /// Remove a game executable
    Remove { name: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ForceMode {
    Gaming,
    Desktop,
}

impl Cli {
    /// True when no subcommand (or `run`) was given
    pub fn runs_daemon(&self) -> bool {
        matches!(self.command, None | Some(Commands::Run))
    }
}

/// Run a non-daemon command
pub fn run_cli(cli: &Cli) -> Result<()> {
    match &cli.command {
        None | Some(Commands::Run) => Ok(()),
        Some(cmd) => execute_command(cmd),
    }
}

fn open_database() -> Result<Arc<Database>> {
    let db = Database::new()?;
    db.initialize()?;
    Ok(Arc::new(db))
}

fn execute_command(cmd: &Commands) -> Result<()> {
    let db = open_database()?;
    let settings = SettingsHandle::load(Arc::clone(&db))?;

    match cmd {
        Commands::Run => Ok(()),
        Commands::Status => cmd_status(&db, &settings),
        Commands::Settings(sub) => cmd_settings(&settings, sub),
        Commands::Games(sub) => cmd_games(&settings, sub),
        Commands::Force { mode } => {
            let probe = TopologyProbe::system();
            let (topology, polluted) = (probe.probe(), probe.scan_polluted_cores());
            let preset = force_mode(&settings, *mode, &topology, &polluted)?;
            println!("Manual override: {:?} ({})", mode, preset);
            Ok(())
        }
        Commands::Auto => {
            settings.update(|s| s.manual_mode = false)?;
            println!("Autopilot enabled");
            Ok(())
        }
        Commands::Apply => cmd_apply(db, &settings),
        Commands::Recover => cmd_recover(db),
    }
}

// ============================================================================
// Status
// ============================================================================

fn cmd_status(db: &Database, settings: &SettingsHandle) -> Result<()> {
    let probe = TopologyProbe::system();
    let topology = probe.probe();
    let polluted = probe.scan_polluted_cores();
    let presets = Presets::calculate(&topology, &polluted);
    let snapshot = settings.snapshot();

    println!("RSS Sentinel Status");
    println!("===================");
    println!();
    println!("Topology:        {}", topology);
    println!("Polluted cores:  {}", polluted);
    println!("Gaming preset:   {}", presets.gaming);
    println!("Desktop preset:  {}", presets.desktop);
    if snapshot.settings.manual_mode {
        println!(
            "Manual preset:   {}  [ACTIVE]",
            ModePreset::manual(&topology, &snapshot.settings)
        );
    } else {
        println!("Mode control:    autopilot");
    }
    println!();

    match db.load_backup() {
        Ok(Some(backup)) => println!(
            "Last backup:     {} {} {:?} at {} {:?}",
            backup.id,
            backup.mode,
            backup.state,
            backup.created_at.format("%Y-%m-%d %H:%M:%S"),
            backup.values
        ),
        Ok(None) => println!("Last backup:     none"),
        Err(e) => println!("Last backup:     unreadable ({})", e),
    }
    println!();

    let history = db.recent_history(STATUS_HISTORY_ROWS)?;
    if history.is_empty() {
        println!("No mode history yet");
    } else {
        println!("Recent history:");
        for entry in history {
            println!(
                "  {}  {:<8} {}",
                entry.time.format("%Y-%m-%d %H:%M:%S"),
                entry.state,
                entry.message
            );
        }
    }
    Ok(())
}

// ============================================================================
// Settings & games
// ============================================================================

fn cmd_settings(settings: &SettingsHandle, cmd: &SettingsCommands) -> Result<()> {
    match cmd {
        SettingsCommands::Show => {
            let json = serde_json::to_string_pretty(&*settings.snapshot().settings)?;
            println!("{}", json);
        }
        SettingsCommands::Get { key } => {
            let value = settings
                .get(key)
                .with_context(|| format!("Unknown setting '{}'", key))?;
            println!("{}", value);
        }
        SettingsCommands::Set { key, value } => {
            settings.set(key, parse_setting_value(value))?;
            let stored = settings.get(key).unwrap_or(Value::Null);
            println!("Set {} = {}", key, stored);
        }
    }
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string
fn parse_setting_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn cmd_games(settings: &SettingsHandle, cmd: &GameCommands) -> Result<()> {
    match cmd {
        GameCommands::List => {
            let snapshot = settings.snapshot();
            if snapshot.settings.games_list.is_empty() {
                println!("No games monitored");
            }
            for game in &snapshot.settings.games_list {
                println!("{}", game);
            }
        }
        GameCommands::Add { name } => {
            if settings.add_game(name)? {
                println!("Added {}", name.trim().to_lowercase());
            } else {
                println!("{} is already monitored", name);
            }
        }
        GameCommands::Remove { name } => {
            if settings.remove_game(name)? {
                println!("Removed {}", name.trim().to_lowercase());
            } else {
                println!("{} is not in the game list", name);
            }
        }
    }
    Ok(())
}

/// Store the computed parameters of `mode` as the manual override
fn force_mode(
    settings: &SettingsHandle,
    mode: ForceMode,
    topology: &CoreTopology,
    polluted: &PollutedCoreSet,
) -> Result<ModePreset> {
    let preset = match mode {
        ForceMode::Gaming => ModePreset::gaming(topology, polluted),
        ForceMode::Desktop => ModePreset::desktop(topology),
    };
    settings.update(|s| {
        s.manual_mode = true;
        s.manual_base = preset.core_range.base as u32;
        s.manual_max = preset.core_range.count as u32;
        s.manual_profile = match mode {
            ForceMode::Gaming => RssProfile::NumaStatic,
            ForceMode::Desktop => RssProfile::Closest,
        };
    })?;
    Ok(preset)
}

// ============================================================================
// Mutating commands
// ============================================================================

fn cmd_apply(db: Arc<Database>, settings: &SettingsHandle) -> Result<()> {
    let _lock = crate::acquire_instance_lock()?;
    let controller = platform::create_controller()?;

    let topology = TopologyProbe::system().probe();
    let preset = ModePreset::manual(&topology, &settings.snapshot().settings);
    let probe_host = SafeApplyTransaction::resolve_probe_host(controller.as_ref());
    let transaction = SafeApplyTransaction::new(controller, db, probe_host);

    transaction.safe_apply(&preset, "MANUAL")?;
    println!("Applied manual preset: {}", preset);
    Ok(())
}

fn cmd_recover(db: Arc<Database>) -> Result<()> {
    let _lock = crate::acquire_instance_lock()?;
    let controller = platform::create_controller()?;
    let probe_host = SafeApplyTransaction::resolve_probe_host(controller.as_ref());
    let transaction = SafeApplyTransaction::new(controller, db, probe_host);

    if transaction.recover_pending()? {
        println!("Restored configuration from an interrupted transaction");
    } else {
        println!("Nothing to recover");
    }
    Ok(())
}
