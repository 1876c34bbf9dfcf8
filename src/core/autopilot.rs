//! Autopilot - game-aware mode switching with hysteresis

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::monitor::{is_game_active, ProcessMonitor};
use super::preset::{ModePreset, Presets};
use super::settings::SettingsHandle;
use super::topology::TopologyProbe;
use super::transaction::SafeApplyTransaction;

/// Time between polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Seconds without an active game before leaving gaming mode
pub const HYSTERESIS_SECS: i64 = 60;

pub const COLOR_MANUAL: &str = "#3498db";
pub const COLOR_GAMING: &str = "#e74c3c";
pub const COLOR_DESKTOP: &str = "#2ecc71";
pub const COLOR_ROLLBACK: &str = "#f39c12";

/// Mode the autopilot believes the adapters are in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutopilotState {
    Unknown,
    Manual,
    Gaming,
    Desktop,
}

impl AutopilotState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Manual => "MANUAL",
            Self::Gaming => "GAMING",
            Self::Desktop => "DESKTOP",
        }
    }
}

impl fmt::Display for AutopilotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Notification sent on every mode transition or rollback
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub message: String,
    /// Hex color hint for presentation
    pub color: &'static str,
    /// State after the event
    pub state: AutopilotState,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(message: impl Into<String>, color: &'static str, state: AutopilotState) -> Self {
        Self {
            message: message.into(),
            color,
            state,
            timestamp: Utc::now(),
        }
    }
}

/// Receives status events. Fire-and-forget: must not block the loop.
pub trait StatusSink: Send {
    fn emit(&self, event: StatusEvent);
}

impl StatusSink for tokio::sync::mpsc::Sender<StatusEvent> {
    fn emit(&self, event: StatusEvent) {
        use tokio::sync::mpsc::error::TrySendError;

        match self.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Status queue full, dropping event '{}'", event.message)
            }
            Err(TrySendError::Closed(event)) => {
                debug!("No status listener for event '{}'", event.message)
            }
        }
    }
}

/// Cooperative shutdown flag, observed only between poll iterations
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep up to `timeout`; returns true if stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (stopped, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *stopped
    }
}

/// The control loop. Sole owner of the mode state and the only caller of
/// `safe_apply` while the daemon runs.
pub struct Autopilot {
    transaction: SafeApplyTransaction,
    monitor: Box<dyn ProcessMonitor>,
    probe: TopologyProbe,
    settings: SettingsHandle,
    sink: Box<dyn StatusSink>,
    presets: Presets,
    state: AutopilotState,
    hysteresis_remaining: i64,
}

impl Autopilot {
    pub fn new(
        transaction: SafeApplyTransaction,
        monitor: Box<dyn ProcessMonitor>,
        probe: TopologyProbe,
        settings: SettingsHandle,
        sink: Box<dyn StatusSink>,
    ) -> Self {
        let topology = probe.probe();
        let polluted = probe.scan_polluted_cores();
        let presets = Presets::calculate(&topology, &polluted);
        info!(
            "Presets for {}: gaming [{}], desktop [{}]",
            topology, presets.gaming, presets.desktop
        );

        Self {
            transaction,
            monitor,
            probe,
            settings,
            sink,
            presets,
            state: AutopilotState::Unknown,
            hysteresis_remaining: 0,
        }
    }

    pub fn state(&self) -> AutopilotState {
        self.state
    }

    pub fn hysteresis_remaining(&self) -> i64 {
        self.hysteresis_remaining
    }

    /// Re-probe topology and pollution; either may have changed since startup
    fn recalculate_presets(&mut self) {
        let topology = self.probe.probe();
        let polluted = self.probe.scan_polluted_cores();
        self.presets = Presets::calculate(&topology, &polluted);
        debug!("Gaming preset recalculated: {}", self.presets.gaming);
    }

    /// Poll until `stop` is triggered. An in-flight transaction always
    /// finishes before the stop is observed.
    pub fn run(mut self, stop: StopSignal) {
        info!("Autopilot started");
        while !stop.is_triggered() {
            self.poll_once();
            if stop.wait_timeout(POLL_INTERVAL) {
                break;
            }
        }
        info!("Autopilot stopped in {} mode", self.state);
    }

    /// One iteration of the state machine
    pub fn poll_once(&mut self) {
        let snapshot = self.settings.snapshot();
        let settings = &snapshot.settings;

        if settings.manual_mode {
            if self.state != AutopilotState::Manual {
                self.state = AutopilotState::Manual;
                self.emit("MANUAL OVERRIDE", COLOR_MANUAL);
            }
            return;
        }

        let game_active = match self.monitor.list_processes() {
            Ok(processes) => is_game_active(&processes, &settings.game_set()),
            Err(e) => {
                error!("Process monitor failed, assuming no game: {}", e);
                false
            }
        };

        if game_active {
            self.hysteresis_remaining = HYSTERESIS_SECS;
            if self.state != AutopilotState::Gaming {
                self.recalculate_presets();
                let gaming = self.presets.gaming;
                if self.apply(&gaming, AutopilotState::Gaming) {
                    let message = format!("GAMING MODE ({}Q)", gaming.receive_queue_count);
                    self.emit(message, COLOR_GAMING);
                }
            }
            return;
        }

        match self.state {
            AutopilotState::Gaming => {
                if self.hysteresis_remaining > 0 {
                    self.hysteresis_remaining -= POLL_INTERVAL.as_secs() as i64;
                    debug!(
                        "No game activity, leaving gaming mode in {}s",
                        self.hysteresis_remaining.max(0)
                    );
                } else {
                    self.switch_to_desktop();
                }
            }
            AutopilotState::Desktop => {}
            AutopilotState::Unknown | AutopilotState::Manual => self.switch_to_desktop(),
        }
    }

    fn switch_to_desktop(&mut self) {
        let desktop = self.presets.desktop;
        if self.apply(&desktop, AutopilotState::Desktop) {
            self.emit("DESKTOP MODE (Throughput)", COLOR_DESKTOP);
        }
    }

    fn apply(&mut self, preset: &ModePreset, target: AutopilotState) -> bool {
        match self.transaction.safe_apply(preset, target.label()) {
            Ok(()) => {
                info!("Mode {} -> {}", self.state, target);
                self.state = target;
                true
            }
            Err(e) => {
                warn!("{}; staying in {} mode, retrying next poll", e, self.state);
                self.emit(format!("ROLLBACK: {} reverted", target), COLOR_ROLLBACK);
                false
            }
        }
    }

    fn emit(&self, message: impl Into<String>, color: &'static str) {
        self.sink.emit(StatusEvent::new(message, color, self.state));
    }
}
