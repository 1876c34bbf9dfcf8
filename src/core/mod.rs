//! Core module - topology probing, presets, guarded apply and the autopilot

pub mod autopilot;
pub mod controller;
pub mod error;
pub mod gap;
pub mod monitor;
pub mod preset;
pub mod settings;
pub mod topology;
pub mod transaction;

pub use autopilot::{Autopilot, StatusEvent, StopSignal};
pub use controller::NetworkAdapterController;
pub use monitor::SysinfoProcessMonitor;
pub use preset::{ModePreset, Presets, RssProfile};
pub use settings::{Settings, SettingsHandle};
pub use topology::{CoreTopology, PollutedCoreSet, TopologyProbe};
pub use transaction::SafeApplyTransaction;
