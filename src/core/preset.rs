//! Mode presets derived from topology

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::gap::{calculate_best_gap, CoreRange};
use super::settings::Settings;
use super::topology::{CoreTopology, PollutedCoreSet};

/// Physical core count at or below which gaming keeps interrupt moderation on
const SMALL_CPU_PHYSICAL_CORES: usize = 6;
/// Logical processor count from which desktop mode uses 8 receive queues
const LARGE_CPU_LOGICAL_PROCESSORS: usize = 12;

/// Windows RSS load-balancing profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RssProfile {
    #[default]
    Closest,
    ClosestStatic,
    #[serde(rename = "NUMA")]
    Numa,
    #[serde(rename = "NUMAStatic")]
    NumaStatic,
}

impl RssProfile {
    /// Name as accepted by `Set-NetAdapterRss -Profile`
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closest => "Closest",
            Self::ClosestStatic => "ClosestStatic",
            Self::Numa => "NUMA",
            Self::NumaStatic => "NUMAStatic",
        }
    }

    pub fn all() -> &'static [RssProfile] {
        &[
            RssProfile::Closest,
            RssProfile::ClosestStatic,
            RssProfile::Numa,
            RssProfile::NumaStatic,
        ]
    }
}

impl fmt::Display for RssProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RssProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|p| p.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown RSS profile '{}'", s))
    }
}

/// Adapter interrupt moderation setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptModeration {
    Enabled,
    Disabled,
}

impl InterruptModeration {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Enabled => "Enabled",
            Self::Disabled => "Disabled",
        }
    }
}

/// Everything `safe_apply` pushes to the adapters for one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModePreset {
    pub core_range: CoreRange,
    pub receive_queue_count: usize,
    pub rss_profile: RssProfile,
    pub interrupt_moderation: InterruptModeration,
}

impl ModePreset {
    /// Low-latency preset pinned to the best clean gap
    pub fn gaming(topology: &CoreTopology, polluted: &PollutedCoreSet) -> Self {
        let core_range = calculate_best_gap(topology, polluted);
        let interrupt_moderation = if topology.physical_core_count <= SMALL_CPU_PHYSICAL_CORES {
            InterruptModeration::Enabled
        } else {
            InterruptModeration::Disabled
        };

        Self {
            core_range,
            receive_queue_count: core_range.count,
            rss_profile: RssProfile::NumaStatic,
            interrupt_moderation,
        }
    }

    /// Throughput preset spread over every logical processor
    pub fn desktop(topology: &CoreTopology) -> Self {
        let logical = topology.logical_processor_count;
        Self {
            core_range: CoreRange::new(0, logical),
            receive_queue_count: if logical < LARGE_CPU_LOGICAL_PROCESSORS { 4 } else { 8 },
            rss_profile: RssProfile::Closest,
            interrupt_moderation: InterruptModeration::Enabled,
        }
    }

    /// User-chosen preset, clamped to the machine
    pub fn manual(topology: &CoreTopology, settings: &Settings) -> Self {
        let logical = topology.logical_processor_count.max(1);
        let base = (settings.manual_base as usize).min(logical - 1);
        let count = (settings.manual_max as usize).clamp(1, logical - base);

        Self {
            core_range: CoreRange::new(base, count),
            receive_queue_count: count,
            rss_profile: settings.manual_profile,
            interrupt_moderation: InterruptModeration::Enabled,
        }
    }
}

impl fmt::Display for ModePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {} queues, profile {}, interrupt moderation {}",
            self.core_range,
            self.receive_queue_count,
            self.rss_profile,
            self.interrupt_moderation.label()
        )
    }
}

/// The two automatic presets, recomputed whenever topology is re-scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presets {
    pub gaming: ModePreset,
    pub desktop: ModePreset,
}

impl Presets {
    pub fn calculate(topology: &CoreTopology, polluted: &PollutedCoreSet) -> Self {
        Self {
            gaming: ModePreset::gaming(topology, polluted),
            desktop: ModePreset::desktop(topology),
        }
    }
}
