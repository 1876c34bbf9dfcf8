//! CPU topology and interrupt-affinity pollution probing

use std::collections::BTreeSet;
use std::fmt;

use sysinfo::{CpuRefreshKind, System};
use tracing::{debug, info, warn};

use super::error::ProbeError;
use crate::platform;

/// Fallback physical core count when the query fails
pub const DEFAULT_PHYSICAL_CORES: usize = 4;
/// Fallback logical processor count when the query fails
pub const DEFAULT_LOGICAL_PROCESSORS: usize = 8;

/// Number of processors representable in an affinity mask
const AFFINITY_MASK_BITS: usize = 64;

/// Immutable snapshot of the machine's core layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreTopology {
    pub physical_core_count: usize,
    pub logical_processor_count: usize,
    pub hyperthreaded: bool,
}

impl CoreTopology {
    pub fn new(physical_core_count: usize, logical_processor_count: usize) -> Self {
        Self {
            physical_core_count,
            logical_processor_count,
            hyperthreaded: logical_processor_count > physical_core_count,
        }
    }
}

impl Default for CoreTopology {
    fn default() -> Self {
        Self::new(DEFAULT_PHYSICAL_CORES, DEFAULT_LOGICAL_PROCESSORS)
    }
}

impl fmt::Display for CoreTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}P / {}L{}",
            self.physical_core_count,
            self.logical_processor_count,
            if self.hyperthreaded { " (SMT)" } else { "" }
        )
    }
}

/// Logical processors already claimed by other device interrupt policies.
///
/// The boot core (index 0) is always a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollutedCoreSet {
    cores: BTreeSet<usize>,
}

impl PollutedCoreSet {
    /// Build from an affinity bitmask, bit `i` marking logical processor `i`
    pub fn from_mask(mask: u64) -> Self {
        let mask = mask | 1;
        let cores = (0..AFFINITY_MASK_BITS)
            .filter(|i| mask & (1u64 << i) != 0)
            .collect();
        Self { cores }
    }

    /// Build from explicit indices; index 0 is added regardless
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut cores: BTreeSet<usize> = indices.into_iter().collect();
        cores.insert(0);
        Self { cores }
    }

    /// The conservative result of a failed scan
    pub fn boot_core_only() -> Self {
        Self::from_mask(0)
    }

    pub fn contains(&self, core: usize) -> bool {
        self.cores.contains(&core)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cores.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }
}

impl Default for PollutedCoreSet {
    fn default() -> Self {
        Self::boot_core_only()
    }
}

impl fmt::Display for PollutedCoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = self.cores.iter().map(|c| c.to_string()).collect();
        write!(f, "[{}]", list.join(", "))
    }
}

/// Raw OS queries behind the probe
pub trait TopologySource: Send {
    /// Returns `(physical, logical)` core counts
    fn core_counts(&self) -> Result<(usize, usize), ProbeError>;

    /// OR of every device interrupt affinity override mask
    fn interrupt_affinity_mask(&self) -> Result<u64, ProbeError>;
}

/// Topology source backed by sysinfo and the platform registry scan
pub struct SystemTopologySource;

impl TopologySource for SystemTopologySource {
    fn core_counts(&self) -> Result<(usize, usize), ProbeError> {
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());

        let logical = system.cpus().len();
        let physical = system
            .physical_core_count()
            .ok_or_else(|| ProbeError::CoreCount("physical core count unavailable".into()))?;

        Ok((physical, logical))
    }

    fn interrupt_affinity_mask(&self) -> Result<u64, ProbeError> {
        platform::interrupt_affinity_mask()
    }
}

/// Produces topology snapshots, degrading to conservative defaults on failure
pub struct TopologyProbe {
    source: Box<dyn TopologySource>,
}

impl TopologyProbe {
    pub fn new(source: Box<dyn TopologySource>) -> Self {
        Self { source }
    }

    /// Probe using the running system
    pub fn system() -> Self {
        Self::new(Box::new(SystemTopologySource))
    }

    /// Read core counts. Never fails.
    pub fn probe(&self) -> CoreTopology {
        match self.source.core_counts() {
            Ok((physical, logical)) if physical > 0 && logical > 0 => {
                let topology = CoreTopology::new(physical, logical.max(physical));
                debug!("Topology probed: {}", topology);
                topology
            }
            Ok((physical, logical)) => {
                warn!(
                    "Topology query returned {}P/{}L, using defaults",
                    physical, logical
                );
                CoreTopology::default()
            }
            Err(e) => {
                warn!("Topology query failed ({}), using defaults", e);
                CoreTopology::default()
            }
        }
    }

    /// Scan interrupt affinity overrides. A failed scan yields `{0}`.
    pub fn scan_polluted_cores(&self) -> PollutedCoreSet {
        info!("Scanning registry for IRQ-polluted cores...");
        match self.source.interrupt_affinity_mask() {
            Ok(mask) => {
                let polluted = PollutedCoreSet::from_mask(mask);
                info!("Polluted cores: {}", polluted);
                polluted
            }
            Err(e) => {
                warn!("Interrupt affinity scan failed ({}), isolating boot core only", e);
                PollutedCoreSet::boot_core_only()
            }
        }
    }
}
