//! Clean-core gap finder for RSS steering

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::topology::{CoreTopology, PollutedCoreSet};

/// Contiguous span of logical processors `[base, base + count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRange {
    pub base: usize,
    pub count: usize,
}

impl CoreRange {
    pub fn new(base: usize, count: usize) -> Self {
        Self { base, count }
    }

    /// One past the last processor in the range
    pub fn end(&self) -> usize {
        self.base + self.count
    }

    pub fn cores(&self) -> impl Iterator<Item = usize> {
        self.base..self.end()
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 1 {
            write!(f, "core {}", self.base)
        } else {
            write!(f, "cores {}-{}", self.base, self.end() - 1)
        }
    }
}

/// Range returned when no clean core exists. Inert rather than an error.
pub const NO_CLEAN_CORE_RANGE: CoreRange = CoreRange { base: 1, count: 1 };

/// Search levels in priority order: (block size, require even base)
const PRIORITIES: [(usize, bool); 4] = [(4, true), (4, false), (2, true), (2, false)];

/// Pick the best clean block for RSS.
///
/// Larger blocks beat smaller ones, even bases beat odd ones within a size,
/// and higher indices beat lower ones within a level. Falls back to the
/// single highest clean core.
pub fn calculate_best_gap(topology: &CoreTopology, polluted: &PollutedCoreSet) -> CoreRange {
    let logical = topology.logical_processor_count;
    let is_clean = |core: usize| core < logical && !polluted.contains(core);

    let highest_clean = match (0..logical).rev().find(|&core| is_clean(core)) {
        Some(core) => core,
        None => {
            debug!("No clean cores among {} logical processors", logical);
            return NO_CLEAN_CORE_RANGE;
        }
    };

    for (level, &(count, even_only)) in PRIORITIES.iter().enumerate() {
        for base in (0..logical).rev() {
            if even_only && base % 2 != 0 {
                continue;
            }
            if base + count > logical {
                continue;
            }
            if (base..base + count).all(is_clean) {
                debug!(
                    "Safety-fit: priority {} ({} cores, base {})",
                    level + 1,
                    count,
                    base
                );
                return CoreRange::new(base, count);
            }
        }
    }

    debug!("Safety-fit: fallback (1 core, base {})", highest_clean);
    CoreRange::new(highest_clean, 1)
}
