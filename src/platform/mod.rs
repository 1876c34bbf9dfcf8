//! Platform-specific implementations
//!
//! Adapter control only exists on Windows. Elsewhere the read-only commands
//! still work and everything that touches the network stack reports
//! "Unsupported platform".

#[cfg(windows)]
pub mod windows;

use std::sync::Arc;

use anyhow::Result;

use crate::core::error::ProbeError;
use crate::core::NetworkAdapterController;

/// Combined interrupt affinity mask of all devices with an override
pub fn interrupt_affinity_mask() -> Result<u64, ProbeError> {
    #[cfg(windows)]
    {
        windows::interrupt_affinity_mask()
    }
    #[cfg(not(windows))]
    {
        Err(ProbeError::Unsupported)
    }
}

/// The adapter controller for this platform
pub fn create_controller() -> Result<Arc<dyn NetworkAdapterController>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(windows::WindowsAdapterController::new()))
    }
    #[cfg(not(windows))]
    {
        anyhow::bail!("Unsupported platform")
    }
}
