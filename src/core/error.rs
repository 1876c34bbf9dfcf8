//! Error types for the tuning core
//!
//! None of these are fatal to the daemon. Each one maps to a degradation
//! path: conservative defaults, a skipped adapter, a rollback, or a poll
//! cycle treated as idle.

use std::net::IpAddr;

use thiserror::Error;

/// Topology or interrupt-affinity query failed
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("core count query failed: {0}")]
    CoreCount(String),
    #[error("interrupt affinity scan failed: {0}")]
    AffinityScan(String),
    #[error("topology probing is not supported on this platform")]
    Unsupported,
}

/// A network adapter or registry operation failed
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("adapter '{adapter}' rejected setting: {reason}")]
    AdapterRejected { adapter: String, reason: String },
    #[error("registry access failed: {0}")]
    Registry(#[from] std::io::Error),
    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("unexpected output: {0}")]
    Parse(String),
    #[error("network adapter control is not supported on this platform")]
    Unsupported,
}

/// The post-apply reachability probe failed and the change was rolled back
#[derive(Debug, Error)]
#[error("connectivity lost after applying {mode} (probe host {host}), previous configuration restored")]
pub struct ConnectivityLost {
    pub mode: String,
    pub host: IpAddr,
}

/// Process enumeration failed
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("process enumeration failed: {0}")]
    Enumeration(String),
}
