//! Network adapter controller interface

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ControllerError;
use super::preset::RssProfile;

/// TCP/IP registry values captured before every change
pub const REG_RECEIVE_SIDE_SCALING: &str = "ReceiveSideScaling";
pub const REG_ENABLE_TCPA: &str = "EnableTCPA";
pub const REG_MAX_NUM_RSS_QUEUES: &str = "MaxNumRSSQueues";

pub const TRACKED_REGISTRY_VALUES: [&str; 3] = [
    REG_RECEIVE_SIDE_SCALING,
    REG_ENABLE_TCPA,
    REG_MAX_NUM_RSS_QUEUES,
];

/// Registry value name to DWORD
pub type RegistryValues = BTreeMap<String, u32>;

/// Name of a physical network adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdapterId(pub String);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Applies and queries adapter and registry state
pub trait NetworkAdapterController: Send + Sync {
    /// Adapters that are up and not virtual
    fn list_active_adapters(&self) -> Result<Vec<AdapterId>, ControllerError>;

    fn apply_rss(
        &self,
        adapter: &AdapterId,
        base: usize,
        max_count: usize,
        queues: usize,
        profile: RssProfile,
    ) -> Result<(), ControllerError>;

    fn apply_interrupt_moderation(
        &self,
        adapter: &AdapterId,
        enabled: bool,
    ) -> Result<(), ControllerError>;

    /// Values that do not exist are omitted from the result
    fn read_registry_values(&self, names: &[&str]) -> Result<RegistryValues, ControllerError>;

    fn write_registry_values(&self, values: &RegistryValues) -> Result<(), ControllerError>;

    /// One echo request; true iff a reply arrived within `timeout`
    fn ping(&self, host: IpAddr, timeout: Duration) -> bool;

    fn resolve_default_gateway(&self) -> Result<IpAddr, ControllerError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory controller used across the core tests

    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RssState {
        pub base: usize,
        pub max_count: usize,
        pub queues: usize,
        pub profile: RssProfile,
    }

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub registry: RegistryValues,
        pub rss: BTreeMap<AdapterId, RssState>,
        pub moderation: BTreeMap<AdapterId, bool>,
        pub reachable: bool,
        pub ping_count: usize,
        /// Every echo request as (host, timeout)
        pub pings: Vec<(IpAddr, Duration)>,
        pub rss_calls: usize,
        pub registry_reads: usize,
        pub fail_registry_read: bool,
        pub rejecting_adapters: HashSet<AdapterId>,
        /// Reachability flips to false once RSS is pointed at this base
        pub unreachable_when_base: Option<usize>,
        pub gateway: Option<IpAddr>,
    }

    pub struct FakeController {
        pub adapters: Vec<AdapterId>,
        pub state: Mutex<FakeState>,
    }

    impl FakeController {
        pub fn new(adapters: &[&str]) -> Self {
            let mut registry = RegistryValues::new();
            registry.insert(REG_RECEIVE_SIDE_SCALING.into(), 0);
            registry.insert(REG_ENABLE_TCPA.into(), 0);
            registry.insert(REG_MAX_NUM_RSS_QUEUES.into(), 2);

            let adapters: Vec<AdapterId> =
                adapters.iter().map(|a| AdapterId(a.to_string())).collect();
            let moderation = adapters.iter().map(|a| (a.clone(), true)).collect();

            Self {
                adapters,
                state: Mutex::new(FakeState {
                    registry,
                    moderation,
                    reachable: true,
                    gateway: Some(IpAddr::from([192, 168, 1, 1])),
                    ..FakeState::default()
                }),
            }
        }

        pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }
    }

    impl NetworkAdapterController for FakeController {
        fn list_active_adapters(&self) -> Result<Vec<AdapterId>, ControllerError> {
            Ok(self.adapters.clone())
        }

        fn apply_rss(
            &self,
            adapter: &AdapterId,
            base: usize,
            max_count: usize,
            queues: usize,
            profile: RssProfile,
        ) -> Result<(), ControllerError> {
            self.with(|s| {
                s.rss_calls += 1;
                if s.rejecting_adapters.contains(adapter) {
                    return Err(ControllerError::AdapterRejected {
                        adapter: adapter.to_string(),
                        reason: "fixture".into(),
                    });
                }
                if s.unreachable_when_base == Some(base) {
                    s.reachable = false;
                }
                s.rss.insert(
                    adapter.clone(),
                    RssState {
                        base,
                        max_count,
                        queues,
                        profile,
                    },
                );
                Ok(())
            })
        }

        fn apply_interrupt_moderation(
            &self,
            adapter: &AdapterId,
            enabled: bool,
        ) -> Result<(), ControllerError> {
            self.with(|s| {
                if s.rejecting_adapters.contains(adapter) {
                    return Err(ControllerError::AdapterRejected {
                        adapter: adapter.to_string(),
                        reason: "fixture".into(),
                    });
                }
                s.moderation.insert(adapter.clone(), enabled);
                Ok(())
            })
        }

        fn read_registry_values(
            &self,
            names: &[&str],
        ) -> Result<RegistryValues, ControllerError> {
            self.with(|s| {
                s.registry_reads += 1;
                if s.fail_registry_read {
                    return Err(ControllerError::Registry(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "fixture",
                    )));
                }
                Ok(names
                    .iter()
                    .filter_map(|n| s.registry.get(*n).map(|v| (n.to_string(), *v)))
                    .collect())
            })
        }

        fn write_registry_values(&self, values: &RegistryValues) -> Result<(), ControllerError> {
            self.with(|s| {
                for (name, value) in values {
                    s.registry.insert(name.clone(), *value);
                }
                Ok(())
            })
        }

        fn ping(&self, host: IpAddr, timeout: Duration) -> bool {
            self.with(|s| {
                s.ping_count += 1;
                s.pings.push((host, timeout));
                s.reachable
            })
        }

        fn resolve_default_gateway(&self) -> Result<IpAddr, ControllerError> {
            self.with(|s| s.gateway.ok_or(ControllerError::Unsupported))
        }
    }
}
