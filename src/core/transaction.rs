//! Backup, apply, verify and rollback around adapter changes

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::controller::{
    AdapterId, NetworkAdapterController, RegistryValues, REG_ENABLE_TCPA,
    REG_MAX_NUM_RSS_QUEUES, REG_RECEIVE_SIDE_SCALING, TRACKED_REGISTRY_VALUES,
};
use super::error::ConnectivityLost;
use super::preset::ModePreset;

/// Time the driver needs to renegotiate queues before the probe is meaningful
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(2);
/// Maximum wait for the echo reply
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Probe target when the default gateway cannot be discovered
pub const FALLBACK_PROBE_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Lifecycle of a persisted backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    /// Captured, change not yet confirmed or reverted
    Pending,
    /// Change verified, backup no longer needed
    Committed,
    /// Backup has been written back
    RolledBack,
}

/// Registry values captured right before a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfigBackup {
    pub id: Uuid,
    pub mode: String,
    pub created_at: DateTime<Utc>,
    pub values: RegistryValues,
    pub state: BackupState,
}

impl NetworkConfigBackup {
    pub fn new(mode: &str, values: RegistryValues) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode: mode.to_string(),
            created_at: Utc::now(),
            values,
            state: BackupState::Pending,
        }
    }
}

/// Durable storage for the most recent backup
pub trait BackupStore: Send + Sync {
    /// Overwrites any previous record
    fn save_backup(&self, backup: &NetworkConfigBackup) -> Result<()>;

    fn load_backup(&self) -> Result<Option<NetworkConfigBackup>>;
}

/// Performs one guarded configuration change at a time.
///
/// Owned by the autopilot thread (or a one-shot CLI command holding the
/// instance lock); never shared between two callers.
pub struct SafeApplyTransaction {
    controller: Arc<dyn NetworkAdapterController>,
    store: Arc<dyn BackupStore>,
    probe_host: IpAddr,
    sleep: fn(Duration),
}

impl SafeApplyTransaction {
    pub fn new(
        controller: Arc<dyn NetworkAdapterController>,
        store: Arc<dyn BackupStore>,
        probe_host: IpAddr,
    ) -> Self {
        Self {
            controller,
            store,
            probe_host,
            sleep: std::thread::sleep,
        }
    }

    /// Resolve the default gateway once, falling back to a public address
    pub fn resolve_probe_host(controller: &dyn NetworkAdapterController) -> IpAddr {
        match controller.resolve_default_gateway() {
            Ok(gateway) => {
                info!("Connectivity probe target: gateway {}", gateway);
                gateway
            }
            Err(e) => {
                warn!(
                    "Gateway discovery failed ({}), probing {} instead",
                    e, FALLBACK_PROBE_HOST
                );
                FALLBACK_PROBE_HOST
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Apply `preset`, keeping it only if the probe host still answers.
    ///
    /// Every step runs to completion; on a failed probe the backup is
    /// restored before this returns.
    pub fn safe_apply(&self, preset: &ModePreset, mode_name: &str) -> Result<(), ConnectivityLost> {
        info!("Applying SAFE mode {}: {}", mode_name, preset);

        let mut backup = self.capture_backup(mode_name);
        let adapters = self.active_adapters();

        self.apply(&adapters, preset);

        (self.sleep)(SETTLE_INTERVAL);

        if self.controller.ping(self.probe_host, PROBE_TIMEOUT) {
            backup.state = BackupState::Committed;
            self.persist(&backup);
            info!("Mode {} applied, {} still reachable", mode_name, self.probe_host);
            return Ok(());
        }

        error!("Connectivity lost after {}! Rolling back...", mode_name);
        self.rollback(&adapters, &backup.values);
        backup.state = BackupState::RolledBack;
        self.persist(&backup);

        Err(ConnectivityLost {
            mode: mode_name.to_string(),
            host: self.probe_host,
        })
    }

    /// Restore a backup left pending by an interrupted run.
    ///
    /// Returns true if something was restored.
    pub fn recover_pending(&self) -> Result<bool> {
        let Some(mut backup) = self.store.load_backup()? else {
            return Ok(false);
        };
        if backup.state != BackupState::Pending {
            debug!("Last backup {} is {:?}, nothing to recover", backup.id, backup.state);
            return Ok(false);
        }

        warn!(
            "Found unfinished {} transaction from {}, restoring backup",
            backup.mode, backup.created_at
        );
        let adapters = self.active_adapters();
        self.rollback(&adapters, &backup.values);

        backup.state = BackupState::RolledBack;
        self.store.save_backup(&backup)?;
        Ok(true)
    }

    fn capture_backup(&self, mode_name: &str) -> NetworkConfigBackup {
        let values = match self.controller.read_registry_values(&TRACKED_REGISTRY_VALUES) {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    "Registry backup failed ({}); applying with an empty backup, rollback can only restore interrupt moderation",
                    e
                );
                RegistryValues::new()
            }
        };

        let backup = NetworkConfigBackup::new(mode_name, values);
        debug!("Backup {} captured: {:?}", backup.id, backup.values);
        self.persist(&backup);
        backup
    }

    fn active_adapters(&self) -> Vec<AdapterId> {
        match self.controller.list_active_adapters() {
            Ok(adapters) => {
                if adapters.is_empty() {
                    warn!("No active physical adapters found");
                }
                adapters
            }
            Err(e) => {
                warn!("Failed to list adapters: {}", e);
                Vec::new()
            }
        }
    }

    fn apply(&self, adapters: &[AdapterId], preset: &ModePreset) {
        let enable_moderation = preset.interrupt_moderation.is_enabled();

        for adapter in adapters {
            if let Err(e) = self.controller.apply_rss(
                adapter,
                preset.core_range.base,
                preset.core_range.count,
                preset.receive_queue_count,
                preset.rss_profile,
            ) {
                warn!("RSS settings not applied to {}: {}", adapter, e);
            }
            if let Err(e) = self
                .controller
                .apply_interrupt_moderation(adapter, enable_moderation)
            {
                warn!("Interrupt moderation not applied to {}: {}", adapter, e);
            }
        }

        let mut tweaks = RegistryValues::new();
        tweaks.insert(REG_RECEIVE_SIDE_SCALING.to_string(), 1);
        tweaks.insert(REG_ENABLE_TCPA.to_string(), 1);
        tweaks.insert(
            REG_MAX_NUM_RSS_QUEUES.to_string(),
            preset.receive_queue_count as u32,
        );
        if let Err(e) = self.controller.write_registry_values(&tweaks) {
            warn!("Registry tweaks not applied: {}", e);
        }
    }

    fn rollback(&self, adapters: &[AdapterId], values: &RegistryValues) {
        if values.is_empty() {
            warn!("Backup is empty, no registry values to restore");
        } else if let Err(e) = self.controller.write_registry_values(values) {
            error!("Failed to restore registry backup: {}", e);
        }

        for adapter in adapters {
            if let Err(e) = self.controller.apply_interrupt_moderation(adapter, true) {
                error!("Failed to re-enable interrupt moderation on {}: {}", adapter, e);
            }
        }
    }

    fn persist(&self, backup: &NetworkConfigBackup) {
        if let Err(e) = self.store.save_backup(backup) {
            warn!("Failed to persist backup {}: {}", backup.id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::sync::Mutex;

    use super::*;
    use crate::core::controller::fake::FakeController;
    use crate::core::gap::CoreRange;
    use crate::core::preset::{InterruptModeration, RssProfile};

    thread_local! {
        static SLEPT: RefCell<Vec<Duration>> = const { RefCell::new(Vec::new()) };
    }

    pub(crate) fn record_sleep(d: Duration) {
        SLEPT.with(|s| s.borrow_mut().push(d));
    }

    fn slept() -> Vec<Duration> {
        SLEPT.with(|s| s.borrow().clone())
    }

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub saved: Mutex<Vec<NetworkConfigBackup>>,
    }

    impl BackupStore for MemoryStore {
        fn save_backup(&self, backup: &NetworkConfigBackup) -> Result<()> {
            self.saved.lock().unwrap().push(backup.clone());
            Ok(())
        }

        fn load_backup(&self) -> Result<Option<NetworkConfigBackup>> {
            Ok(self.saved.lock().unwrap().last().cloned())
        }
    }

    pub(crate) fn gaming_preset() -> ModePreset {
        ModePreset {
            core_range: CoreRange::new(4, 4),
            receive_queue_count: 4,
            rss_profile: RssProfile::NumaStatic,
            interrupt_moderation: InterruptModeration::Disabled,
        }
    }

    fn setup(adapters: &[&str]) -> (Arc<FakeController>, Arc<MemoryStore>, SafeApplyTransaction) {
        let controller = Arc::new(FakeController::new(adapters));
        let store = Arc::new(MemoryStore::default());
        let tx = SafeApplyTransaction::new(
            controller.clone(),
            store.clone(),
            IpAddr::from([192, 168, 1, 1]),
        )
        .with_sleep(record_sleep);
        (controller, store, tx)
    }

    #[test]
    fn successful_apply_commits_and_settles() {
        let (controller, store, tx) = setup(&["Ethernet", "Wi-Fi"]);
        tx.safe_apply(&gaming_preset(), "GAMING").unwrap();

        controller.with(|s| {
            assert_eq!(s.registry[REG_RECEIVE_SIDE_SCALING], 1);
            assert_eq!(s.registry[REG_ENABLE_TCPA], 1);
            assert_eq!(s.registry[REG_MAX_NUM_RSS_QUEUES], 4);
            assert_eq!(s.rss.len(), 2);
            assert!(s.rss.values().all(|r| r.base == 4 && r.queues == 4));
            assert!(s.moderation.values().all(|m| !m));
            assert_eq!(s.pings, vec![(IpAddr::from([192, 168, 1, 1]), PROBE_TIMEOUT)]);
        });
        assert!(slept().contains(&SETTLE_INTERVAL));

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.first().unwrap().state, BackupState::Pending);
        assert_eq!(saved.last().unwrap().state, BackupState::Committed);
    }

    #[test]
    fn verification_pings_configured_host_once() {
        let controller = Arc::new(FakeController::new(&["Ethernet"]));
        let gateway = IpAddr::from([10, 0, 0, 1]);
        let tx = SafeApplyTransaction::new(
            controller.clone(),
            Arc::new(MemoryStore::default()),
            gateway,
        )
        .with_sleep(record_sleep);

        tx.safe_apply(&gaming_preset(), "GAMING").unwrap();
        assert_eq!(
            controller.with(|s| s.pings.clone()),
            vec![(gateway, Duration::from_millis(1000))]
        );
    }

    #[test]
    fn backup_is_persisted_before_any_mutation() {
        let (controller, store, tx) = setup(&["Ethernet"]);
        tx.safe_apply(&gaming_preset(), "GAMING").unwrap();

        let first = store.saved.lock().unwrap()[0].clone();
        assert_eq!(first.values[REG_RECEIVE_SIDE_SCALING], 0);
        assert_eq!(first.values[REG_MAX_NUM_RSS_QUEUES], 2);
        assert_eq!(controller.with(|s| s.registry_reads), 1);
    }

    #[test]
    fn failed_probe_restores_backup_and_moderation() {
        let (controller, store, tx) = setup(&["Ethernet", "Wi-Fi"]);
        let before = controller.with(|s| s.registry.clone());
        controller.with(|s| s.reachable = false);

        let err = tx.safe_apply(&gaming_preset(), "GAMING").unwrap_err();
        assert_eq!(err.mode, "GAMING");

        controller.with(|s| {
            assert_eq!(s.registry, before);
            assert!(s.moderation.values().all(|m| *m));
            assert_eq!(s.ping_count, 1);
        });
        assert_eq!(
            store.saved.lock().unwrap().last().unwrap().state,
            BackupState::RolledBack
        );
    }

    #[test]
    fn unreadable_registry_still_applies_and_rolls_back_moderation() {
        let (controller, _store, tx) = setup(&["Ethernet"]);
        controller.with(|s| {
            s.fail_registry_read = true;
            s.reachable = false;
        });

        assert!(tx.safe_apply(&gaming_preset(), "GAMING").is_err());
        controller.with(|s| {
            assert_eq!(s.rss_calls, 1);
            assert_eq!(s.registry[REG_MAX_NUM_RSS_QUEUES], 4);
            assert!(s.moderation.values().all(|m| *m));
        });
    }

    #[test]
    fn rejecting_adapter_does_not_abort() {
        let (controller, _store, tx) = setup(&["Ethernet", "Broken"]);
        controller.with(|s| {
            s.rejecting_adapters.insert(AdapterId("Broken".into()));
        });

        tx.safe_apply(&gaming_preset(), "GAMING").unwrap();
        controller.with(|s| {
            assert_eq!(s.rss_calls, 2);
            assert!(s.rss.contains_key(&AdapterId("Ethernet".into())));
            assert!(!s.rss.contains_key(&AdapterId("Broken".into())));
        });
    }

    #[test]
    fn repeated_apply_matches_single_apply() {
        let (once, _, tx_once) = setup(&["Ethernet"]);
        tx_once.safe_apply(&gaming_preset(), "GAMING").unwrap();

        let (twice, store, tx_twice) = setup(&["Ethernet"]);
        tx_twice.safe_apply(&gaming_preset(), "GAMING").unwrap();
        tx_twice.safe_apply(&gaming_preset(), "GAMING").unwrap();

        let snapshot = |c: &FakeController| {
            c.with(|s| (s.registry.clone(), s.rss.clone(), s.moderation.clone()))
        };
        assert_eq!(snapshot(&once), snapshot(&twice));

        // Second call backed up the already-applied state, not the original
        let saved = store.saved.lock().unwrap();
        let second_backup = saved.iter().filter(|b| b.state == BackupState::Pending).nth(1);
        assert_eq!(second_backup.unwrap().values[REG_MAX_NUM_RSS_QUEUES], 4);
    }

    #[test]
    fn recover_restores_pending_backup() {
        let (controller, store, tx) = setup(&["Ethernet"]);
        let mut values = RegistryValues::new();
        values.insert(REG_MAX_NUM_RSS_QUEUES.into(), 16);
        store.save_backup(&NetworkConfigBackup::new("GAMING", values)).unwrap();
        controller.with(|s| {
            s.moderation.insert(AdapterId("Ethernet".into()), false);
        });

        assert!(tx.recover_pending().unwrap());
        controller.with(|s| {
            assert_eq!(s.registry[REG_MAX_NUM_RSS_QUEUES], 16);
            assert!(s.moderation.values().all(|m| *m));
        });
        assert!(!tx.recover_pending().unwrap());
    }

    #[test]
    fn recover_ignores_committed_backup() {
        let (controller, _store, tx) = setup(&["Ethernet"]);
        tx.safe_apply(&gaming_preset(), "GAMING").unwrap();
        assert!(!tx.recover_pending().unwrap());
        assert_eq!(controller.with(|s| s.registry[REG_MAX_NUM_RSS_QUEUES]), 4);
    }

    #[test]
    fn ping_target_falls_back_to_public_address() {
        let controller = FakeController::new(&[]);
        assert_eq!(
            SafeApplyTransaction::resolve_probe_host(&controller),
            IpAddr::from([192, 168, 1, 1])
        );

        controller.with(|s| s.gateway = None);
        assert_eq!(
            SafeApplyTransaction::resolve_probe_host(&controller),
            FALLBACK_PROBE_HOST
        );
    }
}
