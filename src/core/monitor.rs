//! Process monitoring - game detection from live CPU usage

use std::collections::HashSet;
use std::time::Duration;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, trace};

use super::error::MonitorError;

/// A game counts as active above this CPU usage
pub const GAME_CPU_THRESHOLD_PERCENT: f32 = 5.0;
/// Window over which CPU usage is sampled
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

/// One running process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub name: String,
    pub cpu_percent: f32,
}

/// Enumerates running processes and their CPU usage
pub trait ProcessMonitor: Send {
    fn list_processes(&mut self) -> Result<Vec<ProcessSample>, MonitorError>;
}

/// True iff a process named in `games` is running above the CPU threshold
pub fn is_game_active(processes: &[ProcessSample], games: &HashSet<String>) -> bool {
    processes.iter().any(|p| {
        let hit = p.cpu_percent > GAME_CPU_THRESHOLD_PERCENT
            && games.contains(&p.name.to_lowercase());
        if hit {
            debug!("Game active: {} ({:.1}% CPU)", p.name, p.cpu_percent);
        }
        hit
    })
}

/// Process monitor backed by sysinfo
pub struct SysinfoProcessMonitor {
    system: System,
    sample_window: Duration,
}

impl SysinfoProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            sample_window: CPU_SAMPLE_WINDOW,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cpu(),
        );
    }
}

impl Default for SysinfoProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMonitor for SysinfoProcessMonitor {
    fn list_processes(&mut self) -> Result<Vec<ProcessSample>, MonitorError> {
        // CPU usage is the delta between two refreshes
        self.refresh();
        std::thread::sleep(self.sample_window);
        self.refresh();

        if self.system.processes().is_empty() {
            return Err(MonitorError::Enumeration(
                "no processes could be refreshed".into(),
            ));
        }

        let samples: Vec<ProcessSample> = self
            .system
            .processes()
            .values()
            .map(|p| ProcessSample {
                name: p.name().to_string_lossy().to_string(),
                cpu_percent: p.cpu_usage(),
            })
            .collect();

        trace!("Sampled {} processes", samples.len());
        Ok(samples)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Replays scripted poll results; repeats the last one when exhausted
    pub(crate) struct ScriptedMonitor {
        pub script: VecDeque<Result<Vec<ProcessSample>, String>>,
        last: Option<Result<Vec<ProcessSample>, String>>,
    }

    impl ScriptedMonitor {
        pub fn new() -> Self {
            Self {
                script: VecDeque::new(),
                last: None,
            }
        }

        pub fn push(&mut self, polls: usize, result: Result<Vec<ProcessSample>, String>) {
            for _ in 0..polls {
                self.script.push_back(result.clone());
            }
        }
    }

    impl ProcessMonitor for ScriptedMonitor {
        fn list_processes(&mut self) -> Result<Vec<ProcessSample>, MonitorError> {
            if let Some(next) = self.script.pop_front() {
                self.last = Some(next);
            }
            match self.last.clone().unwrap_or_else(|| Ok(Vec::new())) {
                Ok(samples) => Ok(samples),
                Err(e) => Err(MonitorError::Enumeration(e)),
            }
        }
    }

    pub(crate) fn sample(name: &str, cpu: f32) -> ProcessSample {
        ProcessSample {
            name: name.to_string(),
            cpu_percent: cpu,
        }
    }

    fn games() -> HashSet<String> {
        ["cs2.exe".to_string()].into_iter().collect()
    }

    #[test]
    fn game_above_threshold_is_active() {
        assert!(is_game_active(&[sample("cs2.exe", 35.0)], &games()));
    }

    #[test]
    fn name_match_is_case_insensitive() {
        assert!(is_game_active(&[sample("CS2.EXE", 12.0)], &games()));
    }

    #[test]
    fn idle_game_is_not_active() {
        assert!(!is_game_active(&[sample("cs2.exe", 5.0)], &games()));
        assert!(!is_game_active(&[sample("cs2.exe", 0.2)], &games()));
    }

    #[test]
    fn busy_non_game_is_not_active() {
        assert!(!is_game_active(&[sample("chrome.exe", 90.0)], &games()));
        assert!(!is_game_active(&[], &games()));
    }

    #[test]
    fn sysinfo_monitor_lists_current_process() {
        let mut monitor = SysinfoProcessMonitor::new();
        let processes = monitor.list_processes().unwrap();
        assert!(!processes.is_empty());
    }
}
