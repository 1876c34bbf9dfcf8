//! Windows-specific adapter control, registry access and reachability probing

use std::ffi::c_void;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::os::windows::process::CommandExt;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, trace, warn};
use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ, KEY_WRITE};
use winreg::RegKey;

use windows::Win32::NetworkManagement::IpHelper::{
    IcmpCloseHandle, IcmpCreateFile, IcmpSendEcho, ICMP_ECHO_REPLY,
};
use windows::Win32::System::Threading::CREATE_NO_WINDOW;

use crate::core::controller::{AdapterId, NetworkAdapterController, RegistryValues};
use crate::core::error::{ControllerError, ProbeError};
use crate::core::preset::RssProfile;

const TCPIP_PARAMETERS: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters";
const DEVICE_ENUM_ROOT: &str = r"SYSTEM\CurrentControlSet\Enum";
const AFFINITY_POLICY_KEY: &str = "Affinity Policy";
const ASSIGNMENT_SET_OVERRIDE: &str = "AssignmentSetOverride";
/// Enum\<bus>\<device>\<instance>\Device Parameters\Interrupt Management\Affinity Policy
const MAX_ENUM_DEPTH: usize = 7;
const IP_SUCCESS: u32 = 0;

/// Run a PowerShell script without flashing a console window
fn run_powershell(script: &str) -> Result<String, ControllerError> {
    trace!("powershell: {}", script);
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map_err(|e| ControllerError::Command {
            command: "powershell".to_string(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ControllerError::Command {
            command: script.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Quote a value as a PowerShell single-quoted string
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn rejected(adapter: &AdapterId, err: ControllerError) -> ControllerError {
    match err {
        ControllerError::Command { stderr, .. } => ControllerError::AdapterRejected {
            adapter: adapter.to_string(),
            reason: stderr,
        },
        other => other,
    }
}

/// Adapter controller backed by the NetAdapter PowerShell module and the registry
#[derive(Debug, Default)]
pub struct WindowsAdapterController;

impl WindowsAdapterController {
    pub fn new() -> Self {
        Self
    }

    fn ping_v4(&self, host: Ipv4Addr, timeout: Duration) -> bool {
        let payload = *b"rss-sentinel";
        // Reply holds the header, the echoed payload and room for an ICMP error
        let reply_size = mem::size_of::<ICMP_ECHO_REPLY>() + payload.len() + 8;
        let mut reply = vec![0u64; reply_size.div_ceil(8)];

        unsafe {
            let handle = match IcmpCreateFile() {
                Ok(h) => h,
                Err(e) => {
                    warn!("IcmpCreateFile failed: {}", e);
                    return false;
                }
            };

            let replies = IcmpSendEcho(
                handle,
                u32::from_ne_bytes(host.octets()),
                payload.as_ptr() as *const c_void,
                payload.len() as u16,
                None,
                reply.as_mut_ptr() as *mut c_void,
                (reply.len() * 8) as u32,
                timeout.as_millis() as u32,
            );
            let _ = IcmpCloseHandle(handle);

            if replies == 0 {
                return false;
            }
            let echo = &*(reply.as_ptr() as *const ICMP_ECHO_REPLY);
            trace!("ICMP reply from {}: status {} rtt {}ms", host, echo.Status, echo.RoundTripTime);
            echo.Status == IP_SUCCESS
        }
    }

    fn ping_v6(&self, host: IpAddr, timeout: Duration) -> bool {
        let result = Command::new("ping")
            .args([
                "-n",
                "1",
                "-w",
                &timeout.as_millis().to_string(),
                &host.to_string(),
            ])
            .creation_flags(CREATE_NO_WINDOW.0)
            .output();

        match result {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!("Failed to run ping: {}", e);
                false
            }
        }
    }
}

impl NetworkAdapterController for WindowsAdapterController {
    fn list_active_adapters(&self) -> Result<Vec<AdapterId>, ControllerError> {
        let out = run_powershell(
            "Get-NetAdapter | Where-Object { $_.Status -eq 'Up' -and $_.Virtual -eq $false } \
             | Select-Object -ExpandProperty Name",
        )?;

        let adapters: Vec<AdapterId> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| AdapterId(l.to_string()))
            .collect();

        debug!("Active adapters: {:?}", adapters);
        Ok(adapters)
    }

    fn apply_rss(
        &self,
        adapter: &AdapterId,
        base: usize,
        max_count: usize,
        queues: usize,
        profile: RssProfile,
    ) -> Result<(), ControllerError> {
        let name = ps_quote(&adapter.0);
        let script = format!(
            "Set-NetAdapterRss -Name {name} -BaseProcessorNumber {base} -MaxProcessors {max_count} \
             -Profile {profile} -ErrorAction Stop; \
             Set-NetAdapterRss -Name {name} -NumberOfReceiveQueues {queues} -ErrorAction Stop",
            profile = profile.label(),
        );
        run_powershell(&script)
            .map(|_| ())
            .map_err(|e| rejected(adapter, e))
    }

    fn apply_interrupt_moderation(
        &self,
        adapter: &AdapterId,
        enabled: bool,
    ) -> Result<(), ControllerError> {
        let value = if enabled { "Enabled" } else { "Disabled" };
        let script = format!(
            "Set-NetAdapterAdvancedProperty -Name {} -DisplayName 'Interrupt Moderation' \
             -DisplayValue '{}' -ErrorAction Stop",
            ps_quote(&adapter.0),
            value
        );
        run_powershell(&script)
            .map(|_| ())
            .map_err(|e| rejected(adapter, e))
    }

    fn read_registry_values(&self, names: &[&str]) -> Result<RegistryValues, ControllerError> {
        let key = RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(TCPIP_PARAMETERS, KEY_READ)?;

        let mut values = RegistryValues::new();
        for name in names {
            match key.get_value::<u32, _>(name) {
                Ok(v) => {
                    values.insert(name.to_string(), v);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    trace!("Registry value {} not present", name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(values)
    }

    fn write_registry_values(&self, values: &RegistryValues) -> Result<(), ControllerError> {
        let key = RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(TCPIP_PARAMETERS, KEY_READ | KEY_WRITE)?;

        for (name, value) in values {
            key.set_value(name, value)?;
            debug!("Registry {} = {}", name, value);
        }
        Ok(())
    }

    fn ping(&self, host: IpAddr, timeout: Duration) -> bool {
        match host {
            IpAddr::V4(v4) => self.ping_v4(v4, timeout),
            IpAddr::V6(_) => self.ping_v6(host, timeout),
        }
    }

    fn resolve_default_gateway(&self) -> Result<IpAddr, ControllerError> {
        let out = run_powershell(
            "Get-NetRoute -DestinationPrefix 0.0.0.0/0 | Sort-Object RouteMetric \
             | Select-Object -First 1 -ExpandProperty NextHop",
        )?;
        let hop = out.trim();
        hop.parse()
            .map_err(|_| ControllerError::Parse(format!("default gateway '{}'", hop)))
    }
}

/// OR of every device's interrupt affinity override under the Enum tree
pub fn interrupt_affinity_mask() -> Result<u64, ProbeError> {
    let root = RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(DEVICE_ENUM_ROOT, KEY_READ)
        .map_err(|e| ProbeError::AffinityScan(e.to_string()))?;

    let mut mask = 0u64;
    let mut found = 0usize;
    scan_affinity_policies(&root, 0, &mut mask, &mut found);
    debug!("Found {} affinity overrides, combined mask {:#x}", found, mask);
    Ok(mask)
}

fn scan_affinity_policies(key: &RegKey, depth: usize, mask: &mut u64, found: &mut usize) {
    if depth > MAX_ENUM_DEPTH {
        return;
    }

    for name in key.enum_keys().filter_map(Result::ok) {
        // Access to some device keys is denied even for administrators
        let Ok(child) = key.open_subkey_with_flags(&name, KEY_READ) else {
            continue;
        };

        if name.eq_ignore_ascii_case(AFFINITY_POLICY_KEY) {
            if let Ok(raw) = child.get_raw_value(ASSIGNMENT_SET_OVERRIDE) {
                *mask |= mask_from_le_bytes(&raw.bytes);
                *found += 1;
            }
            continue;
        }

        scan_affinity_policies(&child, depth + 1, mask, found);
    }
}

/// REG_BINARY, REG_DWORD and REG_QWORD overrides are all little-endian
fn mask_from_le_bytes(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}
