//! BLE device discovery for Nordic DFU targets.
//!
//! Covers three jobs: scanning for candidate devices, rebooting an
//! application-mode device into its bootloader (buttonless trigger), and
//! finding the bootloader again after the reboot. Nordic bootloaders may
//! come back under a different name ("DfuTarg", a "Dfu"-suffixed
//! application name) and often under the original static address with the
//! last octet incremented, so rediscovery matches on several criteria.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use super::config::{
    is_bootloader_name, DfuOpcode, DFU_CONTROL_POINT_UUID, DFU_SERVICE_UUID, RESCAN_DELAY,
    RESOLVE_ATTEMPTS, RESOLVE_RETRY_DELAY, SCAN_BURST,
};
use super::error::{DfuError, DfuResult};

/// A BLE device observed during a scan.
///
/// Wraps the platform peripheral handle together with the advertisement
/// data the DFU flow needs for mode detection and rediscovery.
#[derive(Debug, Clone)]
pub struct DfuTarget {
    pub(crate) peripheral: Peripheral,
    /// Advertised local name, when the device broadcast one.
    pub name: Option<String>,
    /// Bluetooth address string, e.g. "AA:BB:CC:DD:EE:FF".
    pub address: String,
    /// Service UUIDs carried in the advertisement.
    pub advertised_services: Vec<Uuid>,
}

impl DfuTarget {
    /// Get a display label for this device.
    pub fn display_label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.address),
            None => format!("Unnamed ({})", self.address),
        }
    }

    /// Whether the advertised name indicates the device is already running
    /// its DFU bootloader.
    pub fn in_bootloader(&self) -> bool {
        self.name.as_deref().is_some_and(is_bootloader_name)
    }
}

/// First available BLE adapter on this host.
pub(crate) async fn default_adapter() -> DfuResult<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(DfuError::NoAdapter)
}

/// Discover nearby BLE devices that have a name.
pub async fn scan_for_devices(timeout: Duration) -> DfuResult<Vec<DfuTarget>> {
    let adapter = default_adapter().await?;
    let targets = scan_with_adapter(&adapter, timeout).await?;
    Ok(targets.into_iter().filter(|t| t.name.is_some()).collect())
}

/// Run one scan burst on an existing adapter and collect everything seen.
pub(crate) async fn scan_with_adapter(
    adapter: &Adapter,
    timeout: Duration,
) -> DfuResult<Vec<DfuTarget>> {
    adapter.start_scan(ScanFilter::default()).await?;
    sleep(timeout).await;
    adapter.stop_scan().await?;

    let mut targets = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        targets.push(DfuTarget {
            address: properties.address.to_string(),
            name: properties.local_name,
            advertised_services: properties.services,
            peripheral,
        });
    }
    Ok(targets)
}

/// Resolve a `--device` style selector to a concrete target.
///
/// A colon-separated 6-byte hex string is treated as a Bluetooth address
/// (exact, case-insensitive); anything else as a case-insensitive name
/// substring. Retries the scan a few times before giving up.
pub(crate) async fn resolve_device(
    adapter: &Adapter,
    selector: &str,
    scan_timeout: Duration,
) -> DfuResult<DfuTarget> {
    for attempt in 1..=RESOLVE_ATTEMPTS {
        if attempt > 1 {
            sleep(RESOLVE_RETRY_DELAY).await;
        }
        let targets = scan_with_adapter(adapter, scan_timeout).await?;
        if let Some(target) = targets
            .into_iter()
            .find(|t| selector_matches(selector, &t.address, t.name.as_deref()))
        {
            return Ok(target);
        }
        debug!("selector '{selector}' not found in scan (attempt {attempt}/{RESOLVE_ATTEMPTS})");
    }
    Err(DfuError::DeviceNotFound {
        detail: format!("no device matching '{selector}'"),
    })
}

/// Reboot an application-mode device into its DFU bootloader.
///
/// Writes the single-byte jump command to the DFU control point without
/// expecting a response, then drops the connection; the target reboots
/// within about a second. A device without the control point cannot be
/// updated over the air at all.
pub(crate) async fn trigger_bootloader(target: &DfuTarget) -> DfuResult<()> {
    let peripheral = &target.peripheral;
    if !peripheral.is_connected().await? {
        peripheral.connect().await?;
    }
    peripheral.discover_services().await?;

    let characteristics = peripheral.characteristics();
    let control_point = characteristics
        .iter()
        .find(|c| c.uuid == DFU_CONTROL_POINT_UUID)
        .cloned()
        .ok_or(DfuError::NoDfuService)?;

    info!("Sending bootloader trigger to {}", target.display_label());
    if let Err(e) = peripheral
        .write(
            &control_point,
            &[DfuOpcode::StartDfu as u8],
            WriteType::WithoutResponse,
        )
        .await
    {
        // The target resets as soon as it handles the command; a failed
        // write usually means it is already gone.
        debug!("trigger write failed (target likely rebooting): {e}");
    }
    let _ = peripheral.disconnect().await;
    Ok(())
}

/// Scan for a device that has rebooted into its DFU bootloader.
///
/// Keeps scanning in short bursts until the timeout expires, accepting any
/// candidate that matches the original address, the original address with
/// the last octet shifted by one, a bootloader-ish or original name, or an
/// advertised Legacy DFU service.
pub(crate) async fn find_dfu_target(
    adapter: &Adapter,
    original_address: &str,
    original_name: Option<&str>,
    timeout: Duration,
) -> DfuResult<DfuTarget> {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    while Instant::now() < deadline {
        attempt += 1;
        let targets = scan_with_adapter(adapter, SCAN_BURST).await?;
        if let Some(target) = targets.into_iter().find(|t| {
            matches_rebooted_target(
                original_address,
                original_name,
                &t.address,
                t.name.as_deref(),
                &t.advertised_services,
            )
        }) {
            info!(
                "Found DFU target {} after {attempt} scan(s)",
                target.display_label()
            );
            return Ok(target);
        }
        debug!("scan {attempt}: DFU target not visible yet");
        sleep(RESCAN_DELAY).await;
    }

    Err(DfuError::DeviceNotFound {
        detail: format!(
            "DFU target did not reappear within {} s",
            timeout.as_secs()
        ),
    })
}

/// Whether a selector string looks like a Bluetooth address.
fn looks_like_address(selector: &str) -> bool {
    let parts: Vec<&str> = selector.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Match a name/address selector against one scanned device.
fn selector_matches(selector: &str, address: &str, name: Option<&str>) -> bool {
    if looks_like_address(selector) {
        return address.eq_ignore_ascii_case(selector);
    }
    name.is_some_and(|n| n.to_lowercase().contains(&selector.to_lowercase()))
}

/// The address with its last octet shifted by `delta`, wrapping at 0xFF.
fn adjacent_address(address: &str, delta: i16) -> Option<String> {
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let last = u8::from_str_radix(parts[5], 16).ok()?;
    let shifted = (last as i16 + delta).rem_euclid(256) as u8;
    Some(format!("{}:{shifted:02X}", parts[..5].join(":")))
}

/// Rediscovery match: is `candidate` the original device, rebooted into its
/// bootloader?
fn matches_rebooted_target(
    original_address: &str,
    original_name: Option<&str>,
    candidate_address: &str,
    candidate_name: Option<&str>,
    candidate_services: &[Uuid],
) -> bool {
    if candidate_address.eq_ignore_ascii_case(original_address) {
        return true;
    }
    for delta in [1, -1] {
        if let Some(shifted) = adjacent_address(original_address, delta) {
            if candidate_address.eq_ignore_ascii_case(&shifted) {
                return true;
            }
        }
    }
    if let Some(name) = candidate_name {
        if is_bootloader_name(name) {
            return true;
        }
        if original_name
            .is_some_and(|o| !o.is_empty() && name.to_lowercase().contains(&o.to_lowercase()))
        {
            return true;
        }
    }
    candidate_services.contains(&DFU_SERVICE_UUID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_address() {
        assert!(looks_like_address("AA:BB:CC:DD:EE:FF"));
        assert!(looks_like_address("aa:bb:cc:dd:ee:0f"));
        assert!(!looks_like_address("AA:BB:CC:DD:EE"));
        assert!(!looks_like_address("AA:BB:CC:DD:EE:GG"));
        assert!(!looks_like_address("DfuTarg"));
        assert!(!looks_like_address(""));
    }

    #[test]
    fn test_selector_matches_address() {
        assert!(selector_matches(
            "aa:bb:cc:dd:ee:ff",
            "AA:BB:CC:DD:EE:FF",
            Some("OD216205")
        ));
        assert!(!selector_matches(
            "AA:BB:CC:DD:EE:00",
            "AA:BB:CC:DD:EE:FF",
            None
        ));
    }

    #[test]
    fn test_selector_matches_name_substring() {
        assert!(selector_matches("od216", "AA:BB:CC:DD:EE:FF", Some("OD216205")));
        assert!(!selector_matches("od999", "AA:BB:CC:DD:EE:FF", Some("OD216205")));
        assert!(!selector_matches("od216", "AA:BB:CC:DD:EE:FF", None));
    }

    #[test]
    fn test_adjacent_address() {
        assert_eq!(
            adjacent_address("AA:BB:CC:DD:EE:01", 1).as_deref(),
            Some("AA:BB:CC:DD:EE:02")
        );
        assert_eq!(
            adjacent_address("AA:BB:CC:DD:EE:01", -1).as_deref(),
            Some("AA:BB:CC:DD:EE:00")
        );
        // Last octet wraps
        assert_eq!(
            adjacent_address("AA:BB:CC:DD:EE:FF", 1).as_deref(),
            Some("AA:BB:CC:DD:EE:00")
        );
        assert_eq!(
            adjacent_address("AA:BB:CC:DD:EE:00", -1).as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        // Not a MAC-shaped address (e.g. macOS peripheral UUIDs)
        assert_eq!(adjacent_address("12345678-0000-0000", 1), None);
    }

    #[test]
    fn test_rebooted_target_matches_address_plus_one() {
        assert!(matches_rebooted_target(
            "AA:BB:CC:DD:EE:01",
            Some("OD216205"),
            "AA:BB:CC:DD:EE:02",
            None,
            &[]
        ));
    }

    #[test]
    fn test_rebooted_target_matches_bootloader_name() {
        assert!(matches_rebooted_target(
            "AA:BB:CC:DD:EE:01",
            Some("OD216205"),
            "11:22:33:44:55:66",
            Some("DfuTarg"),
            &[]
        ));
        assert!(matches_rebooted_target(
            "AA:BB:CC:DD:EE:01",
            Some("OD216205"),
            "11:22:33:44:55:66",
            Some("OD216205Dfu"),
            &[]
        ));
    }

    #[test]
    fn test_rebooted_target_matches_original_name() {
        assert!(matches_rebooted_target(
            "AA:BB:CC:DD:EE:01",
            Some("OD216205"),
            "11:22:33:44:55:66",
            Some("od216205"),
            &[]
        ));
    }

    #[test]
    fn test_rebooted_target_matches_advertised_service() {
        assert!(matches_rebooted_target(
            "AA:BB:CC:DD:EE:01",
            None,
            "11:22:33:44:55:66",
            None,
            &[DFU_SERVICE_UUID]
        ));
    }

    #[test]
    fn test_rebooted_target_rejects_stranger() {
        assert!(!matches_rebooted_target(
            "AA:BB:CC:DD:EE:01",
            Some("OD216205"),
            "11:22:33:44:55:66",
            Some("Thermometer"),
            &[]
        ));
    }
}
