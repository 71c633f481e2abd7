//! Capture-device enumeration and selection.

use pcap::Device;
use tracing::{info, warn};

use crate::capture::CaptureError;

/// Pick the capture device.
///
/// A configured name must exist. Otherwise the first device that is not a
/// loopback and carries at least one address wins; failing that, the first
/// device is used with a warning.
pub fn select_device(configured: Option<&str>) -> Result<Device, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::Open(e.to_string()))?;
    if devices.is_empty() {
        return Err(CaptureError::NoDevices);
    }

    if let Some(name) = configured {
        return devices
            .into_iter()
            .find(|d| d.name == name)
            .inspect(|d| info!(interface = %d.name, "capture_interface_configured"))
            .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()));
    }

    if let Some(device) = devices
        .iter()
        .find(|d| !is_loopback(d) && !d.addresses.is_empty())
    {
        info!(interface = %device.name, "capture_interface_selected");
        return Ok(device.clone());
    }

    let fallback = devices.into_iter().next().expect("checked non-empty");
    warn!(
        interface = %fallback.name,
        "no non-loopback interface with addresses; falling back to first device"
    );
    Ok(fallback)
}

fn is_loopback(device: &Device) -> bool {
    let name = device.name.to_lowercase();
    device.flags.is_loopback() || name.contains("lo") || name.contains("loopback")
}

/// One line per device, for `--list-interfaces`
pub fn list_devices() -> Result<Vec<String>, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::Open(e.to_string()))?;
    Ok(devices
        .into_iter()
        .map(|d| {
            let addrs: Vec<String> = d.addresses.iter().map(|a| a.addr.to_string()).collect();
            format!(
                "{}{} [{}]",
                d.name,
                d.desc.map(|desc| format!(" ({})", desc)).unwrap_or_default(),
                addrs.join(", ")
            )
        })
        .collect())
}
