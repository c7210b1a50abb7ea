//! USB mass-storage device discovery.
//!
//! Lists attached bulk-only mass-storage devices without opening them.

use super::UsbHost;
use super::types::UsbDeviceInfo;
use log::{debug, warn};

/// Lists all attached USB mass-storage devices.
///
/// Keeps devices with at least one interface of class 0x08 / subclass 0x06 /
/// protocol 0x50 (SCSI over Bulk-Only Transport). Returns an empty vector if
/// enumeration fails.
pub fn list_mass_storage_devices(host: &dyn UsbHost) -> Vec<UsbDeviceInfo> {
    match host.attached_devices() {
        Ok(devices) => {
            let total = devices.len();
            let storage: Vec<UsbDeviceInfo> = devices
                .into_iter()
                .filter(|d| d.interfaces.iter().any(|i| i.is_bulk_only_mass_storage()))
                .map(|d| {
                    debug!(
                        "Mass storage device: name={}, vendor={:04x}, product={:04x}",
                        d.info.device_name, d.info.vendor_id, d.info.product_id
                    );
                    d.info
                })
                .collect();
            debug!("Found {} mass storage device(s) among {} USB device(s)", storage.len(), total);
            storage
        }
        Err(e) => {
            warn!("Failed to enumerate USB devices: {}", e);
            Vec::new()
        }
    }
}

/// Finds the first attached mass-storage device with the given IDs.
///
/// Identical models plugged into different ports share vendor and product IDs;
/// the first one enumerated wins.
pub fn find_device(host: &dyn UsbHost, vendor_id: u16, product_id: u16) -> Option<UsbDeviceInfo> {
    first_match(list_mass_storage_devices(host), vendor_id, product_id)
}

/// Picks the first device with the given IDs from an already enumerated list.
pub fn first_match(devices: Vec<UsbDeviceInfo>, vendor_id: u16, product_id: u16) -> Option<UsbDeviceInfo> {
    let mut matching = devices.into_iter().filter(|d| d.matches(vendor_id, product_id));
    let first = matching.next()?;
    let others = matching.count();
    if others > 0 {
        warn!(
            "{} more device(s) share {:04x}:{:04x}, using {}",
            others, vendor_id, product_id, first.device_name
        );
    }
    Some(first)
}
