//! USB type definitions for frontend communication.
//!
//! These types are serialized to JSON for the plugin commands.

use serde::{Deserialize, Serialize};

/// USB interface class for mass storage.
pub const MASS_STORAGE_CLASS: u8 = 0x08;
/// SCSI transparent command set.
pub const SCSI_TRANSPARENT_SUBCLASS: u8 = 0x06;
/// Bulk-Only Transport.
pub const BULK_ONLY_PROTOCOL: u8 = 0x50;

/// Information about an attached USB mass-storage device.
///
/// Produced fresh on every enumeration. `vendor_id` + `product_id` is the
/// identity callers use to address the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceInfo {
    /// Platform device path, for example "/dev/bus/usb/001/004". Unique per port.
    pub device_name: String,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
    /// For example, 0x0781 for SanDisk.
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbDeviceInfo {
    /// Returns a display name for the device.
    ///
    /// Prefers product name, falls back to "USB drive (vendor:product)".
    pub fn display_name(&self) -> String {
        if let Some(product) = &self.product_name {
            return product.clone();
        }
        if let Some(manufacturer) = &self.manufacturer_name {
            return format!("{} drive", manufacturer);
        }
        format!("USB drive ({:04x}:{:04x})", self.vendor_id, self.product_id)
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Class/subclass/protocol triple of one USB interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceClass {
    /// SCSI transparent command set over Bulk-Only Transport.
    pub const BULK_ONLY_MASS_STORAGE: Self = Self {
        class: MASS_STORAGE_CLASS,
        subclass: SCSI_TRANSPARENT_SUBCLASS,
        protocol: BULK_ONLY_PROTOCOL,
    };

    pub fn is_bulk_only_mass_storage(&self) -> bool {
        *self == Self::BULK_ONLY_MASS_STORAGE
    }
}

/// A device as the platform registry reports it, before filtering.
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub info: UsbDeviceInfo,
    pub interfaces: Vec<InterfaceClass>,
}

/// Observed permission state of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionState {
    Unknown,
    Granted,
    Denied,
    /// A request is in flight, identified by its request ID.
    Pending(String),
}

/// A permission request handed to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    /// UUID v4, unique per request.
    pub id: String,
    pub device: UsbDeviceInfo,
}

impl PermissionRequest {
    pub fn new(device: UsbDeviceInfo) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device,
        }
    }
}

/// The platform's answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionResult {
    pub granted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandisk() -> UsbDeviceInfo {
        UsbDeviceInfo {
            device_name: "/dev/bus/usb/001/004".to_string(),
            manufacturer_name: Some("SanDisk".to_string()),
            product_name: Some("Cruzer Blade".to_string()),
            vendor_id: 0x0781,
            product_id: 0x5567,
        }
    }

    #[test]
    fn test_display_name_with_product() {
        assert_eq!(sandisk().display_name(), "Cruzer Blade");
    }

    #[test]
    fn test_display_name_with_manufacturer() {
        let device = UsbDeviceInfo {
            product_name: None,
            ..sandisk()
        };
        assert_eq!(device.display_name(), "SanDisk drive");
    }

    #[test]
    fn test_display_name_fallback() {
        let device = UsbDeviceInfo {
            manufacturer_name: None,
            product_name: None,
            ..sandisk()
        };
        assert_eq!(device.display_name(), "USB drive (0781:5567)");
    }

    #[test]
    fn test_device_serialization_keeps_null_names() {
        let device = UsbDeviceInfo {
            manufacturer_name: None,
            ..sandisk()
        };
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"deviceName\":\"/dev/bus/usb/001/004\""));
        assert!(json.contains("\"manufacturerName\":null"));
        assert!(json.contains("\"productName\":\"Cruzer Blade\""));
        assert!(json.contains("\"vendorId\":1921"));
        assert!(json.contains("\"productId\":21863"));
    }

    #[test]
    fn test_interface_class_bulk_only() {
        assert!(InterfaceClass::BULK_ONLY_MASS_STORAGE.is_bulk_only_mass_storage());
        // UFI floppy (CBI transport) is mass storage but not bulk-only SCSI
        let ufi = InterfaceClass {
            class: MASS_STORAGE_CLASS,
            subclass: 0x04,
            protocol: 0x00,
        };
        assert!(!ufi.is_bulk_only_mass_storage());
    }

    #[test]
    fn test_permission_request_ids_are_unique() {
        let a = PermissionRequest::new(sandisk());
        let b = PermissionRequest::new(sandisk());
        assert_ne!(a.id, b.id);
    }
}
