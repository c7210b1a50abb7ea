//! USB mass-storage platform access.
//!
//! The device list and the permission registry are process-wide state owned by
//! the OS. They are reached through two injected traits so the rest of the crate
//! never touches a global, and tests can substitute a simulated bus.
//!
//! # Architecture
//!
//! - `types`: Device descriptors and permission types for frontend communication
//! - `discovery`: Filtering the attached devices down to bulk-only mass storage
//! - `bot`: Bulk-Only Transport + SCSI block device
//! - `nusb_host`: Desktop backend (Linux, macOS)
//! - `simulated`: Image-backed bus for tests

pub mod bot;
mod discovery;
#[cfg(any(target_os = "macos", target_os = "linux"))]
pub mod nusb_host;
#[cfg(any(test, feature = "simulated-bus"))]
pub mod simulated;
pub mod types;

pub use discovery::{find_device, first_match, list_mass_storage_devices};
pub use types::{
    AttachedDevice, InterfaceClass, PermissionRequest, PermissionResult, PermissionState, UsbDeviceInfo,
};

use crate::block::BlockDevice;
use std::io;

/// Called by the platform when the user answers a permission request.
pub type PermissionCallback = Box<dyn Fn(PermissionResult) + Send + Sync>;

/// Handle of a registered notification receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(pub u64);

/// The platform's attached-device registry.
pub trait UsbHost: Send + Sync {
    /// Lists every attached USB device with its interface classes.
    fn attached_devices(&self) -> io::Result<Vec<AttachedDevice>>;

    /// Opens the device and initializes its block transport.
    ///
    /// The returned device holds the interface until it is closed or dropped.
    fn open_block_device(&self, device: &UsbDeviceInfo) -> io::Result<Box<dyn BlockDevice>>;
}

/// The platform's permission registry.
pub trait PermissionRegistry: Send + Sync {
    /// Returns whether access is currently granted. Must not prompt the user.
    fn has_permission(&self, device: &UsbDeviceInfo) -> bool;

    /// Registers a one-shot receiver for the answer to `request`.
    fn register_receiver(&self, request: &PermissionRequest, callback: PermissionCallback) -> ReceiverId;

    /// Removes a receiver. Unknown IDs are ignored.
    fn unregister_receiver(&self, id: ReceiverId);

    /// Asks the platform to prompt the user. The answer arrives through the
    /// receivers registered for the request, possibly before this returns.
    fn request_permission(&self, request: &PermissionRequest) -> io::Result<()>;
}
