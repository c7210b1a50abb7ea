//! The caller-facing USB storage operations.
//!
//! Each operation resolves the device again, so a stick that was unplugged and
//! replugged between calls is found under its new device name. Filesystem work
//! runs on the blocking pool while holding the device's lock, so two sessions on
//! the same physical device are never open at once. Different devices don't
//! contend.

use crate::config::UsbStorageConfig;
use crate::error::UsbStorageError;
use crate::ignore_poison::IgnorePoison;
use crate::permission::{PermissionNegotiator, PermissionOutcome};
use crate::session::{self, StorageSession};
use crate::usb::{self, PermissionRegistry, UsbDeviceInfo, UsbHost};
use base64::Engine;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// USB mass-storage access for one application.
pub struct UsbStorage {
    host: Arc<dyn UsbHost>,
    permissions: Arc<dyn PermissionRegistry>,
    negotiator: PermissionNegotiator,
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UsbStorage {
    pub fn new(host: Arc<dyn UsbHost>, permissions: Arc<dyn PermissionRegistry>, config: UsbStorageConfig) -> Self {
        debug!("USB storage config: {:?}", config);
        Self {
            negotiator: PermissionNegotiator::new(Arc::clone(&permissions), &config),
            host,
            permissions,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Uses the platform's USB stack.
    #[cfg(any(target_os = "macos", target_os = "linux"))]
    pub fn with_platform_host(config: UsbStorageConfig) -> Result<Self, UsbStorageError> {
        let host = Arc::new(usb::nusb_host::NusbHost::new());
        Ok(Self::new(host.clone(), host, config))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    pub fn with_platform_host(_config: UsbStorageConfig) -> Result<Self, UsbStorageError> {
        Err(UsbStorageError::IoFailure {
            message: "USB storage isn't supported on this platform".to_string(),
        })
    }

    /// Uses a simulated bus for both device access and permissions.
    #[cfg(any(test, feature = "simulated-bus"))]
    pub fn with_simulated_bus(bus: Arc<usb::simulated::SimulatedUsbBus>, config: UsbStorageConfig) -> Self {
        Self::new(bus.clone(), bus, config)
    }

    /// Lists attached mass-storage devices. Never fails; enumeration errors yield an empty list.
    pub async fn get_devices(&self) -> Vec<UsbDeviceInfo> {
        match self.attached_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration task failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Whether access is granted right now. Never prompts.
    pub async fn has_permission(&self, vendor_id: u16, product_id: u16) -> Result<bool, UsbStorageError> {
        let device = self.resolve(vendor_id, product_id).await?;
        Ok(self.negotiator.has_permission(&device))
    }

    /// Asks for access, waiting for the user's answer up to the configured timeout.
    ///
    /// Returns `Ok(false)` if the user declined.
    pub async fn request_permission(&self, vendor_id: u16, product_id: u16) -> Result<bool, UsbStorageError> {
        let device = self.resolve(vendor_id, product_id).await?;
        let outcome = self
            .negotiator
            .ensure_permission(&device)
            .await
            .map_err(|e| UsbStorageError::io("Permission request failed", e))?;
        match outcome {
            PermissionOutcome::Granted => Ok(true),
            PermissionOutcome::Denied => Ok(false),
            PermissionOutcome::TimedOut { waited } => Err(UsbStorageError::TimedOut {
                device_name: device.device_name,
                waited_ms: waited.as_millis() as u64,
            }),
        }
    }

    /// Names of the children of the directory at `path`.
    pub async fn read_dir(&self, vendor_id: u16, product_id: u16, path: &str) -> Result<Vec<String>, UsbStorageError> {
        let path = path.to_string();
        let entries = self
            .with_session(vendor_id, product_id, move |session| session::list(session, &path))
            .await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    /// Contents of the file at `path`, or `None` if nothing exists there.
    pub async fn read_file(
        &self,
        vendor_id: u16,
        product_id: u16,
        path: &str,
    ) -> Result<Option<Vec<u8>>, UsbStorageError> {
        let path = path.to_string();
        self.with_session(vendor_id, product_id, move |session| session::read(session, &path))
            .await
    }

    /// Like `read_file`, encoded as standard base64 without line breaks.
    pub async fn read_file_base64(
        &self,
        vendor_id: u16,
        product_id: u16,
        path: &str,
    ) -> Result<Option<String>, UsbStorageError> {
        let data = self.read_file(vendor_id, product_id, path).await?;
        Ok(data.map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)))
    }

    /// Enumerates on the blocking pool and forgets permission state of unplugged devices.
    async fn attached_devices(&self) -> Result<Vec<UsbDeviceInfo>, UsbStorageError> {
        let host = Arc::clone(&self.host);
        let devices = tokio::task::spawn_blocking(move || usb::list_mass_storage_devices(&*host))
            .await
            .map_err(|e| UsbStorageError::io("Task failed", e))?;
        self.negotiator.retain_devices(&devices);
        Ok(devices)
    }

    async fn resolve(&self, vendor_id: u16, product_id: u16) -> Result<UsbDeviceInfo, UsbStorageError> {
        let devices = self.attached_devices().await?;
        usb::first_match(devices, vendor_id, product_id).ok_or(UsbStorageError::DeviceNotFound { vendor_id, product_id })
    }

    fn device_lock(&self, device_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.device_locks.lock_ignore_poison();
        Arc::clone(locks.entry(device_name.to_string()).or_default())
    }

    /// Drops the device's lock entry once nobody holds or waits for it.
    fn prune_device_lock(&self, device_name: &str) {
        let mut locks = self.device_locks.lock_ignore_poison();
        if locks.get(device_name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(device_name);
        }
    }

    #[cfg(test)]
    fn device_lock_count(&self) -> usize {
        self.device_locks.lock_ignore_poison().len()
    }

    /// Runs `op` on a fresh session, holding the device lock until the session is closed.
    async fn with_session<T, F>(&self, vendor_id: u16, product_id: u16, op: F) -> Result<T, UsbStorageError>
    where
        T: Send + 'static,
        F: FnOnce(&StorageSession) -> Result<T, UsbStorageError> + Send + 'static,
    {
        let device = self.resolve(vendor_id, product_id).await?;
        let guard = self.device_lock(&device.device_name).lock_owned().await;

        let host = Arc::clone(&self.host);
        let permissions = Arc::clone(&self.permissions);
        let session_device = device.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let device = session_device;
            let mut session = StorageSession::open(&*host, &*permissions, &device)?;
            let result = op(&session);
            if let Err(e) = session.close() {
                warn!("Ignoring error while closing session for {}: {}", device.device_name, e);
            }
            if let Err(e) = &result {
                info!("Operation on {} failed: {}", device.device_name, e);
            }
            result
        })
        .await
        .map_err(|e| UsbStorageError::io("Task failed", e));

        self.prune_device_lock(&device.device_name);
        result?
    }
}
