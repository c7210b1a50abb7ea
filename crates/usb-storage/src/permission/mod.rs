//! Permission negotiation.
//!
//! The OS owns the grant. We can ask whether a device is accessible and ask the OS
//! to prompt the user; the answer arrives asynchronously through a receiver the
//! platform calls. Two waiting strategies are available:
//!
//! - **Event**: register a one-shot receiver, request, and wait for the first of
//!   notification or timeout. The receiver is unregistered on every exit path,
//!   including when the waiting future is dropped.
//! - **Poll**: request, then re-check `has_permission` every poll interval until
//!   granted or the deadline passes.

use crate::config::{UsbStorageConfig, WaitStrategy};
use crate::ignore_poison::IgnorePoison;
use crate::usb::{PermissionRegistry, PermissionRequest, PermissionState, ReceiverId, UsbDeviceInfo};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// How a permission wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
    TimedOut { waited: Duration },
}

/// Asks the platform for device access and waits for the answer.
pub struct PermissionNegotiator {
    registry: Arc<dyn PermissionRegistry>,
    timeout: Duration,
    poll_interval: Duration,
    strategy: WaitStrategy,
    states: Mutex<HashMap<String, PermissionState>>,
}

impl PermissionNegotiator {
    pub fn new(registry: Arc<dyn PermissionRegistry>, config: &UsbStorageConfig) -> Self {
        Self {
            registry,
            timeout: config.permission_timeout(),
            poll_interval: config.poll_interval(),
            strategy: config.wait_strategy,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current grant, straight from the platform. Never prompts and never changes state.
    pub fn has_permission(&self, device: &UsbDeviceInfo) -> bool {
        self.registry.has_permission(device)
    }

    /// Last state this negotiator observed for the device.
    pub fn state(&self, device_name: &str) -> PermissionState {
        self.states
            .lock_ignore_poison()
            .get(device_name)
            .cloned()
            .unwrap_or(PermissionState::Unknown)
    }

    /// Makes sure the device is accessible, prompting the user if needed.
    ///
    /// Returns at once if access is already granted, without a platform request.
    pub async fn ensure_permission(&self, device: &UsbDeviceInfo) -> io::Result<PermissionOutcome> {
        if self.registry.has_permission(device) {
            debug!("Permission already granted for {}", device.device_name);
            self.set_state(device, PermissionState::Granted);
            return Ok(PermissionOutcome::Granted);
        }

        let request = PermissionRequest::new(device.clone());
        info!(
            "Requesting permission for {} (request {}, strategy {:?}, timeout {:?})",
            device.display_name(),
            request.id,
            self.strategy,
            self.timeout
        );
        self.set_state(device, PermissionState::Pending(request.id.clone()));

        let result = match self.strategy {
            WaitStrategy::Event => self.wait_for_notification(&request).await,
            WaitStrategy::Poll => self.poll_until_granted(&request).await,
        };

        let state = match &result {
            Ok(PermissionOutcome::Granted) => PermissionState::Granted,
            Ok(PermissionOutcome::Denied) => PermissionState::Denied,
            Ok(PermissionOutcome::TimedOut { .. }) | Err(_) => PermissionState::Unknown,
        };
        self.set_state(device, state);

        match &result {
            Ok(outcome) => info!("Permission request {} ended: {:?}", request.id, outcome),
            Err(e) => warn!("Permission request {} failed: {}", request.id, e),
        }
        result
    }

    async fn wait_for_notification(&self, request: &PermissionRequest) -> io::Result<PermissionOutcome> {
        let (sender, receiver) = oneshot::channel();
        let slot = Arc::new(ResolveOnce::new(sender));

        let callback_slot = Arc::clone(&slot);
        let request_id = request.id.clone();
        let id = self.registry.register_receiver(
            request,
            Box::new(move |result| {
                if !callback_slot.resolve(result.granted) {
                    debug!("Ignoring late permission notification for request {}", request_id);
                }
            }),
        );
        let _receiver = ReceiverGuard::new(Arc::clone(&self.registry), id);

        // The platform may answer before this returns; the receiver is already in place
        self.registry.request_permission(request)?;

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(granted)) => Ok(if granted {
                PermissionOutcome::Granted
            } else {
                PermissionOutcome::Denied
            }),
            Ok(Err(_)) => Err(io::Error::other("permission receiver dropped without an answer")),
            Err(_) => {
                slot.abandon();
                Ok(PermissionOutcome::TimedOut { waited: self.timeout })
            }
        }
    }

    async fn poll_until_granted(&self, request: &PermissionRequest) -> io::Result<PermissionOutcome> {
        self.registry.request_permission(request)?;

        let start = Instant::now();
        let deadline = start + self.timeout;
        loop {
            if self.registry.has_permission(&request.device) {
                return Ok(PermissionOutcome::Granted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(PermissionOutcome::TimedOut {
                    waited: now - start,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Forgets devices that are no longer attached. Device names are reused after replugging.
    pub fn retain_devices(&self, attached: &[UsbDeviceInfo]) {
        let mut states = self.states.lock_ignore_poison();
        let before = states.len();
        states.retain(|name, _| attached.iter().any(|d| &d.device_name == name));
        if states.len() < before {
            debug!("Forgot permission state of {} unplugged device(s)", before - states.len());
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_states(&self) -> usize {
        self.states.lock_ignore_poison().len()
    }

    fn set_state(&self, device: &UsbDeviceInfo, state: PermissionState) {
        let mut states = self.states.lock_ignore_poison();
        if matches!(state, PermissionState::Unknown) {
            states.remove(&device.device_name);
        } else {
            states.insert(device.device_name.clone(), state);
        }
    }
}

/// One-shot answer slot. The first of `resolve` and `abandon` wins.
struct ResolveOnce {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<bool>>>,
}

impl ResolveOnce {
    fn new(sender: oneshot::Sender<bool>) -> Self {
        Self {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Delivers the answer. Returns false if the slot was already resolved or abandoned.
    fn resolve(&self, granted: bool) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.sender.lock_ignore_poison().take() {
            Some(sender) => sender.send(granted).is_ok(),
            None => false,
        }
    }

    fn abandon(&self) {
        self.resolved.store(true, Ordering::Release);
        self.sender.lock_ignore_poison().take();
    }
}

/// Unregisters the receiver when dropped.
struct ReceiverGuard {
    registry: Arc<dyn PermissionRegistry>,
    id: Option<ReceiverId>,
}

impl ReceiverGuard {
    fn new(registry: Arc<dyn PermissionRegistry>, id: ReceiverId) -> Self {
        Self { registry, id: Some(id) }
    }
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.unregister_receiver(id);
        }
    }
}
