//! Simulated USB bus for testing.
//!
//! Attaches virtual mass-storage devices backed by disk images (in memory or in a
//! file) and plays the user's part in permission dialogs. Counts every platform
//! call so tests can assert which side effects happened.

use super::types::{AttachedDevice, InterfaceClass, PermissionRequest, PermissionResult, UsbDeviceInfo};
use super::{PermissionCallback, PermissionRegistry, ReceiverId, UsbHost};
use crate::block::BlockDevice;
use crate::ignore_poison::IgnorePoison;
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SIMULATED_BLOCK_SIZE: u32 = 512;

/// Block device over an in-memory image.
pub struct MemoryDisk {
    image: Arc<Vec<u8>>,
    block_size: u32,
}

impl MemoryDisk {
    pub fn new(image: Vec<u8>, block_size: u32) -> Self {
        Self::shared(Arc::new(image), block_size)
    }

    pub fn shared(image: Arc<Vec<u8>>, block_size: u32) -> Self {
        Self { image, block_size }
    }
}

impl BlockDevice for MemoryDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.image.len() as u64 / u64::from(self.block_size)
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = (lba * u64::from(self.block_size)) as usize;
        let end = start + buf.len();
        let src = self
            .image
            .get(start..end)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past the end of the image"))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Block device over an image file.
pub struct FileDisk {
    file: File,
    block_count: u64,
}

impl FileDisk {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            block_count: len / u64::from(SIMULATED_BLOCK_SIZE),
        })
    }
}

impl BlockDevice for FileDisk {
    fn block_size(&self) -> u32 {
        SIMULATED_BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(lba * u64::from(SIMULATED_BLOCK_SIZE)))?;
        self.file.read_exact(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Backing store of a simulated device.
#[derive(Clone)]
pub enum SimulatedDisk {
    Memory(Arc<Vec<u8>>),
    File(PathBuf),
    /// Reports a capacity but fails every read.
    Unreadable { block_count: u64 },
}

impl SimulatedDisk {
    pub fn memory(image: Vec<u8>) -> Self {
        Self::Memory(Arc::new(image))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

struct UnreadableDisk {
    block_count: u64,
}

impl BlockDevice for UnreadableDisk {
    fn block_size(&self) -> u32 {
        SIMULATED_BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&mut self, _lba: u64, _buf: &mut [u8]) -> io::Result<()> {
        Err(io::Error::other("simulated media error"))
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// How the simulated user answers permission dialogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResponse {
    Grant,
    Deny,
    /// Leave the dialog open; nothing is delivered until `answer_pending`.
    Ignore,
}

/// Call counters for assertions.
#[derive(Default)]
pub struct BusCounters {
    has_permission_calls: AtomicUsize,
    permission_requests: AtomicUsize,
    registered_receivers: AtomicUsize,
    unregistered_receivers: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    open_now: AtomicUsize,
    max_open_now: AtomicUsize,
}

struct SimulatedDevice {
    attached: AttachedDevice,
    disk: Option<SimulatedDisk>,
    granted: bool,
}

type SharedCallback = Arc<dyn Fn(PermissionResult) + Send + Sync>;

/// A USB bus with virtual devices. Implements both platform traits.
pub struct SimulatedUsbBus {
    devices: Mutex<Vec<SimulatedDevice>>,
    response: Mutex<PermissionResponse>,
    receivers: Mutex<HashMap<ReceiverId, (String, SharedCallback)>>,
    pending: Mutex<Vec<PermissionRequest>>,
    next_receiver: AtomicU64,
    fail_enumeration: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    counters: Arc<BusCounters>,
}

impl Default for SimulatedUsbBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedUsbBus {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            response: Mutex::new(PermissionResponse::Grant),
            receivers: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            next_receiver: AtomicU64::new(1),
            fail_enumeration: AtomicBool::new(false),
            read_delay: Mutex::new(None),
            counters: Arc::new(BusCounters::default()),
        }
    }

    /// Attaches a bulk-only mass-storage device. Permission starts out not granted.
    pub fn attach(&self, info: UsbDeviceInfo, disk: SimulatedDisk) {
        debug!("Simulated bus: attaching {}", info.device_name);
        self.devices.lock_ignore_poison().push(SimulatedDevice {
            attached: AttachedDevice {
                info,
                interfaces: vec![InterfaceClass::BULK_ONLY_MASS_STORAGE],
            },
            disk: Some(disk),
            granted: false,
        });
    }

    /// Attaches a device that is not mass storage (keyboard, hub...).
    pub fn attach_non_storage(&self, info: UsbDeviceInfo, interface: InterfaceClass) {
        self.devices.lock_ignore_poison().push(SimulatedDevice {
            attached: AttachedDevice {
                info,
                interfaces: vec![interface],
            },
            disk: None,
            granted: false,
        });
    }

    /// Unplugs the device.
    pub fn detach(&self, device_name: &str) {
        self.devices
            .lock_ignore_poison()
            .retain(|d| d.attached.info.device_name != device_name);
    }

    /// Sets the permission as if granted earlier (or revoked).
    pub fn set_granted(&self, device_name: &str, granted: bool) {
        for device in self.devices.lock_ignore_poison().iter_mut() {
            if device.attached.info.device_name == device_name {
                device.granted = granted;
            }
        }
    }

    pub fn set_permission_response(&self, response: PermissionResponse) {
        *self.response.lock_ignore_poison() = response;
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// Makes every block read sleep, to widen race windows in concurrency tests.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock_ignore_poison() = delay;
    }

    /// Answers all dialogs left open by `PermissionResponse::Ignore`.
    pub fn answer_pending(&self, granted: bool) {
        let requests: Vec<PermissionRequest> = self.pending.lock_ignore_poison().drain(..).collect();
        for request in requests {
            self.deliver(&request, granted);
        }
    }

    pub fn has_permission_calls(&self) -> usize {
        self.counters.has_permission_calls.load(Ordering::SeqCst)
    }

    pub fn permission_requests(&self) -> usize {
        self.counters.permission_requests.load(Ordering::SeqCst)
    }

    pub fn registered_receivers(&self) -> usize {
        self.counters.registered_receivers.load(Ordering::SeqCst)
    }

    pub fn unregistered_receivers(&self) -> usize {
        self.counters.unregistered_receivers.load(Ordering::SeqCst)
    }

    /// Receivers still registered.
    pub fn active_receivers(&self) -> usize {
        self.receivers.lock_ignore_poison().len()
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet closed.
    pub fn open_devices(&self) -> usize {
        self.counters.open_now.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open devices seen.
    pub fn max_open_devices(&self) -> usize {
        self.counters.max_open_now.load(Ordering::SeqCst)
    }

    fn deliver(&self, request: &PermissionRequest, granted: bool) {
        if granted {
            self.set_granted(&request.device.device_name, true);
        }
        let callbacks: Vec<SharedCallback> = self
            .receivers
            .lock_ignore_poison()
            .values()
            .filter(|(request_id, _)| *request_id == request.id)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        debug!(
            "Simulated bus: delivering granted={} for request {} to {} receiver(s)",
            granted,
            request.id,
            callbacks.len()
        );
        for callback in callbacks {
            callback(PermissionResult { granted });
        }
    }
}

impl UsbHost for SimulatedUsbBus {
    fn attached_devices(&self) -> io::Result<Vec<AttachedDevice>> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated enumeration failure"));
        }
        Ok(self
            .devices
            .lock_ignore_poison()
            .iter()
            .map(|d| d.attached.clone())
            .collect())
    }

    fn open_block_device(&self, device: &UsbDeviceInfo) -> io::Result<Box<dyn BlockDevice>> {
        let disk = {
            let devices = self.devices.lock_ignore_poison();
            let entry = devices
                .iter()
                .find(|d| d.attached.info.device_name == device.device_name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "device was unplugged"))?;
            entry
                .disk
                .clone()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "not a mass storage device"))?
        };

        let inner: Box<dyn BlockDevice> = match disk {
            SimulatedDisk::Memory(image) => Box::new(MemoryDisk::shared(image, SIMULATED_BLOCK_SIZE)),
            SimulatedDisk::File(path) => Box::new(FileDisk::open(&path)?),
            SimulatedDisk::Unreadable { block_count } => Box::new(UnreadableDisk { block_count }),
        };

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open_now.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(TrackedDevice {
            inner,
            counters: Arc::clone(&self.counters),
            read_delay: *self.read_delay.lock_ignore_poison(),
            closed: false,
        }))
    }
}

impl PermissionRegistry for SimulatedUsbBus {
    fn has_permission(&self, device: &UsbDeviceInfo) -> bool {
        self.counters.has_permission_calls.fetch_add(1, Ordering::SeqCst);
        self.devices
            .lock_ignore_poison()
            .iter()
            .any(|d| d.attached.info.device_name == device.device_name && d.granted)
    }

    fn register_receiver(&self, request: &PermissionRequest, callback: PermissionCallback) -> ReceiverId {
        let id = ReceiverId(self.next_receiver.fetch_add(1, Ordering::SeqCst));
        self.counters.registered_receivers.fetch_add(1, Ordering::SeqCst);
        self.receivers
            .lock_ignore_poison()
            .insert(id, (request.id.clone(), Arc::from(callback)));
        id
    }

    fn unregister_receiver(&self, id: ReceiverId) {
        if self.receivers.lock_ignore_poison().remove(&id).is_some() {
            self.counters.unregistered_receivers.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request_permission(&self, request: &PermissionRequest) -> io::Result<()> {
        self.counters.permission_requests.fetch_add(1, Ordering::SeqCst);
        let response = *self.response.lock_ignore_poison();
        match response {
            PermissionResponse::Grant => self.deliver(request, true),
            PermissionResponse::Deny => self.deliver(request, false),
            PermissionResponse::Ignore => self.pending.lock_ignore_poison().push(request.clone()),
        }
        Ok(())
    }
}

/// Wraps a simulated block device to count opens and closes.
struct TrackedDevice {
    inner: Box<dyn BlockDevice>,
    counters: Arc<BusCounters>,
    read_delay: Option<Duration>,
    closed: bool,
}

impl BlockDevice for TrackedDevice {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        self.inner.read_blocks(lba, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.counters.open_now.fetch_sub(1, Ordering::SeqCst);
        self.inner.close()
    }
}

impl Drop for TrackedDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
