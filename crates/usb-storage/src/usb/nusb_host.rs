//! Desktop USB host backed by nusb.
//!
//! Enumeration and bulk transfers go through nusb. Desktop systems have no
//! permission dialog: access is decided by file permissions on the device node
//! (Linux, via udev rules) or is always available to the user (macOS). A request
//! therefore answers immediately with the current state.

use super::bot::{BotBlockDevice, BulkPipe};
use super::types::{AttachedDevice, InterfaceClass, PermissionRequest, PermissionResult, UsbDeviceInfo};
use super::{PermissionCallback, PermissionRegistry, ReceiverId, UsbHost};
use crate::block::BlockDevice;
use crate::ignore_poison::IgnorePoison;
use log::{debug, info, warn};
use nusb::descriptors::TransferType;
use nusb::transfer::{Buffer, Bulk, In, Out};
use nusb::{DeviceInfo, Endpoint, Interface, MaybeFuture};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timeout for a single bulk transfer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the device name the way Linux names device nodes.
fn device_name(info: &DeviceInfo) -> String {
    format!("/dev/bus/usb/{:0>3}/{:03}", info.bus_id(), info.device_address())
}

fn to_usb_device_info(info: &DeviceInfo) -> UsbDeviceInfo {
    UsbDeviceInfo {
        device_name: device_name(info),
        manufacturer_name: info.manufacturer_string().map(str::to_string),
        product_name: info.product_string().map(str::to_string),
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
    }
}

fn to_io(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

type SharedCallback = Arc<dyn Fn(PermissionResult) + Send + Sync>;

/// USB host for Linux and macOS.
pub struct NusbHost {
    receivers: Mutex<HashMap<ReceiverId, (String, SharedCallback)>>,
    next_receiver: AtomicU64,
}

impl Default for NusbHost {
    fn default() -> Self {
        Self::new()
    }
}

impl NusbHost {
    pub fn new() -> Self {
        Self {
            receivers: Mutex::new(HashMap::new()),
            next_receiver: AtomicU64::new(1),
        }
    }

    fn find_info(&self, device: &UsbDeviceInfo) -> io::Result<DeviceInfo> {
        nusb::list_devices()
            .wait()
            .map_err(to_io)?
            .find(|info| device_name(info) == device.device_name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "device was unplugged"))
    }
}

impl UsbHost for NusbHost {
    fn attached_devices(&self) -> io::Result<Vec<AttachedDevice>> {
        let devices = nusb::list_devices().wait().map_err(to_io)?;
        Ok(devices
            .map(|info| AttachedDevice {
                interfaces: info
                    .interfaces()
                    .map(|i| InterfaceClass {
                        class: i.class(),
                        subclass: i.subclass(),
                        protocol: i.protocol(),
                    })
                    .collect(),
                info: to_usb_device_info(&info),
            })
            .collect())
    }

    fn open_block_device(&self, device: &UsbDeviceInfo) -> io::Result<Box<dyn BlockDevice>> {
        let info = self.find_info(device)?;
        let interface_number = info
            .interfaces()
            .find(|i| {
                InterfaceClass {
                    class: i.class(),
                    subclass: i.subclass(),
                    protocol: i.protocol(),
                }
                .is_bulk_only_mass_storage()
            })
            .map(|i| i.interface_number())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no bulk-only mass storage interface"))?;

        debug!("Opening {} interface {}", device.device_name, interface_number);
        let handle = info.open().wait().map_err(to_io)?;
        let interface = handle
            .detach_and_claim_interface(interface_number)
            .wait()
            .map_err(to_io)?;

        let pipe = NusbPipe::new(interface)?;
        let block = BotBlockDevice::init(pipe)?;
        info!(
            "Opened {}: {} blocks of {} bytes",
            device.display_name(),
            block.block_count(),
            block.block_size()
        );
        Ok(Box::new(block))
    }
}

impl PermissionRegistry for NusbHost {
    fn has_permission(&self, device: &UsbDeviceInfo) -> bool {
        node_accessible(&device.device_name)
    }

    fn register_receiver(&self, request: &PermissionRequest, callback: PermissionCallback) -> ReceiverId {
        let id = ReceiverId(self.next_receiver.fetch_add(1, Ordering::SeqCst));
        self.receivers
            .lock_ignore_poison()
            .insert(id, (request.id.clone(), Arc::from(callback)));
        id
    }

    fn unregister_receiver(&self, id: ReceiverId) {
        self.receivers.lock_ignore_poison().remove(&id);
    }

    fn request_permission(&self, request: &PermissionRequest) -> io::Result<()> {
        let granted = self.has_permission(&request.device);
        if !granted {
            warn!(
                "No access to {}. Add a udev rule granting the user read/write access to the device.",
                request.device.device_name
            );
        }
        let callbacks: Vec<SharedCallback> = self
            .receivers
            .lock_ignore_poison()
            .values()
            .filter(|(request_id, _)| *request_id == request.id)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(PermissionResult { granted });
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn node_accessible(device_name: &str) -> bool {
    let Ok(path) = std::ffi::CString::new(device_name) else {
        return false;
    };
    // SAFETY: `path` is a valid NUL-terminated string for the duration of the call
    unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

#[cfg(target_os = "macos")]
fn node_accessible(_device_name: &str) -> bool {
    true
}

/// Bulk endpoint pair of a claimed mass-storage interface.
///
/// Fields drop in order, so the endpoints let go of the interface before it is released.
struct ClaimedEndpoints {
    bulk_in: Endpoint<Bulk, In>,
    bulk_out: Endpoint<Bulk, Out>,
    _interface: Interface,
}

struct NusbPipe {
    claimed: Option<ClaimedEndpoints>,
}

impl NusbPipe {
    fn new(interface: Interface) -> io::Result<Self> {
        let descriptor = interface
            .descriptor()
            .ok_or_else(|| io::Error::other("interface has no descriptor"))?;
        let mut in_address = None;
        let mut out_address = None;
        for endpoint in descriptor.endpoints() {
            if endpoint.transfer_type() != TransferType::Bulk {
                continue;
            }
            if endpoint.address() & 0x80 != 0 {
                in_address.get_or_insert(endpoint.address());
            } else {
                out_address.get_or_insert(endpoint.address());
            }
        }
        let (Some(in_address), Some(out_address)) = (in_address, out_address) else {
            return Err(io::Error::other("interface lacks a bulk endpoint pair"));
        };

        let bulk_in = interface.endpoint::<Bulk, In>(in_address).map_err(to_io)?;
        let bulk_out = interface.endpoint::<Bulk, Out>(out_address).map_err(to_io)?;
        Ok(Self {
            claimed: Some(ClaimedEndpoints {
                bulk_in,
                bulk_out,
                _interface: interface,
            }),
        })
    }

    fn endpoints(&mut self) -> io::Result<&mut ClaimedEndpoints> {
        self.claimed
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "mass storage interface was released"))
    }
}

impl BulkPipe for NusbPipe {
    fn bulk_out(&mut self, data: &[u8]) -> io::Result<()> {
        let endpoint = &mut self.endpoints()?.bulk_out;
        endpoint.submit(Buffer::from(data.to_vec()));
        let completion = endpoint
            .wait_next_complete(TRANSFER_TIMEOUT)
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "bulk OUT transfer timed out"))?;
        completion.status.map_err(to_io)?;
        if completion.actual_len != data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short bulk OUT transfer"));
        }
        Ok(())
    }

    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let endpoint = &mut self.endpoints()?.bulk_in;
        // IN requests must be a whole number of packets
        let packet = endpoint.max_packet_size().max(1);
        let requested = buf.len().div_ceil(packet) * packet;
        let mut buffer = Buffer::new(requested);
        buffer.set_requested_len(requested);
        endpoint.submit(buffer);
        let completion = endpoint
            .wait_next_complete(TRANSFER_TIMEOUT)
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "bulk IN transfer timed out"))?;
        completion.status.map_err(to_io)?;
        let received = completion.actual_len.min(buf.len());
        buf[..received].copy_from_slice(&completion.buffer[..received]);
        Ok(received)
    }

    fn release(&mut self) -> io::Result<()> {
        if self.claimed.take().is_some() {
            debug!("Released mass storage interface and its endpoints");
        }
        Ok(())
    }
}
