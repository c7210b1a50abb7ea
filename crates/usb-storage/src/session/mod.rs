//! Storage sessions: an opened device with its first partition mounted.
//!
//! A session is opened fresh for every operation and closed before the operation
//! returns. Opening follows a fixed order (permission check, block device,
//! partition, FAT mount) and releases whatever was acquired when a later step fails.

mod navigator;
mod reader;

pub use navigator::{FsEntry, list};
pub use reader::{FatFileStream, FileReadStream, read, read_to_end};

use crate::block::BlockStream;
use crate::block::partition::{self, PartitionInfo};
use crate::error::UsbStorageError;
use crate::usb::{PermissionRegistry, UsbDeviceInfo, UsbHost};
use fatfs::{FatType, FileSystem, FsOptions};
use log::{debug, info, warn};

/// Chunk size used when the boot sector doesn't yield a plausible cluster size.
const FALLBACK_CHUNK_SIZE: usize = 4096;

pub(crate) type UsbFileSystem = FileSystem<BlockStream>;

/// A mounted FAT filesystem on a USB device.
pub struct StorageSession {
    device_name: String,
    partition: PartitionInfo,
    chunk_size: usize,
    fat_type: FatType,
    fs: Option<UsbFileSystem>,
}

impl StorageSession {
    /// Opens the device and mounts its first partition.
    ///
    /// Fails with `PermissionDenied` if access is not granted right now, and with
    /// `NoPartition` if there is nothing to mount.
    pub fn open(
        host: &dyn UsbHost,
        permissions: &dyn PermissionRegistry,
        device: &UsbDeviceInfo,
    ) -> Result<Self, UsbStorageError> {
        if !permissions.has_permission(device) {
            debug!("Refusing to open {}: permission not granted", device.device_name);
            return Err(UsbStorageError::PermissionDenied {
                device_name: device.device_name.clone(),
            });
        }

        let mut block = host
            .open_block_device(device)
            .map_err(|e| UsbStorageError::io("Couldn't open the device", e))?;

        let selected = partition::select_first_partition(&mut *block)
            .and_then(|selected| match selected {
                Some(info) => {
                    let mut boot_sector = vec![0u8; block.block_size() as usize];
                    block.read_blocks(info.first_lba, &mut boot_sector)?;
                    Ok(Some((info, boot_sector)))
                }
                None => Ok(None),
            });

        let (partition, boot_sector) = match selected {
            Ok(Some(found)) => found,
            Ok(None) => {
                release(&mut *block, &device.device_name);
                return Err(UsbStorageError::NoPartition {
                    device_name: device.device_name.clone(),
                });
            }
            Err(e) => {
                release(&mut *block, &device.device_name);
                return Err(UsbStorageError::io("Couldn't read the partition table", e));
            }
        };

        let chunk_size = partition::cluster_size(&boot_sector)
            .map(|size| size as usize)
            .unwrap_or(FALLBACK_CHUNK_SIZE);

        // From here on the stream owns the device and closes it when dropped
        let stream = BlockStream::new(block, partition.first_lba, partition.block_count);
        let fs = FileSystem::new(stream, FsOptions::new().update_accessed_date(false))
            .map_err(|e| UsbStorageError::io("Couldn't mount the FAT filesystem", e))?;
        let fat_type = fs.fat_type();

        info!(
            "Mounted {} ({:?}, partition at LBA {}, chunk size {} bytes)",
            device.display_name(),
            fat_type,
            partition.first_lba,
            chunk_size
        );

        Ok(Self {
            device_name: device.device_name.clone(),
            partition,
            chunk_size,
            fat_type,
            fs: Some(fs),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn partition(&self) -> PartitionInfo {
        self.partition
    }

    /// Bytes per read: the filesystem's cluster size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn is_open(&self) -> bool {
        self.fs.is_some()
    }

    pub(crate) fn fs(&self) -> Result<&UsbFileSystem, UsbStorageError> {
        self.fs.as_ref().ok_or_else(|| UsbStorageError::IoFailure {
            message: format!("Session for {} is closed", self.device_name),
        })
    }

    /// Unmounts and closes the device. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), UsbStorageError> {
        let Some(fs) = self.fs.take() else {
            return Ok(());
        };
        debug!("Closing session for {}", self.device_name);
        // Dropping the filesystem drops the stream, which closes the device
        fs.unmount()
            .map_err(|e| UsbStorageError::io("Couldn't unmount the filesystem", e))
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Ignoring error while closing session: {}", e);
        }
    }
}

fn release(block: &mut dyn crate::block::BlockDevice, device_name: &str) {
    if let Err(e) = block.close() {
        warn!("Ignoring error while closing {}: {}", device_name, e);
    }
}
