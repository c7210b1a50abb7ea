//! Fixtures shared by unit tests: device descriptors and FAT disk images.

use crate::usb::UsbDeviceInfo;
use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions};
use std::io::{Cursor, Write};

pub use crate::usb::simulated::MemoryDisk;

/// Routes `log` output to the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn device_info(device_name: &str, vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        device_name: device_name.to_string(),
        manufacturer_name: Some("SanDisk".to_string()),
        product_name: Some("Cruzer Blade".to_string()),
        vendor_id,
        product_id,
    }
}

/// A freshly formatted, empty FAT volume of `size` bytes.
pub fn format_fat(size: usize) -> Vec<u8> {
    FatImage::new(size).build()
}

/// Builds a FAT image with directories and files.
pub struct FatImage {
    size: usize,
    bytes_per_cluster: Option<u32>,
    fat_type: Option<FatType>,
    dirs: Vec<String>,
    files: Vec<(String, Vec<u8>)>,
}

impl FatImage {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            bytes_per_cluster: None,
            fat_type: None,
            dirs: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn bytes_per_cluster(mut self, bytes: u32) -> Self {
        self.bytes_per_cluster = Some(bytes);
        self
    }

    /// Forces the FAT variant instead of letting the volume size pick it.
    pub fn fat_type(mut self, fat_type: FatType) -> Self {
        self.fat_type = Some(fat_type);
        self
    }

    /// Creates a directory. Parents must be added first.
    pub fn dir(mut self, path: &str) -> Self {
        self.dirs.push(path.to_string());
        self
    }

    pub fn file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.push((path.to_string(), content.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut cursor = Cursor::new(vec![0u8; self.size]);
        let mut options = FormatVolumeOptions::new();
        if let Some(bytes) = self.bytes_per_cluster {
            options = options.bytes_per_cluster(bytes);
        }
        if let Some(fat_type) = self.fat_type {
            options = options.fat_type(fat_type);
        }
        fatfs::format_volume(&mut cursor, options).unwrap();

        {
            let fs = FileSystem::new(&mut cursor, FsOptions::new()).unwrap();
            {
                let root = fs.root_dir();
                for dir in &self.dirs {
                    root.create_dir(dir).unwrap();
                }
                for (path, content) in &self.files {
                    let mut file = root.create_file(path).unwrap();
                    file.truncate().unwrap();
                    file.write_all(content).unwrap();
                    file.flush().unwrap();
                }
            }
            fs.unmount().unwrap();
        }

        cursor.into_inner()
    }
}

/// A disk with an MBR whose four entries are `(type, first_lba, contents)`.
pub fn mbr_disk(entries: &[Option<(u8, u32, Vec<u8>)>]) -> Vec<u8> {
    let end = entries
        .iter()
        .flatten()
        .map(|(_, lba, data)| *lba as usize * 512 + data.len())
        .max()
        .unwrap_or(512)
        .max(512);
    let mut image = vec![0u8; end];

    for (index, entry) in entries.iter().enumerate().take(4) {
        let Some((partition_type, lba, data)) = entry else {
            continue;
        };
        let offset = 446 + index * 16;
        image[offset + 4] = *partition_type;
        image[offset + 8..offset + 12].copy_from_slice(&lba.to_le_bytes());
        image[offset + 12..offset + 16].copy_from_slice(&((data.len() / 512) as u32).to_le_bytes());
        let start = *lba as usize * 512;
        image[start..start + data.len()].copy_from_slice(data);
    }
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

/// Deterministic non-repeating-ish payload of `len` bytes.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}
