//! Read-only access to FAT-formatted USB mass-storage devices.
//!
//! Lists attached thumb drives and card readers, negotiates access with the OS,
//! mounts the first partition and serves directory listings and whole-file reads.
//! With the `tauri` feature, [`init`] registers the operations as the
//! `usb-storage` plugin.

// Warn on unused code to catch dead code early
#![warn(unused)]
// Warn on unused dependencies to catch platform-specific cfg mismatches
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::io::Error when io is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

//noinspection ALL
// libc is only needed for the device node access check on Linux
#[cfg(target_os = "macos")]
use libc as _;

pub mod api;
pub mod block;
pub mod config;
pub mod error;
mod ignore_poison;
pub mod permission;
#[cfg(feature = "tauri")]
mod plugin;
pub mod service;
pub mod session;
pub mod usb;

#[cfg(test)]
mod test_support;

pub use config::{PluginConfig, UsbStorageConfig, WaitStrategy};
pub use error::UsbStorageError;
#[cfg(feature = "tauri")]
pub use plugin::init;
pub use service::UsbStorage;
pub use usb::UsbDeviceInfo;
