//! Tauri plugin `usb-storage`.
//!
//! Registers the five operations as commands. The frontend calls them as
//! `plugin:usb-storage|readdir` and so on, with camelCase arguments.

use crate::api::{self, DataResponse, DeviceArgs, DevicesResponse, FilesResponse, GrantedResponse, PathArgs};
use crate::config::{PluginConfig, UsbStorageConfig};
use crate::error::UsbStorageError;
use crate::service::UsbStorage;
use log::info;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{Manager, Runtime, State};

/// Lists attached USB mass-storage devices.
#[tauri::command]
pub async fn get_devices(storage: State<'_, UsbStorage>) -> Result<DevicesResponse, UsbStorageError> {
    Ok(api::get_devices(&storage).await)
}

/// Asks the OS for access to a device and waits for the answer.
///
/// # Arguments
///
/// * `vendor_id`, `product_id` - The device's USB IDs
#[tauri::command]
pub async fn request_permission(
    storage: State<'_, UsbStorage>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> Result<GrantedResponse, UsbStorageError> {
    api::request_permission(&storage, &DeviceArgs { vendor_id, product_id }).await
}

/// Whether access to a device is granted. Never prompts.
#[tauri::command]
pub async fn has_permission(
    storage: State<'_, UsbStorage>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> Result<GrantedResponse, UsbStorageError> {
    api::has_permission(&storage, &DeviceArgs { vendor_id, product_id }).await
}

/// Lists the names in a directory of the device's first partition.
#[tauri::command]
pub async fn readdir(
    storage: State<'_, UsbStorage>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    path: Option<String>,
) -> Result<FilesResponse, UsbStorageError> {
    api::readdir(
        &storage,
        &PathArgs {
            vendor_id,
            product_id,
            path,
        },
    )
    .await
}

/// Reads a whole file as base64. `data` is null if the path doesn't exist.
#[tauri::command]
pub async fn read(
    storage: State<'_, UsbStorage>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    path: Option<String>,
) -> Result<DataResponse, UsbStorageError> {
    api::read(
        &storage,
        &PathArgs {
            vendor_id,
            product_id,
            path,
        },
    )
    .await
}

/// Builds the plugin. Configuration comes from `plugins.usb-storage` in the app
/// config, overridden by `USB_STORAGE_*` environment variables.
pub fn init<R: Runtime>() -> TauriPlugin<R, Option<PluginConfig>> {
    Builder::<R, Option<PluginConfig>>::new("usb-storage")
        .invoke_handler(tauri::generate_handler![
            get_devices,
            request_permission,
            has_permission,
            readdir,
            read
        ])
        .setup(|app, api| {
            let config = UsbStorageConfig::from_plugin_config_and_env(api.config().clone());
            info!(
                "USB storage plugin ready (permission timeout {} ms, {:?} wait)",
                config.permission_timeout_ms, config.wait_strategy
            );
            app.manage(UsbStorage::with_platform_host(config)?);
            Ok(())
        })
        .build()
}
