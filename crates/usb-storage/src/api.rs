//! JSON request/response shapes and method dispatch.
//!
//! The five operations are addressed by name with JSON arguments, the way a
//! webview bridge calls them. Arguments are validated here so every entry point
//! (Tauri commands, `invoke`) rejects missing IDs with the same message.

use crate::error::UsbStorageError;
use crate::service::UsbStorage;
use crate::usb::UsbDeviceInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MISSING_IDS: &str = "vendorId and productId are required";
const MISSING_IDS_OR_PATH: &str = "vendorId, productId, and path are required";

/// Arguments of `requestPermission` and `hasPermission`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceArgs {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

/// Arguments of `readdir` and `read`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathArgs {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<UsbDeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantedResponse {
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesResponse {
    pub files: Vec<String>,
}

/// `data` is standard base64, or `null` when nothing exists at the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataResponse {
    pub data: Option<String>,
}

impl DeviceArgs {
    fn ids(&self) -> Result<(u16, u16), UsbStorageError> {
        match (self.vendor_id, self.product_id) {
            (Some(vendor_id), Some(product_id)) => Ok((vendor_id, product_id)),
            _ => Err(invalid(MISSING_IDS)),
        }
    }
}

impl PathArgs {
    fn ids_and_path(&self) -> Result<(u16, u16, &str), UsbStorageError> {
        match (self.vendor_id, self.product_id, self.path.as_deref()) {
            (Some(vendor_id), Some(product_id), Some(path)) => Ok((vendor_id, product_id, path)),
            _ => Err(invalid(MISSING_IDS_OR_PATH)),
        }
    }
}

fn invalid(message: &str) -> UsbStorageError {
    UsbStorageError::InvalidArgument {
        message: message.to_string(),
    }
}

pub async fn get_devices(storage: &UsbStorage) -> DevicesResponse {
    DevicesResponse {
        devices: storage.get_devices().await,
    }
}

pub async fn request_permission(storage: &UsbStorage, args: &DeviceArgs) -> Result<GrantedResponse, UsbStorageError> {
    let (vendor_id, product_id) = args.ids()?;
    let granted = storage.request_permission(vendor_id, product_id).await?;
    Ok(GrantedResponse { granted })
}

pub async fn has_permission(storage: &UsbStorage, args: &DeviceArgs) -> Result<GrantedResponse, UsbStorageError> {
    let (vendor_id, product_id) = args.ids()?;
    let granted = storage.has_permission(vendor_id, product_id).await?;
    Ok(GrantedResponse { granted })
}

pub async fn readdir(storage: &UsbStorage, args: &PathArgs) -> Result<FilesResponse, UsbStorageError> {
    let (vendor_id, product_id, path) = args.ids_and_path()?;
    let files = storage.read_dir(vendor_id, product_id, path).await?;
    Ok(FilesResponse { files })
}

pub async fn read(storage: &UsbStorage, args: &PathArgs) -> Result<DataResponse, UsbStorageError> {
    let (vendor_id, product_id, path) = args.ids_and_path()?;
    let data = storage.read_file_base64(vendor_id, product_id, path).await?;
    Ok(DataResponse { data })
}

impl UsbStorage {
    /// Calls an operation by name with JSON arguments.
    ///
    /// Arguments that fail to parse (wrong types, IDs out of range) count as missing.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value, UsbStorageError> {
        let response = match method {
            "getDevices" => to_value(get_devices(self).await)?,
            "requestPermission" => to_value(request_permission(self, &device_args(args)).await?)?,
            "hasPermission" => to_value(has_permission(self, &device_args(args)).await?)?,
            "readdir" => to_value(readdir(self, &path_args(args)).await?)?,
            "read" => to_value(read(self, &path_args(args)).await?)?,
            other => {
                return Err(UsbStorageError::InvalidArgument {
                    message: format!("Unknown method: {other}"),
                });
            }
        };
        Ok(response)
    }
}

fn device_args(args: Value) -> DeviceArgs {
    serde_json::from_value(args).unwrap_or_default()
}

fn path_args(args: Value) -> PathArgs {
    serde_json::from_value(args).unwrap_or_default()
}

fn to_value(response: impl Serialize) -> Result<Value, UsbStorageError> {
    serde_json::to_value(response).map_err(|e| UsbStorageError::io("Couldn't serialize the response", e))
}
