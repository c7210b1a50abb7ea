//! Error types for USB storage operations.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Error returned by every caller-facing USB storage operation.
///
/// Serialized with a `type` tag so the frontend can branch on the kind, plus the
/// variant's fields and the `Display` text as `message`, for example
/// `{"type":"deviceNotFound","vendor_id":1234,"product_id":5678,"message":"USB device not found: 04d2:162e"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbStorageError {
    /// No attached mass-storage device matches the vendor/product pair.
    DeviceNotFound { vendor_id: u16, product_id: u16 },
    /// The platform has not granted access to the device.
    PermissionDenied { device_name: String },
    /// The permission dialog was not answered within the wait window.
    TimedOut { device_name: String, waited_ms: u64 },
    /// The device has no partition we can mount.
    NoPartition { device_name: String },
    /// Nothing exists at the path.
    NotFound { path: String },
    /// The path resolves to a file where a directory was expected.
    NotADirectory { path: String },
    /// The path resolves to a directory where a file was expected.
    IsADirectory { path: String },
    /// Block device or filesystem driver failure.
    IoFailure { message: String },
    /// The request is missing a required argument or names an unknown operation.
    InvalidArgument { message: String },
}

impl UsbStorageError {
    pub(crate) fn io(context: &str, err: impl std::fmt::Display) -> Self {
        Self::IoFailure {
            message: format!("{context}: {err}"),
        }
    }

    /// The camelCase `type` tag of the serialized form.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "deviceNotFound",
            Self::PermissionDenied { .. } => "permissionDenied",
            Self::TimedOut { .. } => "timedOut",
            Self::NoPartition { .. } => "noPartition",
            Self::NotFound { .. } => "notFound",
            Self::NotADirectory { .. } => "notADirectory",
            Self::IsADirectory { .. } => "isADirectory",
            Self::IoFailure { .. } => "ioFailure",
            Self::InvalidArgument { .. } => "invalidArgument",
        }
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::DeviceNotFound { .. } => "USB device not found. It may have been unplugged.".to_string(),
            Self::PermissionDenied { .. } => {
                "No permission to access the USB device. Allow access when the system asks.".to_string()
            }
            Self::TimedOut { .. } => "The permission request was not answered in time. Try again.".to_string(),
            Self::NoPartition { .. } => "The USB device has no readable partition.".to_string(),
            Self::NotFound { path } => format!("File or folder not found: {}", path),
            Self::NotADirectory { path } => format!("Not a folder: {}", path),
            Self::IsADirectory { path } => format!("The path is a folder: {}", path),
            Self::IoFailure { message } => format!("Couldn't read the USB device: {}", message),
            Self::InvalidArgument { message } => message.clone(),
        }
    }
}

impl std::fmt::Display for UsbStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceNotFound { vendor_id, product_id } => {
                write!(f, "USB device not found: {vendor_id:04x}:{product_id:04x}")
            }
            Self::PermissionDenied { device_name } => write!(f, "Permission denied for {device_name}"),
            Self::TimedOut { device_name, waited_ms } => {
                write!(f, "Permission request for {device_name} timed out after {waited_ms} ms")
            }
            Self::NoPartition { device_name } => write!(f, "No partition found on {device_name}"),
            Self::NotFound { path } => write!(f, "Not found: {path}"),
            Self::NotADirectory { path } => write!(f, "Not a directory: {path}"),
            Self::IsADirectory { path } => write!(f, "Is a directory: {path}"),
            Self::IoFailure { message } => write!(f, "I/O failure: {message}"),
            Self::InvalidArgument { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for UsbStorageError {}

impl Serialize for UsbStorageError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind())?;
        match self {
            Self::DeviceNotFound { vendor_id, product_id } => {
                map.serialize_entry("vendor_id", vendor_id)?;
                map.serialize_entry("product_id", product_id)?;
            }
            Self::PermissionDenied { device_name } | Self::NoPartition { device_name } => {
                map.serialize_entry("device_name", device_name)?;
            }
            Self::TimedOut { device_name, waited_ms } => {
                map.serialize_entry("device_name", device_name)?;
                map.serialize_entry("waited_ms", waited_ms)?;
            }
            Self::NotFound { path } | Self::NotADirectory { path } | Self::IsADirectory { path } => {
                map.serialize_entry("path", path)?;
            }
            // Their own `message` field is carried by the Display text below
            Self::IoFailure { .. } | Self::InvalidArgument { .. } => {}
        }
        map.serialize_entry("message", &self.to_string())?;
        map.end()
    }
}

impl From<std::io::Error> for UsbStorageError {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailure {
            message: err.to_string(),
        }
    }
}
