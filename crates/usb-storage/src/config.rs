//! USB storage configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

const DEFAULT_PERMISSION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// How the permission negotiator waits for the platform's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Subscribe to the platform's grant/deny notification.
    #[default]
    Event,
    /// Re-check the permission state on a fixed interval.
    Poll,
}

impl WaitStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "event" => Some(Self::Event),
            "poll" => Some(Self::Poll),
            _ => None,
        }
    }
}

/// Plugin configuration as it appears under `plugins.usb-storage` in the app config.
/// Every field is optional there.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub permission_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub wait_strategy: Option<WaitStrategy>,
}

/// Configuration for the USB storage subsystem.
/// Priority: environment variables > plugin config > defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbStorageConfig {
    /// How long to wait for the user to answer the permission dialog
    pub permission_timeout_ms: u64,
    /// Re-check interval for the poll strategy
    pub poll_interval_ms: u64,
    pub wait_strategy: WaitStrategy,
}

impl UsbStorageConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Self {
        Self::from_plugin_config_and_env(None)
    }

    /// Load configuration with priority: env vars > plugin config > defaults.
    pub fn from_plugin_config_and_env(plugin: Option<PluginConfig>) -> Self {
        let plugin = plugin.unwrap_or_default();

        let permission_timeout_ms = env::var("USB_STORAGE_PERMISSION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(plugin.permission_timeout_ms)
            .unwrap_or(DEFAULT_PERMISSION_TIMEOUT_MS);

        // A zero interval would spin
        let poll_interval_ms = env::var("USB_STORAGE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(plugin.poll_interval_ms)
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let wait_strategy = env::var("USB_STORAGE_WAIT_STRATEGY")
            .ok()
            .and_then(|v| WaitStrategy::parse(&v))
            .or(plugin.wait_strategy)
            .unwrap_or_default();

        Self {
            permission_timeout_ms,
            poll_interval_ms,
            wait_strategy,
        }
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for UsbStorageConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
