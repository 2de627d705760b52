//! Telemetry source abstraction.
//!
//! The collector only talks to the hardware through these traits. The
//! production implementation lives in [`crate::nvml`]; [`crate::mock`]
//! provides a scripted one for tests and demo mode.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failure of a single native telemetry query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The device or driver does not support this query.
    #[error("Not supported")]
    NotSupported,

    /// The caller lacks permission to perform the query.
    #[error("Insufficient permissions")]
    NoPermission,

    /// The device fell off the bus or otherwise became inaccessible.
    #[error("GPU is lost")]
    GpuLost,

    /// Any other error reported by the native library.
    #[error("{0}")]
    Native(String),
}

/// Memory usage of a device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub used: u64,
    pub total: u64,
}

/// The individual per-device queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceField {
    MinorNumber,
    Uuid,
    Name,
    MemoryInfo,
    Utilization,
    PowerUsage,
    Temperature,
    FanSpeed,
}

impl DeviceField {
    /// Fields that together form the device identity.
    pub const IDENTITY: [DeviceField; 3] =
        [DeviceField::MinorNumber, DeviceField::Uuid, DeviceField::Name];

    /// Get the field name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceField::MinorNumber => "minor_number",
            DeviceField::Uuid => "uuid",
            DeviceField::Name => "name",
            DeviceField::MemoryInfo => "memory_info",
            DeviceField::Utilization => "utilization",
            DeviceField::PowerUsage => "power_usage",
            DeviceField::Temperature => "temperature",
            DeviceField::FanSpeed => "fan_speed",
        }
    }
}

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Library-wide queries of a telemetry source.
///
/// Implementations must be callable from any thread. Every call is treated
/// as synchronous; the collector serializes whole cycles, not single calls.
pub trait TelemetrySource: Send + Sync {
    /// Version string of the installed driver.
    fn driver_version(&self) -> Result<String, SourceError>;

    /// Number of devices currently visible.
    fn device_count(&self) -> Result<u32, SourceError>;

    /// Resolve the device at `index`.
    ///
    /// Handles are borrowed from the source and never outlive one cycle.
    fn device(&self, index: u32) -> Result<Box<dyn DeviceTelemetry + '_>, SourceError>;

    /// Release the native library.
    fn shutdown(self: Box<Self>) -> Result<(), SourceError> {
        Ok(())
    }
}

// Lets a caller keep a handle on a source it hands to the collector.
impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    fn driver_version(&self) -> Result<String, SourceError> {
        (**self).driver_version()
    }

    fn device_count(&self) -> Result<u32, SourceError> {
        (**self).device_count()
    }

    fn device(&self, index: u32) -> Result<Box<dyn DeviceTelemetry + '_>, SourceError> {
        (**self).device(index)
    }
}

/// Per-device queries.
pub trait DeviceTelemetry {
    fn minor_number(&self) -> Result<u32, SourceError>;

    fn uuid(&self) -> Result<String, SourceError>;

    fn name(&self) -> Result<String, SourceError>;

    fn memory_info(&self) -> Result<MemoryInfo, SourceError>;

    /// Percent of the last sample period during which a kernel was running.
    fn utilization_gpu(&self) -> Result<u32, SourceError>;

    fn power_usage_milliwatts(&self) -> Result<u32, SourceError>;

    /// Temperature of the GPU die.
    fn temperature_celsius(&self) -> Result<u32, SourceError>;

    /// Speed of the first fan, as a percent of its maximum.
    fn fan_speed_percent(&self) -> Result<u32, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_field_names() {
        assert_eq!(DeviceField::MinorNumber.to_string(), "minor_number");
        assert_eq!(DeviceField::FanSpeed.to_string(), "fan_speed");
        assert_eq!(
            DeviceField::IDENTITY.map(|f| f.as_str()),
            ["minor_number", "uuid", "name"]
        );
    }

    #[test]
    fn test_source_error_display() {
        assert_eq!(SourceError::NotSupported.to_string(), "Not supported");
        assert_eq!(
            SourceError::Native("Unknown Error".to_string()).to_string(),
            "Unknown Error"
        );
    }
}
