//! Telemetry source backed by the NVIDIA Management Library.

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use tracing::debug;

use crate::source::{DeviceTelemetry, MemoryInfo, SourceError, TelemetrySource};

/// Index of the fan reported by `fan_speed_percent`.
const FAN_INDEX: u32 = 0;

impl From<NvmlError> for SourceError {
    fn from(err: NvmlError) -> Self {
        match err {
            NvmlError::NotSupported => SourceError::NotSupported,
            NvmlError::NoPermission => SourceError::NoPermission,
            NvmlError::GpuLost => SourceError::GpuLost,
            other => SourceError::Native(other.to_string()),
        }
    }
}

/// NVML-backed telemetry source.
///
/// Holds the library for the lifetime of the process. Device handles are
/// resolved by index on every call to [`TelemetrySource::device`].
pub struct NvmlSource {
    nvml: Nvml,
}

impl NvmlSource {
    /// Load and initialize NVML.
    ///
    /// Fails when the shared library cannot be found or the driver is not
    /// loaded.
    pub fn init() -> Result<Self, SourceError> {
        let nvml = Nvml::init()?;
        debug!("NVML initialized");
        Ok(Self { nvml })
    }
}

impl TelemetrySource for NvmlSource {
    fn driver_version(&self) -> Result<String, SourceError> {
        Ok(self.nvml.sys_driver_version()?)
    }

    fn device_count(&self) -> Result<u32, SourceError> {
        Ok(self.nvml.device_count()?)
    }

    fn device(&self, index: u32) -> Result<Box<dyn DeviceTelemetry + '_>, SourceError> {
        let device = self.nvml.device_by_index(index)?;
        Ok(Box::new(NvmlDevice { device }))
    }

    fn shutdown(self: Box<Self>) -> Result<(), SourceError> {
        self.nvml.shutdown()?;
        debug!("NVML shut down");
        Ok(())
    }
}

struct NvmlDevice<'nvml> {
    device: Device<'nvml>,
}

impl DeviceTelemetry for NvmlDevice<'_> {
    #[cfg(target_os = "linux")]
    fn minor_number(&self) -> Result<u32, SourceError> {
        Ok(self.device.minor_number()?)
    }

    // Minor numbers only exist for Linux device nodes.
    #[cfg(not(target_os = "linux"))]
    fn minor_number(&self) -> Result<u32, SourceError> {
        Err(SourceError::NotSupported)
    }

    fn uuid(&self) -> Result<String, SourceError> {
        Ok(self.device.uuid()?)
    }

    fn name(&self) -> Result<String, SourceError> {
        Ok(self.device.name()?)
    }

    fn memory_info(&self) -> Result<MemoryInfo, SourceError> {
        let info = self.device.memory_info()?;
        Ok(MemoryInfo {
            used: info.used,
            total: info.total,
        })
    }

    fn utilization_gpu(&self) -> Result<u32, SourceError> {
        Ok(self.device.utilization_rates()?.gpu)
    }

    fn power_usage_milliwatts(&self) -> Result<u32, SourceError> {
        Ok(self.device.power_usage()?)
    }

    fn temperature_celsius(&self) -> Result<u32, SourceError> {
        Ok(self.device.temperature(TemperatureSensor::Gpu)?)
    }

    fn fan_speed_percent(&self) -> Result<u32, SourceError> {
        Ok(self.device.fan_speed(FAN_INDEX)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvml_error_mapping() {
        assert_eq!(
            SourceError::from(NvmlError::NotSupported),
            SourceError::NotSupported
        );
        assert_eq!(
            SourceError::from(NvmlError::NoPermission),
            SourceError::NoPermission
        );
        assert_eq!(SourceError::from(NvmlError::GpuLost), SourceError::GpuLost);
        assert!(matches!(
            SourceError::from(NvmlError::Unknown),
            SourceError::Native(_)
        ));
    }
}
