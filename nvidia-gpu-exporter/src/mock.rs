//! Scripted telemetry source for testing and demo mode.
//!
//! Provides devices with fixed readings and per-field failure injection,
//! without NVML or a GPU.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::source::{DeviceField, DeviceTelemetry, MemoryInfo, SourceError, TelemetrySource};

/// A mock device with fixed readings.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub minor_number: u32,
    pub uuid: String,
    pub name: String,
    pub memory: MemoryInfo,
    pub utilization: u32,
    pub power_usage: u32,
    pub temperature: u32,
    pub fan_speed: u32,
    failures: HashMap<DeviceField, SourceError>,
    latency: Option<Duration>,
}

impl MockDevice {
    /// Create an idle device with 16 GiB of memory.
    pub fn new(minor_number: u32, uuid: &str, name: &str) -> Self {
        Self {
            minor_number,
            uuid: uuid.to_string(),
            name: name.to_string(),
            memory: MemoryInfo {
                used: 0,
                total: 16 * 1024 * 1024 * 1024,
            },
            utilization: 0,
            power_usage: 0,
            temperature: 0,
            fan_speed: 0,
            failures: HashMap::new(),
            latency: None,
        }
    }

    pub fn with_memory(mut self, used: u64, total: u64) -> Self {
        self.memory = MemoryInfo { used, total };
        self
    }

    pub fn with_utilization(mut self, percent: u32) -> Self {
        self.utilization = percent;
        self
    }

    pub fn with_power_usage(mut self, milliwatts: u32) -> Self {
        self.power_usage = milliwatts;
        self
    }

    pub fn with_temperature(mut self, celsius: u32) -> Self {
        self.temperature = celsius;
        self
    }

    pub fn with_fan_speed(mut self, percent: u32) -> Self {
        self.fan_speed = percent;
        self
    }

    /// Make every query of `field` fail with `error`.
    pub fn with_failure(mut self, field: DeviceField, error: SourceError) -> Self {
        self.failures.insert(field, error);
        self
    }

    /// Delay every field query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn read<T>(&self, field: DeviceField, value: T) -> Result<T, SourceError> {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        match self.failures.get(&field) {
            Some(err) => Err(err.clone()),
            None => Ok(value),
        }
    }
}

impl DeviceTelemetry for MockDevice {
    fn minor_number(&self) -> Result<u32, SourceError> {
        self.read(DeviceField::MinorNumber, self.minor_number)
    }

    fn uuid(&self) -> Result<String, SourceError> {
        self.read(DeviceField::Uuid, self.uuid.clone())
    }

    fn name(&self) -> Result<String, SourceError> {
        self.read(DeviceField::Name, self.name.clone())
    }

    fn memory_info(&self) -> Result<MemoryInfo, SourceError> {
        self.read(DeviceField::MemoryInfo, self.memory)
    }

    fn utilization_gpu(&self) -> Result<u32, SourceError> {
        self.read(DeviceField::Utilization, self.utilization)
    }

    fn power_usage_milliwatts(&self) -> Result<u32, SourceError> {
        self.read(DeviceField::PowerUsage, self.power_usage)
    }

    fn temperature_celsius(&self) -> Result<u32, SourceError> {
        self.read(DeviceField::Temperature, self.temperature)
    }

    fn fan_speed_percent(&self) -> Result<u32, SourceError> {
        self.read(DeviceField::FanSpeed, self.fan_speed)
    }
}

#[derive(Debug, Default)]
struct MockState {
    driver_version: Option<String>,
    devices: Vec<MockDevice>,
    device_count_error: Option<SourceError>,
    handle_errors: HashMap<u32, SourceError>,
}

/// In-memory telemetry source whose responses can be changed between cycles.
#[derive(Debug, Default)]
pub struct MockSource {
    state: RwLock<MockState>,
}

impl MockSource {
    /// Create a source reporting `driver_version` and `devices`.
    pub fn new(driver_version: &str, devices: Vec<MockDevice>) -> Self {
        Self {
            state: RwLock::new(MockState {
                driver_version: Some(driver_version.to_string()),
                devices,
                ..Default::default()
            }),
        }
    }

    /// Replace the device list.
    pub fn set_devices(&self, devices: Vec<MockDevice>) {
        self.state.write().devices = devices;
    }

    /// Make the driver version query fail (`None`) or succeed again.
    pub fn set_driver_version(&self, version: Option<&str>) {
        self.state.write().driver_version = version.map(str::to_string);
    }

    /// Make the device count query fail with `error`, or clear the failure.
    pub fn set_device_count_error(&self, error: Option<SourceError>) {
        self.state.write().device_count_error = error;
    }

    /// Make resolving the handle at `index` fail with `error`.
    pub fn set_handle_error(&self, index: u32, error: SourceError) {
        self.state.write().handle_errors.insert(index, error);
    }

    /// Let the handle at `index` resolve again.
    pub fn clear_handle_error(&self, index: u32) {
        self.state.write().handle_errors.remove(&index);
    }
}

impl TelemetrySource for MockSource {
    fn driver_version(&self) -> Result<String, SourceError> {
        self.state
            .read()
            .driver_version
            .clone()
            .ok_or(SourceError::NotSupported)
    }

    fn device_count(&self) -> Result<u32, SourceError> {
        let state = self.state.read();
        match &state.device_count_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.devices.len() as u32),
        }
    }

    fn device(&self, index: u32) -> Result<Box<dyn DeviceTelemetry + '_>, SourceError> {
        let state = self.state.read();
        if let Some(err) = state.handle_errors.get(&index) {
            return Err(err.clone());
        }
        state
            .devices
            .get(index as usize)
            .cloned()
            .map(|device| Box::new(device) as Box<dyn DeviceTelemetry>)
            .ok_or_else(|| SourceError::Native("Invalid Argument".to_string()))
    }
}

/// Source used by `--demo`: two busy GPUs, one of them without a fan.
pub fn demo_source() -> MockSource {
    MockSource::new(
        "550.54.15",
        vec![
            MockDevice::new(0, "GPU-7f3b2c1e-0000-4d6a-9a51-1c2d3e4f5a60", "NVIDIA A100-SXM4-40GB")
                .with_memory(12 * 1024 * 1024 * 1024, 40 * 1024 * 1024 * 1024)
                .with_utilization(87)
                .with_power_usage(243_000)
                .with_temperature(61)
                .with_fan_speed(45),
            MockDevice::new(1, "GPU-7f3b2c1e-0001-4d6a-9a51-1c2d3e4f5a61", "NVIDIA A100-SXM4-40GB")
                .with_memory(3 * 1024 * 1024 * 1024, 40 * 1024 * 1024 * 1024)
                .with_utilization(12)
                .with_power_usage(68_000)
                .with_temperature(44)
                .with_failure(DeviceField::FanSpeed, SourceError::NotSupported),
        ],
    )
}
