//! Collection cycle: queries the telemetry source and rebuilds the metric
//! value sets on every scrape.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::registry::{DeviceIdentity, DeviceMetric, MetricRegistry, Sample};
use crate::source::{DeviceField, DeviceTelemetry, SourceError, TelemetrySource};

/// Errors that prevent a collection cycle from running at all.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("Collection still in progress after waiting {0:?}")]
    Busy(Duration),
}

/// Result of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    /// Driver version, if the query succeeded.
    pub driver_version: Option<String>,
    /// Raw enumerated device count, if the query succeeded.
    pub device_count: Option<u32>,
    /// Every device-scoped series recorded this cycle.
    pub samples: Vec<Sample>,
}

impl Collection {
    /// Samples belonging to one device.
    pub fn device_samples<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> impl Iterator<Item = &'a Sample> + 'a {
        self.samples.iter().filter(move |s| &s.identity == identity)
    }

    /// Value of one series, if present.
    pub fn value(&self, metric: DeviceMetric, identity: &DeviceIdentity) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.metric == metric && &s.identity == identity)
            .map(|s| s.value)
    }
}

/// Collector statistics, cumulative over the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    /// Completed collection cycles.
    pub cycles: u64,
    /// Cycles cut short because the device count was unavailable.
    pub device_count_failures: u64,
    /// Devices skipped because their handle or identity was unreadable.
    pub devices_skipped: u64,
    /// Individual field queries that failed.
    pub field_errors: u64,
}

impl CollectorStats {
    fn absorb(&mut self, cycle: &CollectorStats) {
        self.cycles += cycle.cycles;
        self.device_count_failures += cycle.device_count_failures;
        self.devices_skipped += cycle.devices_skipped;
        self.field_errors += cycle.field_errors;
    }
}

/// Thread-safe GPU metric collector.
///
/// Cycles are serialized by a single lock: resets, queries and the snapshot
/// of one cycle never interleave with another. A native call that hangs
/// holds that lock until it returns; `lock_timeout` bounds how long other
/// scrapes wait for it. Statistics sit behind their own lock and stay
/// readable while a cycle is stuck.
pub struct GpuCollector {
    source: Box<dyn TelemetrySource>,
    registry: Mutex<MetricRegistry>,
    stats: Mutex<CollectorStats>,
    lock_timeout: Option<Duration>,
}

impl GpuCollector {
    /// Create a collector over `source`.
    pub fn new(source: Box<dyn TelemetrySource>) -> Self {
        Self {
            source,
            registry: Mutex::new(MetricRegistry::new()),
            stats: Mutex::new(CollectorStats::default()),
            lock_timeout: None,
        }
    }

    /// Bound how long a cycle waits for a previous one to finish.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Consume the collector and hand back its source, e.g. for shutdown.
    pub fn into_source(self) -> Box<dyn TelemetrySource> {
        self.source
    }

    /// Get collector statistics of every completed cycle.
    pub fn stats(&self) -> CollectorStats {
        self.stats.lock().clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MetricRegistry>, CollectError> {
        match self.lock_timeout {
            Some(timeout) => self
                .registry
                .try_lock_for(timeout)
                .ok_or(CollectError::Busy(timeout)),
            None => Ok(self.registry.lock()),
        }
    }

    /// Run one collection cycle.
    ///
    /// Only a missing device count cuts the cycle short; every other failure
    /// drops the affected device or series and is logged.
    pub fn collect(&self) -> Result<Collection, CollectError> {
        let mut registry = self.lock()?;
        let mut cycle = CollectorStats {
            cycles: 1,
            ..Default::default()
        };

        registry.reset_all();

        let driver_version = match self.source.driver_version() {
            Ok(version) => Some(version),
            Err(e) => {
                error!(error = %e, "Unable to get system driver version");
                None
            }
        };

        let device_count = match self.source.device_count() {
            Ok(count) => Some(count),
            Err(e) => {
                error!(error = %e, "Unable to get device count");
                cycle.device_count_failures += 1;
                None
            }
        };

        for index in 0..device_count.unwrap_or(0) {
            let device = match self.source.device(index) {
                Ok(device) => device,
                Err(e) => {
                    warn!(index, error = %e, "Unable to get device");
                    cycle.devices_skipped += 1;
                    continue;
                }
            };

            let identity = match resolve_identity(device.as_ref()) {
                Ok(identity) => identity,
                Err((field, e)) => {
                    warn!(index, %field, error = %e, "Unable to identify device, skipping");
                    cycle.devices_skipped += 1;
                    continue;
                }
            };

            record_device(&mut registry, &mut cycle, index, &identity, device.as_ref());
        }

        let collection = Collection {
            driver_version,
            device_count,
            samples: registry.snapshot(),
        };

        debug!(
            devices = ?collection.device_count,
            series = registry.series_count(),
            "Collection cycle complete"
        );

        self.stats.lock().absorb(&cycle);

        Ok(collection)
    }
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<GpuCollector>;

/// Read the identity triple; any failure rejects the whole device.
fn resolve_identity(
    device: &dyn DeviceTelemetry,
) -> Result<DeviceIdentity, (DeviceField, SourceError)> {
    let minor_number = device
        .minor_number()
        .map_err(|e| (DeviceField::MinorNumber, e))?;
    let uuid = device.uuid().map_err(|e| (DeviceField::Uuid, e))?;
    let name = device.name().map_err(|e| (DeviceField::Name, e))?;

    Ok(DeviceIdentity::new(minor_number, uuid, name))
}

/// Query every telemetry field of one device and record the ones that
/// succeed. A failed field leaves its series absent for this cycle.
fn record_device(
    registry: &mut MetricRegistry,
    stats: &mut CollectorStats,
    index: u32,
    identity: &DeviceIdentity,
    device: &dyn DeviceTelemetry,
) {
    if let Some(memory) = observe(stats, index, DeviceField::MemoryInfo, device.memory_info()) {
        registry.set(DeviceMetric::MemoryUsed, identity, memory.used as f64);
        registry.set(DeviceMetric::MemoryTotal, identity, memory.total as f64);
    }

    let fields = [
        (
            DeviceMetric::DutyCycle,
            DeviceField::Utilization,
            device.utilization_gpu(),
        ),
        (
            DeviceMetric::PowerUsage,
            DeviceField::PowerUsage,
            device.power_usage_milliwatts(),
        ),
        (
            DeviceMetric::Temperature,
            DeviceField::Temperature,
            device.temperature_celsius(),
        ),
        (
            DeviceMetric::FanSpeed,
            DeviceField::FanSpeed,
            device.fan_speed_percent(),
        ),
    ];

    for (metric, field, result) in fields {
        if let Some(value) = observe(stats, index, field, result) {
            registry.set(metric, identity, f64::from(value));
        }
    }

    trace!(index, uuid = %identity.uuid, "Recorded device");
}

/// Turn a query result into a value, logging and counting the failure.
fn observe<T>(
    stats: &mut CollectorStats,
    index: u32,
    field: DeviceField,
    result: Result<T, SourceError>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            stats.field_errors += 1;
            if e == SourceError::NotSupported {
                debug!(index, %field, error = %e, "Device field unavailable");
            } else {
                warn!(index, %field, error = %e, "Unable to query device field");
            }
            None
        }
    }
}
