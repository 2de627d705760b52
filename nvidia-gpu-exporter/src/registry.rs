//! Metric descriptors and per-cycle value sets.

use std::collections::BTreeMap;

/// Labels carried by every device-scoped metric, in exposition order.
pub const DEVICE_LABELS: &[&str] = &["minor_number", "uuid", "name"];

/// Labels carried by the driver info metric.
pub const GPU_INFO_LABELS: &[&str] = &["driver_version"];

/// Static definition of one exported metric.
///
/// The name is relative to the configured namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

impl MetricDescriptor {
    /// Full metric name under `namespace`.
    pub fn full_name(&self, namespace: &str) -> String {
        if namespace.is_empty() {
            self.name.to_string()
        } else {
            format!("{}_{}", namespace, self.name)
        }
    }
}

pub const GPU_INFO: MetricDescriptor = MetricDescriptor {
    name: "gpu_info",
    help: "A metric with a constant '1' value labeled by gpu driver_version",
    labels: GPU_INFO_LABELS,
};

pub const NUM_DEVICES: MetricDescriptor = MetricDescriptor {
    name: "num_devices",
    help: "Number of GPU devices",
    labels: &[],
};

/// The device-scoped metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceMetric {
    MemoryUsed,
    MemoryTotal,
    DutyCycle,
    PowerUsage,
    Temperature,
    FanSpeed,
}

impl DeviceMetric {
    pub const ALL: [DeviceMetric; 6] = [
        DeviceMetric::MemoryUsed,
        DeviceMetric::MemoryTotal,
        DeviceMetric::DutyCycle,
        DeviceMetric::PowerUsage,
        DeviceMetric::Temperature,
        DeviceMetric::FanSpeed,
    ];

    pub fn descriptor(&self) -> MetricDescriptor {
        let (name, help) = match self {
            DeviceMetric::MemoryUsed => (
                "memory_used_bytes",
                "Memory used by the GPU device in bytes",
            ),
            DeviceMetric::MemoryTotal => (
                "memory_total_bytes",
                "Total memory of the GPU device in bytes",
            ),
            DeviceMetric::DutyCycle => (
                "duty_cycle",
                "Percent of time over the past sample period during which one or more kernels were executing on the GPU device",
            ),
            DeviceMetric::PowerUsage => (
                "power_usage_milliwatts",
                "Power usage of the GPU device in milliwatts",
            ),
            DeviceMetric::Temperature => (
                "temperature_celsius",
                "Temperature of the GPU device in celsius",
            ),
            DeviceMetric::FanSpeed => (
                "fanspeed_percent",
                "Fanspeed of the GPU device as a percent of its maximum",
            ),
        };

        MetricDescriptor {
            name,
            help,
            labels: DEVICE_LABELS,
        }
    }
}

/// Identity of a device within one cycle; the label key of its series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity {
    pub minor_number: String,
    pub uuid: String,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(minor_number: u32, uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            minor_number: minor_number.to_string(),
            uuid: uuid.into(),
            name: name.into(),
        }
    }
}

/// One entry of a registry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: DeviceMetric,
    pub identity: DeviceIdentity,
    pub value: f64,
}

impl Sample {
    pub fn descriptor(&self) -> MetricDescriptor {
        self.metric.descriptor()
    }
}

/// Holds the value set of every device-scoped metric.
///
/// Owned by the collector and only mutated while its cycle lock is held.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    values: BTreeMap<DeviceMetric, BTreeMap<DeviceIdentity, f64>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All descriptors this exporter can emit, global ones first.
    pub fn describe() -> Vec<MetricDescriptor> {
        let mut descriptors = vec![GPU_INFO, NUM_DEVICES];
        descriptors.extend(DeviceMetric::ALL.iter().map(DeviceMetric::descriptor));
        descriptors
    }

    /// Clear the value set of one metric kind.
    pub fn reset(&mut self, metric: DeviceMetric) {
        self.values.remove(&metric);
    }

    /// Clear every device-scoped value set.
    pub fn reset_all(&mut self) {
        for metric in DeviceMetric::ALL {
            self.reset(metric);
        }
    }

    /// Insert or overwrite the value of one series.
    pub fn set(&mut self, metric: DeviceMetric, identity: &DeviceIdentity, value: f64) {
        self.values
            .entry(metric)
            .or_default()
            .insert(identity.clone(), value);
    }

    /// Number of stored series across all kinds.
    pub fn series_count(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    /// Point-in-time copy of every stored series, ordered by metric kind
    /// then by identity.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.values
            .iter()
            .flat_map(|(metric, series)| {
                series.iter().map(|(identity, value)| Sample {
                    metric: *metric,
                    identity: identity.clone(),
                    value: *value,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(minor: u32) -> DeviceIdentity {
        DeviceIdentity::new(minor, format!("GPU-{}", minor), "Tesla T4")
    }

    fn values(registry: &MetricRegistry) -> Vec<(DeviceMetric, f64)> {
        registry
            .snapshot()
            .into_iter()
            .map(|s| (s.metric, s.value))
            .collect()
    }

    #[test]
    fn test_describe_lists_every_metric() {
        let names: Vec<_> = MetricRegistry::describe().iter().map(|d| d.name).collect();

        assert_eq!(
            names,
            vec![
                "gpu_info",
                "num_devices",
                "memory_used_bytes",
                "memory_total_bytes",
                "duty_cycle",
                "power_usage_milliwatts",
                "temperature_celsius",
                "fanspeed_percent",
            ]
        );
    }

    #[test]
    fn test_label_schemas() {
        assert_eq!(GPU_INFO.labels, &["driver_version"]);
        assert!(NUM_DEVICES.labels.is_empty());
        for metric in DeviceMetric::ALL {
            assert_eq!(metric.descriptor().labels, DEVICE_LABELS);
        }
    }

    #[test]
    fn test_full_name() {
        assert_eq!(
            NUM_DEVICES.full_name("nvidia_gpu"),
            "nvidia_gpu_num_devices"
        );
        assert_eq!(NUM_DEVICES.full_name(""), "num_devices");
    }

    #[test]
    fn test_set_last_write_wins() {
        let mut registry = MetricRegistry::new();
        registry.set(DeviceMetric::Temperature, &gpu(0), 40.0);
        registry.set(DeviceMetric::Temperature, &gpu(0), 42.0);

        assert_eq!(registry.series_count(), 1);
        assert_eq!(values(&registry), vec![(DeviceMetric::Temperature, 42.0)]);
    }

    #[test]
    fn test_reset_clears_one_kind() {
        let mut registry = MetricRegistry::new();
        registry.set(DeviceMetric::Temperature, &gpu(0), 40.0);
        registry.set(DeviceMetric::FanSpeed, &gpu(0), 30.0);

        registry.reset(DeviceMetric::Temperature);

        assert_eq!(values(&registry), vec![(DeviceMetric::FanSpeed, 30.0)]);
    }

    #[test]
    fn test_reset_all() {
        let mut registry = MetricRegistry::new();
        for metric in DeviceMetric::ALL {
            registry.set(metric, &gpu(0), 1.0);
            registry.set(metric, &gpu(1), 2.0);
        }
        assert_eq!(registry.series_count(), 12);

        registry.reset_all();

        assert_eq!(registry.series_count(), 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let mut registry = MetricRegistry::new();
        registry.set(DeviceMetric::FanSpeed, &gpu(1), 30.0);
        registry.set(DeviceMetric::MemoryUsed, &gpu(1), 200.0);
        registry.set(DeviceMetric::MemoryUsed, &gpu(0), 100.0);

        let snapshot = registry.snapshot();
        registry.reset_all();

        let order: Vec<_> = snapshot
            .iter()
            .map(|s| (s.metric, s.identity.minor_number.as_str(), s.value))
            .collect();
        assert_eq!(
            order,
            vec![
                (DeviceMetric::MemoryUsed, "0", 100.0),
                (DeviceMetric::MemoryUsed, "1", 200.0),
                (DeviceMetric::FanSpeed, "1", 30.0),
            ]
        );
        assert_eq!(snapshot[0].descriptor().name, "memory_used_bytes");
    }
}
