//! Mapping from a [`Collection`] to the Prometheus text exposition format.

use prometheus_client::collector::Collector;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{DescriptorEncoder, EncodeLabelSet};
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;

use crate::collector::Collection;
use crate::registry::{DeviceIdentity, GPU_INFO, MetricDescriptor, MetricRegistry, NUM_DEVICES};

/// Content type of the rendered exposition.
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

const BUILD_INFO: MetricDescriptor = MetricDescriptor {
    name: "exporter_build_info",
    help: "A metric with a constant '1' value labeled by the exporter version",
    labels: &["version"],
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct DeviceLabels {
    minor_number: String,
    uuid: String,
    name: String,
}

impl From<&DeviceIdentity> for DeviceLabels {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            minor_number: identity.minor_number.clone(),
            uuid: identity.uuid.clone(),
            name: identity.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct DriverLabels {
    driver_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct BuildLabels {
    version: String,
}

/// Encodes one collection in descriptor order.
///
/// Samples are written in the order the collection holds them, so the same
/// collection always renders to the same bytes.
#[derive(Debug)]
struct CollectionEncoder {
    collection: Collection,
    namespace: String,
}

impl CollectionEncoder {
    fn encode_global(
        &self,
        encoder: &mut DescriptorEncoder,
        descriptor: &MetricDescriptor,
    ) -> Result<(), std::fmt::Error> {
        let name = descriptor.full_name(&self.namespace);

        if *descriptor == GPU_INFO {
            if let Some(version) = &self.collection.driver_version {
                let labels = DriverLabels {
                    driver_version: version.clone(),
                };
                let mut family =
                    encoder.encode_descriptor(&name, descriptor.help, None, MetricType::Gauge)?;
                family.encode_family(&labels)?.encode_gauge(&1i64)?;
            }
        } else if *descriptor == NUM_DEVICES {
            if let Some(count) = self.collection.device_count {
                let mut metric =
                    encoder.encode_descriptor(&name, descriptor.help, None, MetricType::Gauge)?;
                metric.encode_gauge(&i64::from(count))?;
            }
        }

        Ok(())
    }

    /// Device-scoped families are always described, even when empty.
    fn encode_device_family(
        &self,
        encoder: &mut DescriptorEncoder,
        descriptor: &MetricDescriptor,
    ) -> Result<(), std::fmt::Error> {
        let name = descriptor.full_name(&self.namespace);
        let mut family = encoder.encode_descriptor(&name, descriptor.help, None, MetricType::Gauge)?;

        for sample in self
            .collection
            .samples
            .iter()
            .filter(|s| s.descriptor() == *descriptor)
        {
            let labels = DeviceLabels::from(&sample.identity);
            family.encode_family(&labels)?.encode_gauge(&sample.value)?;
        }

        Ok(())
    }
}

impl Collector for CollectionEncoder {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
        for descriptor in MetricRegistry::describe() {
            if descriptor == GPU_INFO || descriptor == NUM_DEVICES {
                self.encode_global(&mut encoder, &descriptor)?;
            } else {
                self.encode_device_family(&mut encoder, &descriptor)?;
            }
        }

        let name = BUILD_INFO.full_name(&self.namespace);
        let labels = BuildLabels {
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let mut family = encoder.encode_descriptor(&name, BUILD_INFO.help, None, MetricType::Gauge)?;
        family.encode_family(&labels)?.encode_gauge(&1i64)?;

        Ok(())
    }
}

/// Build a registry holding exactly the metrics of one collection.
///
/// Global metrics whose query failed are left out; device-scoped families
/// are always described, even when empty.
pub fn build_registry(collection: &Collection, namespace: &str) -> Registry {
    let mut registry = Registry::default();
    registry.register_collector(Box::new(CollectionEncoder {
        collection: collection.clone(),
        namespace: namespace.to_string(),
    }));
    registry
}

/// Render one collection in the text exposition format.
pub fn render(collection: &Collection, namespace: &str) -> Result<String, std::fmt::Error> {
    let registry = build_registry(collection, namespace);
    let mut output = String::new();
    encode(&mut output, &registry)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceMetric, Sample};

    fn gpu(minor: u32, uuid: &str) -> DeviceIdentity {
        DeviceIdentity::new(minor, uuid, "X")
    }

    /// Value lines (not comments) whose name is exactly `name`.
    fn series<'a>(output: &'a str, name: &str) -> Vec<&'a str> {
        output
            .lines()
            .filter(|l| !l.starts_with('#'))
            .filter(|l| {
                let metric = l.split(['{', ' ']).next().unwrap_or("");
                metric == name
            })
            .collect()
    }

    #[test]
    fn test_render_full_collection() {
        let collection = Collection {
            driver_version: Some("550.54.15".to_string()),
            device_count: Some(1),
            samples: vec![
                Sample {
                    metric: DeviceMetric::MemoryUsed,
                    identity: gpu(0, "GPU-A"),
                    value: 100.0,
                },
                Sample {
                    metric: DeviceMetric::Temperature,
                    identity: gpu(0, "GPU-A"),
                    value: 60.0,
                },
            ],
        };

        let output = render(&collection, "nvidia_gpu").unwrap();

        let info = series(&output, "nvidia_gpu_gpu_info");
        assert_eq!(info.len(), 1);
        assert!(info[0].contains("driver_version=\"550.54.15\""));

        let devices = series(&output, "nvidia_gpu_num_devices");
        assert_eq!(devices, vec!["nvidia_gpu_num_devices 1"]);

        let used = series(&output, "nvidia_gpu_memory_used_bytes");
        assert_eq!(used.len(), 1);
        assert!(used[0].starts_with(
            "nvidia_gpu_memory_used_bytes{minor_number=\"0\",uuid=\"GPU-A\",name=\"X\"} 100"
        ));

        assert_eq!(series(&output, "nvidia_gpu_temperature_celsius").len(), 1);
        assert!(series(&output, "nvidia_gpu_fanspeed_percent").is_empty());
        assert!(output.contains("# TYPE nvidia_gpu_fanspeed_percent gauge"));
        assert_eq!(series(&output, "nvidia_gpu_exporter_build_info").len(), 1);
        assert!(output.ends_with("# EOF\n"));
    }

    #[test]
    fn test_render_omits_failed_globals() {
        let output = render(&Collection::default(), "nvidia_gpu").unwrap();

        assert!(!output.contains("nvidia_gpu_gpu_info"));
        assert!(!output.contains("nvidia_gpu_num_devices"));
        assert!(output.contains("# TYPE nvidia_gpu_memory_used_bytes gauge"));
    }

    #[test]
    fn test_render_custom_namespace() {
        let collection = Collection {
            device_count: Some(0),
            ..Default::default()
        };

        let output = render(&collection, "gpu").unwrap();

        assert_eq!(series(&output, "gpu_num_devices"), vec!["gpu_num_devices 0"]);
    }

    #[test]
    fn test_render_is_stable_and_ordered() {
        let mut samples = Vec::new();
        for metric in DeviceMetric::ALL {
            for (minor, uuid) in [(0, "GPU-A"), (1, "GPU-B"), (2, "GPU-C"), (3, "GPU-D")] {
                samples.push(Sample {
                    metric,
                    identity: gpu(minor, uuid),
                    value: f64::from(minor),
                });
            }
        }
        let collection = Collection {
            driver_version: Some("550.54.15".to_string()),
            device_count: Some(4),
            samples,
        };

        let first = render(&collection, "nvidia_gpu").unwrap();
        for _ in 0..50 {
            assert_eq!(render(&collection, "nvidia_gpu").unwrap(), first);
        }

        let used = series(&first, "nvidia_gpu_memory_used_bytes");
        let order: Vec<_> = ["GPU-A", "GPU-B", "GPU-C", "GPU-D"]
            .iter()
            .map(|uuid| used.iter().position(|l| l.contains(uuid)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);

        let families: Vec<_> = first
            .lines()
            .filter_map(|l| l.strip_prefix("# TYPE "))
            .map(|l| l.split(' ').next().unwrap_or(""))
            .collect();
        assert_eq!(
            families,
            vec![
                "nvidia_gpu_gpu_info",
                "nvidia_gpu_num_devices",
                "nvidia_gpu_memory_used_bytes",
                "nvidia_gpu_memory_total_bytes",
                "nvidia_gpu_duty_cycle",
                "nvidia_gpu_power_usage_milliwatts",
                "nvidia_gpu_temperature_celsius",
                "nvidia_gpu_fanspeed_percent",
                "nvidia_gpu_exporter_build_info",
            ]
        );
    }
}
