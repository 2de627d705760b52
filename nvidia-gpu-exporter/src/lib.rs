//! Prometheus exporter for NVIDIA GPU telemetry.
//!
//! This crate reads per-device telemetry (memory, utilization, power,
//! temperature, fan speed) through NVML on every scrape and exposes it via
//! an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ TelemetrySource │<────│  GpuCollector   │<────│   HTTP Server   │
//! │     (NVML)      │     │ (one cycle per  │     │   (/metrics)    │
//! └─────────────────┘     │     scrape)     │     └─────────────────┘
//!                         └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! nvidia-gpu-exporter --listen :9445
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod auth;
pub mod collector;
pub mod config;
pub mod http;
pub mod mapping;
pub mod mock;
pub mod nvml;
pub mod registry;
pub mod source;

pub use collector::{Collection, GpuCollector, SharedCollector};
pub use config::ExporterConfig;
pub use http::HttpServer;
pub use nvml::NvmlSource;
pub use source::{DeviceTelemetry, SourceError, TelemetrySource};
