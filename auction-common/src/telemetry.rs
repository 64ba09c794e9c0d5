// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

//! Logging, tracing and metrics setup shared by every binary crate.

use fastrace::collector::Config as FastraceConfig;
use fastrace_opentelemetry::OpenTelemetryReporter;
use log::LevelFilter;
use opentelemetry::InstrumentationScope;
use opentelemetry_otlp::WithExportConfig;
use serde::Deserialize;
use std::{borrow::Cow, net::SocketAddr};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "tracing")]
    pub tracing_config: TracingConfig,

    #[serde(rename = "metrics")]
    pub metrics_config: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// Enables span reporting via OTLP; when `None`, spans are collected but not exported.
    pub otlp_exporter_endpoint: Option<String>,

    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Address the Prometheus scrape endpoint is served on.
    pub addr: SocketAddr,
}

/// Initializes the global `log` logger. Must be called exactly once, before any other
/// initialization, so panics and early errors are captured.
pub fn init_logging() {
    logforth::starter_log::builder()
        .dispatch(|d| d.filter(LevelFilter::Info).append(logforth::append::Stdout))
        .apply();
}

/// Initializes `fastrace` span collection and, if configured, OTLP export.
pub fn init_tracing(config: TracingConfig) {
    let TracingConfig {
        otlp_exporter_endpoint,
        service_name,
    } = config;

    let Some(endpoint) = otlp_exporter_endpoint else {
        fastrace::set_reporter(fastrace::collector::ConsoleReporter, FastraceConfig::default());
        return;
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .expect("OTLP span exporter can be built");

    let reporter = OpenTelemetryReporter::new(
        exporter,
        Cow::Owned(opentelemetry_sdk::Resource::builder().build()),
        InstrumentationScope::builder(service_name).build(),
    );

    fastrace::set_reporter(reporter, FastraceConfig::default());
}

/// Initializes the global `metrics` recorder and starts the Prometheus scrape endpoint.
pub fn init_metrics(config: MetricsConfig) {
    let MetricsConfig { addr } = config;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("Prometheus exporter can be installed");
}
