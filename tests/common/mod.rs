//! Shared telemetry harness for the integration tests.

#![allow(dead_code)]

use actix_web_request_telemetry::{RequestTelemetry, RequestTelemetryBuilder};
use opentelemetry::{Key, KeyValue};
use opentelemetry_sdk::{
    metrics::{
        data::{Histogram, Sum},
        InMemoryMetricExporter, PeriodicReader, SdkMeterProvider,
    },
    propagation::TraceContextPropagator,
    trace::{InMemorySpanExporter, SdkTracerProvider, SpanData},
};

pub const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
pub const UPSTREAM_TRACE_ID: &str = "0af7651916cd43dd8448eb211c80319c";
pub const UPSTREAM_SPAN_ID: &str = "b7ad6b7169203331";

/// One recorded metric data point.
#[derive(Debug, Clone)]
pub struct DataPoint {
    pub metric: String,
    pub attributes: Vec<KeyValue>,
    /// Counter value or histogram sum.
    pub value: f64,
}

impl DataPoint {
    pub fn attribute(&self, key: &'static str) -> Option<String> {
        attribute(&self.attributes, key)
    }
}

/// String form of the attribute stored under `key`.
pub fn attribute(attributes: &[KeyValue], key: &'static str) -> Option<String> {
    attributes
        .iter()
        .find(|kv| kv.key == Key::from_static_str(key))
        .map(|kv| kv.value.to_string())
}

/// In-memory tracer and meter providers wired into the middleware.
pub struct Telemetry {
    spans: InMemorySpanExporter,
    metrics: InMemoryMetricExporter,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn new() -> Self {
        let spans = InMemorySpanExporter::default();
        let tracer_provider = SdkTracerProvider::builder()
            .with_simple_exporter(spans.clone())
            .build();

        let metrics = InMemoryMetricExporter::default();
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metrics.clone()).build())
            .build();

        Telemetry {
            spans,
            metrics,
            tracer_provider,
            meter_provider,
        }
    }

    /// Builder using the in-memory providers and W3C trace context.
    pub fn builder(&self, service: &str) -> RequestTelemetryBuilder {
        RequestTelemetry::builder(service)
            .with_tracer_provider(self.tracer_provider.clone())
            .with_meter_provider(self.meter_provider.clone())
            .with_propagator(TraceContextPropagator::new())
    }

    pub fn middleware(&self) -> RequestTelemetry {
        self.builder("test-service").build()
    }

    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans.get_finished_spans().unwrap()
    }

    /// Every data point of the latest metric collection.
    pub fn data_points(&self) -> Vec<DataPoint> {
        self.meter_provider.force_flush().unwrap();
        let collected = self.metrics.get_finished_metrics().unwrap();
        let Some(latest) = collected.last() else {
            return Vec::new();
        };

        let mut points = Vec::new();
        for scope in &latest.scope_metrics {
            for metric in &scope.metrics {
                let data = metric.data.as_any();
                if let Some(sum) = data.downcast_ref::<Sum<i64>>() {
                    points.extend(sum.data_points.iter().map(|point| DataPoint {
                        metric: metric.name.to_string(),
                        attributes: point.attributes.clone(),
                        value: point.value as f64,
                    }));
                } else if let Some(histogram) = data.downcast_ref::<Histogram<f64>>() {
                    points.extend(histogram.data_points.iter().map(|point| DataPoint {
                        metric: metric.name.to_string(),
                        attributes: point.attributes.clone(),
                        value: point.sum,
                    }));
                }
            }
        }
        points
    }

    pub fn data_points_for(&self, metric: &str) -> Vec<DataPoint> {
        self.data_points()
            .into_iter()
            .filter(|point| point.metric == metric)
            .collect()
    }
}
