//! OTLP/gRPC push of canary samples.
//!
//! Each write is one `ExportMetricsServiceRequest` carrying a single gauge
//! data point of [`CANARIED_METRIC`], exported immediately over the
//! endpoint's gRPC channel. Nothing is aggregated or buffered between
//! writes, so the collector sees the sample as soon as the call returns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue, any_value};
use opentelemetry_proto::tonic::metrics::v1::{
    Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, metric, number_data_point,
};
use opentelemetry_proto::tonic::resource::v1::Resource;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::remote_write::{CANARIED_METRIC, SAMPLE_VALUE, series_labels};
use crate::target::IngestTarget;

/// `service.name` and `service.namespace` reported in the resource.
pub const SERVICE_NAME: &str = "o11y-canary";

fn string_attribute(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

/// Builds the export request for one canary sample.
///
/// Data point attributes are the remote-write label set minus `__name__`,
/// which becomes the metric name. Reserved attributes cannot be overridden by
/// additional labels.
pub fn build_export_request(
    target: &str,
    request_id: &str,
    additional_labels: &BTreeMap<String, String>,
    time_unix_nano: u64,
) -> ExportMetricsServiceRequest {
    let attributes = series_labels(target, request_id, additional_labels)
        .into_iter()
        .filter(|(name, _)| *name != "__name__")
        .map(|(name, value)| string_attribute(name, value))
        .collect();

    let metric = Metric {
        name: CANARIED_METRIC.to_string(),
        data: Some(metric::Data::Gauge(Gauge {
            data_points: vec![NumberDataPoint {
                attributes,
                time_unix_nano,
                value: Some(number_data_point::Value::AsDouble(SAMPLE_VALUE)),
                ..Default::default()
            }],
        })),
        ..Default::default()
    };

    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(Resource {
                attributes: vec![
                    string_attribute("service.name", SERVICE_NAME),
                    string_attribute("service.namespace", SERVICE_NAME),
                    string_attribute("service.version", env!("CARGO_PKG_VERSION")),
                ],
                ..Default::default()
            }),
            scope_metrics: vec![ScopeMetrics {
                scope: Some(InstrumentationScope {
                    name: SERVICE_NAME.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Default::default()
                }),
                metrics: vec![metric],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn now_unix_nano() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_nanos()).ok())
        .unwrap_or_default()
}

/// OTLP metrics exporter for one ingest endpoint.
#[derive(Debug)]
pub struct OtlpClient {
    connection: Arc<Connection>,
    target: String,
    additional_labels: BTreeMap<String, String>,
}

impl OtlpClient {
    /// Creates a client exporting through `connection`.
    pub fn new(connection: Arc<Connection>, additional_labels: BTreeMap<String, String>) -> Self {
        let target = connection.url().to_string();
        Self {
            connection,
            target,
            additional_labels,
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl IngestTarget for OtlpClient {
    fn target(&self) -> &str {
        &self.target
    }

    async fn write(&self, request_id: &str) -> Result<(), TransportError> {
        let mut client = MetricsServiceClient::new(self.connection.channel()?);
        let request = build_export_request(
            &self.target,
            request_id,
            &self.additional_labels,
            now_unix_nano(),
        );

        let response = client
            .export(request)
            .await
            .map_err(|status| TransportError::Grpc {
                source: Box::new(status),
            })?
            .into_inner();

        match response.partial_success {
            Some(partial) if partial.rejected_data_points > 0 => Err(TransportError::Rejected {
                rejected: partial.rejected_data_points,
                message: partial.error_message,
            }),
            _ => Ok(()),
        }
    }

    fn release(&self) {
        self.connection.release();
    }
}
