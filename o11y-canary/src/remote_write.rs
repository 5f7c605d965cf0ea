//! Prometheus remote-write push of canary samples.
//!
//! Each write is one `WriteRequest` holding a single gauge sample of
//! [`CANARIED_METRIC`], serialized to protobuf, snappy-compressed and POSTed
//! immediately. There is no batching and no retry: the next scheduled cycle
//! is the retry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use prost::Message;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::target::IngestTarget;

/// Metric name of the synthetic sample.
pub const CANARIED_METRIC: &str = "canaried_metric";

/// Value written with every sample. Only existence and labels matter.
pub const SAMPLE_VALUE: f64 = 1.0;

/// Prometheus remote-write protobuf types.
///
/// Hand-written types matching `prometheus/prompb/remote.proto`.
/// Using prost derives avoids the need for protoc and proto file management.
pub mod proto {
    /// A write request containing one or more time series.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        /// The time series to write.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    /// A single time series with labels and samples.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Metric labels identifying the series.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        /// Data samples for this series.
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    /// A key-value label pair.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        /// Label name.
        #[prost(string, tag = "1")]
        pub name: String,
        /// Label value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// A single data sample (value + timestamp).
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        /// The sample value.
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Timestamp in milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

/// Builds the write request for one canary sample.
///
/// Labels are `__name__`, `canary="true"`, `request_id`, `target` and the
/// canary's additional labels. The reserved labels cannot be overridden by
/// additional labels.
pub fn build_write_request(
    target: &str,
    request_id: &str,
    additional_labels: &BTreeMap<String, String>,
    timestamp_ms: i64,
) -> proto::WriteRequest {
    proto::WriteRequest {
        timeseries: vec![proto::TimeSeries {
            labels: build_labels(target, request_id, additional_labels),
            samples: vec![proto::Sample {
                value: SAMPLE_VALUE,
                timestamp: timestamp_ms,
            }],
        }],
    }
}

/// The full label set of a canary sample, reserved labels winning.
pub(crate) fn series_labels<'a>(
    target: &'a str,
    request_id: &'a str,
    additional_labels: &'a BTreeMap<String, String>,
) -> BTreeMap<&'a str, &'a str> {
    let mut labels: BTreeMap<&str, &str> = additional_labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    labels.insert("__name__", CANARIED_METRIC);
    labels.insert("canary", "true");
    labels.insert("request_id", request_id);
    labels.insert("target", target);
    labels
}

/// Builds the label set, sorted by name as remote-write requires.
fn build_labels(
    target: &str,
    request_id: &str,
    additional_labels: &BTreeMap<String, String>,
) -> Vec<proto::Label> {
    series_labels(target, request_id, additional_labels)
        .into_iter()
        .map(|(name, value)| proto::Label {
            name: name.to_string(),
            value: value.to_string(),
        })
        .collect()
}

/// Serializes and snappy-compresses a write request.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] or
/// [`TransportError::Compression`] on failure.
pub fn encode(request: &proto::WriteRequest) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut buf)
        .map_err(|e| TransportError::Serialization { source: e })?;

    snap::raw::Encoder::new()
        .compress_vec(&buf)
        .map_err(|e| TransportError::Compression { source: e })
}

/// Milliseconds since the Unix epoch, wall clock.
#[allow(clippy::cast_possible_truncation)] // ms since epoch fits i64 for the foreseeable future
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Remote-write client for one ingest endpoint.
#[derive(Debug)]
pub struct RemoteWriteClient {
    connection: Arc<Connection>,
    target: String,
    additional_labels: BTreeMap<String, String>,
}

impl RemoteWriteClient {
    /// Creates a client pushing through `connection`.
    ///
    /// The endpoint URL is used verbatim as the push URL.
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
impl IngestTarget for RemoteWriteClient {
    fn target(&self) -> &str {
        &self.target
    }

    async fn write(&self, request_id: &str) -> Result<(), TransportError> {
        let client = self.connection.client()?;
        let request =
            build_write_request(&self.target, request_id, &self.additional_labels, now_ms());
        let body = encode(&request)?;

        let resp = client
            .post(self.connection.url().clone())
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed { source: e })?;

        if resp.status().is_success() {
            return Ok(());
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::HttpStatus { status, body })
    }

    fn release(&self) {
        self.connection.release();
    }
}
