//! Instant queries against a Prometheus-compatible HTTP API.
//!
//! The probe asks `GET <base>/api/v1/query` for
//! `canaried_metric{canary="true",request_id="<id>"}` at the current time and
//! needs at least one series back. Warnings in the response are logged and
//! otherwise ignored.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::remote_write::CANARIED_METRIC;
use crate::target::QueryTarget;

/// Path of the instant-query API relative to the endpoint URL.
pub const INSTANT_QUERY_PATH: &str = "/api/v1/query";

/// Result of a transport-level successful query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMatch {
    /// Number of series in the result.
    pub series: usize,
    /// Warnings returned alongside the result.
    pub warnings: Vec<String>,
}

impl QueryMatch {
    /// Returns `true` if no series matched.
    pub fn is_empty(&self) -> bool {
        self.series == 0
    }
}

/// The query expression selecting one canary series.
pub fn canary_query(request_id: &str) -> String {
    format!(r#"{CANARIED_METRIC}{{canary="true",request_id="{request_id}"}}"#)
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: serde_json::Value,
}

/// Interprets a query API response body.
///
/// Only `vector` and `matrix` results count series; scalars and strings
/// never match a selector and count as empty.
///
/// # Errors
///
/// Returns [`TransportError::Decode`] for malformed JSON and
/// [`TransportError::Api`] when the envelope reports an error.
pub fn parse_response(body: &[u8]) -> Result<QueryMatch, TransportError> {
    let response: QueryResponse =
        serde_json::from_slice(body).map_err(|e| TransportError::Decode { source: e })?;

    if response.status != "success" {
        return Err(TransportError::Api {
            error_type: response.error_type.unwrap_or_else(|| "unknown".to_string()),
            message: response
                .error
                .unwrap_or_else(|| format!("status '{}'", response.status)),
        });
    }

    let series = match response.data {
        Some(data) if matches!(data.result_type.as_str(), "vector" | "matrix") => {
            data.result.as_array().map_or(0, Vec::len)
        }
        _ => 0,
    };

    Ok(QueryMatch {
        series,
        warnings: response.warnings,
    })
}

/// Instant-query client for one query endpoint.
#[derive(Debug)]
pub struct QueryClient {
    connection: Arc<Connection>,
    target: String,
    query_url: String,
}

impl QueryClient {
    /// Creates a client querying through `connection`.
    ///
    /// [`INSTANT_QUERY_PATH`] is appended to the endpoint URL, so the URL may
    /// carry a prefix such as `/select/0/prometheus`.
    pub fn new(connection: Arc<Connection>) -> Self {
        let target = connection.url().to_string();
        let query_url = format!("{}{INSTANT_QUERY_PATH}", target.trim_end_matches('/'));
        Self {
            connection,
            target,
            query_url,
        }
    }

    /// The full instant-query URL.
    pub fn query_url(&self) -> &str {
        &self.query_url
    }
}

/// Current time as fractional Unix seconds, the `time` parameter format.
fn now_unix_seconds() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

#[async_trait]
impl QueryTarget for QueryClient {
    fn target(&self) -> &str {
        &self.target
    }

    async fn query(&self, request_id: &str) -> Result<QueryMatch, TransportError> {
        let client = self.connection.client()?;
        let expr = canary_query(request_id);
        let time = now_unix_seconds();

        let resp = client
            .get(&self.query_url)
            .query(&[("query", expr.as_str()), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed { source: e })?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::RequestFailed { source: e })?;

        if !status.is_success() {
            // Prometheus reports bad queries as 400/422 with an error envelope
            if let Err(api @ TransportError::Api { .. }) = parse_response(&body) {
                return Err(api);
            }
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let matched = parse_response(&body)?;
        for warning in &matched.warnings {
            tracing::warn!(endpoint = %self.target, request_id, warning = %warning, "query returned warning");
        }
        Ok(matched)
    }

    fn release(&self) {
        self.connection.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;

    #[test]
    fn test_canary_query_expression() {
        assert_eq!(
            canary_query("0123abcd"),
            r#"canaried_metric{canary="true",request_id="0123abcd"}"#
        );
    }

    #[test]
    fn test_parse_vector_with_series() {
        let body = br#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"__name__": "canaried_metric", "request_id": "abc"}, "value": [1700000000.0, "1"]}
                ]
            }
        }"#;

        let matched = parse_response(body).unwrap();
        assert_eq!(matched.series, 1);
        assert!(matched.warnings.is_empty());
    }

    #[test]
    fn test_parse_empty_vector() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        let matched = parse_response(body).unwrap();
        assert!(matched.is_empty());
    }

    #[test]
    fn test_parse_scalar_counts_as_empty() {
        let body = br#"{"status":"success","data":{"resultType":"scalar","result":[1700000000.0,"1"]}}"#;
        assert!(parse_response(body).unwrap().is_empty());
    }

    #[test]
    fn test_parse_warnings_kept() {
        let body = br#"{
            "status": "success",
            "warnings": ["partial response"],
            "data": {"resultType": "vector", "result": [{"metric": {}, "value": [0, "1"]}]}
        }"#;
        let matched = parse_response(body).unwrap();
        assert_eq!(matched.series, 1);
        assert_eq!(matched.warnings, vec!["partial response".to_string()]);
    }

    #[test]
    fn test_parse_error_envelope() {
        let body = br#"{"status":"error","errorType":"bad_data","error":"parse error at char 3"}"#;
        match parse_response(body) {
            Err(TransportError::Api {
                error_type,
                message,
            }) => {
                assert_eq!(error_type, "bad_data");
                assert_eq!(message, "parse error at char 3");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed_body() {
        assert!(matches!(
            parse_response(b"<html>bad gateway</html>"),
            Err(TransportError::Decode { .. })
        ));
    }

    #[test]
    fn test_query_url_joins_prefix() {
        let connection = Arc::new(
            Connection::connect(&EndpointConfig::new("http://vmselect:8481/select/0/prometheus/"), None)
                .unwrap(),
        );
        let client = QueryClient::new(connection);
        assert_eq!(
            client.query_url(),
            "http://vmselect:8481/select/0/prometheus/api/v1/query"
        );

        let connection =
            Arc::new(Connection::connect(&EndpointConfig::new("http://prometheus:9090"), None).unwrap());
        // Url normalises a bare host to a trailing slash
        assert_eq!(
            QueryClient::new(connection).query_url(),
            "http://prometheus:9090/api/v1/query"
        );
    }
}
