//! Minimal HTTP endpoint exposing the probe's own metrics.
//!
//! Uses `tokio::net::TcpListener` directly, no HTTP framework.
//! Endpoints:
//!
//! - `GET /metrics`: Prometheus text exposition of every probe metric
//! - `GET /health` : liveness check

use std::time::Duration;

use o11y_canary::MetricsRegistry;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A response ready to be written.
#[derive(Debug, PartialEq, Eq)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }
}

/// Accepts connections until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, metrics: MetricsRegistry, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("metrics endpoint listening on http://{addr}/metrics");
    }

    loop {
        let stream = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    continue;
                }
            },
        };

        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &metrics).await {
                tracing::debug!("request error: {e}");
            }
        });
    }

    tracing::debug!("metrics endpoint stopped");
}

/// Reads one request and writes one response.
async fn handle_connection(
    stream: TcpStream,
    metrics: &MetricsRegistry,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut request_line = String::new();
    tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut request_line)).await??;

    // Drain remaining headers (we don't need them)
    loop {
        let mut line = String::new();
        let n = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    let response = route(&request_line, metrics);
    write.write_all(render(&response).as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}

/// Dispatches a request line (`GET /path HTTP/1.x`).
fn route(request_line: &str, metrics: &MetricsRegistry) -> Response {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Response::error(400, "bad request");
    };
    let path = target.split_once('?').map_or(target, |(p, _)| p);

    if method != "GET" {
        return Response::error(405, "method not allowed");
    }

    match path {
        "/metrics" => match metrics.encode_text() {
            Ok(body) => Response {
                status: 200,
                content_type: TEXT_FORMAT,
                body,
            },
            Err(e) => Response::error(500, &e.to_string()),
        },
        "/health" => Response::json(200, &serde_json::json!({ "status": "ok" })),
        _ => Response::error(404, "not found"),
    }
}

fn render(response: &Response) -> String {
    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    format!(
        "HTTP/1.1 {} {status_text}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        response.status,
        response.content_type,
        response.body.len(),
        response.body,
    )
}
