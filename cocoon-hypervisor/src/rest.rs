//! REST client over the per-VM Cloud Hypervisor API Unix socket (spec
//! §4.6 "REST API").
//!
//! Grounded on the `hyperlocal`-free Unix-socket + `hyper` client idiom:
//! connect a [`tokio::net::UnixStream`], hand it to
//! `hyper::client::conn::http1::handshake`, and drive the connection on a
//! spawned task while issuing requests against a fake `http://localhost`
//! authority (the socket, not the URI host, is what actually routes the
//! connection).

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use cocoon_core::error::{Error, Result};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt as _, Empty, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

/// Base retry delay for the exponential backoff policy (spec §4.6:
/// "100 ms × 2^i, up to 3 retries").
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Number of retries attempted on top of the first try.
const MAX_RETRIES: u32 = 3;

/// Dials `socket_path` and issues one Cloud Hypervisor API request,
/// retrying transient failures per the backoff policy.
async fn call(socket_path: &Path, method: Method, path: &str, body: Option<Bytes>) -> Result<Bytes> {
    let mut attempt = 0;
    loop {
        match try_call(socket_path, method.clone(), path, body.clone()).await {
            Ok(bytes) => return Ok(bytes),
            Err(error) if error.is_transient() && attempt < MAX_RETRIES => {
                let delay = RETRY_BASE_DELAY * 2_u32.pow(attempt);
                tracing::debug!(%error, attempt, path, "hypervisor API call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn try_call(socket_path: &Path, method: Method, path: &str, body: Option<Bytes>) -> Result<Bytes> {
    let stream = UnixStream::connect(socket_path).await.map_err(Error::transient)?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.map_err(Error::transient)?;
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            tracing::debug!(%error, "hypervisor API connection closed");
        }
    });

    let request = Request::builder()
        .method(method)
        .uri(format!("http://localhost{path}"))
        .header("content-type", "application/json")
        .body(match body {
            Some(bytes) => BoxBody::new(Full::new(bytes)),
            None => BoxBody::new(Empty::new()),
        })
        .map_err(|e| Error::Validation(e.to_string()))?;

    let response = sender.send_request(request).await.map_err(Error::transient)?;
    let status = response.status();
    let body_bytes = response.into_body().collect().await.map_err(Error::transient)?.to_bytes();

    if status == StatusCode::NO_CONTENT || status.is_success() {
        return Ok(body_bytes);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::transient(format!("{status}: {}", String::from_utf8_lossy(&body_bytes))));
    }
    Err(Error::Subprocess {
        bin: "cloud-hypervisor api".to_owned(),
        detail: format!("{method} {path} -> {status}: {}", String::from_utf8_lossy(&body_bytes)),
    })
}

/// `PUT /api/v1/vm.shutdown` (flush disk backends before termination).
pub async fn vm_shutdown(socket_path: &Path) -> Result<()> {
    call(socket_path, Method::PUT, "/api/v1/vm.shutdown", None).await.map(drop)
}

/// `PUT /api/v1/vm.power-button` (ACPI power button press, UEFI boot's
/// graceful-shutdown path).
pub async fn vm_power_button(socket_path: &Path) -> Result<()> {
    call(socket_path, Method::PUT, "/api/v1/vm.power-button", None).await.map(drop)
}

/// `GET /api/v1/vm.info`, parsed as the raw JSON value — used to discover
/// the allocated console PTY path after a direct-boot launch.
pub async fn vm_info(socket_path: &Path) -> Result<serde_json::Value> {
    let bytes = call(socket_path, Method::GET, "/api/v1/vm.info", None).await?;
    serde_json::from_slice(&bytes).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connecting_to_a_missing_socket_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let result = try_call(&dir.path().join("missing.sock"), Method::GET, "/api/v1/vm.info", None).await;
        assert!(matches!(result, Err(Error::TransientIo(_))));
    }
}
