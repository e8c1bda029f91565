use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Executes one logical request against the test target.
///
/// Implementations live outside the core (HTTP, WebSocket, SSE, gRPC
/// clients and friends); the scheduler only needs to know whether the
/// attempt failed. `cancel` fires when in-flight work is being
/// force-terminated and should be honoured by implementations that can be
/// interrupted mid-request.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn call(&self, cancel: CancellationToken) -> Result<()>;
}

/// Receives requester failures for out-of-band reporting.
///
/// The core hands the error over verbatim and never inspects it.
pub trait FailureLogger: Send + Sync {
    fn log_failure(&self, err: &anyhow::Error);
}

/// HTTP failure vocabulary shared with the protocol executors.
///
/// Executors signal non-2xx responses with this type; the scheduling core
/// treats it like any other opaque requester error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("HTTP {status_code}: {body}")]
pub struct HttpError {
    pub status_code: u16,
    pub body: String,
}
