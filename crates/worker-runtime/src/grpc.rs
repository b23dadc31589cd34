//! Binary RPC transport shared by the PyTorch and GNMT backends

use std::time::Duration;
use tracing::debug;
use worker_core::{Error, Result};
use worker_proto::{
    HeartbeatRequest, QueryClient, QueryOfflineRequest, QueryOfflineResponse, QueryOnlineRequest,
    QueryOnlineResponse, RequestStatus,
};

/// Connects to backend instances listening on the local host
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    host: String,
    connect_timeout: Duration,
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl GrpcTransport {
    pub fn new(host: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            connect_timeout,
        }
    }

    pub fn endpoint(&self, port: u16) -> String {
        format!("http://{}:{}", self.host, port)
    }

    async fn client(&self, port: u16) -> Result<QueryClient> {
        QueryClient::connect(self.endpoint(port), self.connect_timeout)
            .await
            .map_err(|e| Error::upstream(format!("connect to {}: {}", self.endpoint(port), e)))
    }

    /// Heartbeat the instance. Connection failures mean "not ready yet".
    pub async fn probe(&self, port: u16) -> Result<bool> {
        let mut client = match self.client(port).await {
            Ok(client) => client,
            Err(e) => {
                debug!(port, error = %e, "Backend not accepting connections yet");
                return Ok(false);
            }
        };
        let request = HeartbeatRequest {
            status: Some(RequestStatus::success()),
        };
        match client.heartbeat(request).await {
            Ok(response) => Ok(response
                .into_inner()
                .status
                .map(|s| s.is_success())
                .unwrap_or(false)),
            Err(status) => {
                debug!(port, code = ?status.code(), "Heartbeat rejected");
                Ok(false)
            }
        }
    }

    pub async fn query_online(
        &self,
        port: u16,
        request: QueryOnlineRequest,
    ) -> Result<QueryOnlineResponse> {
        let mut client = self.client(port).await?;
        client
            .query_online(request)
            .await
            .map(|response| response.into_inner())
            .map_err(|status| {
                Error::upstream(format!(
                    "QueryOnline on port {} failed: {:?} {}",
                    port,
                    status.code(),
                    status.message()
                ))
            })
    }

    pub async fn query_offline(
        &self,
        port: u16,
        request: QueryOfflineRequest,
    ) -> Result<QueryOfflineResponse> {
        let mut client = self.client(port).await?;
        client
            .query_offline(request)
            .await
            .map(|response| response.into_inner())
            .map_err(|status| {
                Error::upstream(format!(
                    "QueryOffline on port {} failed: {:?} {}",
                    port,
                    status.code(),
                    status.message()
                ))
            })
    }
}
