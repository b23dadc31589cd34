//! gRPC client of the backend query service

use crate::backend::v1::query_client::QueryClient as GeneratedClient;
use crate::{
    HeartbeatRequest, HeartbeatResponse, QueryOfflineRequest, QueryOfflineResponse,
    QueryOnlineRequest, QueryOnlineResponse, MAX_MESSAGE_SIZE,
};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Response, Status};

/// Client of one backend instance
#[derive(Debug, Clone)]
pub struct QueryClient {
    inner: GeneratedClient<Channel>,
}

impl QueryClient {
    /// Connect to `endpoint`, e.g. `http://127.0.0.1:9001`
    pub async fn connect(
        endpoint: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(endpoint.into())?
            .connect_timeout(connect_timeout)
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        let inner = GeneratedClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        Self { inner }
    }

    pub async fn query_online(
        &mut self,
        request: QueryOnlineRequest,
    ) -> Result<Response<QueryOnlineResponse>, Status> {
        self.inner.query_online(request).await
    }

    pub async fn query_offline(
        &mut self,
        request: QueryOfflineRequest,
    ) -> Result<Response<QueryOfflineResponse>, Status> {
        self.inner.query_offline(request).await
    }

    pub async fn heartbeat(
        &mut self,
        request: HeartbeatRequest,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        self.inner.heartbeat(request).await
    }
}
