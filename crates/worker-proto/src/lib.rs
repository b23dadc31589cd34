//! # worker-proto
//!
//! Protocol buffer definitions and generated gRPC bindings of the backend
//! query service (`worker.backend.v1.Query`) spoken by PyTorch and GNMT
//! backend containers.

pub mod client;

// Generated protobuf code
pub mod backend {
    pub mod v1 {
        tonic::include_proto!("worker.backend.v1");
    }
}

pub use backend::v1::{
    query_server::{Query, QueryServer},
    HeartbeatRequest, HeartbeatResponse, QueryOfflineRequest, QueryOfflineResponse,
    QueryOnlineRequest, QueryOnlineResponse, QuerySlo, RequestStatus, RequestStatusCode,
};
pub use client::QueryClient;

/// Fully qualified gRPC service name
pub const SERVICE_NAME: &str = "worker.backend.v1.Query";

/// Largest message either side may send
pub const MAX_MESSAGE_SIZE: usize = i32::MAX as usize;

impl RequestStatus {
    pub fn success() -> Self {
        Self {
            code: RequestStatusCode::Success as i32,
            msg: String::new(),
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            code: RequestStatusCode::Invalid as i32,
            msg: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == RequestStatusCode::Success as i32
    }
}

impl QueryOnlineResponse {
    pub fn is_success(&self) -> bool {
        self.status.as_ref().map(RequestStatus::is_success).unwrap_or(false)
    }
}

impl QueryOfflineResponse {
    pub fn is_success(&self) -> bool {
        self.status.as_ref().map(RequestStatus::is_success).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_status_helpers() {
        assert!(RequestStatus::success().is_success());
        assert!(!RequestStatus::failure("bad input").is_success());

        let missing = QueryOfflineResponse { status: None };
        assert!(!missing.is_success());
    }

    #[test]
    fn test_online_request_wire_format() {
        let request = QueryOnlineRequest {
            raw_input: vec![vec![1, 2, 3]],
            model: vec!["resnet50_4".to_string()],
            slo: None,
        };
        let bytes = request.encode_to_vec();
        // field 1, wire type 2, length 3
        assert_eq!(&bytes[..5], &[0x0a, 0x03, 1, 2, 3]);

        let decoded = QueryOnlineRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.model, vec!["resnet50_4"]);
    }

    #[test]
    fn test_unknown_status_code() {
        let status = RequestStatus { code: 42, msg: String::new() };
        assert!(!status.is_success());
        assert!(RequestStatusCode::try_from(42).is_err());
        assert_eq!(RequestStatusCode::try_from(2).unwrap(), RequestStatusCode::Unavailable);
        assert_eq!(
            RequestStatusCode::Success.as_str_name(),
            "REQUEST_STATUS_CODE_SUCCESS"
        );
    }
}
