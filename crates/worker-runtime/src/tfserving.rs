//! TensorFlow Serving backend (CPU), spoken to over its REST API

use crate::backend::{Backend, LaunchHandle, LaunchSpec, OfflineBatch};
use crate::container::{ContainerRuntime, ContainerSpec};
use crate::pytorch::NAME_RELEASE_POLICY;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use worker_core::{BackendKind, ContainerConfig, Error, InstanceName, ModelVariant, Result};
use worker_proto::{QueryOfflineResponse, QueryOnlineRequest, QueryOnlineResponse, RequestStatus};

/// REST port TensorFlow Serving listens on inside the container
const CONTAINER_REST_PORT: u16 = 8501;

#[derive(Debug, Serialize)]
struct PredictRequest {
    instances: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelStatusResponse {
    #[serde(default)]
    model_version_status: Vec<VersionStatus>,
}

#[derive(Debug, Deserialize)]
struct VersionStatus {
    state: String,
}

pub struct TfServingBackend {
    containers: Arc<ContainerRuntime>,
    config: ContainerConfig,
    client: Client,
    host: String,
}

impl TfServingBackend {
    pub fn new(containers: Arc<ContainerRuntime>, config: ContainerConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            containers,
            config,
            client,
            host: "127.0.0.1".to_string(),
        }
    }

    fn model_url(&self, variant: &ModelVariant, port: u16) -> String {
        format!("http://{}:{}/v1/models/{}", self.host, port, variant)
    }

    pub fn container_spec(&self, spec: &LaunchSpec) -> ContainerSpec {
        let model_path = format!("/models/{}", spec.variant);
        let mut container = ContainerSpec::new(spec.instance.as_str(), &self.config.tensorflow_image)
            .publish(spec.port, CONTAINER_REST_PORT)
            .cpus(spec.cpu_limit)
            .flag("--ipc=host")
            .flag("--cap-add=sys_nice")
            .volume(&spec.model_dir, model_path.as_str())
            .env("MODEL_NAME", spec.variant.as_str());

        if let Some(parameters) = &self.config.tf_batching_parameters {
            let mounted = format!("{}/batching_parameters.txt", model_path);
            container = container
                .volume(parameters, mounted.as_str())
                .arg("--enable_batching=true")
                .arg(format!("--batching_parameters_file={}", mounted));
        }
        container
    }
}

/// Encode inputs the way the predict endpoint expects them
fn encode_instances(raw_input: &[Vec<u8>]) -> Vec<String> {
    raw_input
        .iter()
        .map(|raw| format!("b64:{}", URL_SAFE.encode(raw)))
        .collect()
}

/// Repack one prediction row as native-endian f32 bytes
fn pack_prediction(row: &serde_json::Value) -> Result<Vec<u8>> {
    let values: Vec<&serde_json::Value> = match row {
        serde_json::Value::Array(items) => items.iter().collect(),
        scalar => vec![scalar],
    };
    let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<f32>());
    for value in values {
        let number = value.as_f64().ok_or_else(|| {
            Error::upstream(format!("prediction value is not a number: {}", value))
        })?;
        bytes.extend_from_slice(&(number as f32).to_ne_bytes());
    }
    Ok(bytes)
}

#[async_trait]
impl Backend for TfServingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TensorFlowCpu
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<LaunchHandle> {
        let container = self.container_spec(spec);
        self.containers
            .wait_until_absent(spec.instance.as_str(), NAME_RELEASE_POLICY, &CancellationToken::new())
            .await?;
        let container_id = self.containers.run(&container).await?;
        info!(instance = %spec.instance, port = spec.port, "TensorFlow Serving container started");
        Ok(LaunchHandle {
            instance: spec.instance.clone(),
            container_id,
            port: spec.port,
        })
    }

    async fn stop(&self, instance: &InstanceName) -> Result<()> {
        self.containers.stop(instance.as_str()).await
    }

    async fn probe_ready(&self, variant: &ModelVariant, port: u16) -> Result<bool> {
        let response = match self.client.get(self.model_url(variant, port)).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(port, error = %e, "Model server not reachable yet");
                return Ok(false);
            }
        };
        if !response.status().is_success() {
            return Ok(false);
        }
        let status: ModelStatusResponse = match response.json().await {
            Ok(status) => status,
            Err(_) => return Ok(false),
        };
        Ok(status
            .model_version_status
            .iter()
            .any(|v| v.state.eq_ignore_ascii_case("AVAILABLE")))
    }

    async fn query_online(
        &self,
        variant: &ModelVariant,
        port: u16,
        request: QueryOnlineRequest,
    ) -> Result<QueryOnlineResponse> {
        let body = PredictRequest {
            instances: encode_instances(&request.raw_input),
        };
        let url = format!("{}:predict", self.model_url(variant, port));

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("predict request to {}: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::upstream(format!("reading predict response: {}", e)))?;
        if !status.is_success() {
            return Err(Error::upstream(format!(
                "predict on {} returned {}: {}",
                variant, status, text
            )));
        }

        let parsed: PredictResponse = serde_json::from_str(&text).map_err(|e| {
            Error::upstream(format!("malformed predict response from {}: {}", variant, e))
        })?;
        if let Some(error) = parsed.error {
            return Err(Error::upstream(format!("predict on {} failed: {}", variant, error)));
        }

        let raw_output = parsed
            .predictions
            .iter()
            .map(pack_prediction)
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryOnlineResponse {
            raw_output,
            status: Some(RequestStatus::success()),
        })
    }

    async fn query_offline(&self, _port: u16, batch: &OfflineBatch) -> Result<QueryOfflineResponse> {
        Err(Error::unsupported(format!(
            "offline queries for {} need an RPC backend, not {}",
            batch.variant,
            self.kind()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::path::PathBuf;
    use worker_core::ServingMode;

    fn backend() -> TfServingBackend {
        let config = ContainerConfig::default();
        TfServingBackend::new(Arc::new(ContainerRuntime::new(&config)), config)
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[test]
    fn test_encode_instances_url_safe() {
        let encoded = encode_instances(&[vec![0xfb, 0xff], vec![]]);
        assert_eq!(encoded, vec!["b64:-_8=", "b64:"]);
    }

    #[test]
    fn test_pack_prediction_native_floats() {
        let row = serde_json::json!([0.5, 1.0, -2.25]);
        let mut expected = Vec::new();
        for v in [0.5f32, 1.0, -2.25] {
            expected.extend_from_slice(&v.to_ne_bytes());
        }
        assert_eq!(pack_prediction(&row).unwrap(), expected);
        assert_eq!(
            pack_prediction(&serde_json::json!(3.0)).unwrap(),
            3.0f32.to_ne_bytes().to_vec()
        );
        assert!(pack_prediction(&serde_json::json!(["x"])).is_err());
    }

    #[test]
    fn test_container_spec_maps_rest_port() {
        let spec = LaunchSpec {
            variant: ModelVariant::new("mobilenet_2").unwrap(),
            instance: InstanceName::new("mobilenet_2").unwrap(),
            port: 9000,
            mode: ServingMode::Online,
            cpu_limit: 2.0,
            input_dim: Some(224),
            model_dir: PathBuf::from("/tmp/models/mobilenet_2"),
        };
        let container = backend().container_spec(&spec);
        assert_eq!(container.publish, vec![(9000, 8501)]);
        assert!(container
            .env
            .contains(&("MODEL_NAME".to_string(), "mobilenet_2".to_string())));
        assert!(container.command.is_empty());
    }

    #[tokio::test]
    async fn test_predict_roundtrip_against_server() {
        let router = Router::new().route(
            "/v1/models/*path",
            post(
                |Path(path): Path<String>, Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(path, "mobilenet_2:predict");
                    let count = body["instances"].as_array().map(|a| a.len()).unwrap_or(0);
                    let rows: Vec<Vec<f32>> =
                        (0..count).map(|i| vec![i as f32, 0.25]).collect();
                    Json(serde_json::json!({ "predictions": rows }))
                },
            ),
        );
        let port = serve(router).await;

        let variant = ModelVariant::new("mobilenet_2").unwrap();
        let request = QueryOnlineRequest {
            raw_input: vec![b"img-a".to_vec(), b"img-b".to_vec()],
            model: vec![variant.to_string()],
            slo: None,
        };
        let response = backend().query_online(&variant, port, request).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.raw_output.len(), 2);
        let mut second = 1.0f32.to_ne_bytes().to_vec();
        second.extend_from_slice(&0.25f32.to_ne_bytes());
        assert_eq!(response.raw_output[1], second);
    }

    #[tokio::test]
    async fn test_malformed_predict_body_is_upstream_failure() {
        let router = Router::new().route(
            "/v1/models/*path",
            post(|| async { "<html>gateway</html>" }),
        );
        let port = serve(router).await;

        let variant = ModelVariant::new("mobilenet_2").unwrap();
        let request = QueryOnlineRequest {
            raw_input: vec![b"img-a".to_vec()],
            model: vec![variant.to_string()],
            slo: None,
        };
        let err = backend().query_online(&variant, port, request).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_probe_reads_version_state() {
        let router = Router::new().route(
            "/v1/models/*path",
            get(|Path(path): Path<String>| async move {
                let state = match path.as_str() {
                    "ready_1" => "AVAILABLE",
                    "loading_1" => "LOADING",
                    _ => return Err(StatusCode::NOT_FOUND),
                };
                Ok(Json(serde_json::json!({
                    "model_version_status": [{ "version": "1", "state": state }]
                })))
            }),
        );
        let port = serve(router).await;
        let backend = backend();

        let ready = ModelVariant::new("ready_1").unwrap();
        let loading = ModelVariant::new("loading_1").unwrap();
        let unknown = ModelVariant::new("unknown_1").unwrap();
        assert!(backend.probe_ready(&ready, port).await.unwrap());
        assert!(!backend.probe_ready(&loading, port).await.unwrap());
        assert!(!backend.probe_ready(&unknown, port).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_is_unsupported() {
        let variant = ModelVariant::new("mobilenet_2").unwrap();
        let batch = OfflineBatch {
            job: InstanceName::scoped(&variant, "bob").unwrap(),
            variant,
            submitter: "bob".to_string(),
            inputs: vec![],
        };
        assert!(matches!(
            backend().query_offline(9000, &batch).await,
            Err(Error::Unsupported(_))
        ));
    }
}
