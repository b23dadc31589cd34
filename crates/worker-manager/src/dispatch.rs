//! Online query routing

use crate::metrics::ManagerMetrics;
use crate::pool::InstancePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use worker_core::{Error, ModelVariant, Result, ServingMode};
use worker_proto::{QueryOnlineRequest, QueryOnlineResponse};
use worker_runtime::cancellable;

/// How often routing retries when the pool empties between the wait and the
/// rotation
const ROUTE_ATTEMPTS: u32 = 3;

/// Forwards online queries to pooled instances, round robin
#[derive(Clone)]
pub struct QueryDispatcher {
    pool: InstancePool,
    metrics: Option<ManagerMetrics>,
}

impl QueryDispatcher {
    pub fn new(pool: InstancePool, metrics: Option<ManagerMetrics>) -> Self {
        Self { pool, metrics }
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Route one query, loading an online instance first if none is pooled
    pub async fn dispatch(
        &self,
        variant: &ModelVariant,
        mut request: QueryOnlineRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryOnlineResponse> {
        if request.model.is_empty() {
            request.model.push(variant.to_string());
        }

        let mut routed = None;
        for _ in 0..ROUTE_ATTEMPTS {
            self.pool
                .wait_for_instance(variant, None, ServingMode::Online, cancel)
                .await?;
            if let Some(instance) = self.pool.next_instance(variant, ServingMode::Online)? {
                routed = Some(instance);
                break;
            }
            debug!(variant = %variant, "Pool emptied before routing, waiting again");
        }
        let instance = routed.ok_or_else(|| {
            Error::timeout(format!("no online instance of {} stayed available", variant))
        })?;

        let backend = self.pool.backend(instance.kind)?;
        let result = cancellable(
            cancel,
            "online query",
            backend.query_online(variant, instance.port, request),
        )
        .await;

        let outcome = match &result {
            Ok(response) if response.is_success() => "success",
            Ok(_) => "rejected",
            Err(e) => {
                warn!(variant = %variant, instance = %instance.name, error = %e, "Online query failed");
                "failed"
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .dispatches_total
                .with_label_values(&[variant.as_str(), &instance.kind.to_string(), outcome])
                .inc();
        }
        debug!(variant = %variant, instance = %instance.name, port = instance.port, outcome, "Query dispatched");
        result
    }
}
