//! Offline batch jobs
//!
//! A job streams every object under an input location through a dedicated
//! offline instance in fixed-size batches and uploads what the backend wrote.
//! Scratch directories are keyed by `<variant>_<submitter>`, so one submitter
//! runs at most one job per variant at a time.

use crate::gate::LoadGate;
use crate::metrics::ManagerMetrics;
use crate::pool::InstancePool;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker_core::{
    Error, InstanceName, ModelVariant, ObjectStorage, ObjectUrl, OfflineConfig, PathsConfig,
    Result, ServingMode,
};
use worker_runtime::{cancellable, OfflineBatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineJob {
    pub variant: ModelVariant,
    pub input_url: ObjectUrl,
    pub output_url: ObjectUrl,
    pub submitter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OfflineReport {
    pub job: Option<InstanceName>,
    pub inputs: usize,
    /// Size of every batch sent, in order
    pub batches: Vec<usize>,
    /// Batches the backend answered with a non-success status
    pub rejected_batches: usize,
    pub uploaded: usize,
}

/// Scratch directories of one job
struct Scratch {
    input: PathBuf,
    infer: PathBuf,
    output: PathBuf,
}

impl Scratch {
    async fn create(input_base: &Path, output_base: &Path, job: &InstanceName) -> Result<Self> {
        tokio::fs::create_dir_all(input_base).await?;
        tokio::fs::create_dir_all(output_base).await?;

        let scratch = Self {
            input: input_base.join(job.as_str()),
            infer: input_base.join(job.as_str()).join("infer"),
            output: output_base.join(job.as_str()),
        };
        create_fresh(&scratch.input, job).await?;
        if let Err(e) = create_fresh(&scratch.infer, job).await {
            let _ = tokio::fs::remove_dir_all(&scratch.input).await;
            return Err(e);
        }
        if let Err(e) = create_fresh(&scratch.output, job).await {
            let _ = tokio::fs::remove_dir_all(&scratch.input).await;
            return Err(e);
        }
        Ok(scratch)
    }

    async fn remove(&self) -> Result<()> {
        for dir in [&self.input, &self.output] {
            tokio::fs::remove_dir_all(dir).await.map_err(|e| {
                Error::internal(format!("removing scratch directory {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    async fn outputs(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.output).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

async fn create_fresh(dir: &Path, job: &InstanceName) -> Result<()> {
    match tokio::fs::create_dir(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::conflict(format!(
            "offline job {} already has scratch data at {}",
            job,
            dir.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Runs offline jobs against dedicated offline instances
#[derive(Clone)]
pub struct OfflinePipeline {
    pool: InstancePool,
    storage: Arc<dyn ObjectStorage>,
    gate: Arc<LoadGate>,
    batch_size: usize,
    input_base: PathBuf,
    output_base: PathBuf,
    metrics: Option<ManagerMetrics>,
}

impl OfflinePipeline {
    pub fn new(
        pool: InstancePool,
        storage: Arc<dyn ObjectStorage>,
        gate: Arc<LoadGate>,
        config: &OfflineConfig,
        paths: &PathsConfig,
    ) -> Self {
        Self {
            pool,
            storage,
            gate,
            batch_size: config.batch_size.max(1),
            input_base: paths.input_dir.clone(),
            output_base: paths.output_dir.clone(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ManagerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run a job to completion.
    ///
    /// Once scratch space exists, outputs are uploaded, scratch is removed and
    /// the offline instance is unloaded whatever happened in between; the
    /// first error is returned afterwards.
    pub async fn run(&self, job: &OfflineJob, cancel: &CancellationToken) -> Result<OfflineReport> {
        let name = InstanceName::scoped(&job.variant, &job.submitter)?;
        let scratch = Scratch::create(&self.input_base, &self.output_base, &name).await?;
        info!(job = %name, input = %job.input_url, output = %job.output_url, "Offline job started");

        let mut report = OfflineReport {
            job: Some(name.clone()),
            ..Default::default()
        };
        let processed = self.process(job, &name, &scratch, &mut report, cancel).await;

        let uploaded = match &processed {
            Err(Error::Cancelled(_)) => Ok(()),
            _ => self.upload_outputs(job, &scratch, &mut report).await,
        };
        let removed = scratch.remove().await;
        let unloaded = self
            .pool
            .unload(&job.variant, Some(name.clone()), ServingMode::Offline)
            .await;

        processed?;
        uploaded?;
        removed?;
        unloaded?;
        info!(
            job = %name,
            inputs = report.inputs,
            batches = report.batches.len(),
            rejected = report.rejected_batches,
            uploaded = report.uploaded,
            "Offline job finished"
        );
        Ok(report)
    }

    async fn process(
        &self,
        job: &OfflineJob,
        name: &InstanceName,
        scratch: &Scratch,
        report: &mut OfflineReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.pool
            .wait_for_instance(&job.variant, Some(name), ServingMode::Offline, cancel)
            .await?;

        let keys = cancellable(cancel, "listing offline inputs", self.storage.list(&job.input_url)).await?;
        report.inputs = keys.len();
        let prefix = job.input_url.dir_key();

        for chunk in keys.chunks(self.batch_size) {
            cancellable(
                cancel,
                "downloading offline batch",
                self.storage
                    .download(job.input_url.bucket(), &prefix, chunk, &scratch.infer),
            )
            .await?;
            let inputs: Vec<String> = chunk
                .iter()
                .map(|key| key.strip_prefix(prefix.as_str()).unwrap_or(key).to_string())
                .collect();

            let gate = self.gate.wait_for_capacity(cancel).await?;
            debug!(job = %name, samples = gate.samples, utilization = gate.utilization, "Gate passed");

            let instance = self.pool.instance(name).ok_or_else(|| {
                Error::inconsistent(format!("offline instance {} disappeared mid-job", name))
            })?;
            let backend = self.pool.backend(instance.kind)?;
            let batch = OfflineBatch {
                variant: job.variant.clone(),
                job: name.clone(),
                submitter: job.submitter.clone(),
                inputs,
            };

            let reply = cancellable(
                cancel,
                "offline batch",
                backend.query_offline(instance.port, &batch),
            )
            .await;
            let outcome = match &reply {
                Ok(response) if response.is_success() => "success",
                Ok(response) => {
                    let msg = response.status.as_ref().map(|s| s.msg.as_str()).unwrap_or("");
                    warn!(job = %name, size = batch.inputs.len(), msg, "Backend rejected offline batch");
                    report.rejected_batches += 1;
                    "rejected"
                }
                Err(_) => "failed",
            };
            self.record_batch(&job.variant, outcome);
            self.clear_inputs(&scratch.infer, &batch.inputs).await;
            reply?;
            report.batches.push(batch.inputs.len());
        }
        Ok(())
    }

    async fn upload_outputs(
        &self,
        job: &OfflineJob,
        scratch: &Scratch,
        report: &mut OfflineReport,
    ) -> Result<()> {
        let outputs = scratch.outputs().await?;
        if outputs.is_empty() {
            return Ok(());
        }
        self.storage
            .upload(
                &scratch.output,
                &outputs,
                job.output_url.bucket(),
                &job.output_url.dir_key(),
            )
            .await?;
        report.uploaded = outputs.len();
        Ok(())
    }

    async fn clear_inputs(&self, infer: &Path, inputs: &[String]) {
        for input in inputs {
            if let Err(e) = tokio::fs::remove_file(infer.join(input)).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(input = %input, error = %e, "Failed to remove batch input");
                }
            }
        }
    }

    fn record_batch(&self, variant: &ModelVariant, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .offline_batches_total
                .with_label_values(&[variant.as_str(), outcome])
                .inc();
        }
    }
}
