//! Instance pools of one worker
//!
//! The pool owns every piece of lifecycle state: which instances serve which
//! variant in which mode, the port and core reservations behind them, and the
//! round-robin order used by the dispatcher.
//!
//! Two locks are involved:
//!
//! - `state` is a synchronous mutex guarding in-memory bookkeeping only. It is
//!   never held across an await.
//! - `transitions` is an async mutex serializing every change of an online
//!   pool's visibility to the metadata store (first instance added, last
//!   instance removed) together with the metadata calls that announce it.

use crate::metrics::ManagerMetrics;
use crate::stager::ArtifactStager;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker_core::{
    Autoscaler, BackendKind, Error, InstanceName, MetadataStore, ModelVariant, Result,
    ServingMode, WorkerConfig, WorkerId, FIELD_FRAMEWORK, FIELD_INPUT_DIM,
};
use worker_runtime::{
    cancellable, poll_until, Backend, BackendRegistry, LaunchSpec, PortAllocator, ReadinessPolicy,
};

/// A servable instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub name: InstanceName,
    pub variant: ModelVariant,
    pub port: u16,
    pub kind: BackendKind,
    pub mode: ServingMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// This call launched the instance and it is now pooled
    Loaded(Instance),
    /// The instance was already pooled before this call
    AlreadyLoaded(Instance),
    /// Another call is launching the same instance
    InProgress,
}

impl LoadOutcome {
    pub fn instance(&self) -> Option<&Instance> {
        match self {
            LoadOutcome::Loaded(instance) | LoadOutcome::AlreadyLoaded(instance) => Some(instance),
            LoadOutcome::InProgress => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LoadOutcome::Loaded(_) => "loaded",
            LoadOutcome::AlreadyLoaded(_) => "already_loaded",
            LoadOutcome::InProgress => "in_progress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadOutcome {
    Unloaded(InstanceName),
    AlreadyUnloaded,
}

/// Collaborators an [`InstancePool`] drives
pub struct PoolDependencies {
    pub backends: BackendRegistry,
    pub stager: ArtifactStager,
    pub metadata: Arc<dyn MetadataStore>,
    pub autoscaler: Arc<dyn Autoscaler>,
    pub metrics: Option<ManagerMetrics>,
}

/// Serializable view of every pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub worker: WorkerId,
    pub online: BTreeMap<ModelVariant, Vec<Instance>>,
    pub offline: BTreeMap<ModelVariant, Vec<Instance>>,
    /// Instances reserved but not pooled yet
    pub pending: Vec<InstanceName>,
    pub ports_in_use: usize,
    pub cores_in_use: u32,
    pub core_budget: Option<u32>,
}

#[derive(Debug, Clone)]
struct Reservation {
    variant: ModelVariant,
    mode: ServingMode,
    port: u16,
    cores: u32,
    /// Set once the instance is ready and pooled
    kind: Option<BackendKind>,
}

#[derive(Debug)]
struct PoolState {
    online: HashMap<ModelVariant, VecDeque<InstanceName>>,
    offline: HashMap<ModelVariant, VecDeque<InstanceName>>,
    reservations: HashMap<InstanceName, Reservation>,
    ports: PortAllocator,
    cores_in_use: u32,
    core_budget: Option<u32>,
}

impl PoolState {
    fn pools(&self, mode: ServingMode) -> &HashMap<ModelVariant, VecDeque<InstanceName>> {
        match mode {
            ServingMode::Online => &self.online,
            ServingMode::Offline => &self.offline,
        }
    }

    fn pools_mut(&mut self, mode: ServingMode) -> &mut HashMap<ModelVariant, VecDeque<InstanceName>> {
        match mode {
            ServingMode::Online => &mut self.online,
            ServingMode::Offline => &mut self.offline,
        }
    }

    fn replicas(&self, variant: &ModelVariant, mode: ServingMode) -> usize {
        self.pools(mode).get(variant).map_or(0, VecDeque::len)
    }

    fn is_queued(&self, variant: &ModelVariant, mode: ServingMode, name: &InstanceName) -> bool {
        self.pools(mode)
            .get(variant)
            .is_some_and(|queue| queue.contains(name))
    }

    /// Remove `name` from a queue, dropping the queue once empty
    fn dequeue(&mut self, variant: &ModelVariant, mode: ServingMode, name: &InstanceName) -> bool {
        let pools = self.pools_mut(mode);
        let Some(queue) = pools.get_mut(variant) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|queued| queued != name);
        let removed = queue.len() != before;
        if queue.is_empty() {
            pools.remove(variant);
        }
        removed
    }

    /// Drop a reservation and give back its port and cores
    fn release(&mut self, name: &InstanceName) -> Option<Reservation> {
        let reservation = self.reservations.remove(name)?;
        self.ports.release(reservation.port);
        self.cores_in_use = self.cores_in_use.saturating_sub(reservation.cores);
        Some(reservation)
    }

    fn instance(&self, name: &InstanceName) -> Option<Instance> {
        let reservation = self.reservations.get(name)?;
        Some(Instance {
            name: name.clone(),
            variant: reservation.variant.clone(),
            port: reservation.port,
            kind: reservation.kind?,
            mode: reservation.mode,
        })
    }
}

struct PoolInner {
    worker: WorkerId,
    state: Mutex<PoolState>,
    transitions: tokio::sync::Mutex<()>,
    backends: BackendRegistry,
    stager: ArtifactStager,
    metadata: Arc<dyn MetadataStore>,
    autoscaler: Arc<dyn Autoscaler>,
    ready_fast: ReadinessPolicy,
    ready_slow: ReadinessPolicy,
    instance_wait: ReadinessPolicy,
    metrics: Option<ManagerMetrics>,
}

impl PoolInner {
    /// Forget an instance entirely: queue entry and reservation
    fn forget(&self, variant: &ModelVariant, mode: ServingMode, name: &InstanceName) {
        let mut state = self.state.lock();
        state.dequeue(variant, mode, name);
        state.release(name);
    }

    fn record_pool_size(&self, variant: &ModelVariant, mode: ServingMode) {
        if let Some(metrics) = &self.metrics {
            let replicas = self.state.lock().replicas(variant, mode);
            metrics
                .pooled_instances
                .with_label_values(&[variant.as_str(), &mode.to_string()])
                .set(replicas as f64);
        }
    }
}

/// Reservation of an instance that is not pooled yet.
///
/// Dropping it unarmed does nothing. Dropping it armed, which happens when
/// the load future is dropped mid-flight, releases the reservation and stops
/// whatever was started in the background.
struct PendingLoad {
    inner: Arc<PoolInner>,
    variant: ModelVariant,
    mode: ServingMode,
    instance: InstanceName,
    port: u16,
    launched: Option<Arc<dyn Backend>>,
    armed: bool,
}

impl PendingLoad {
    /// Stop the backend, then release the reservation
    async fn abort(mut self) {
        self.armed = false;
        if let Some(backend) = self.launched.take() {
            if let Err(e) = backend.stop(&self.instance).await {
                warn!(instance = %self.instance, error = %e, "Failed to stop instance during unwind");
            }
        }
        self.inner.forget(&self.variant, self.mode, &self.instance);
        debug!(instance = %self.instance, port = self.port, "Released reservation");
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLoad {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.forget(&self.variant, self.mode, &self.instance);
        let Some(backend) = self.launched.take() else {
            return;
        };
        let instance = self.instance.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.stop(&instance).await {
                        warn!(instance = %instance, error = %e, "Failed to stop abandoned instance");
                    }
                });
            }
            Err(_) => warn!(instance = %instance, "No runtime left to stop abandoned instance"),
        }
    }
}

enum Reserved {
    Pending(PendingLoad),
    Pooled(Instance),
    InProgress,
}

/// Online and offline instance pools of one worker
#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

impl InstancePool {
    pub fn new(config: &WorkerConfig, deps: PoolDependencies) -> Self {
        let state = PoolState {
            online: HashMap::new(),
            offline: HashMap::new(),
            reservations: HashMap::new(),
            ports: PortAllocator::from_config(&config.ports),
            cores_in_use: 0,
            core_budget: config.pool.core_budget,
        };
        Self {
            inner: Arc::new(PoolInner {
                worker: config.worker_id(),
                state: Mutex::new(state),
                transitions: tokio::sync::Mutex::new(()),
                backends: deps.backends,
                stager: deps.stager,
                metadata: deps.metadata,
                autoscaler: deps.autoscaler,
                ready_fast: ReadinessPolicy::fast(&config.pool),
                ready_slow: ReadinessPolicy::slow(&config.pool),
                instance_wait: ReadinessPolicy::instance_wait(&config.pool),
                metrics: deps.metrics,
            }),
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.inner.worker
    }

    pub fn backend(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        self.inner.backends.get(kind)
    }

    /// Launch an instance of `variant` and add it to the pool of `mode`.
    ///
    /// Without a name the instance is named after the variant. Any failure,
    /// cancellation included, stops what was started and releases the
    /// reservation before returning.
    pub async fn load(
        &self,
        variant: &ModelVariant,
        name: Option<InstanceName>,
        mode: ServingMode,
        cancel: &CancellationToken,
    ) -> Result<LoadOutcome> {
        let name = name.unwrap_or_else(|| InstanceName::for_variant(variant));
        let started = Instant::now();

        let mut pending = match self.reserve(variant, &name, mode)? {
            Reserved::Pending(pending) => pending,
            Reserved::Pooled(instance) => {
                let outcome = LoadOutcome::AlreadyLoaded(instance);
                self.record_load(variant, mode, outcome.label());
                return Ok(outcome);
            }
            Reserved::InProgress => {
                debug!(variant = %variant, instance = %name, "Load already in progress");
                self.record_load(variant, mode, LoadOutcome::InProgress.label());
                return Ok(LoadOutcome::InProgress);
            }
        };
        info!(variant = %variant, instance = %name, port = pending.port, mode = %mode, "Loading instance");

        let kind = match self.launch(&mut pending, variant, mode, cancel).await {
            Ok(kind) => kind,
            Err(e) => {
                warn!(variant = %variant, instance = %name, error = %e, "Load failed");
                pending.abort().await;
                self.record_load(variant, mode, "failed");
                return Err(e);
            }
        };

        // Committing runs on its own task so a dropped caller cannot leave
        // the running record and the pool disagreeing.
        let pool = self.clone();
        let committed = tokio::spawn(async move { pool.commit(pending, kind).await })
            .await
            .unwrap_or_else(|e| Err(Error::internal(format!("commit task failed: {}", e))));
        let instance = match committed {
            Ok(instance) => instance,
            Err(e) => {
                self.record_load(variant, mode, "failed");
                return Err(e);
            }
        };

        if let Some(metrics) = &self.inner.metrics {
            metrics
                .load_duration_seconds
                .with_label_values(&[variant.as_str(), &kind.to_string()])
                .observe(started.elapsed().as_secs_f64());
        }
        self.record_load(variant, mode, "loaded");
        info!(
            variant = %variant,
            instance = %instance.name,
            port = instance.port,
            backend = %kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Instance ready"
        );
        Ok(LoadOutcome::Loaded(instance))
    }

    fn reserve(&self, variant: &ModelVariant, name: &InstanceName, mode: ServingMode) -> Result<Reserved> {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.reservations.get(name) {
            if existing.variant != *variant || existing.mode != mode {
                return Err(Error::conflict(format!(
                    "instance {} is already reserved for {} ({})",
                    name, existing.variant, existing.mode
                )));
            }
            // A ready reservation that is no longer queued is being unloaded.
            return Ok(match state.instance(name) {
                Some(instance) if state.is_queued(variant, mode, name) => Reserved::Pooled(instance),
                _ => Reserved::InProgress,
            });
        }

        let cores = variant.resource_units();
        let exhausted = || {
            Error::resource_exhausted(format!(
                "{} needs {} cores, {} in use",
                variant, cores, state.cores_in_use
            ))
        };
        let cores_after = state.cores_in_use.checked_add(cores).ok_or_else(exhausted)?;
        if state.core_budget.is_some_and(|budget| cores_after > budget) {
            return Err(exhausted());
        }
        let port = state.ports.allocate()?;
        state.cores_in_use = cores_after;
        state.reservations.insert(
            name.clone(),
            Reservation {
                variant: variant.clone(),
                mode,
                port,
                cores,
                kind: None,
            },
        );

        Ok(Reserved::Pending(PendingLoad {
            inner: self.inner.clone(),
            variant: variant.clone(),
            mode,
            instance: name.clone(),
            port,
            launched: None,
            armed: true,
        }))
    }

    /// Stage, start and wait for the backend; returns its kind
    async fn launch(
        &self,
        pending: &mut PendingLoad,
        variant: &ModelVariant,
        mode: ServingMode,
        cancel: &CancellationToken,
    ) -> Result<BackendKind> {
        let staged = cancellable(cancel, "artifact staging", self.inner.stager.ensure_staged(variant)).await?;

        let metadata = &self.inner.metadata;
        let framework =
            cancellable(cancel, "model info", metadata.get_model_info(variant, FIELD_FRAMEWORK)).await?;
        let kind: BackendKind = framework.trim().parse()?;
        let input_dim = match metadata.get_model_info(variant, FIELD_INPUT_DIM).await {
            Ok(value) => value.trim().parse().ok(),
            Err(e) => {
                debug!(variant = %variant, error = %e, "No input dimension recorded");
                None
            }
        };
        let backend = self.inner.backends.get(kind)?;

        let spec = LaunchSpec {
            variant: variant.clone(),
            instance: pending.instance.clone(),
            port: pending.port,
            mode,
            cpu_limit: variant.resource_units() as f32,
            input_dim,
            model_dir: staged.path().to_path_buf(),
        };
        // Set before starting so a half-started process is stopped on unwind.
        pending.launched = Some(backend.clone());
        let handle = cancellable(cancel, "backend launch", backend.start(&spec))
            .await
            .map_err(|e| match e {
                Error::Cancelled(_) | Error::LaunchFailure(_) => e,
                other => Error::launch_failure(format!("starting {} for {}: {}", kind, variant, other)),
            })?;
        debug!(instance = %handle.instance, container = %handle.container_id, "Backend started");

        match backend
            .await_ready(variant, pending.port, self.inner.ready_fast, cancel)
            .await
        {
            Ok(_) => Ok(kind),
            Err(Error::Timeout(_)) => {
                warn!(instance = %pending.instance, "Backend not ready yet, polling more slowly");
                backend
                    .await_ready(variant, pending.port, self.inner.ready_slow, cancel)
                    .await
                    .map_err(|e| match e {
                        Error::Timeout(msg) => Error::launch_failure(format!(
                            "{} never became ready: {}",
                            pending.instance, msg
                        )),
                        other => other,
                    })?;
                Ok(kind)
            }
            Err(e) => Err(e),
        }
    }

    /// Pool a ready instance and announce the first online one
    async fn commit(&self, pending: PendingLoad, kind: BackendKind) -> Result<Instance> {
        let transition = self.inner.transitions.lock().await;
        let variant = pending.variant.clone();
        let mode = pending.mode;
        let name = pending.instance.clone();

        let (instance, first_online) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(reservation) = state.reservations.get_mut(&name) else {
                return Err(Error::inconsistent(format!(
                    "reservation of {} vanished while loading",
                    name
                )));
            };
            reservation.kind = Some(kind);
            let instance = Instance {
                name: name.clone(),
                variant: variant.clone(),
                port: reservation.port,
                kind,
                mode,
            };
            let queue = state.pools_mut(mode).entry(variant.clone()).or_default();
            let first = queue.is_empty();
            queue.push_back(name.clone());
            (instance, first && mode.is_online())
        };

        if first_online {
            if let Err(e) = self.announce(&variant).await {
                warn!(variant = %variant, error = %e, "Could not announce instance, rolling back");
                self.inner.state.lock().dequeue(&variant, mode, &name);
                if let Err(cleanup) = self
                    .inner
                    .metadata
                    .remove_running_model(&self.inner.worker, &variant)
                    .await
                {
                    warn!(variant = %variant, error = %cleanup, "Failed to clear running record");
                }
                drop(transition);
                pending.abort().await;
                return Err(Error::upstream(format!(
                    "announcing {} on {}: {}",
                    variant, self.inner.worker, e
                )));
            }
        }
        drop(transition);

        pending.commit();
        self.inner.record_pool_size(&variant, mode);
        Ok(instance)
    }

    async fn announce(&self, variant: &ModelVariant) -> Result<()> {
        let metadata = &self.inner.metadata;
        metadata.add_running_model(&self.inner.worker, variant).await?;
        let parent = metadata.get_parent_model(variant).await?;
        metadata
            .unset_parent_scaledown(&self.inner.worker, &parent)
            .await
    }

    /// Remove an instance from the pool of `mode` and stop it.
    ///
    /// Without a name the most recently added instance goes first.
    pub async fn unload(
        &self,
        variant: &ModelVariant,
        name: Option<InstanceName>,
        mode: ServingMode,
    ) -> Result<UnloadOutcome> {
        let result = self.unload_inner(variant, name, mode).await;
        let outcome = match &result {
            Ok(UnloadOutcome::Unloaded(_)) => "unloaded",
            Ok(UnloadOutcome::AlreadyUnloaded) => "already_unloaded",
            Err(_) => "failed",
        };
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .unloads_total
                .with_label_values(&[variant.as_str(), &mode.to_string(), outcome])
                .inc();
        }
        result
    }

    async fn unload_inner(
        &self,
        variant: &ModelVariant,
        name: Option<InstanceName>,
        mode: ServingMode,
    ) -> Result<UnloadOutcome> {
        let transition = self.inner.transitions.lock().await;
        let metadata = &self.inner.metadata;
        let worker = &self.inner.worker;

        let name = {
            let state = self.inner.state.lock();
            let name = match name {
                Some(name) => name,
                None => match state.pools(mode).get(variant).and_then(VecDeque::back) {
                    Some(name) => name.clone(),
                    None => return Ok(UnloadOutcome::AlreadyUnloaded),
                },
            };
            if !state.is_queued(variant, mode, &name) {
                debug!(variant = %variant, instance = %name, "Instance not pooled");
                return Ok(UnloadOutcome::AlreadyUnloaded);
            }
            if state.instance(&name).is_none() {
                return Err(Error::inconsistent(format!(
                    "{} is pooled without a reservation",
                    name
                )));
            }
            name
        };

        if mode.is_online() && !metadata.is_model_running(variant, worker).await? {
            return Err(Error::inconsistent(format!(
                "{} is pooled but not recorded as running on {}",
                variant, worker
            )));
        }

        let (kind, last_online) = {
            let mut state = self.inner.state.lock();
            state.dequeue(variant, mode, &name);
            let kind = state.instance(&name).map(|instance| instance.kind);
            (kind, mode.is_online() && state.replicas(variant, mode) == 0)
        };
        self.inner.record_pool_size(variant, mode);

        let mut deregistered = Ok(());
        if last_online {
            if let Err(e) = metadata.set_model_load_unload(variant).await {
                warn!(variant = %variant, error = %e, "Failed to flag variant as unloading");
            }
            deregistered = metadata.remove_running_model(worker, variant).await;
        }
        drop(transition);

        // The reservation stays until the process is gone so the port is not
        // handed out while still bound.
        let stopped = match kind {
            Some(kind) => match self.inner.backends.get(kind) {
                Ok(backend) => backend.stop(&name).await,
                Err(e) => Err(e),
            },
            None => Ok(()),
        };
        self.inner.state.lock().release(&name);

        if last_online {
            if let Err(e) = metadata.unset_model_load_unload(variant).await {
                warn!(variant = %variant, error = %e, "Failed to clear unloading flag");
            }
        }
        if stopped.is_ok() {
            self.inner.autoscaler.set_avg_batch(variant, 0.0);
        }

        deregistered.map_err(|e| {
            Error::upstream(format!("removing running record of {}: {}", variant, e))
        })?;
        stopped?;
        info!(variant = %variant, instance = %name, mode = %mode, "Instance unloaded");
        Ok(UnloadOutcome::Unloaded(name))
    }

    /// Make sure an instance is servable, loading one if needed.
    ///
    /// Online waits for any replica of the variant; offline waits for the
    /// named instance. Returns the poll attempt that found it.
    pub async fn wait_for_instance(
        &self,
        variant: &ModelVariant,
        name: Option<&InstanceName>,
        mode: ServingMode,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let name = name
            .cloned()
            .unwrap_or_else(|| InstanceName::for_variant(variant));
        let name = &name;
        let what = format!("{} instance {}", mode, name);
        poll_until(self.inner.instance_wait, cancel, &what, || {
            self.try_ensure(variant, name, mode, cancel)
        })
        .await
    }

    async fn try_ensure(
        &self,
        variant: &ModelVariant,
        name: &InstanceName,
        mode: ServingMode,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let present = match mode {
            ServingMode::Online => self.replicas(variant, mode) > 0,
            ServingMode::Offline => self.contains(variant, mode, name),
        };
        if present {
            return Ok(true);
        }
        if mode.is_online() && self.inner.metadata.is_model_load_unload(variant).await? {
            debug!(variant = %variant, "Variant is being loaded or unloaded elsewhere");
            return Ok(false);
        }
        let outcome = self.load(variant, Some(name.clone()), mode, cancel).await?;
        Ok(outcome.instance().is_some())
    }

    /// Rotate the pool of `variant` and return the instance that was in front
    pub fn next_instance(&self, variant: &ModelVariant, mode: ServingMode) -> Result<Option<Instance>> {
        let mut state = self.inner.state.lock();
        let name = {
            let Some(queue) = state.pools_mut(mode).get_mut(variant) else {
                return Ok(None);
            };
            let Some(name) = queue.pop_front() else {
                return Ok(None);
            };
            queue.push_back(name.clone());
            name
        };
        state.instance(&name).map(Some).ok_or_else(|| {
            Error::inconsistent(format!("{} is pooled without a ready reservation", name))
        })
    }

    pub fn replicas(&self, variant: &ModelVariant, mode: ServingMode) -> usize {
        self.inner.state.lock().replicas(variant, mode)
    }

    /// Pooled instances of a variant in round-robin order
    pub fn instances(&self, variant: &ModelVariant, mode: ServingMode) -> Vec<Instance> {
        let state = self.inner.state.lock();
        state
            .pools(mode)
            .get(variant)
            .map(|queue| queue.iter().filter_map(|name| state.instance(name)).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, variant: &ModelVariant, mode: ServingMode, name: &InstanceName) -> bool {
        self.inner.state.lock().is_queued(variant, mode, name)
    }

    /// Ready instance by name, pooled or being unloaded
    pub fn instance(&self, name: &InstanceName) -> Option<Instance> {
        self.inner.state.lock().instance(name)
    }

    pub fn cores_in_use(&self) -> u32 {
        self.inner.state.lock().cores_in_use
    }

    pub fn ports_in_use(&self) -> usize {
        self.inner.state.lock().ports.in_use()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.state.lock();
        let collect = |mode: ServingMode| {
            state
                .pools(mode)
                .iter()
                .map(|(variant, queue)| {
                    let instances = queue.iter().filter_map(|name| state.instance(name)).collect();
                    (variant.clone(), instances)
                })
                .collect::<BTreeMap<_, _>>()
        };
        let mut pending: Vec<_> = state
            .reservations
            .iter()
            .filter(|(_, reservation)| reservation.kind.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        pending.sort();

        PoolSnapshot {
            worker: self.inner.worker.clone(),
            online: collect(ServingMode::Online),
            offline: collect(ServingMode::Offline),
            pending,
            ports_in_use: state.ports.in_use(),
            cores_in_use: state.cores_in_use,
            core_budget: state.core_budget,
        }
    }

    /// Unload every pooled instance; returns how many were unloaded
    pub async fn shutdown(&self) -> Result<usize> {
        let mut targets = Vec::new();
        {
            let state = self.inner.state.lock();
            for mode in [ServingMode::Online, ServingMode::Offline] {
                for (variant, queue) in state.pools(mode) {
                    for name in queue {
                        targets.push((variant.clone(), mode, name.clone()));
                    }
                }
            }
        }

        let mut unloaded = 0;
        let mut first_error = None;
        for (variant, mode, name) in targets {
            match self.unload(&variant, Some(name.clone()), mode).await {
                Ok(UnloadOutcome::Unloaded(_)) => unloaded += 1,
                Ok(UnloadOutcome::AlreadyUnloaded) => {}
                Err(e) => {
                    warn!(instance = %name, error = %e, "Failed to unload during shutdown");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        info!(unloaded, "Instance pools drained");
        match first_error {
            Some(e) => Err(e),
            None => Ok(unloaded),
        }
    }

    fn record_load(&self, variant: &ModelVariant, mode: ServingMode, outcome: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .loads_total
                .with_label_values(&[variant.as_str(), &mode.to_string(), outcome])
                .inc();
        }
    }
}
