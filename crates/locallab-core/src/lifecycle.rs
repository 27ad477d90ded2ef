//! Model lifecycle manager
//!
//! Owns every model instance resident in the execution runtime and is the
//! only component that calls into it. Loads are single-flight: concurrent
//! callers asking for the same target share one load, which runs in its own
//! task and finishes even if every caller stops waiting. Each instance runs
//! one batch or stream at a time. Unloads drain in-flight work first. Failed
//! loads are retried with exponential backoff.
//!
//! # Instance states
//!
//! ```text
//! Unloaded → Loading → Ready → Unloading → Unloaded
//!                        └───→ Failed (unrecoverable execution error)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt, Shared};
use locallab_kernel::config::LocalLabConfig;
use locallab_kernel::error::{InferenceError, InferenceResult, RuntimeError};
use locallab_kernel::registry::ModelRegistry;
use locallab_kernel::runtime::{ExecutionRuntime, TokenStream};
use locallab_kernel::types::{
    Completion, FinishReason, GenerationParams, InstanceState, ModelDescriptor, ModelHandle,
    OptimizationConfig,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Notify, OwnedMutexGuard, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::generation::Accumulator;
use crate::monitor::{Reclaim, ResourceMonitor};

/// Lifecycle settings, taken from [`LocalLabConfig`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub default_model: Option<String>,
    pub allow_model_fallback: bool,
    pub max_loaded_models: usize,
    pub idle_timeout: Option<Duration>,
    pub idle_check_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from(&LocalLabConfig::default())
    }
}

impl From<&LocalLabConfig> for LifecycleSettings {
    fn from(config: &LocalLabConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            allow_model_fallback: config.allow_model_fallback,
            max_loaded_models: config.max_loaded_models.max(1),
            idle_timeout: config.model_idle_timeout(),
            idle_check_interval: config.idle_check_interval(),
            retry_base: config.load_retry_base(),
            retry_max: config.load_retry_max(),
        }
    }
}

// ============================================================================
// Model instance
// ============================================================================

/// A model resident in the execution runtime.
pub struct ModelInstance {
    descriptor: ModelDescriptor,
    options: OptimizationConfig,
    handle: ModelHandle,
    loaded_at: DateTime<Utc>,
    state: Mutex<InstanceState>,
    in_flight: AtomicUsize,
    drained: Notify,
    last_used: Mutex<Instant>,
    /// Held by the batch or stream currently executing.
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("model_id", &self.descriptor.id)
            .field("options", &self.options)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ModelInstance {
    fn new(descriptor: ModelDescriptor, options: OptimizationConfig, handle: ModelHandle) -> Self {
        Self {
            descriptor,
            options,
            handle,
            loaded_at: Utc::now(),
            state: Mutex::new(InstanceState::Ready),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            last_used: Mutex::new(Instant::now()),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn options(&self) -> &OptimizationConfig {
        &self.options
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    /// Requests currently executing against this instance.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn matches(&self, model_id: &str, options: &OptimizationConfig) -> bool {
        self.descriptor.id == model_id && self.options == *options
    }

    /// Take an in-flight reference. Only a `Ready` instance accepts work.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        let state = self.state.lock();
        if *state != InstanceState::Ready {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        drop(state);
        self.touch();
        Some(InFlightGuard {
            instance: Arc::clone(self),
        })
    }

    fn mark_failed(&self) {
        let mut state = self.state.lock();
        if *state == InstanceState::Ready {
            *state = InstanceState::Failed;
        }
    }

    fn begin_unload(&self) {
        *self.state.lock() = InstanceState::Unloading;
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.lock() = state;
    }

    /// Wait for this instance's turn to execute.
    ///
    /// Callers already hold an in-flight reference, so a drain waits for
    /// queued turns too. An instance that failed while we waited runs nothing.
    async fn take_turn(&self) -> InferenceResult<OwnedMutexGuard<()>> {
        let turn = Arc::clone(&self.gate).lock_owned().await;
        if self.state() == InstanceState::Failed {
            return Err(self.not_ready());
        }
        Ok(turn)
    }

    fn not_ready(&self) -> InferenceError {
        InferenceError::GenerationFailure(format!("model {} is {}", self.model_id(), self.state()))
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// In-flight reference on an instance; released on drop on every exit path.
pub(crate) struct InFlightGuard {
    instance: Arc<ModelInstance>,
}

impl InFlightGuard {
    pub(crate) fn instance(&self) -> &Arc<ModelInstance> {
        &self.instance
    }

    /// Record an unrecoverable runtime failure against the instance.
    pub(crate) fn report_failure(&self, err: &RuntimeError) {
        if err.is_unrecoverable() {
            error!(
                model_id = %self.instance.model_id(),
                error = %err,
                "Unrecoverable runtime failure, instance requires reload"
            );
            self.instance.mark_failed();
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.instance.touch();
        if self.instance.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.instance.drained.notify_waiters();
        }
    }
}

/// Snapshot of one resident instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub model_id: String,
    pub state: InstanceState,
    pub optimizations: OptimizationConfig,
    pub loaded_at: DateTime<Utc>,
    pub in_flight: usize,
    pub idle_for: Duration,
}

impl From<&ModelInstance> for InstanceInfo {
    fn from(instance: &ModelInstance) -> Self {
        Self {
            model_id: instance.model_id().to_string(),
            state: instance.state(),
            optimizations: *instance.options(),
            loaded_at: instance.loaded_at(),
            in_flight: instance.in_flight(),
            idle_for: instance.idle_for(),
        }
    }
}

// ============================================================================
// Requests against an instance
// ============================================================================

/// Result of [`ModelLifecycleManager::select_model`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub descriptor: ModelDescriptor,
    /// Set when a smaller model was substituted for the requested one
    pub substituted_from: Option<String>,
}

/// One request of a batch, as the lifecycle manager sees it.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub prompt: String,
    /// Resolved parameters (`max_tokens` set)
    pub params: GenerationParams,
    pub cancel: CancellationToken,
}

impl BatchItem {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            prompt: prompt.into(),
            params,
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of [`ModelLifecycleManager::unload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// Released immediately
    Unloaded,
    /// Requests were in flight; the instance unloads once they finish
    Draining,
    NotLoaded,
}

/// A generation holding the instance's turn and an in-flight reference
/// until dropped. Fields drop in order: the stream first, the reference last.
pub(crate) struct ActiveGeneration {
    pub(crate) tokens: TokenStream,
    _turn: OwnedMutexGuard<()>,
    pub(crate) guard: InFlightGuard,
}

enum ItemOutcome {
    Done(Completion),
    Cancelled,
    Failed(RuntimeError),
}

// ============================================================================
// Manager
// ============================================================================

type LoadTarget = (String, OptimizationConfig);

type SharedLoad = Shared<BoxFuture<'static, InferenceResult<Arc<ModelInstance>>>>;

/// Clears a finished load from the in-progress table.
struct LoadSlot {
    manager: Arc<ModelLifecycleManager>,
    target: LoadTarget,
}

impl Drop for LoadSlot {
    fn drop(&mut self) {
        self.manager.loading.lock().remove(&self.target);
    }
}

#[derive(Debug, Clone)]
struct FailureRecord {
    failures: u32,
    error: InferenceError,
    retry_at: Instant,
}

/// Single owner of the resident model instances.
pub struct ModelLifecycleManager {
    runtime: Arc<dyn ExecutionRuntime>,
    registry: Arc<dyn ModelRegistry>,
    monitor: Arc<ResourceMonitor>,
    settings: LifecycleSettings,
    instances: RwLock<Vec<Arc<ModelInstance>>>,
    load_lock: tokio::sync::Mutex<()>,
    loading: Mutex<HashMap<LoadTarget, SharedLoad>>,
    failures: Mutex<HashMap<LoadTarget, FailureRecord>>,
}

impl ModelLifecycleManager {
    pub fn new(
        runtime: Arc<dyn ExecutionRuntime>,
        registry: Arc<dyn ModelRegistry>,
        monitor: Arc<ResourceMonitor>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            runtime,
            registry,
            monitor,
            settings,
            instances: RwLock::new(Vec::new()),
            load_lock: tokio::sync::Mutex::new(()),
            loading: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    /// Pick the model a request runs against.
    ///
    /// An explicit id (or the configured default) must be feasible; without
    /// `allow_model_fallback` an infeasible request fails with
    /// `ResourceInsufficient`. With no id at all the largest feasible model
    /// that supports `options` wins.
    pub fn select_model(
        &self,
        requested: Option<&str>,
        options: &OptimizationConfig,
    ) -> InferenceResult<ModelSelection> {
        let snapshot = self.monitor.snapshot();
        let instances = self.instances.read().clone();
        let feasible = |d: &ModelDescriptor| -> InferenceResult<()> {
            let resident = instances
                .iter()
                .any(|i| i.model_id() == d.id && i.state() == InstanceState::Ready);
            if resident {
                return Ok(());
            }
            let reclaim = self.reclaim_for(&self.eviction_plan(&instances, d, options));
            self.monitor.check_against(&snapshot, d, reclaim)
        };

        let requested = requested.or(self.settings.default_model.as_deref());

        let Some(id) = requested else {
            let descriptors = self.registry.descriptors();
            if descriptors.is_empty() {
                return Err(InferenceError::ModelNotFound("no models registered".to_string()));
            }
            return descriptors
                .iter()
                .find(|&d| options.validate_for(d).is_ok() && feasible(d).is_ok())
                .map(|d| ModelSelection {
                    descriptor: d.clone(),
                    substituted_from: None,
                })
                .ok_or_else(|| {
                    InferenceError::resource_insufficient(
                        "auto",
                        "no registered model fits the available memory",
                    )
                });
        };

        let descriptor = self
            .registry
            .descriptor_for(id)
            .ok_or_else(|| InferenceError::ModelNotFound(id.to_string()))?;

        let shortfall = match feasible(&descriptor) {
            Ok(()) => {
                return Ok(ModelSelection {
                    descriptor,
                    substituted_from: None,
                });
            }
            Err(e) => e,
        };

        if !self.settings.allow_model_fallback {
            return Err(shortfall);
        }

        let substitute = self
            .fallback_candidates(&descriptor)
            .into_iter()
            .find(|d| options.validate_for(d).is_ok() && feasible(d).is_ok());

        match substitute {
            Some(substitute) => {
                warn!(
                    requested = %descriptor.id,
                    substitute = %substitute.id,
                    reason = %shortfall,
                    "Falling back to a smaller model"
                );
                Ok(ModelSelection {
                    descriptor: substitute,
                    substituted_from: Some(descriptor.id),
                })
            }
            None => Err(shortfall),
        }
    }

    /// Preferred substitute first, then every smaller model, largest first.
    fn fallback_candidates(&self, descriptor: &ModelDescriptor) -> Vec<ModelDescriptor> {
        let mut candidates = Vec::new();
        if let Some(preferred) = descriptor
            .fallback
            .as_deref()
            .and_then(|id| self.registry.descriptor_for(id))
        {
            if preferred.parameter_count < descriptor.parameter_count {
                candidates.push(preferred);
            }
        }
        for d in self.registry.descriptors() {
            if d.parameter_count < descriptor.parameter_count
                && !candidates.iter().any(|c| c.id == d.id)
            {
                candidates.push(d);
            }
        }
        candidates
    }

    /// Make `descriptor` resident with `options`, loading it if needed.
    ///
    /// Concurrent callers for the same target share one load. Returns the
    /// existing instance without touching the runtime when it already
    /// matches. Dropping the returned future does not cancel the load.
    ///
    /// # Errors
    /// - `UnsupportedOptimization` before any load attempt
    /// - `ResourceInsufficient` when the model cannot fit, even after
    ///   evicting what capacity requires
    /// - `LoadFailure` from the runtime, or the recorded failure while its
    ///   backoff has not elapsed
    pub async fn ensure_loaded(
        self: &Arc<Self>,
        descriptor: &ModelDescriptor,
        options: &OptimizationConfig,
    ) -> InferenceResult<Arc<ModelInstance>> {
        options.validate_for(descriptor)?;

        if let Some(instance) = self.ready_instance(&descriptor.id, options) {
            instance.touch();
            return Ok(instance);
        }

        self.shared_load(descriptor, options).await
    }

    /// The load in progress for this target, started if there is none.
    fn shared_load(self: &Arc<Self>, descriptor: &ModelDescriptor, options: &OptimizationConfig) -> SharedLoad {
        let target: LoadTarget = (descriptor.id.clone(), *options);
        let (tx, rx) = oneshot::channel();
        let load = {
            let mut loading = self.loading.lock();
            if let Some(load) = loading.get(&target) {
                return load.clone();
            }
            let model_id = descriptor.id.clone();
            let load = async move {
                rx.await.unwrap_or_else(|_| {
                    Err(InferenceError::load_failure(&model_id, "load task ended without a result"))
                })
            }
            .boxed()
            .shared();
            loading.insert(target.clone(), load.clone());
            load
        };

        let slot = LoadSlot {
            manager: Arc::clone(self),
            target,
        };
        let descriptor = descriptor.clone();
        let options = *options;
        tokio::spawn(async move {
            let result = slot.manager.load_target(&descriptor, &options).await;
            drop(slot);
            let _ = tx.send(result);
        });
        load
    }

    async fn load_target(
        &self,
        descriptor: &ModelDescriptor,
        options: &OptimizationConfig,
    ) -> InferenceResult<Arc<ModelInstance>> {
        let _load = self.load_lock.lock().await;

        // a previous load may have finished while we waited
        if let Some(instance) = self.ready_instance(&descriptor.id, options) {
            instance.touch();
            return Ok(instance);
        }

        let target: LoadTarget = (descriptor.id.clone(), *options);
        if let Some(record) = self.failures.lock().get(&target) {
            if Instant::now() < record.retry_at {
                debug!(
                    model_id = %descriptor.id,
                    failures = record.failures,
                    "Load backoff in effect"
                );
                return Err(record.error.clone());
            }
        }

        let plan = {
            let instances = self.instances.read();
            self.eviction_plan(&instances, descriptor, options)
        };
        let snapshot = self.monitor.resample().await;
        self.monitor
            .check_against(&snapshot, descriptor, self.reclaim_for(&plan))?;

        for victim in plan {
            self.remove_instance(&victim);
            info!(
                model_id = %victim.model_id(),
                state = %victim.state(),
                "Evicting model to make room"
            );
            retire(Arc::clone(&self.runtime), victim, "evicted").await;
        }

        info!(
            model_id = %descriptor.id,
            optimizations = %options,
            runtime = self.runtime.name(),
            "Loading model"
        );
        let started = Instant::now();
        match self.runtime.load(descriptor, options).await {
            Ok(handle) => {
                self.failures.lock().remove(&target);
                let instance = Arc::new(ModelInstance::new(descriptor.clone(), *options, handle));
                self.instances.write().push(Arc::clone(&instance));
                info!(
                    model_id = %descriptor.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model ready"
                );
                Ok(instance)
            }
            Err(e) => {
                let error = InferenceError::load_failure(&descriptor.id, e.to_string());
                let mut failures = self.failures.lock();
                let failures_so_far = failures.get(&target).map_or(0, |r| r.failures) + 1;
                let delay = self.backoff(failures_so_far);
                warn!(
                    model_id = %descriptor.id,
                    error = %e,
                    failures = failures_so_far,
                    retry_in_ms = delay.as_millis() as u64,
                    "Model load failed"
                );
                failures.insert(
                    target,
                    FailureRecord {
                        failures: failures_so_far,
                        error: error.clone(),
                        retry_at: Instant::now() + delay,
                    },
                );
                Err(error)
            }
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.settings
            .retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.settings.retry_max)
    }

    fn ready_instance(&self, model_id: &str, options: &OptimizationConfig) -> Option<Arc<ModelInstance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.matches(model_id, options) && i.state() == InstanceState::Ready)
            .cloned()
    }

    /// Instances that must go before `descriptor` can be loaded: failed
    /// ones, the same model under other options, then least recently used
    /// until there is a free slot.
    fn eviction_plan(
        &self,
        instances: &[Arc<ModelInstance>],
        descriptor: &ModelDescriptor,
        options: &OptimizationConfig,
    ) -> Vec<Arc<ModelInstance>> {
        let (mut plan, mut remaining): (Vec<_>, Vec<_>) =
            instances.iter().cloned().partition(|i| {
                i.state() == InstanceState::Failed
                    || (i.model_id() == descriptor.id && i.options() != options)
            });

        remaining.retain(|i| !i.matches(&descriptor.id, options));
        remaining.sort_by_key(|i| i.last_used());
        let excess = (remaining.len() + 1).saturating_sub(self.settings.max_loaded_models);
        plan.extend(remaining.into_iter().take(excess));
        plan
    }

    fn reclaim_for(&self, plan: &[Arc<ModelInstance>]) -> Reclaim {
        plan.iter().fold(Reclaim::default(), |acc, i| Reclaim {
            ram_mb: acc.ram_mb + i.descriptor().min_ram_mb,
            vram_mb: acc.vram_mb + i.descriptor().min_vram_mb.unwrap_or(0),
        })
    }

    fn remove_instance(&self, instance: &Arc<ModelInstance>) -> bool {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|i| !Arc::ptr_eq(i, instance));
        instances.len() != before
    }

    /// Execute `batch` against `instance`; results follow batch order.
    ///
    /// The in-flight count is raised for the duration of the call and
    /// restored on every exit path. Batches on one instance run one after
    /// another, never overlapping. A runtime failure fails every request of
    /// the batch with `GenerationFailure`; only unrecoverable failures move
    /// the instance to `Failed`.
    ///
    /// # Errors
    /// `GenerationFailure` when the instance is not `Ready`, or failed while
    /// the batch waited for its turn. Nothing was executed in that case.
    pub async fn execute(
        &self,
        instance: &Arc<ModelInstance>,
        batch: &[BatchItem],
    ) -> InferenceResult<Vec<InferenceResult<Completion>>> {
        let Some(guard) = instance.try_acquire() else {
            return Err(instance.not_ready());
        };
        let _turn = instance.take_turn().await?;

        let parallel = self.runtime.max_parallel_generations().max(1);
        let pending: Vec<_> = batch
            .iter()
            .map(|item| self.generate_one(guard.instance(), item))
            .collect();
        let mut outcomes = futures::stream::iter(pending).buffered(parallel);

        let mut results = Vec::with_capacity(batch.len());
        let mut failure = None;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                ItemOutcome::Failed(e) => {
                    failure = Some(e);
                    break;
                }
                other => results.push(other),
            }
        }
        // abandon whatever is still generating
        drop(outcomes);

        if let Some(e) = failure {
            guard.report_failure(&e);
            error!(
                model_id = %instance.model_id(),
                batch_size = batch.len(),
                error = %e,
                "Batch execution failed"
            );
            let err = InferenceError::GenerationFailure(e.to_string());
            return Ok(batch
                .iter()
                .map(|item| {
                    if item.cancel.is_cancelled() {
                        Err(InferenceError::Cancelled("cancelled during execution".into()))
                    } else {
                        Err(err.clone())
                    }
                })
                .collect());
        }

        Ok(results
            .into_iter()
            .map(|outcome| match outcome {
                ItemOutcome::Done(completion) => Ok(completion),
                _ => Err(InferenceError::Cancelled("cancelled during execution".into())),
            })
            .collect())
    }

    async fn generate_one(&self, instance: &ModelInstance, item: &BatchItem) -> ItemOutcome {
        if item.cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }

        let mut acc = Accumulator::new(&item.params);
        if acc.exhausted() {
            return ItemOutcome::Done(acc.finish(instance.model_id(), FinishReason::Length));
        }

        let mut tokens = match self
            .runtime
            .generate(instance.handle(), &item.prompt, &item.params)
        {
            Ok(tokens) => tokens,
            Err(e) => return ItemOutcome::Failed(e),
        };

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = item.cancel.cancelled() => return ItemOutcome::Cancelled,
                next = tokens.next() => next,
            };
            match next {
                None => break FinishReason::End,
                Some(Err(e)) => return ItemOutcome::Failed(e),
                Some(Ok(chunk)) => {
                    if let Some(reason) = acc.push(&chunk) {
                        break reason;
                    }
                }
            }
        };

        ItemOutcome::Done(acc.finish(instance.model_id(), reason))
    }

    /// Start a single streamed generation once the instance is free. The
    /// returned value holds the instance until dropped.
    pub(crate) async fn open_generation(
        &self,
        instance: &Arc<ModelInstance>,
        prompt: &str,
        params: &GenerationParams,
    ) -> InferenceResult<ActiveGeneration> {
        let guard = instance.try_acquire().ok_or_else(|| instance.not_ready())?;
        let turn = instance.take_turn().await?;

        match self.runtime.generate(instance.handle(), prompt, params) {
            Ok(tokens) => Ok(ActiveGeneration {
                tokens,
                _turn: turn,
                guard,
            }),
            Err(e) => {
                guard.report_failure(&e);
                Err(InferenceError::GenerationFailure(e.to_string()))
            }
        }
    }

    /// Unload `model_id`.
    ///
    /// An instance with requests in flight is marked `Unloading` at once and
    /// released in the background after the last request finishes.
    pub async fn unload(&self, model_id: &str) -> UnloadOutcome {
        let victims: Vec<Arc<ModelInstance>> = {
            let mut instances = self.instances.write();
            let (victims, keep) = instances
                .drain(..)
                .partition(|i| i.model_id() == model_id);
            *instances = keep;
            victims
        };

        if victims.is_empty() {
            return UnloadOutcome::NotLoaded;
        }

        let mut outcome = UnloadOutcome::Unloaded;
        for victim in victims {
            if victim.in_flight() == 0 {
                retire_detached(Arc::clone(&self.runtime), victim, "requested").await;
            } else {
                victim.begin_unload();
                info!(
                    model_id = %victim.model_id(),
                    pending = victim.in_flight(),
                    "Unload deferred until in-flight requests drain"
                );
                tokio::spawn(retire(Arc::clone(&self.runtime), victim, "requested"));
                outcome = UnloadOutcome::Draining;
            }
        }
        outcome
    }

    /// Unload every instance, waiting for in-flight work to drain.
    pub async fn unload_all(&self) {
        let victims: Vec<Arc<ModelInstance>> = self.instances.write().drain(..).collect();
        for victim in victims {
            retire_detached(Arc::clone(&self.runtime), victim, "shutdown").await;
        }
    }

    /// Unload `Ready` instances idle for longer than the configured timeout.
    ///
    /// Returns the ids unloaded.
    pub async fn evict_idle(&self) -> Vec<String> {
        let Some(timeout) = self.settings.idle_timeout else {
            return Vec::new();
        };

        let idle: Vec<Arc<ModelInstance>> = {
            let mut instances = self.instances.write();
            let (idle, keep) = instances.drain(..).partition(|i| {
                i.state() == InstanceState::Ready && i.in_flight() == 0 && i.idle_for() > timeout
            });
            *instances = keep;
            idle
        };

        let mut unloaded = Vec::with_capacity(idle.len());
        for instance in idle {
            let model_id = instance.model_id().to_string();
            info!(
                model_id = %model_id,
                idle_secs = instance.idle_for().as_secs(),
                "Unloading idle model"
            );
            retire_detached(Arc::clone(&self.runtime), instance, "idle").await;
            unloaded.push(model_id);
        }
        unloaded
    }

    /// Run [`evict_idle`](Self::evict_idle) periodically until `shutdown`
    /// fires. `None` when no idle timeout is configured.
    pub fn spawn_idle_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.settings.idle_timeout?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.idle_check_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Idle reaper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.evict_idle().await;
                    }
                }
            }
        }))
    }

    /// Lifecycle state of `model_id`.
    pub fn state_of(&self, model_id: &str) -> InstanceState {
        if self.loading.lock().keys().any(|(id, _)| id == model_id) {
            return InstanceState::Loading;
        }

        let states: Vec<InstanceState> = self
            .instances
            .read()
            .iter()
            .filter(|i| i.model_id() == model_id)
            .map(|i| i.state())
            .collect();
        if states.contains(&InstanceState::Ready) {
            return InstanceState::Ready;
        }
        if let Some(state) = states.first() {
            return *state;
        }

        if self.failures.lock().keys().any(|(id, _)| id == model_id) {
            return InstanceState::Failed;
        }
        InstanceState::Unloaded
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.instances
            .read()
            .iter()
            .map(|i| InstanceInfo::from(i.as_ref()))
            .collect()
    }

    /// The `Ready` instance of `model_id`, if any.
    pub fn instance(&self, model_id: &str) -> Option<Arc<ModelInstance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.model_id() == model_id && i.state() == InstanceState::Ready)
            .cloned()
    }
}

/// Drain `instance`, then release it in the runtime.
async fn retire(runtime: Arc<dyn ExecutionRuntime>, instance: Arc<ModelInstance>, reason: &'static str) {
    instance.begin_unload();
    instance.wait_drained().await;
    if let Err(e) = runtime.unload(instance.handle()).await {
        warn!(model_id = %instance.model_id(), error = %e, "Runtime unload failed");
    }
    instance.set_state(InstanceState::Unloaded);
    info!(model_id = %instance.model_id(), reason, "Model unloaded");
}

/// [`retire`] in its own task, so an abandoned caller cannot leave the
/// instance half released.
async fn retire_detached(runtime: Arc<dyn ExecutionRuntime>, instance: Arc<ModelInstance>, reason: &'static str) {
    if let Err(e) = tokio::spawn(retire(runtime, instance, reason)).await {
        warn!(error = %e, "Unload task ended abnormally");
    }
}
