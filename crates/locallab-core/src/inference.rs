//! `InferenceCore`: the components wired together from one configuration.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use locallab_kernel::config::LocalLabConfig;
use locallab_kernel::error::{InferenceError, InferenceResult};
use locallab_kernel::registry::{ModelRegistry, StaticRegistry};
use locallab_kernel::runtime::ExecutionRuntime;
use locallab_kernel::types::{
    Completion, GenerationParams, GenerationRequest, InstanceState, ResourceSnapshot,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{CacheStats, ResponseCache};
use crate::lifecycle::{InstanceInfo, LifecycleSettings, ModelLifecycleManager, UnloadOutcome};
use crate::monitor::{ResourceMonitor, ResourceProbe, SystemProbe};
use crate::scheduler::{RequestScheduler, SchedulerSettings, SchedulerStats};
use crate::stream::CompletionStream;

/// Caller id used for requests created by [`InferenceCore::generate_batch`].
const BATCH_CALLER: &str = "batch";

/// Point-in-time view of the whole core.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub resources: ResourceSnapshot,
    pub degraded: Option<String>,
    pub instances: Vec<InstanceInfo>,
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub uptime: Duration,
}

/// Resource monitor, lifecycle manager, response cache and scheduler,
/// configured from one [`LocalLabConfig`].
///
/// `new` only wires the components. [`start`](Self::start) launches the
/// background tasks (resource sampler, cache sweeper, idle reaper) and
/// [`shutdown`](Self::shutdown) stops them and unloads every model.
pub struct InferenceCore {
    config: Arc<LocalLabConfig>,
    monitor: Arc<ResourceMonitor>,
    lifecycle: Arc<ModelLifecycleManager>,
    cache: Arc<ResponseCache>,
    scheduler: RequestScheduler,
    started_at: Instant,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceCore {
    /// Core over the configured model table, sampling this host.
    pub fn new(config: LocalLabConfig, runtime: Arc<dyn ExecutionRuntime>) -> InferenceResult<Self> {
        let registry = Arc::new(StaticRegistry::new(config.models.clone()));
        Self::with_components(config, runtime, registry, Arc::new(SystemProbe::new()))
    }

    pub fn with_components(
        config: LocalLabConfig,
        runtime: Arc<dyn ExecutionRuntime>,
        registry: Arc<dyn ModelRegistry>,
        probe: Arc<dyn ResourceProbe>,
    ) -> InferenceResult<Self> {
        config.validate()?;

        let monitor = Arc::new(ResourceMonitor::new(probe, &config));
        let lifecycle = Arc::new(ModelLifecycleManager::new(
            runtime,
            registry,
            Arc::clone(&monitor),
            LifecycleSettings::from(&config),
        ));
        let cache = Arc::new(ResponseCache::from_config(&config));
        let scheduler = RequestScheduler::new(
            Arc::clone(&lifecycle),
            Arc::clone(&cache),
            Arc::clone(&monitor),
            config.optimization_config(),
            SchedulerSettings::from(&config),
        );

        Ok(Self {
            config: Arc::new(config),
            monitor,
            lifecycle,
            cache,
            scheduler,
            started_at: Instant::now(),
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &LocalLabConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycleManager> {
        &self.lifecycle
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    /// Launch the background tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.stop.is_cancelled() {
            return;
        }

        tasks.push(self.monitor.spawn_sampler(self.stop.child_token()));
        tasks.extend(
            self.cache
                .spawn_sweeper(self.config.cache_sweep_interval(), self.stop.child_token()),
        );
        tasks.extend(self.lifecycle.spawn_idle_reaper(self.stop.child_token()));

        info!(
            default_model = ?self.config.default_model,
            max_loaded_models = self.config.max_loaded_models,
            max_concurrent_requests = self.config.max_concurrent_requests,
            dynamic_batching = self.config.enable_dynamic_batching,
            cache = self.cache.is_enabled(),
            "Inference core started"
        );
    }

    /// Stop background tasks, refuse new requests and unload every model
    /// once its in-flight work has drained.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        self.scheduler.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.lifecycle.unload_all().await;
        info!(uptime_secs = self.started_at.elapsed().as_secs(), "Inference core stopped");
    }

    /// A request carrying the configured sampling defaults.
    pub fn request(&self, caller_id: impl Into<String>, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(caller_id, prompt).with_params(self.config.default_params())
    }

    pub async fn generate(&self, request: GenerationRequest) -> InferenceResult<Completion> {
        self.scheduler.submit(request).await
    }

    pub async fn generate_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<Completion> {
        self.scheduler.submit_with_cancel(request, cancel).await
    }

    pub async fn generate_stream(&self, request: GenerationRequest) -> InferenceResult<CompletionStream> {
        self.scheduler.submit_stream(request).await
    }

    /// Submit every prompt concurrently. Results come back in prompt order.
    pub async fn generate_batch<I, S>(
        &self,
        prompts: I,
        model_id: Option<&str>,
        params: Option<GenerationParams>,
    ) -> Vec<InferenceResult<Completion>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = params.unwrap_or_else(|| self.config.default_params());
        let submissions = prompts.into_iter().map(|prompt| {
            let mut request =
                GenerationRequest::new(BATCH_CALLER, prompt).with_params(params.clone());
            request.model_id = model_id.map(str::to_string);
            self.scheduler.submit(request)
        });
        join_all(submissions).await
    }

    /// Load `model_id` with the configured optimizations.
    pub async fn load_model(&self, model_id: &str) -> InferenceResult<InstanceInfo> {
        let descriptor = self
            .lifecycle
            .registry()
            .descriptor_for(model_id)
            .ok_or_else(|| InferenceError::ModelNotFound(model_id.to_string()))?;
        let instance = self
            .lifecycle
            .ensure_loaded(&descriptor, &self.config.optimization_config())
            .await?;
        Ok(InstanceInfo::from(instance.as_ref()))
    }

    pub async fn unload_model(&self, model_id: &str) -> UnloadOutcome {
        self.lifecycle.unload(model_id).await
    }

    pub fn model_state(&self, model_id: &str) -> InstanceState {
        self.lifecycle.state_of(model_id)
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.lifecycle.instances()
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            resources: self.monitor.snapshot(),
            degraded: self.monitor.degradation().map(|e| e.to_string()),
            instances: self.lifecycle.instances(),
            scheduler: self.scheduler.stats(),
            cache: self.cache.stats(),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Drop for InferenceCore {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
