//! Request scheduler and dynamic batcher
//!
//! Every generation request passes through [`RequestScheduler::submit`]:
//!
//! 1. Resolve the target model and the effective parameters, and serve from
//!    the response cache when possible. A cached answer for a named model is
//!    served before its feasibility is checked. Cache hits never take a
//!    concurrency slot or touch the model.
//! 2. Check the model fits, substituting a smaller one when fallback is on.
//! 3. Take a concurrency slot (`max_concurrent_requests`). When none is
//!    free the request is refused with `Overloaded`, or waits in a bounded
//!    queue for up to `queue_timeout_ms` when a queue is configured.
//! 4. Refuse the request under memory pressure.
//! 5. Join the open batch for the model. A batch is dispatched when it
//!    reaches `max_batch_size` or when `batch_timeout_ms` has passed since
//!    its first request, whichever comes first.
//! 6. The dispatched batch runs through the lifecycle manager; results are
//!    delivered in admission order and successful ones are cached once
//!    delivered.
//!
//! Per-request states:
//! `Submitted → (CacheHit | Admitted) → (Batched → Dispatched → Completed|Failed) | Rejected`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use locallab_kernel::config::LocalLabConfig;
use locallab_kernel::error::{InferenceError, InferenceResult};
use locallab_kernel::types::{
    Completion, GenerationParams, GenerationRequest, InstanceState, ModelDescriptor,
    OptimizationConfig,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheKey, ResponseCache};
use crate::lifecycle::{BatchItem, ModelLifecycleManager};
use crate::monitor::ResourceMonitor;
use crate::stream::CompletionStream;

/// Attempts to find a `Ready` instance when the one just loaded is evicted
/// before the batch can run on it.
const DISPATCH_ATTEMPTS: usize = 3;

/// Scheduler settings, taken from [`LocalLabConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_requests: usize,
    pub dynamic_batching: bool,
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub queue_capacity: usize,
    pub queue_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&LocalLabConfig::default())
    }
}

impl From<&LocalLabConfig> for SchedulerSettings {
    fn from(config: &LocalLabConfig) -> Self {
        Self {
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            dynamic_batching: config.enable_dynamic_batching,
            max_batch_size: config.max_batch_size.max(1),
            batch_timeout: config.batch_timeout(),
            queue_capacity: config.queue_capacity,
            queue_timeout: config.queue_timeout(),
        }
    }
}

/// Lifecycle of one request through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Submitted,
    CacheHit,
    Admitted,
    Batched,
    Dispatched,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::CacheHit => "cache_hit",
            Self::Admitted => "admitted",
            Self::Batched => "batched",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub cache_hits: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub batches_dispatched: u64,
    /// Requests holding a concurrency slot
    pub in_flight: usize,
    /// Requests waiting for a concurrency slot
    pub queued: usize,
    /// Requests sitting in open, undispatched batches
    pub batched: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    submitted: AtomicU64,
    cache_hits: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    batches: AtomicU64,
}

impl SchedulerCounters {
    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}

/// A request after model resolution and the cache lookup.
enum Resolved {
    Cached(Completion),
    Run(Runnable),
}

struct Runnable {
    descriptor: ModelDescriptor,
    params: GenerationParams,
    key: CacheKey,
}

impl Runnable {
    fn new(descriptor: ModelDescriptor, request: &GenerationRequest) -> Self {
        let params = request.params.resolved_for(&descriptor);
        let key = CacheKey::new(&descriptor.id, &request.prompt, &params);
        Self {
            descriptor,
            params,
            key,
        }
    }
}

/// An admitted request waiting for its batch result.
struct Pending {
    request_id: String,
    item: BatchItem,
    key: CacheKey,
    tx: oneshot::Sender<InferenceResult<Completion>>,
    _permit: OwnedSemaphorePermit,
}

struct OpenBatch {
    id: u64,
    descriptor: ModelDescriptor,
    requests: Vec<Pending>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    lifecycle: Arc<ModelLifecycleManager>,
    cache: Arc<ResponseCache>,
    monitor: Arc<ResourceMonitor>,
    options: OptimizationConfig,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    batches: Mutex<HashMap<String, OpenBatch>>,
    next_batch_id: AtomicU64,
    counters: Arc<SchedulerCounters>,
}

/// Admission control and batching in front of the lifecycle manager.
///
/// Cheaply cloneable; all clones share the same state.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

impl RequestScheduler {
    pub fn new(
        lifecycle: Arc<ModelLifecycleManager>,
        cache: Arc<ResponseCache>,
        monitor: Arc<ResourceMonitor>,
        options: OptimizationConfig,
        settings: SchedulerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_requests));
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                cache,
                monitor,
                options,
                settings,
                permits,
                waiting: AtomicUsize::new(0),
                batches: Mutex::new(HashMap::new()),
                next_batch_id: AtomicU64::new(0),
                counters: Arc::new(SchedulerCounters::default()),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Submit a request and wait for its completion.
    pub async fn submit(&self, request: GenerationRequest) -> InferenceResult<Completion> {
        self.submit_with_cancel(request, CancellationToken::new()).await
    }

    /// Submit a request that the caller may abandon by cancelling `cancel`.
    ///
    /// Cancelling before the batch is dispatched removes the request from
    /// its batch. Cancelling afterwards abandons the generation at the next
    /// token boundary. Either way the caller receives `Cancelled` and the
    /// result is never cached, unless the result was already handed over,
    /// in which case the caller gets it. Each request is counted exactly
    /// once as completed, failed or cancelled.
    pub async fn submit_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<Completion> {
        let inner = &self.inner;
        let Runnable { descriptor, params, key } = match inner.resolve(&request) {
            Ok(Resolved::Cached(completion)) => return Ok(completion),
            Ok(Resolved::Run(runnable)) => runnable,
            Err(e) => {
                inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request.id, state = %RequestState::Rejected, error = %e);
                return Err(e);
            }
        };

        let permit = inner.admit(&request, &params, &cancel).await?;

        let (tx, mut rx) = oneshot::channel();
        let item = BatchItem {
            prompt: request.prompt,
            params,
            cancel: CancellationToken::new(),
        };
        let mut submission = Submission {
            inner,
            model_id: descriptor.id.clone(),
            request_id: request.id.clone(),
            item_cancel: item.cancel.clone(),
            settled: false,
        };

        inner.enqueue(
            descriptor,
            Pending {
                request_id: request.id,
                item,
                key,
                tx,
                _permit: permit,
            },
        );

        let delivered = tokio::select! {
            biased;
            delivered = &mut rx => delivered,
            _ = cancel.cancelled() => {
                // a result sent before the close is still ours
                rx.close();
                match rx.try_recv() {
                    Ok(delivered) => Ok(delivered),
                    Err(_) => return Err(InferenceError::Cancelled(submission.request_id.clone())),
                }
            }
        };
        submission.settled = true;

        delivered.unwrap_or_else(|_| {
            Err(InferenceError::GenerationFailure(
                "request dropped before completion".to_string(),
            ))
        })
    }

    /// Submit a request and receive its tokens as they are produced.
    ///
    /// Streams bypass batching: each one is its own batch of one.
    pub async fn submit_stream(&self, request: GenerationRequest) -> InferenceResult<CompletionStream> {
        let inner = &self.inner;
        let Runnable { descriptor, params, key } = match inner.resolve(&request) {
            Ok(Resolved::Cached(completion)) => return Ok(CompletionStream::from_cache(completion)),
            Ok(Resolved::Run(runnable)) => runnable,
            Err(e) => {
                inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request.id, state = %RequestState::Rejected, error = %e);
                return Err(e);
            }
        };

        let permit = inner
            .admit(&request, &params, &CancellationToken::new())
            .await?;

        let mut last_error = None;
        for _ in 0..DISPATCH_ATTEMPTS {
            let instance = match inner.lifecycle.ensure_loaded(&descriptor, &inner.options).await {
                Ok(instance) => instance,
                Err(e) => {
                    inner.counters.record_failed();
                    return Err(e);
                }
            };
            match inner
                .lifecycle
                .open_generation(&instance, &request.prompt, &params)
                .await
            {
                Ok(generation) => {
                    debug!(
                        request_id = %request.id,
                        model_id = %descriptor.id,
                        state = %RequestState::Dispatched,
                        "Streaming generation started"
                    );
                    return Ok(CompletionStream::live(
                        generation,
                        &params,
                        key,
                        Arc::clone(&inner.cache),
                        Arc::clone(&inner.counters),
                        permit,
                    ));
                }
                Err(e) if instance.state() == InstanceState::Ready => {
                    inner.counters.record_failed();
                    return Err(e);
                }
                Err(e) => last_error = Some(e),
            }
        }

        inner.counters.record_failed();
        Err(last_error.unwrap_or_else(|| {
            InferenceError::GenerationFailure(format!("model {} unavailable", descriptor.id))
        }))
    }

    /// Refuse every new admission. Requests already admitted still complete.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let batched = inner
            .batches
            .lock()
            .values()
            .map(|b| b.requests.len())
            .sum();
        SchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            batches_dispatched: c.batches.load(Ordering::Relaxed),
            in_flight: inner
                .settings
                .max_concurrent_requests
                .saturating_sub(inner.permits.available_permits()),
            queued: inner.waiting.load(Ordering::SeqCst),
            batched,
        }
    }
}

impl Inner {
    /// Resolve the model and parameters, serving from the cache when an
    /// answer exists.
    ///
    /// A named model (explicit or the configured default) is looked up in
    /// the cache before its feasibility is checked, so a cached answer is
    /// served even when the model could not be loaded right now. Selection
    /// and fallback only run on a miss; a substitute gets its own lookup.
    fn resolve(&self, request: &GenerationRequest) -> InferenceResult<Resolved> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %request.id,
            caller_id = %request.caller_id,
            state = %RequestState::Submitted
        );

        let requested = request
            .model_id
            .as_deref()
            .or(self.lifecycle.settings().default_model.as_deref());

        if let Some(id) = requested {
            let descriptor = self
                .lifecycle
                .registry()
                .descriptor_for(id)
                .ok_or_else(|| InferenceError::ModelNotFound(id.to_string()))?;
            let runnable = Runnable::new(descriptor, request);
            if let Some(completion) = self.lookup(&request.id, &runnable.key) {
                return Ok(Resolved::Cached(completion));
            }
        }

        let selection = self.lifecycle.select_model(requested, &self.options)?;
        let runnable = Runnable::new(selection.descriptor, request);
        if requested.is_none() || selection.substituted_from.is_some() {
            if let Some(completion) = self.lookup(&request.id, &runnable.key) {
                return Ok(Resolved::Cached(completion));
            }
        }
        Ok(Resolved::Run(runnable))
    }

    fn lookup(&self, request_id: &str, key: &CacheKey) -> Option<Completion> {
        let entry = self.cache.lookup(key)?;
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %request_id, key = ?key, state = %RequestState::CacheHit);
        Some(Completion {
            cached: true,
            ..entry.completion.clone()
        })
    }

    async fn admit(
        &self,
        request: &GenerationRequest,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> InferenceResult<OwnedSemaphorePermit> {
        let result = self.take_permit(cancel).await.and_then(|permit| {
            let cost = self.monitor.estimate_request_cost_mb(&request.prompt, params);
            if self.monitor.can_admit_request(cost) {
                Ok(permit)
            } else {
                Err(InferenceError::Overloaded(format!(
                    "insufficient memory for request (~{cost} MB)"
                )))
            }
        });

        match &result {
            Ok(_) => debug!(request_id = %request.id, state = %RequestState::Admitted),
            Err(InferenceError::Cancelled(_)) => {
                self.counters.record_cancelled();
                debug!(request_id = %request.id, state = %RequestState::Cancelled);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request.id, state = %RequestState::Rejected, error = %e);
            }
        }
        result
    }

    async fn take_permit(&self, cancel: &CancellationToken) -> InferenceResult<OwnedSemaphorePermit> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => {
                return Err(InferenceError::Overloaded("scheduler is shut down".to_string()));
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let capacity = self.settings.queue_capacity;
        if capacity == 0 {
            return Err(InferenceError::Overloaded(format!(
                "{} requests already in flight",
                self.settings.max_concurrent_requests
            )));
        }

        if self.waiting.fetch_add(1, Ordering::SeqCst) >= capacity {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(InferenceError::Overloaded(format!(
                "wait queue full ({capacity} requests)"
            )));
        }
        let _queued = QueueSlot(&self.waiting);

        let wait = tokio::time::timeout(
            self.settings.queue_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(InferenceError::Cancelled("cancelled while queued".to_string())),
            waited = wait => match waited {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(InferenceError::Overloaded("scheduler is shut down".to_string())),
                Err(_) => Err(InferenceError::Overloaded(format!(
                    "no capacity within {} ms",
                    self.settings.queue_timeout.as_millis()
                ))),
            },
        }
    }

    fn enqueue(self: &Arc<Self>, descriptor: ModelDescriptor, pending: Pending) {
        if !self.settings.dynamic_batching || self.settings.max_batch_size <= 1 {
            self.dispatch(descriptor, vec![pending]);
            return;
        }

        let request_id = pending.request_id.clone();
        let model_id = descriptor.id.clone();
        let mut batches = self.batches.lock();
        let batch = batches.entry(model_id.clone()).or_insert_with(|| OpenBatch {
            id: self.next_batch_id.fetch_add(1, Ordering::Relaxed),
            descriptor,
            requests: Vec::new(),
            timer: None,
        });
        batch.requests.push(pending);
        debug!(
            request_id = %request_id,
            model_id = %model_id,
            batch_size = batch.requests.len(),
            state = %RequestState::Batched
        );

        if batch.requests.len() < self.settings.max_batch_size {
            if batch.timer.is_none() {
                let scheduler = Arc::clone(self);
                let batch_id = batch.id;
                let timeout = self.settings.batch_timeout;
                let model_id = model_id.clone();
                batch.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    scheduler.close_batch(&model_id, batch_id);
                }));
            }
            return;
        }

        let Some(full) = batches.remove(&model_id) else {
            return;
        };
        drop(batches);
        if let Some(timer) = full.timer {
            timer.abort();
        }
        self.dispatch(full.descriptor, full.requests);
    }

    /// Batch timeout fired.
    fn close_batch(self: &Arc<Self>, model_id: &str, batch_id: u64) {
        let batch = {
            let mut batches = self.batches.lock();
            match batches.get(model_id) {
                Some(open) if open.id == batch_id => batches.remove(model_id),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            self.dispatch(batch.descriptor, batch.requests);
        }
    }

    /// Take a cancelled request out of its open batch. False once dispatched.
    fn withdraw(&self, model_id: &str, request_id: &str) -> bool {
        let mut batches = self.batches.lock();
        let Some(batch) = batches.get_mut(model_id) else {
            return false;
        };
        let Some(pos) = batch.requests.iter().position(|p| p.request_id == request_id) else {
            return false;
        };
        batch.requests.remove(pos);
        if batch.requests.is_empty() {
            if let Some(empty) = batches.remove(model_id) {
                if let Some(timer) = empty.timer {
                    timer.abort();
                }
            }
        }
        true
    }

    fn dispatch(self: &Arc<Self>, descriptor: ModelDescriptor, requests: Vec<Pending>) {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_batch(descriptor, requests).await });
    }

    async fn run_batch(&self, descriptor: ModelDescriptor, requests: Vec<Pending>) {
        let live: Vec<Pending> = requests
            .into_iter()
            .filter(|p| !p.tx.is_closed() && !p.item.cancel.is_cancelled())
            .collect();
        if live.is_empty() {
            return;
        }

        debug!(
            model_id = %descriptor.id,
            batch_size = live.len(),
            state = %RequestState::Dispatched,
            "Dispatching batch"
        );
        let items: Vec<BatchItem> = live.iter().map(|p| p.item.clone()).collect();
        let results = self.execute_on(&descriptor, &items).await;

        for (pending, result) in live.into_iter().zip(results) {
            let outcome = match &result {
                Ok(completion) => Ok(completion.clone()),
                Err(e) => Err(e.to_string()),
            };
            // a caller that stopped waiting was already counted as cancelled
            if pending.tx.send(result).is_err() {
                continue;
            }
            match outcome {
                Ok(completion) => {
                    self.cache.store(pending.key, &completion);
                    self.counters.record_completed();
                    debug!(request_id = %pending.request_id, state = %RequestState::Completed);
                }
                Err(error) => {
                    self.counters.record_failed();
                    debug!(request_id = %pending.request_id, state = %RequestState::Failed, error = %error);
                }
            }
        }
    }

    async fn execute_on(
        &self,
        descriptor: &ModelDescriptor,
        items: &[BatchItem],
    ) -> Vec<InferenceResult<Completion>> {
        let mut last_error = None;
        for _ in 0..DISPATCH_ATTEMPTS {
            let instance = match self.lifecycle.ensure_loaded(descriptor, &self.options).await {
                Ok(instance) => instance,
                Err(e) => return vec![Err(e); items.len()],
            };
            match self.lifecycle.execute(&instance, items).await {
                Ok(results) => return results,
                Err(e) => {
                    warn!(model_id = %descriptor.id, error = %e, "Instance unavailable, retrying dispatch");
                    last_error = Some(e);
                }
            }
        }
        let err = last_error.unwrap_or_else(|| {
            InferenceError::GenerationFailure(format!("model {} unavailable", descriptor.id))
        });
        vec![Err(err); items.len()]
    }
}

/// Decrements the wait-queue length when dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cleans up after a caller that stops waiting for its result.
struct Submission<'a> {
    inner: &'a Arc<Inner>,
    model_id: String,
    request_id: String,
    item_cancel: CancellationToken,
    settled: bool,
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if !self.inner.withdraw(&self.model_id, &self.request_id) {
            // already dispatched: abandon the generation
            self.item_cancel.cancel();
        }
        self.inner.counters.record_cancelled();
        debug!(request_id = %self.request_id, state = %RequestState::Cancelled);
    }
}
