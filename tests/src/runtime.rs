use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use locallab_kernel::error::RuntimeError;
use locallab_kernel::runtime::{ExecutionRuntime, TokenStream};
use locallab_kernel::types::{GenerationParams, ModelDescriptor, ModelHandle, OptimizationConfig};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

/// A mock execution runtime.
///
/// Responses are scripted per prompt substring and streamed word by word, so
/// the concatenated chunks equal the scripted text. Loads, unloads and
/// generations are counted, failures can be injected, and generation can be
/// paused to hold requests in flight.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<State>,
}

struct State {
    responses: RwLock<Vec<(String, String)>>,
    fallback: RwLock<String>,
    token_delay: RwLock<Duration>,
    load_delay: RwLock<Duration>,
    parallelism: AtomicUsize,
    /// Remaining injected load failures per model id
    load_failures: Mutex<HashMap<String, (usize, RuntimeError)>>,
    generate_failure: Mutex<Option<RuntimeError>>,
    stream_failure: Mutex<Option<(usize, RuntimeError)>>,
    paused: watch::Sender<bool>,
    next_handle: AtomicU64,
    resident: Mutex<Vec<ModelHandle>>,
    load_log: Mutex<Vec<(String, OptimizationConfig)>>,
    prompts: Mutex<Vec<String>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    generations: AtomicUsize,
    active: Arc<AtomicUsize>,
    peak_active: Arc<AtomicUsize>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(State {
                responses: RwLock::new(Vec::new()),
                fallback: RwLock::new("This is a mock response.".to_string()),
                token_delay: RwLock::new(Duration::ZERO),
                load_delay: RwLock::new(Duration::ZERO),
                parallelism: AtomicUsize::new(1),
                load_failures: Mutex::new(HashMap::new()),
                generate_failure: Mutex::new(None),
                stream_failure: Mutex::new(None),
                paused,
                next_handle: AtomicU64::new(1),
                resident: Mutex::new(Vec::new()),
                load_log: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
                loads: AtomicUsize::new(0),
                unloads: AtomicUsize::new(0),
                generations: AtomicUsize::new(0),
                active: Arc::new(AtomicUsize::new(0)),
                peak_active: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Respond with `response` to every prompt containing `prompt_key`.
    pub fn add_response(&self, prompt_key: &str, response: &str) {
        self.state
            .responses
            .write()
            .push((prompt_key.to_string(), response.to_string()));
    }

    /// Response for prompts that match no scripted key.
    pub fn set_fallback_response(&self, response: &str) {
        *self.state.fallback.write() = response.to_string();
    }

    pub fn set_token_delay(&self, delay: Duration) {
        *self.state.token_delay.write() = delay;
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.state.load_delay.write() = delay;
    }

    pub fn set_parallelism(&self, parallel: usize) {
        self.state.parallelism.store(parallel, Ordering::SeqCst);
    }

    /// Fail the next `times` loads of `model_id`.
    pub fn fail_loads(&self, model_id: &str, times: usize, error: RuntimeError) {
        self.state
            .load_failures
            .lock()
            .insert(model_id.to_string(), (times, error));
    }

    /// Fail the next `generate` call outright.
    pub fn fail_next_generate(&self, error: RuntimeError) {
        *self.state.generate_failure.lock() = Some(error);
    }

    /// Let the next generation produce `after` chunks, then fail.
    pub fn fail_next_stream_after(&self, after: usize, error: RuntimeError) {
        *self.state.stream_failure.lock() = Some((after, error));
    }

    /// Hold every generation before its next chunk until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.state.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.state.paused.send_replace(false);
    }

    pub fn load_count(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.state.unloads.load(Ordering::SeqCst)
    }

    pub fn generate_count(&self) -> usize {
        self.state.generations.load(Ordering::SeqCst)
    }

    /// Generations currently producing tokens.
    pub fn active_generations(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of generations seen running at once.
    pub fn peak_active_generations(&self) -> usize {
        self.state.peak_active.load(Ordering::SeqCst)
    }

    /// Model ids currently loaded in the runtime.
    pub fn resident_models(&self) -> Vec<String> {
        self.state
            .resident
            .lock()
            .iter()
            .map(|h| h.model_id().to_string())
            .collect()
    }

    /// Every successful load, in order.
    pub fn load_log(&self) -> Vec<(String, OptimizationConfig)> {
        self.state.load_log.lock().clone()
    }

    /// Every prompt passed to `generate`, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().clone()
    }

    fn response_for(&self, prompt: &str) -> String {
        self.state
            .responses
            .read()
            .iter()
            .find(|(key, _)| prompt.contains(key.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.state.fallback.read().clone())
    }
}

/// Decrements the active-generation count when the stream is dropped.
struct ActiveSlot(Arc<AtomicUsize>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct StreamState {
    chunks: std::vec::IntoIter<String>,
    produced: usize,
    fail: Option<(usize, RuntimeError)>,
    delay: Duration,
    paused: watch::Receiver<bool>,
    _slot: ActiveSlot,
}

#[async_trait]
impl ExecutionRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        options: &OptimizationConfig,
    ) -> Result<ModelHandle, RuntimeError> {
        let delay = *self.state.load_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.loads.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.state.load_failures.lock();
            if let Some((remaining, error)) = failures.get_mut(&descriptor.id) {
                let error = error.clone();
                *remaining -= 1;
                if *remaining == 0 {
                    failures.remove(&descriptor.id);
                }
                return Err(error);
            }
        }

        let handle = ModelHandle::new(
            self.state.next_handle.fetch_add(1, Ordering::SeqCst),
            &descriptor.id,
        );
        self.state.resident.lock().push(handle.clone());
        self.state
            .load_log
            .lock()
            .push((descriptor.id.clone(), *options));
        Ok(handle)
    }

    async fn unload(&self, handle: &ModelHandle) -> Result<(), RuntimeError> {
        self.state.unloads.fetch_add(1, Ordering::SeqCst);
        self.state.resident.lock().retain(|h| h != handle);
        Ok(())
    }

    fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<TokenStream, RuntimeError> {
        if let Some(error) = self.state.generate_failure.lock().take() {
            return Err(error);
        }
        self.state.generations.fetch_add(1, Ordering::SeqCst);
        self.state.prompts.lock().push(prompt.to_string());

        let response = self.response_for(prompt);
        let chunks: Vec<String> = response
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {word}") })
            .collect();

        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_active.fetch_max(active, Ordering::SeqCst);

        let state = StreamState {
            chunks: chunks.into_iter(),
            produced: 0,
            fail: self.state.stream_failure.lock().take(),
            delay: *self.state.token_delay.read(),
            paused: self.state.paused.subscribe(),
            _slot: ActiveSlot(Arc::clone(&self.state.active)),
        };

        let tokens = stream::unfold(state, |mut st| async move {
            let _ = st.paused.wait_for(|paused| !*paused).await;
            if !st.delay.is_zero() {
                tokio::time::sleep(st.delay).await;
            }
            if let Some((after, _)) = &st.fail {
                if st.produced >= *after {
                    let (_, error) = st.fail.take()?;
                    return Some((Err(error), st));
                }
            }
            let chunk = st.chunks.next()?;
            st.produced += 1;
            Some((Ok(chunk), st))
        });
        Ok(Box::pin(tokens))
    }

    fn max_parallel_generations(&self) -> usize {
        self.state.parallelism.load(Ordering::SeqCst)
    }
}
