//! Streaming completions.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use locallab_kernel::error::{InferenceError, InferenceResult};
use locallab_kernel::types::{Completion, FinishReason, GenerationParams};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::cache::{CacheKey, ResponseCache};
use crate::generation::Accumulator;
use crate::lifecycle::ActiveGeneration;
use crate::scheduler::SchedulerCounters;

/// Lazily produced, finite sequence of text chunks for one request.
///
/// A cache hit yields the whole completion as one chunk. A live stream
/// holds its concurrency slot and an in-flight reference on the model
/// instance until it ends or is dropped; dropping it early abandons the
/// generation. On normal completion the full text is written to the cache.
pub struct CompletionStream {
    model_id: String,
    source: Source,
    completion: Option<Completion>,
}

enum Source {
    Cached(Option<Completion>),
    Live(Option<Live>),
}

struct Live {
    generation: ActiveGeneration,
    acc: Accumulator,
    key: CacheKey,
    cache: Arc<ResponseCache>,
    counters: Arc<SchedulerCounters>,
    _permit: OwnedSemaphorePermit,
}

impl CompletionStream {
    pub(crate) fn from_cache(completion: Completion) -> Self {
        Self {
            model_id: completion.model_id.clone(),
            source: Source::Cached(Some(completion)),
            completion: None,
        }
    }

    pub(crate) fn live(
        generation: ActiveGeneration,
        params: &GenerationParams,
        key: CacheKey,
        cache: Arc<ResponseCache>,
        counters: Arc<SchedulerCounters>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let acc = Accumulator::new(params);
        Self {
            model_id: generation.guard.instance().model_id().to_string(),
            source: Source::Live(Some(Live {
                generation,
                acc,
                key,
                cache,
                counters,
                _permit: permit,
            })),
            completion: None,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.source, Source::Cached(_))
    }

    /// The finished completion, once the stream has ended normally.
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// Drain the stream into its completion.
    pub async fn collect_completion(mut self) -> InferenceResult<Completion> {
        while let Some(chunk) = self.next().await {
            chunk?;
        }
        self.completion
            .take()
            .ok_or_else(|| InferenceError::GenerationFailure("stream ended without a result".into()))
    }

    fn finish(&mut self, mut live: Live, reason: FinishReason) -> Option<String> {
        let tail = live.acc.take_ready(true);
        let completion = live.acc.finish(&self.model_id, reason);
        live.cache.store(live.key, &completion);
        live.counters.record_completed();
        debug!(
            model_id = %self.model_id,
            token_count = completion.token_count,
            finish_reason = ?reason,
            "Stream completed"
        );
        self.completion = Some(completion);
        // live drops here: token stream, in-flight reference and permit
        tail
    }
}

impl Stream for CompletionStream {
    type Item = InferenceResult<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let live = match &mut this.source {
            Source::Cached(slot) => {
                return Poll::Ready(slot.take().map(|completion| {
                    let text = completion.text.clone();
                    this.completion = Some(Completion {
                        cached: true,
                        ..completion
                    });
                    Ok(text)
                }));
            }
            Source::Live(live) => live,
        };

        loop {
            let Some(state) = live.as_mut() else {
                return Poll::Ready(None);
            };

            if state.acc.exhausted() {
                let finished = live.take().map(|l| (l, FinishReason::Length));
                return Poll::Ready(this.finish_with(finished).map(Ok));
            }

            match state.generation.tokens.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    let finished = live.take().map(|l| (l, FinishReason::End));
                    return Poll::Ready(this.finish_with(finished).map(Ok));
                }
                Poll::Ready(Some(Err(e))) => {
                    if let Some(state) = live.take() {
                        state.generation.guard.report_failure(&e);
                        state.counters.record_failed();
                    }
                    return Poll::Ready(Some(Err(InferenceError::GenerationFailure(e.to_string()))));
                }
                Poll::Ready(Some(Ok(chunk))) => {
                    if let Some(reason) = state.acc.push(&chunk) {
                        let finished = live.take().map(|l| (l, reason));
                        return Poll::Ready(this.finish_with(finished).map(Ok));
                    }
                    if let Some(text) = state.acc.take_ready(false) {
                        return Poll::Ready(Some(Ok(text)));
                    }
                }
            }
        }
    }
}

impl CompletionStream {
    fn finish_with(&mut self, finished: Option<(Live, FinishReason)>) -> Option<String> {
        let (live, reason) = finished?;
        self.finish(live, reason)
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        if let Source::Live(Some(live)) = &self.source {
            live.counters.record_cancelled();
            debug!(model_id = %self.model_id, "Stream dropped before completion");
        }
    }
}

impl std::fmt::Debug for CompletionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionStream")
            .field("model_id", &self.model_id)
            .field("cached", &self.is_cached())
            .field("finished", &self.completion.is_some())
            .finish()
    }
}
