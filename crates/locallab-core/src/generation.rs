//! Token accumulation with stop-sequence and length handling.

use locallab_kernel::types::{Completion, FinishReason, GenerationParams};

/// Collects token chunks into a completion.
///
/// Text that could still turn out to be the start of a stop sequence is held
/// back from [`take_ready`](Self::take_ready) until it is resolved.
#[derive(Debug)]
pub(crate) struct Accumulator {
    stop: Vec<String>,
    max_tokens: usize,
    holdback: usize,
    text: String,
    released: usize,
    token_count: usize,
}

impl Accumulator {
    pub(crate) fn new(params: &GenerationParams) -> Self {
        let stop: Vec<String> = params.stop.iter().filter(|s| !s.is_empty()).cloned().collect();
        let holdback = stop.iter().map(|s| s.len()).max().unwrap_or(1) - 1;
        Self {
            stop,
            max_tokens: params.max_tokens.unwrap_or(usize::MAX),
            holdback,
            text: String::new(),
            released: 0,
            token_count: 0,
        }
    }

    /// True when nothing may be generated at all.
    pub(crate) fn exhausted(&self) -> bool {
        self.token_count >= self.max_tokens
    }

    /// Append one chunk. Returns the finish reason once generation must end.
    pub(crate) fn push(&mut self, chunk: &str) -> Option<FinishReason> {
        self.token_count += 1;
        self.text.push_str(chunk);

        let hit = self
            .stop
            .iter()
            .filter_map(|s| self.text.find(s.as_str()))
            .min();
        if let Some(pos) = hit {
            self.text.truncate(pos);
            return Some(FinishReason::Stop);
        }

        if self.exhausted() {
            return Some(FinishReason::Length);
        }
        None
    }

    /// Text that is safe to hand out, if any. `finished` releases everything.
    pub(crate) fn take_ready(&mut self, finished: bool) -> Option<String> {
        let mut end = if finished {
            self.text.len()
        } else {
            self.text.len().saturating_sub(self.holdback)
        };
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        if end <= self.released {
            return None;
        }
        let ready = self.text[self.released..end].to_string();
        self.released = end;
        Some(ready)
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn finish(self, model_id: &str, finish_reason: FinishReason) -> Completion {
        Completion {
            text: self.text,
            token_count: self.token_count,
            model_id: model_id.to_string(),
            finish_reason,
            cached: false,
        }
    }
}
