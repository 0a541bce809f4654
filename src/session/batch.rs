use std::collections::HashSet;

use crate::engine::RequestId;
use crate::error::{Result, SessionError};
use crate::settings::SessionSettings;

use super::{GenerationRequest, GenerationResult, InferenceSession, PromptInput, RequestOptions, SubmitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Submitting,
    Draining,
    Done,
}

/// The built-in prompt set: `default_request_count` copies of the default
/// prompt, request `i` asking for `default_max_new_tokens + i` tokens.
pub fn default_batch(settings: &SessionSettings, template: &RequestOptions) -> Vec<(PromptInput, RequestOptions)> {
    (0..settings.default_request_count)
        .map(|i| {
            let options = RequestOptions {
                max_new_tokens: settings.default_max_new_tokens.saturating_add(i),
                ..template.clone()
            };
            (PromptInput::Text(settings.default_prompt.clone()), options)
        })
        .collect()
}

impl InferenceSession {
    /// Validates every prompt up front, then runs them to completion. Nothing
    /// is submitted if any prompt is invalid.
    pub fn run_prompts(&mut self, prompts: Vec<(PromptInput, RequestOptions)>) -> Result<Vec<GenerationResult>> {
        let requests = prompts
            .into_iter()
            .map(|(input, options)| self.build_request(input, &options))
            .collect::<Result<Vec<_>>>()?;
        self.run_batch(requests)
    }

    /// Submits every request, then polls until each admitted request has
    /// produced exactly one result. Results come back in completion order.
    ///
    /// While the engine is full the session keeps polling it. Only
    /// `admission_retries` consecutive refusals with no engine output in
    /// between fail the run with [`SessionError::AdmissionExhausted`], and
    /// nothing after that request is submitted.
    pub fn run_batch(&mut self, requests: Vec<GenerationRequest>) -> Result<Vec<GenerationResult>> {
        let total = requests.len();
        let retries = self.settings.admission_retries.max(1);
        let retry_delay = self.settings.retry_delay();
        let poll_timeout = self.settings.batch_poll_timeout();

        let mut pending: HashSet<RequestId> = HashSet::with_capacity(total);
        let mut results = Vec::with_capacity(total);

        let mut phase = BatchPhase::Submitting;
        tracing::info!(?phase, requests = total, "batch started");

        for request in requests {
            let mut request = request;
            let mut idle_refusals = 0u32;
            loop {
                match self.submit(request)? {
                    SubmitOutcome::Admitted { request_id, .. } => {
                        pending.insert(request_id);
                        break;
                    }
                    SubmitOutcome::Rejected(back) => {
                        idle_refusals += 1;
                        if idle_refusals >= retries {
                            tracing::error!(
                                correlation_id = back.correlation_id,
                                attempts = idle_refusals,
                                "engine never admitted request"
                            );
                            return Err(SessionError::AdmissionExhausted {
                                correlation_id: back.correlation_id,
                                attempts: idle_refusals,
                            });
                        }
                        // Waiting happens inside the engine poll so finished
                        // work is collected while we back off.
                        if self.drain_into(retry_delay, &mut pending, &mut results) > 0 {
                            idle_refusals = 0;
                        }
                        tracing::debug!(
                            correlation_id = back.correlation_id,
                            idle_refusals,
                            outstanding = pending.len(),
                            "engine full, waiting for capacity"
                        );
                        request = back;
                    }
                }
            }
        }

        phase = BatchPhase::Draining;
        tracing::info!(?phase, outstanding = pending.len(), "all requests admitted");

        while !pending.is_empty() {
            if self.drain_into(poll_timeout, &mut pending, &mut results) == 0 {
                tracing::debug!(outstanding = pending.len(), "still waiting on engine");
            }
        }

        phase = BatchPhase::Done;
        tracing::info!(?phase, results = results.len(), "batch finished");
        Ok(results)
    }

    /// Polls once and keeps the results that belong to this batch. Returns the
    /// number of engine events seen.
    fn drain_into(
        &mut self,
        timeout: std::time::Duration,
        pending: &mut HashSet<RequestId>,
        results: &mut Vec<GenerationResult>,
    ) -> usize {
        let (events, finished) = self.collect(timeout);
        for result in finished {
            if pending.remove(&result.request_id) {
                results.push(result);
            }
        }
        events
    }
}
