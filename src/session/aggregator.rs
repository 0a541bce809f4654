//! Per-request accumulation of streamed engine output.
//!
//! Accumulators are append-only: a merged response can add tokens and update
//! finish reasons, never remove either. Once a request is terminal it is
//! finalized exactly once and dropped; later events for its id are ignored.

use std::collections::HashMap;
use std::time::Duration;

use session_protocol::ResultRecord;

use crate::engine::{EngineOutput, FinishReason, GenerationEngine, RequestId, Response, ResponseBody};
use crate::tokenizer::{TokenId, TokenizerSession};

use super::lifecycle::RequestTicket;

#[derive(Debug, Clone, Default)]
struct BeamState {
    tokens: Vec<TokenId>,
    log_probs: Vec<f32>,
    finish: FinishReason,
}

#[derive(Debug, Clone)]
pub struct RequestAccumulator {
    ticket: RequestTicket,
    beams: Vec<BeamState>,
    terminal: bool,
    error: Option<String>,
    events: u32,
}

impl RequestAccumulator {
    fn new(ticket: RequestTicket) -> Self {
        Self {
            ticket,
            beams: vec![BeamState::default(); ticket.num_beams.max(1) as usize],
            terminal: false,
            error: None,
            events: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn token_counts(&self) -> Vec<usize> {
        self.beams.iter().map(|b| b.tokens.len()).collect()
    }

    fn apply_output(&mut self, output: EngineOutput) {
        let beam_count = output
            .output_token_ids
            .len()
            .max(output.finish_reasons.len());
        if beam_count > self.beams.len() {
            self.beams.resize_with(beam_count, BeamState::default);
        }

        let log_probs = output.log_probs.filter(|_| self.ticket.return_log_probs);
        for (beam, tokens) in output.output_token_ids.into_iter().enumerate() {
            self.beams[beam].tokens.extend(tokens);
        }
        if let Some(log_probs) = log_probs {
            for (beam, values) in log_probs.into_iter().enumerate() {
                if let Some(state) = self.beams.get_mut(beam) {
                    state.log_probs.extend(values);
                }
            }
        }
        for (beam, reason) in output.finish_reasons.into_iter().enumerate() {
            // A beam that already finished keeps its reason.
            if !self.beams[beam].finish.is_terminal() {
                self.beams[beam].finish = reason;
            }
        }
        if output.is_final {
            self.terminal = true;
        }
    }

    fn apply_error(&mut self, message: String) {
        for beam in &mut self.beams {
            beam.finish = FinishReason::Error;
        }
        self.error = Some(message);
        self.terminal = true;
    }
}

/// The final, decoded outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub request_id: RequestId,
    pub correlation_id: u64,
    pub output_tokens: Vec<Vec<TokenId>>,
    pub log_probs: Option<Vec<Vec<f32>>>,
    pub finish_reasons: Vec<FinishReason>,
    pub texts: Vec<String>,
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_record(&self) -> ResultRecord {
        ResultRecord {
            request_id: self.request_id,
            output_tokens: self.output_tokens.clone(),
            output_logprobs: self.log_probs.clone(),
            finish_reason: self.finish_reasons.clone(),
            generated_text: self.texts.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Progress,
    Terminal,
    /// Unknown id, or an event that arrived after the request finished.
    Ignored,
}

#[derive(Debug, Default)]
pub struct ResponseAggregator {
    accumulators: HashMap<RequestId, RequestAccumulator>,
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts accumulating for an admitted request. Returns false if the id is
    /// already outstanding.
    pub fn track(&mut self, request_id: RequestId, ticket: RequestTicket) -> bool {
        if self.accumulators.contains_key(&request_id) {
            tracing::warn!(request_id, "engine reused an outstanding request id");
            return false;
        }
        self.accumulators
            .insert(request_id, RequestAccumulator::new(ticket));
        true
    }

    /// The one blocking point of both run modes.
    pub fn poll(&self, engine: &mut dyn GenerationEngine, timeout: Duration) -> Vec<Response> {
        let responses = engine.await_responses(timeout);
        if responses.is_empty() {
            tracing::trace!(timeout_ms = timeout.as_millis() as u64, "poll returned nothing");
        }
        responses
    }

    pub fn merge(&mut self, response: Response) -> MergeOutcome {
        let Some(acc) = self.accumulators.get_mut(&response.request_id) else {
            tracing::debug!(request_id = response.request_id, "event for unknown request dropped");
            return MergeOutcome::Ignored;
        };
        if acc.terminal {
            return MergeOutcome::Ignored;
        }

        acc.events += 1;
        match response.body {
            ResponseBody::Output(output) => acc.apply_output(output),
            ResponseBody::Error(message) => {
                tracing::warn!(request_id = response.request_id, error = %message, "request failed");
                acc.apply_error(message);
            }
        }

        if acc.terminal {
            MergeOutcome::Terminal
        } else {
            MergeOutcome::Progress
        }
    }

    /// Decodes and removes a terminal accumulator. Returns `None` for unknown
    /// or still-running requests, so each request yields one result at most.
    pub fn finalize(
        &mut self,
        request_id: RequestId,
        tokenizer: &TokenizerSession,
    ) -> Option<GenerationResult> {
        if !self.accumulators.get(&request_id)?.terminal {
            return None;
        }
        let acc = self.accumulators.remove(&request_id)?;

        let mut error = acc.error;
        let mut texts = Vec::with_capacity(acc.beams.len());
        let mut finish_reasons = Vec::with_capacity(acc.beams.len());
        for (beam, state) in acc.beams.iter().enumerate() {
            match tokenizer.decode(&state.tokens) {
                Ok(text) => {
                    texts.push(text);
                    finish_reasons.push(state.finish);
                }
                Err(e) => {
                    tracing::warn!(request_id, beam, error = %e, "cannot decode beam output");
                    texts.push(String::new());
                    finish_reasons.push(FinishReason::Error);
                    let message = format!("beam {}: {}", beam, e);
                    error = Some(match error {
                        Some(prev) => format!("{}; {}", prev, message),
                        None => message,
                    });
                }
            }
        }

        let log_probs = acc
            .ticket
            .return_log_probs
            .then(|| acc.beams.iter().map(|b| b.log_probs.clone()).collect());

        tracing::debug!(
            request_id,
            events = acc.events,
            tokens = ?acc.beams.iter().map(|b| b.tokens.len()).collect::<Vec<_>>(),
            "request finalized"
        );

        Some(GenerationResult {
            request_id,
            correlation_id: acc.ticket.correlation_id,
            output_tokens: acc.beams.into_iter().map(|b| b.tokens).collect(),
            log_probs,
            finish_reasons,
            texts,
            error,
        })
    }

    /// Merges a batch of responses in arrival order and finalizes every request
    /// that became terminal.
    pub fn absorb(
        &mut self,
        responses: Vec<Response>,
        tokenizer: &TokenizerSession,
    ) -> Vec<GenerationResult> {
        let mut finished = Vec::new();
        for response in responses {
            let request_id = response.request_id;
            if self.merge(response) == MergeOutcome::Terminal {
                finished.extend(self.finalize(request_id, tokenizer));
            }
        }
        finished
    }

    /// Stops tracking a request. Any further events for it are dropped.
    pub fn abandon(&mut self, request_id: RequestId) -> bool {
        self.accumulators.remove(&request_id).is_some()
    }

    pub fn get(&self, request_id: RequestId) -> Option<&RequestAccumulator> {
        self.accumulators.get(&request_id)
    }

    pub fn outstanding(&self) -> usize {
        self.accumulators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{error_event, output_event, word_level_tokenizer};

    fn ticket(num_beams: u32, return_log_probs: bool) -> RequestTicket {
        RequestTicket {
            correlation_id: 1,
            num_beams,
            return_log_probs,
            streaming: true,
        }
    }

    #[test]
    fn token_counts_never_decrease() {
        let mut agg = ResponseAggregator::new();
        agg.track(7, ticket(1, false));

        let mut last = 0;
        for tokens in [vec![3], vec![], vec![4, 5]] {
            agg.merge(output_event(7, vec![tokens], FinishReason::Running, false));
            let count = agg.get(7).unwrap().token_counts()[0];
            assert!(count >= last);
            last = count;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn terminal_request_is_finalized_once_and_ignores_late_events() {
        let tok = word_level_tokenizer();
        let mut agg = ResponseAggregator::new();
        agg.track(1, ticket(1, false));

        assert_eq!(
            agg.merge(output_event(1, vec![vec![3, 4]], FinishReason::Running, false)),
            MergeOutcome::Progress
        );
        assert_eq!(
            agg.merge(output_event(1, vec![vec![5]], FinishReason::Length, true)),
            MergeOutcome::Terminal
        );
        assert_eq!(
            agg.merge(output_event(1, vec![vec![6]], FinishReason::Running, false)),
            MergeOutcome::Ignored
        );

        let result = agg.finalize(1, &tok).unwrap();
        assert_eq!(result.output_tokens, vec![vec![3, 4, 5]]);
        assert_eq!(result.finish_reasons, vec![FinishReason::Length]);
        assert!(!result.texts[0].is_empty());
        assert!(agg.finalize(1, &tok).is_none());
        assert_eq!(agg.merge(output_event(1, vec![vec![6]], FinishReason::Length, true)), MergeOutcome::Ignored);
    }

    #[test]
    fn running_request_is_not_finalized() {
        let tok = word_level_tokenizer();
        let mut agg = ResponseAggregator::new();
        agg.track(2, ticket(1, false));
        agg.merge(output_event(2, vec![vec![3]], FinishReason::Running, false));
        assert!(agg.finalize(2, &tok).is_none());
        assert_eq!(agg.outstanding(), 1);
    }

    #[test]
    fn error_affects_only_its_own_request() {
        let tok = word_level_tokenizer();
        let mut agg = ResponseAggregator::new();
        agg.track(1, ticket(2, false));
        agg.track(2, ticket(1, false));

        let finished = agg.absorb(
            vec![
                output_event(2, vec![vec![3]], FinishReason::Running, false),
                error_event(1, "kv cache exhausted"),
                output_event(2, vec![vec![4]], FinishReason::EndId, true),
            ],
            &tok,
        );

        assert_eq!(finished.len(), 2);
        let failed = finished.iter().find(|r| r.request_id == 1).unwrap();
        assert_eq!(failed.finish_reasons, vec![FinishReason::Error; 2]);
        assert_eq!(failed.error.as_deref(), Some("kv cache exhausted"));

        let ok = finished.iter().find(|r| r.request_id == 2).unwrap();
        assert!(!ok.is_error());
        assert_eq!(ok.output_tokens, vec![vec![3, 4]]);
        assert_eq!(ok.finish_reasons, vec![FinishReason::EndId]);
    }

    #[test]
    fn undecodable_beam_is_marked_as_error() {
        let tok = word_level_tokenizer();
        let mut agg = ResponseAggregator::new();
        agg.track(3, ticket(2, false));
        agg.merge(output_event(
            3,
            vec![vec![3], vec![50_000]],
            FinishReason::Length,
            true,
        ));

        let result = agg.finalize(3, &tok).unwrap();
        assert_eq!(result.finish_reasons[0], FinishReason::Length);
        assert_eq!(result.finish_reasons[1], FinishReason::Error);
        assert!(result.error.unwrap().contains("beam 1"));
    }

    #[test]
    fn log_probs_follow_the_request_option() {
        let tok = word_level_tokenizer();
        let mut agg = ResponseAggregator::new();
        agg.track(4, ticket(1, true));
        agg.track(5, ticket(1, false));

        for id in [4, 5] {
            let mut event = output_event(id, vec![vec![3, 4]], FinishReason::Length, true);
            if let ResponseBody::Output(out) = &mut event.body {
                out.log_probs = Some(vec![vec![-0.1, -0.2]]);
            }
            agg.merge(event);
        }

        let with = agg.finalize(4, &tok).unwrap();
        assert_eq!(with.log_probs, Some(vec![vec![-0.1, -0.2]]));
        let without = agg.finalize(5, &tok).unwrap();
        assert_eq!(without.log_probs, None);
        assert!(without.to_record().output_logprobs.is_none());
    }

    #[test]
    fn unknown_and_abandoned_ids_are_ignored() {
        let mut agg = ResponseAggregator::new();
        assert_eq!(
            agg.merge(output_event(9, vec![vec![3]], FinishReason::Running, false)),
            MergeOutcome::Ignored
        );

        agg.track(9, ticket(1, false));
        assert!(!agg.track(9, ticket(1, false)));
        assert!(agg.abandon(9));
        assert_eq!(
            agg.merge(output_event(9, vec![vec![3]], FinishReason::Running, false)),
            MergeOutcome::Ignored
        );
        assert_eq!(agg.outstanding(), 0);
    }
}
