//! In-process engine that replays prompt tokens as output.
//!
//! Beam `b` of a request emits `prompt[(step + b) % prompt.len()]` at each step,
//! so the output is fully determined by the input. It honours the admission
//! limit, streaming, log-prob and input-echo options so the session can be
//! driven end to end without accelerator hardware.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use super::{EngineLauncher, EngineOutput, FinishReason, GenerationEngine, RequestId, Response, ResponseBody};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::session::GenerationRequest;
use crate::tokenizer::TokenId;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackLauncher;

impl EngineLauncher for LoopbackLauncher {
    fn launch(
        &self,
        engine_dir: &Path,
        config: &EngineConfig,
        end_id: TokenId,
    ) -> Result<Box<dyn GenerationEngine>, EngineError> {
        let engine_files = std::fs::read_dir(engine_dir)
            .map_err(|e| EngineError::Launch(format!("{}: {}", engine_dir.display(), e)))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "engine"))
            .count();
        tracing::info!(
            engine_dir = %engine_dir.display(),
            engine_files,
            max_batch_size = config.max_batch_size,
            max_beam_width = config.max_beam_width,
            participants = config.parallel.participant_count,
            "loopback engine launched"
        );
        Ok(Box::new(LoopbackEngine::new(config, end_id)))
    }
}

struct ActiveRequest {
    id: RequestId,
    request: GenerationRequest,
    generated: Vec<Vec<TokenId>>,
    finish: Vec<FinishReason>,
    step: usize,
    echoed_input: bool,
}

impl ActiveRequest {
    fn new(id: RequestId, request: GenerationRequest) -> Self {
        let beams = request.num_beams as usize;
        Self {
            id,
            request,
            generated: vec![Vec::new(); beams],
            finish: vec![FinishReason::Running; beams],
            step: 0,
            echoed_input: false,
        }
    }

    fn is_done(&self) -> bool {
        self.finish.iter().all(|r| r.is_terminal())
    }

    /// Advances every running beam by one token and returns the new token per
    /// beam (empty for beams that had already finished).
    fn advance(&mut self) -> Vec<Vec<TokenId>> {
        let prompt = &self.request.input_token_ids;
        let min_tokens = self.request.sampling.min_tokens.unwrap_or(1) as usize;
        let mut delta = vec![Vec::new(); self.generated.len()];

        for beam in 0..self.generated.len() {
            if self.finish[beam].is_terminal() {
                continue;
            }
            let token = prompt[(self.step + beam) % prompt.len()];
            self.generated[beam].push(token);
            delta[beam].push(token);

            let produced = self.generated[beam].len();
            if token == self.request.end_id && produced >= min_tokens {
                self.finish[beam] = FinishReason::EndId;
            } else if produced >= self.request.max_new_tokens as usize {
                self.finish[beam] = FinishReason::Length;
            }
        }
        self.step += 1;
        delta
    }

    fn log_probs_for(&self, tokens: &[Vec<TokenId>], first_step: usize) -> Vec<Vec<f32>> {
        tokens
            .iter()
            .enumerate()
            .map(|(beam, beam_tokens)| {
                (0..beam_tokens.len())
                    .map(|i| synthetic_log_prob(first_step + i, beam))
                    .collect()
            })
            .collect()
    }

    fn with_input_prefix(&mut self, mut tokens: Vec<Vec<TokenId>>) -> Vec<Vec<TokenId>> {
        if self.request.output.exclude_input_from_output || self.echoed_input {
            return tokens;
        }
        self.echoed_input = true;
        for beam in tokens.iter_mut() {
            let mut prefixed = self.request.input_token_ids.clone();
            prefixed.append(beam);
            *beam = prefixed;
        }
        tokens
    }
}

fn synthetic_log_prob(step: usize, beam: usize) -> f32 {
    -(0.05 * (step as f32 + 1.0)) - 0.01 * beam as f32
}

pub struct LoopbackEngine {
    max_batch_size: usize,
    max_beam_width: u32,
    next_id: RequestId,
    active: Vec<ActiveRequest>,
    shut_down: bool,
}

impl LoopbackEngine {
    /// `end_id` is carried on each request; the launcher signature passes it
    /// for engines that bake it into their runtime instead.
    pub fn new(config: &EngineConfig, _end_id: TokenId) -> Self {
        Self {
            max_batch_size: config.max_batch_size as usize,
            max_beam_width: config.max_beam_width,
            next_id: 0,
            active: Vec::new(),
            shut_down: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    fn step_request(active: &mut ActiveRequest) -> Option<Response> {
        let first_step = active.step;
        let delta = active.advance();
        let done = active.is_done();

        let tokens = if active.request.streaming {
            delta
        } else if done {
            active.generated.clone()
        } else {
            return None;
        };

        let log_probs = if active.request.output.return_log_probs {
            let start = if active.request.streaming { first_step } else { 0 };
            Some(active.log_probs_for(&tokens, start))
        } else {
            None
        };
        let output_token_ids = active.with_input_prefix(tokens);

        Some(Response {
            request_id: active.id,
            body: ResponseBody::Output(EngineOutput {
                output_token_ids,
                log_probs,
                finish_reasons: active.finish.clone(),
                is_final: done,
            }),
        })
    }
}

impl GenerationEngine for LoopbackEngine {
    fn can_enqueue(&self) -> bool {
        !self.shut_down && self.active.len() < self.max_batch_size
    }

    fn enqueue(&mut self, request: GenerationRequest) -> Result<RequestId, EngineError> {
        if self.shut_down {
            return Err(EngineError::Shutdown);
        }
        if self.active.len() >= self.max_batch_size {
            return Err(EngineError::Enqueue(format!(
                "batch is full ({} in flight)",
                self.active.len()
            )));
        }
        if request.num_beams > self.max_beam_width {
            return Err(EngineError::Enqueue(format!(
                "num_beams {} exceeds max_beam_width {}",
                request.num_beams, self.max_beam_width
            )));
        }
        if request.input_token_ids.is_empty() {
            return Err(EngineError::Enqueue("empty input".to_string()));
        }

        self.next_id += 1;
        let id = self.next_id;
        tracing::trace!(request_id = id, correlation_id = request.correlation_id, "enqueued");
        self.active.push(ActiveRequest::new(id, request));
        Ok(id)
    }

    fn await_responses(&mut self, timeout: Duration) -> Vec<Response> {
        if self.active.is_empty() {
            if !timeout.is_zero() {
                thread::sleep(timeout);
            }
            return Vec::new();
        }

        // Non-streaming requests report nothing until they finish, so keep
        // stepping until something is reportable or the timeout runs out.
        let deadline = Instant::now() + timeout;
        loop {
            let responses: Vec<Response> = self
                .active
                .iter_mut()
                .filter_map(Self::step_request)
                .collect();
            self.active.retain(|a| !a.is_done());
            if !responses.is_empty() || self.active.is_empty() || Instant::now() >= deadline {
                return responses;
            }
        }
    }

    fn shutdown(&mut self) {
        if !self.shut_down {
            tracing::debug!(abandoned = self.active.len(), "loopback engine shutting down");
        }
        self.shut_down = true;
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{OutputOptions, SamplingParams};

    fn config(max_batch_size: i64, max_beam_width: i64) -> EngineConfig {
        EngineConfig::builder()
            .max_batch_size(max_batch_size)
            .max_beam_width(max_beam_width)
            .max_num_tokens(256)
            .build()
            .unwrap()
    }

    fn request(prompt: Vec<TokenId>, max_new_tokens: u32, streaming: bool) -> GenerationRequest {
        GenerationRequest {
            correlation_id: 0,
            input_token_ids: prompt,
            max_new_tokens,
            streaming,
            num_beams: 1,
            sampling: SamplingParams::default(),
            output: OutputOptions {
                return_log_probs: false,
                exclude_input_from_output: true,
            },
            priority: 0.5,
            end_id: 1,
        }
    }

    fn outputs(responses: &[Response]) -> Vec<&EngineOutput> {
        responses
            .iter()
            .map(|r| match &r.body {
                ResponseBody::Output(o) => o,
                ResponseBody::Error(e) => panic!("unexpected error: {e}"),
            })
            .collect()
    }

    #[test]
    fn streaming_emits_one_token_per_step_until_length() {
        let mut engine = LoopbackEngine::new(&config(4, 1), 1);
        let id = engine.enqueue(request(vec![5, 6, 7], 4, true)).unwrap();

        let mut tokens = Vec::new();
        let mut last = None;
        for _ in 0..4 {
            let responses = engine.await_responses(Duration::ZERO);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].request_id, id);
            let out = outputs(&responses)[0].clone();
            tokens.extend(out.output_token_ids[0].iter().copied());
            last = Some(out);
        }
        let last = last.unwrap();
        assert!(last.is_final);
        assert_eq!(last.finish_reasons, vec![FinishReason::Length]);
        assert_eq!(tokens, vec![5, 6, 7, 5]);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn end_id_in_prompt_stops_generation() {
        let mut engine = LoopbackEngine::new(&config(4, 1), 1);
        engine.enqueue(request(vec![5, 1, 7], 10, false)).unwrap();

        assert!(engine.await_responses(Duration::ZERO).is_empty());
        let responses = engine.await_responses(Duration::ZERO);
        let out = outputs(&responses)[0];
        assert!(out.is_final);
        assert_eq!(out.output_token_ids, vec![vec![5, 1]]);
        assert_eq!(out.finish_reasons, vec![FinishReason::EndId]);
    }

    #[test]
    fn admission_is_bounded_by_batch_size() {
        let mut engine = LoopbackEngine::new(&config(2, 1), 1);
        assert!(engine.can_enqueue());
        engine.enqueue(request(vec![3], 2, true)).unwrap();
        engine.enqueue(request(vec![3], 2, true)).unwrap();
        assert!(!engine.can_enqueue());
        assert!(engine.enqueue(request(vec![3], 2, true)).is_err());

        engine.await_responses(Duration::ZERO);
        engine.await_responses(Duration::ZERO);
        assert!(engine.can_enqueue());
    }

    #[test]
    fn beams_are_offset_and_width_is_enforced() {
        let mut engine = LoopbackEngine::new(&config(2, 2), 1);
        let mut req = request(vec![4, 5, 6], 2, false);
        req.num_beams = 3;
        assert!(engine.enqueue(req.clone()).is_err());

        req.num_beams = 2;
        engine.enqueue(req).unwrap();
        engine.await_responses(Duration::ZERO);
        let responses = engine.await_responses(Duration::ZERO);
        let out = outputs(&responses)[0];
        assert_eq!(out.output_token_ids, vec![vec![4, 5], vec![5, 6]]);
    }

    #[test]
    fn input_is_echoed_once_and_log_probs_cover_generated_tokens() {
        let mut engine = LoopbackEngine::new(&config(1, 1), 1);
        let mut req = request(vec![8, 9], 2, true);
        req.output = OutputOptions {
            return_log_probs: true,
            exclude_input_from_output: false,
        };
        engine.enqueue(req).unwrap();

        let first = engine.await_responses(Duration::ZERO);
        let out = outputs(&first)[0];
        assert_eq!(out.output_token_ids, vec![vec![8, 9, 8]]);
        assert_eq!(out.log_probs.as_ref().unwrap()[0].len(), 1);

        let second = engine.await_responses(Duration::ZERO);
        let out = outputs(&second)[0];
        assert_eq!(out.output_token_ids, vec![vec![9]]);
        assert!(out.log_probs.as_ref().unwrap()[0][0] < 0.0);
    }

    #[test]
    fn shutdown_refuses_further_work() {
        let mut engine = LoopbackEngine::new(&config(2, 1), 1);
        engine.enqueue(request(vec![3], 5, true)).unwrap();
        engine.shutdown();
        engine.shutdown();
        assert!(!engine.can_enqueue());
        assert!(matches!(
            engine.enqueue(request(vec![3], 5, true)),
            Err(EngineError::Shutdown)
        ));
        assert!(engine.await_responses(Duration::ZERO).is_empty());
    }

    #[test]
    fn non_streaming_poll_waits_for_the_final_output() {
        let mut engine = LoopbackEngine::new(&config(1, 1), 1);
        engine.enqueue(request(vec![5, 6], 6, false)).unwrap();

        let responses = engine.await_responses(Duration::from_secs(5));
        let out = outputs(&responses)[0];
        assert!(out.is_final);
        assert_eq!(out.output_token_ids, vec![vec![5, 6, 5, 6, 5, 6]]);
        assert_eq!(engine.in_flight(), 0);
    }
}
