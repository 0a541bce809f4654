use crate::config::EngineConfig;
use crate::engine::{GenerationEngine, RequestId};
use crate::error::{EngineError, SessionError};
use crate::tokenizer::{TokenId, TokenizerSession};

use super::request::{invalid, GenerationRequest, PromptInput, RequestOptions};

/// What the session needs to remember about a request once the request itself
/// has been handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestTicket {
    pub correlation_id: u64,
    pub num_beams: u32,
    pub return_log_probs: bool,
    pub streaming: bool,
}

impl RequestTicket {
    pub fn of(request: &GenerationRequest) -> Self {
        Self {
            correlation_id: request.correlation_id,
            num_beams: request.num_beams,
            return_log_probs: request.output.return_log_probs,
            streaming: request.streaming,
        }
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Admitted {
        request_id: RequestId,
        ticket: RequestTicket,
    },
    /// The engine had no room; the caller gets the request back untouched.
    Rejected(GenerationRequest),
}

/// Builds validated requests and submits them, honouring the engine's
/// admission signal.
#[derive(Debug)]
pub struct RequestLifecycle {
    max_beam_width: u32,
    max_input_len: Option<u32>,
    max_seq_len: Option<u32>,
    end_id: TokenId,
    next_correlation_id: u64,
}

impl RequestLifecycle {
    pub fn new(config: &EngineConfig, end_id: TokenId) -> Self {
        Self {
            max_beam_width: config.max_beam_width,
            max_input_len: config.max_input_len,
            max_seq_len: config.max_seq_len,
            end_id,
            next_correlation_id: 0,
        }
    }

    pub fn build_request(
        &mut self,
        input: PromptInput,
        options: &RequestOptions,
        tokenizer: &TokenizerSession,
    ) -> Result<GenerationRequest, SessionError> {
        options.validate()?;

        let input_token_ids = match input {
            PromptInput::Text(text) => tokenizer.encode(&text)?,
            PromptInput::TokenIds(ids) => ids,
        };
        if input_token_ids.is_empty() {
            return Err(invalid("input token sequence is empty").into());
        }

        if options.num_beams > self.max_beam_width {
            return Err(invalid(format!(
                "num_beams {} exceeds max_beam_width {}",
                options.num_beams, self.max_beam_width
            ))
            .into());
        }
        let input_len = input_token_ids.len() as u64;
        if let Some(limit) = self.max_input_len {
            if input_len > u64::from(limit) {
                return Err(invalid(format!(
                    "input has {} tokens, max_input_len is {}",
                    input_len, limit
                ))
                .into());
            }
        }
        if let Some(limit) = self.max_seq_len {
            let total = input_len + u64::from(options.max_new_tokens);
            if total > u64::from(limit) {
                return Err(invalid(format!(
                    "input plus max_new_tokens is {}, max_seq_len is {}",
                    total, limit
                ))
                .into());
            }
        }

        self.next_correlation_id += 1;
        Ok(GenerationRequest {
            correlation_id: self.next_correlation_id,
            input_token_ids,
            max_new_tokens: options.max_new_tokens,
            streaming: options.streaming,
            num_beams: options.num_beams,
            sampling: options.sampling.clone(),
            output: options.output,
            priority: options.priority,
            end_id: self.end_id,
        })
    }

    /// Checks the admission signal first and never blocks. An engine error on
    /// enqueue is returned as-is; a full engine is `Rejected`.
    pub fn submit(
        &self,
        engine: &mut dyn GenerationEngine,
        request: GenerationRequest,
    ) -> Result<SubmitOutcome, EngineError> {
        if !engine.can_enqueue() {
            tracing::debug!(correlation_id = request.correlation_id, "engine full, request deferred");
            return Ok(SubmitOutcome::Rejected(request));
        }

        let ticket = RequestTicket::of(&request);
        let request_id = engine.enqueue(request)?;
        tracing::debug!(
            request_id,
            correlation_id = ticket.correlation_id,
            beams = ticket.num_beams,
            "request admitted"
        );
        Ok(SubmitOutcome::Admitted { request_id, ticket })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{word_level_tokenizer, ScriptedEngine};

    fn config() -> EngineConfig {
        EngineConfig::builder()
            .max_beam_width(2)
            .max_batch_size(4)
            .max_num_tokens(256)
            .max_input_len(Some(4))
            .max_seq_len(Some(20))
            .build()
            .unwrap()
    }

    #[test]
    fn text_is_tokenized_and_correlation_ids_increase() {
        let tok = word_level_tokenizer();
        let mut lifecycle = RequestLifecycle::new(&config(), tok.end_id());

        let first = lifecycle
            .build_request(PromptInput::Text("hello world".into()), &RequestOptions::default(), &tok)
            .unwrap();
        let second = lifecycle
            .build_request(PromptInput::TokenIds(vec![3, 4]), &RequestOptions::default(), &tok)
            .unwrap();

        assert_eq!(first.input_token_ids.len(), 2);
        assert_eq!(first.end_id, 1);
        assert_eq!(first.max_new_tokens, 17);
        assert!(second.correlation_id > first.correlation_id);
    }

    #[test]
    fn limits_are_enforced_before_submission() {
        let tok = word_level_tokenizer();
        let mut lifecycle = RequestLifecycle::new(&config(), tok.end_id());

        let wide = RequestOptions {
            num_beams: 3,
            ..RequestOptions::default()
        };
        let long_input = PromptInput::TokenIds(vec![3; 5]);
        let long_output = RequestOptions {
            max_new_tokens: 18,
            ..RequestOptions::default()
        };

        for (input, options) in [
            (PromptInput::TokenIds(vec![3]), wide),
            (long_input, RequestOptions::default()),
            (PromptInput::TokenIds(vec![3, 3, 3]), long_output),
            (PromptInput::Text(String::new()), RequestOptions::default()),
        ] {
            let err = lifecycle.build_request(input, &options, &tok).unwrap_err();
            assert!(matches!(err, SessionError::InvalidRequest(_)), "got {err:?}");
        }
    }

    #[test]
    fn full_engine_hands_the_request_back() {
        let tok = word_level_tokenizer();
        let mut lifecycle = RequestLifecycle::new(&config(), tok.end_id());
        let (mut engine, state) = ScriptedEngine::new();
        state.borrow_mut().admit = false;

        let request = lifecycle
            .build_request(PromptInput::TokenIds(vec![3]), &RequestOptions::default(), &tok)
            .unwrap();
        let correlation_id = request.correlation_id;

        match lifecycle.submit(&mut engine, request).unwrap() {
            SubmitOutcome::Rejected(back) => assert_eq!(back.correlation_id, correlation_id),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(state.borrow().enqueued.is_empty());

        state.borrow_mut().admit = true;
        let request = lifecycle
            .build_request(PromptInput::TokenIds(vec![3]), &RequestOptions::default(), &tok)
            .unwrap();
        match lifecycle.submit(&mut engine, request).unwrap() {
            SubmitOutcome::Admitted { ticket, .. } => assert_eq!(ticket.num_beams, 1),
            other => panic!("expected admission, got {other:?}"),
        }
        assert_eq!(state.borrow().enqueued.len(), 1);
    }
}
