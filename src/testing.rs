//! Shared fixtures for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use tokenizers::Tokenizer;

use crate::config::CONFIG_FILE_NAME;
use crate::engine::{EngineOutput, FinishReason, GenerationEngine, RequestId, Response, ResponseBody};
use crate::error::EngineError;
use crate::session::GenerationRequest;
use crate::tokenizer::{TokenId, TokenizerSession, TOKENIZER_FILE_NAME};

/// Word-level vocabulary: `<unk>`=0, `</s>`=1, then hello world what is deep
/// learning ? as 2..=8.
pub fn word_level_json() -> String {
    r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 1, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "WhitespaceSplit"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "<unk>": 0,
      "</s>": 1,
      "hello": 2,
      "world": 3,
      "what": 4,
      "is": 5,
      "deep": 6,
      "learning": 7,
      "?": 8
    },
    "unk_token": "<unk>"
  }
}"#
    .to_string()
}

pub fn word_level_tokenizer() -> TokenizerSession {
    let tokenizer = Tokenizer::from_str(&word_level_json()).expect("fixture tokenizer parses");
    TokenizerSession::from_tokenizer(tokenizer)
}

/// Writes `config.json` and `tokenizer.json` into `dir`.
pub fn write_engine_dir(dir: &Path, max_batch_size: u32, max_beam_width: u32) {
    let config = format!(
        r#"{{"build_config":{{"max_beam_width":{},"max_batch_size":{},"max_num_tokens":4096}}}}"#,
        max_beam_width, max_batch_size
    );
    fs::write(dir.join(CONFIG_FILE_NAME), config).expect("write config.json");
    fs::write(dir.join(TOKENIZER_FILE_NAME), word_level_json()).expect("write tokenizer.json");
}

pub fn output_event(
    request_id: RequestId,
    tokens: Vec<Vec<TokenId>>,
    reason: FinishReason,
    is_final: bool,
) -> Response {
    let finish_reasons = vec![reason; tokens.len()];
    Response {
        request_id,
        body: ResponseBody::Output(EngineOutput {
            output_token_ids: tokens,
            log_probs: None,
            finish_reasons,
            is_final,
        }),
    }
}

pub fn error_event(request_id: RequestId, message: &str) -> Response {
    Response {
        request_id,
        body: ResponseBody::Error(message.to_string()),
    }
}

/// Observable state behind a [`ScriptedEngine`].
#[derive(Debug)]
pub struct ScriptState {
    pub admit: bool,
    /// Admit only while fewer than this many requests have been enqueued.
    pub capacity: Option<usize>,
    /// Admission checks that answer "full" before `admit` applies.
    pub reject_next: u32,
    pub admission_checks: u32,
    pub enqueued: Vec<(RequestId, GenerationRequest)>,
    /// Handed out one batch per poll.
    pub batches: VecDeque<Vec<Response>>,
    pub polls: u32,
    pub next_id: RequestId,
    pub shut_down: bool,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            admit: true,
            capacity: None,
            reject_next: 0,
            admission_checks: 0,
            enqueued: Vec::new(),
            batches: VecDeque::new(),
            polls: 0,
            next_id: 100,
            shut_down: false,
        }
    }
}

/// Engine double whose admission answers and response batches are set by the
/// test. The state handle stays with the test after the engine is boxed.
pub struct ScriptedEngine {
    state: Rc<RefCell<ScriptState>>,
}

impl ScriptedEngine {
    pub fn new() -> (Self, Rc<RefCell<ScriptState>>) {
        let state = Rc::new(RefCell::new(ScriptState::default()));
        (
            Self {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl GenerationEngine for ScriptedEngine {
    fn can_enqueue(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.admission_checks += 1;
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return false;
        }
        let has_room = state.capacity.map_or(true, |c| state.enqueued.len() < c);
        state.admit && has_room && !state.shut_down
    }

    fn enqueue(&mut self, request: GenerationRequest) -> Result<RequestId, EngineError> {
        let mut state = self.state.borrow_mut();
        if state.shut_down {
            return Err(EngineError::Shutdown);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.enqueued.push((id, request));
        Ok(id)
    }

    fn await_responses(&mut self, _timeout: Duration) -> Vec<Response> {
        let mut state = self.state.borrow_mut();
        state.polls += 1;
        state.batches.pop_front().unwrap_or_default()
    }

    fn shutdown(&mut self) {
        self.state.borrow_mut().shut_down = true;
    }
}
