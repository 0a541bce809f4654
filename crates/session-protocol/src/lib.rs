//! Wire types shared by the session server and its clients.
//!
//! A command is a single header line `VERB <tag> <content-length>\n` followed by
//! exactly `content-length` bytes of body. Replies are either control lines
//! (`+OK` / `-ERR`) or pushed `DATA` frames carrying a JSON document.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty header")]
    EmptyHeader,
    #[error("unknown opcode: {0}")]
    UnknownOpcode(String),
    #[error("invalid content length '{0}'")]
    InvalidLength(String),
    #[error("content length {len} exceeds limit {limit}")]
    BodyTooLarge { len: usize, limit: usize },
    #[error("header line longer than {limit} bytes")]
    HeaderTooLong { limit: usize },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Largest body a single command may carry.
pub const MAX_BODY_BYTES: usize = 1 << 20;

/// Longest header line accepted while waiting for its newline.
pub const MAX_HEADER_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Ping,
    Submit,
    Fetch,
    Cancel,
    Status,
    Shutdown,
}

impl OpCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Ping => "PING",
            OpCode::Submit => "SUBMIT",
            OpCode::Fetch => "FETCH",
            OpCode::Cancel => "CANCEL",
            OpCode::Status => "STATUS",
            OpCode::Shutdown => "SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: OpCode,
    pub tag: String,
    pub content_length: usize,
}

impl CommandHeader {
    /// Parses the header line: "VERB tag length".
    /// Example: "SUBMIT client_01 42"
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts.is_empty() {
            return Err(ProtocolError::EmptyHeader);
        }

        let opcode = match parts[0].to_uppercase().as_str() {
            "PING" => OpCode::Ping,
            "SUBMIT" => OpCode::Submit,
            "FETCH" => OpCode::Fetch,
            "CANCEL" => OpCode::Cancel,
            "STATUS" => OpCode::Status,
            "SHUTDOWN" => OpCode::Shutdown,
            _ => return Err(ProtocolError::UnknownOpcode(parts[0].to_string())),
        };

        // Bare verbs (e.g. PING) carry no tag and no body.
        let tag = if parts.len() > 1 {
            parts[1].to_string()
        } else {
            "anon".to_string()
        };

        let content_length = if parts.len() > 2 {
            parts[2]
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidLength(parts[2].to_string()))?
        } else {
            0
        };

        if content_length > MAX_BODY_BYTES {
            return Err(ProtocolError::BodyTooLarge {
                len: content_length,
                limit: MAX_BODY_BYTES,
            });
        }

        Ok(CommandHeader {
            opcode,
            tag,
            content_length,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub header: CommandHeader,
    pub body: Vec<u8>,
}

/// Reassembles commands from the byte stream of one connection.
///
/// Input may arrive in arbitrary pieces. A header that fails to parse is
/// reported once and skipped, and decoding resumes at the next line.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    inbound: Vec<u8>,
    awaiting_body: Option<CommandHeader>,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Bytes received that do not yet form a complete command.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// The next complete command or header error, `None` when more input is needed.
    pub fn next_command(&mut self) -> Option<Result<Command, ProtocolError>> {
        loop {
            if let Some(header) = self.awaiting_body.take() {
                if self.inbound.len() < header.content_length {
                    self.awaiting_body = Some(header);
                    return None;
                }
                let body = self.inbound.drain(..header.content_length).collect();
                return Some(Ok(Command { header, body }));
            }

            let Some(newline) = self.inbound.iter().position(|&b| b == b'\n') else {
                if self.inbound.len() > MAX_HEADER_BYTES {
                    self.inbound.clear();
                    return Some(Err(ProtocolError::HeaderTooLong {
                        limit: MAX_HEADER_BYTES,
                    }));
                }
                return None;
            };
            let raw: Vec<u8> = self.inbound.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match CommandHeader::parse(line) {
                Ok(header) => self.awaiting_body = Some(header),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Reply bytes for one connection, drained as the socket accepts them.
#[derive(Debug, Default)]
pub struct Outbox {
    bytes: VecDeque<u8>,
}

impl Outbox {
    pub fn push(&mut self, frame: &[u8]) {
        self.bytes.extend(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// The next contiguous run of bytes to write.
    pub fn front(&self) -> &[u8] {
        self.bytes.as_slices().0
    }

    /// Marks `n` bytes from the front as written.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n);
    }
}

/// `+OK <CODE> <len>\r\n<body>`
pub fn response_ok_code(code: &str, body: &str) -> Vec<u8> {
    let mut out = format!("+OK {} {}\r\n", code, body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

pub fn response_err_code(code: &str, msg: &str) -> Vec<u8> {
    format!("-ERR {} {}\r\n", code, msg.replace(['\r', '\n'], " ")).into_bytes()
}

/// Pushed frame: `DATA <kind> <len>\r\n<payload>`
pub fn response_data(kind: &str, data: &[u8]) -> Vec<u8> {
    let mut vec = format!("DATA {} {}\r\n", kind, data.len()).into_bytes();
    vec.extend_from_slice(data);
    vec
}

/// Why a beam stopped (or that it has not stopped yet).
///
/// The set is closed: `Running` is the only non-terminal value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Running,
    EndId,
    Length,
    Error,
}

impl FinishReason {
    pub fn label(&self) -> &'static str {
        match self {
            FinishReason::Running => "running",
            FinishReason::EndId => "end_id",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FinishReason::Running)
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Optional decoding controls accepted over the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingPayload {
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub length_penalty: Option<f32>,
    #[serde(default)]
    pub min_tokens: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Body of a `SUBMIT` command. Exactly one of `text` / `token_ids` is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub token_ids: Option<Vec<u32>>,
    #[serde(default)]
    pub max_new_tokens: Option<u32>,
    #[serde(default)]
    pub streaming: Option<bool>,
    #[serde(default)]
    pub num_beams: Option<u32>,
    #[serde(default)]
    pub return_log_probs: Option<bool>,
    #[serde(default)]
    pub priority: Option<f32>,
    #[serde(default)]
    pub sampling: Option<SamplingPayload>,
}

impl SubmitPayload {
    pub fn from_json(body: &[u8]) -> Result<Self, ProtocolError> {
        let payload: SubmitPayload = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        match (&payload.text, &payload.token_ids) {
            (Some(_), Some(_)) => Err(ProtocolError::InvalidPayload(
                "give either 'text' or 'token_ids', not both".to_string(),
            )),
            (None, None) => Err(ProtocolError::InvalidPayload(
                "one of 'text' or 'token_ids' is required".to_string(),
            )),
            _ => Ok(payload),
        }
    }
}

/// Structured output for one finished request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub request_id: u64,
    pub output_tokens: Vec<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_logprobs: Option<Vec<Vec<f32>>>,
    pub finish_reason: Vec<FinishReason>,
    pub generated_text: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pushed to the submitting client once the engine admits a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmittedEvent {
    pub correlation_id: u64,
    pub request_id: u64,
}

/// Pushed when a request will never run, e.g. the engine stayed full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEvent {
    pub correlation_id: u64,
    pub error: String,
}

/// Answer to a `SUBMIT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub correlation_id: u64,
}
