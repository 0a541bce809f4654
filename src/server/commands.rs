use session_protocol::{response_err_code, response_ok_code, Command, OpCode, SubmitAck, SubmitPayload};

use crate::session::{OutputOptions, PromptInput, RequestOptions, SamplingParams, Ticket, DEFAULT_PRIORITY};
use crate::settings::SessionSettings;

use super::client::Client;
use super::metrics::log_event;
use super::{Outcome, ServerState, TicketState};

pub fn execute_command(client: &mut Client, command: Command, state: &mut ServerState, client_id: usize) {
    let Command { header, body } = command;
    let response = match header.opcode {
        OpCode::Ping => response_ok_code("PING", "PONG"),
        OpCode::Submit => submit(&header.tag, &body, state, client_id),
        OpCode::Fetch => match parse_ticket(&body) {
            Ok(ticket) => fetch(ticket, state),
            Err(e) => response_err_code("INVALID_TICKET", &e),
        },
        OpCode::Cancel => match parse_ticket(&body) {
            Ok(ticket) if state.cancel(ticket) => {
                log_event("cancel", client_id, Some(ticket), "");
                response_ok_code("CANCEL", &format!("cancelled {}", ticket))
            }
            Ok(ticket) => response_err_code("UNKNOWN_TICKET", &format!("no request {}", ticket)),
            Err(e) => response_err_code("INVALID_TICKET", &e),
        },
        OpCode::Status => {
            let m = &state.metrics;
            response_ok_code(
                "STATUS",
                &format!(
                    "uptime_s={} total_commands={} total_errors={} submitted={} completed={} failed={} queued={} outstanding={} retained={}",
                    m.uptime_secs(),
                    m.total_commands,
                    m.total_errors,
                    m.submitted,
                    m.completed,
                    m.failed,
                    state.serve.queued(),
                    state.session.outstanding(),
                    state.retained(),
                ),
            )
        }
        OpCode::Shutdown => {
            state.request_shutdown();
            log_event("shutdown", client_id, None, "shutdown_requested=true");
            response_ok_code("SHUTDOWN", "session shutdown requested")
        }
    };

    state.metrics.record_command(response.starts_with(b"+OK"));
    client.outbox.push(&response);
}

fn submit(tag: &str, payload: &[u8], state: &mut ServerState, client_id: usize) -> Vec<u8> {
    let parsed = match SubmitPayload::from_json(payload) {
        Ok(parsed) => parsed,
        Err(e) => return response_err_code("INVALID_PAYLOAD", &e.to_string()),
    };
    let (input, options) = request_from_payload(parsed, state.session.settings());

    let request = match state.session.build_request(input, &options) {
        Ok(request) => request,
        Err(e) => return response_err_code("INVALID_REQUEST", &e.to_string()),
    };

    let ticket = state.serve.enqueue(request);
    state.register_owner(ticket, client_id);
    state.metrics.submitted += 1;
    log_event("submit", client_id, Some(ticket), tag);

    match serde_json::to_string(&SubmitAck { correlation_id: ticket }) {
        Ok(body) => response_ok_code("SUBMIT", &body),
        Err(e) => response_err_code("INTERNAL", &e.to_string()),
    }
}

fn fetch(ticket: Ticket, state: &mut ServerState) -> Vec<u8> {
    match state.ticket_state(ticket) {
        TicketState::Finished => match state.take_outcome(ticket) {
            Some(Outcome::Done(record)) => match serde_json::to_string(&record) {
                Ok(body) => response_ok_code("RESULT", &body),
                Err(e) => response_err_code("INTERNAL", &e.to_string()),
            },
            Some(Outcome::Rejected(reason)) => response_err_code("REJECTED", &reason),
            None => response_err_code("UNKNOWN_TICKET", &format!("no request {}", ticket)),
        },
        TicketState::Queued => response_err_code("NOT_READY", &format!("request {} is queued", ticket)),
        TicketState::Running(_) => {
            response_err_code("NOT_READY", &format!("request {} is running", ticket))
        }
        TicketState::Unknown => response_err_code("UNKNOWN_TICKET", &format!("no request {}", ticket)),
    }
}

fn parse_ticket(payload: &[u8]) -> Result<Ticket, String> {
    let text = String::from_utf8_lossy(payload).trim().to_string();
    if text.is_empty() {
        return Err("payload must carry a correlation id".to_string());
    }
    text.parse()
        .map_err(|_| format!("invalid correlation id '{}'", text))
}

/// Fills unset payload fields from the session defaults. Range checks happen
/// when the request is built.
pub(crate) fn request_from_payload(
    payload: SubmitPayload,
    settings: &SessionSettings,
) -> (PromptInput, RequestOptions) {
    let input = match (payload.text, payload.token_ids) {
        (Some(text), _) => PromptInput::Text(text),
        (None, Some(ids)) => PromptInput::TokenIds(ids),
        (None, None) => PromptInput::TokenIds(Vec::new()),
    };

    let sampling = payload
        .sampling
        .map(|s| SamplingParams {
            top_k: s.top_k,
            top_p: s.top_p,
            temperature: s.temperature,
            repetition_penalty: s.repetition_penalty,
            presence_penalty: s.presence_penalty,
            frequency_penalty: s.frequency_penalty,
            length_penalty: s.length_penalty,
            min_tokens: s.min_tokens,
            seed: s.seed,
        })
        .unwrap_or_default();

    let options = RequestOptions {
        max_new_tokens: payload
            .max_new_tokens
            .unwrap_or(settings.default_max_new_tokens),
        streaming: payload.streaming.unwrap_or(true),
        num_beams: payload.num_beams.unwrap_or(1),
        sampling,
        output: OutputOptions {
            return_log_probs: payload.return_log_probs.unwrap_or(false),
            exclude_input_from_output: false,
        },
        priority: payload.priority.unwrap_or(DEFAULT_PRIORITY),
    };
    (input, options)
}
