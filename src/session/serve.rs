//! Continuous operation: requests arrive at any time, are admitted when the
//! engine has room, and are reported as soon as they finish.

use std::collections::VecDeque;
use std::time::Instant;

use crate::engine::RequestId;
use crate::error::{EngineError, Result, SessionError};

use super::{GenerationRequest, GenerationResult, InferenceSession, SubmitOutcome};

/// Caller-facing handle for a queued request: its correlation id.
pub type Ticket = u64;

#[derive(Debug)]
pub enum ServeEvent {
    Admitted {
        ticket: Ticket,
        request_id: RequestId,
    },
    /// The engine was full; the request stays at the head of the queue and is
    /// retried after a growing delay.
    Deferred { ticket: Ticket, attempts: u32 },
    Finished(GenerationResult),
    /// The request will never run: the engine refused it outright, or the
    /// optional admission limit was reached. Other requests are unaffected.
    Failed { ticket: Ticket, reason: String },
}

#[derive(Debug)]
struct Queued {
    request: GenerationRequest,
    attempts: u32,
    not_before: Instant,
}

#[derive(Debug, Default)]
pub struct ServeLoop {
    queue: VecDeque<Queued>,
    ticks: u64,
}

impl ServeLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: GenerationRequest) -> Ticket {
        let ticket = request.correlation_id;
        self.queue.push_back(Queued {
            request,
            attempts: 0,
            not_before: Instant::now(),
        });
        ticket
    }

    /// Waiting for admission, not yet handed to the engine.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queued(&self, ticket: Ticket) -> bool {
        self.queue.iter().any(|q| q.request.correlation_id == ticket)
    }

    pub fn cancel_queued(&mut self, ticket: Ticket) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.request.correlation_id != ticket);
        self.queue.len() != before
    }

    /// One iteration: try to admit the head of the queue, then poll the engine
    /// once for `server_poll_timeout`. Only engine-level failures are errors.
    pub fn tick(&mut self, session: &mut InferenceSession) -> Result<Vec<ServeEvent>> {
        self.ticks += 1;
        let mut events = Vec::new();

        if let Some(event) = self.admit_head(session)? {
            events.push(event);
        }

        let timeout = session.settings.server_poll_timeout();
        let (_, finished) = session.collect(timeout);
        events.extend(finished.into_iter().map(ServeEvent::Finished));
        Ok(events)
    }

    fn admit_head(&mut self, session: &mut InferenceSession) -> Result<Option<ServeEvent>> {
        let now = Instant::now();
        match self.queue.front() {
            Some(head) if head.not_before <= now => {}
            _ => return Ok(None),
        }
        let Some(mut queued) = self.queue.pop_front() else {
            return Ok(None);
        };
        queued.attempts += 1;
        let ticket = queued.request.correlation_id;

        match session.submit(queued.request) {
            Ok(SubmitOutcome::Admitted { request_id, .. }) => {
                Ok(Some(ServeEvent::Admitted { ticket, request_id }))
            }
            Ok(SubmitOutcome::Rejected(back)) => {
                let attempts = queued.attempts;
                let settings = session.settings();
                if settings.serve_admission_limit.is_some_and(|limit| attempts >= limit) {
                    let reason = SessionError::AdmissionExhausted {
                        correlation_id: ticket,
                        attempts,
                    }
                    .to_string();
                    tracing::warn!(ticket, attempts, "request dropped at admission limit");
                    return Ok(Some(ServeEvent::Failed { ticket, reason }));
                }
                let delay = settings.admission_backoff(attempts);
                tracing::trace!(ticket, attempts, delay_ms = delay.as_millis() as u64, "engine full");
                self.queue.push_front(Queued {
                    request: back,
                    attempts,
                    not_before: now + delay,
                });
                Ok(Some(ServeEvent::Deferred { ticket, attempts }))
            }
            Err(SessionError::Engine(EngineError::Enqueue(reason))) => {
                tracing::warn!(ticket, %reason, "engine refused request");
                Ok(Some(ServeEvent::Failed { ticket, reason }))
            }
            Err(e) => Err(e),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
