//! TCP front end for server mode.
//!
//! A single-threaded mio loop: the network is polled without waiting, then the
//! serve loop ticks once, and the engine poll inside that tick is the only
//! place the thread blocks.

mod client;
mod commands;
mod io;
mod metrics;

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use serde::Serialize;
use session_protocol::{response_data, AdmittedEvent, RejectedEvent, ResultRecord};

use crate::engine::RequestId;
use crate::error::Result;
use crate::session::{InferenceSession, ServeEvent, ServeLoop, Ticket};

pub use client::Client;
pub use io::{handle_read, handle_write};
pub use metrics::ServerMetrics;

use metrics::log_event;

const SERVER: Token = Token(0);

/// How a ticket ended, kept for `FETCH` until fetched, cancelled or evicted.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done(ResultRecord),
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Queued,
    Running(RequestId),
    Finished,
    Unknown,
}

/// Everything the command handlers and the tick share.
pub struct ServerState {
    pub session: InferenceSession,
    pub serve: ServeLoop,
    pub metrics: ServerMetrics,
    owners: HashMap<Ticket, usize>,
    running: HashMap<RequestId, Ticket>,
    retained: HashMap<Ticket, Outcome>,
    /// Retained tickets, oldest first.
    retained_order: VecDeque<Ticket>,
    shutdown: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(session: InferenceSession, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            session,
            serve: ServeLoop::new(),
            metrics: ServerMetrics::default(),
            owners: HashMap::new(),
            running: HashMap::new(),
            retained: HashMap::new(),
            retained_order: VecDeque::new(),
            shutdown,
        }
    }

    pub fn ticket_state(&self, ticket: Ticket) -> TicketState {
        if self.retained.contains_key(&ticket) {
            return TicketState::Finished;
        }
        if let Some((&request_id, _)) = self.running.iter().find(|(_, t)| **t == ticket) {
            return TicketState::Running(request_id);
        }
        if self.serve.is_queued(ticket) {
            return TicketState::Queued;
        }
        TicketState::Unknown
    }

    pub fn take_outcome(&mut self, ticket: Ticket) -> Option<Outcome> {
        let outcome = self.retained.remove(&ticket)?;
        self.retained_order.retain(|&t| t != ticket);
        Some(outcome)
    }

    /// Forgets a ticket wherever it is. An admitted request keeps running in
    /// the engine but its output is discarded.
    pub fn cancel(&mut self, ticket: Ticket) -> bool {
        let cancelled = match self.ticket_state(ticket) {
            TicketState::Queued => self.serve.cancel_queued(ticket),
            TicketState::Running(request_id) => {
                self.running.remove(&request_id);
                self.session.abandon(request_id)
            }
            TicketState::Finished => self.take_outcome(ticket).is_some(),
            TicketState::Unknown => false,
        };
        if cancelled {
            self.owners.remove(&ticket);
        }
        cancelled
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn retained(&self) -> usize {
        self.retained.len()
    }

    fn register_owner(&mut self, ticket: Ticket, client_id: usize) {
        self.owners.insert(ticket, client_id);
    }

    /// Drops a disconnected client's claims. Its requests keep running and
    /// their outcomes stay fetchable.
    pub fn forget_client(&mut self, client_id: usize) {
        self.owners.retain(|_, owner| *owner != client_id);
    }

    fn retain_outcome(&mut self, ticket: Ticket, outcome: Outcome) {
        self.owners.remove(&ticket);
        let capacity = self.session.settings().max_retained_results;
        if capacity == 0 {
            return;
        }
        if self.retained.insert(ticket, outcome).is_none() {
            self.retained_order.push_back(ticket);
        }
        while self.retained.len() > capacity {
            let Some(oldest) = self.retained_order.pop_front() else {
                break;
            };
            if self.retained.remove(&oldest).is_some() {
                tracing::debug!(ticket = oldest, "unfetched outcome evicted");
            }
        }
    }

    /// Runs one serve tick and routes its events to the owning clients.
    pub fn tick(&mut self, clients: &mut HashMap<Token, Client>, poll: &Poll) -> Result<()> {
        let events = self.serve.tick(&mut self.session)?;
        for event in events {
            match event {
                ServeEvent::Admitted { ticket, request_id } => {
                    self.running.insert(request_id, ticket);
                    let frame = data_frame(
                        "admitted",
                        &AdmittedEvent {
                            correlation_id: ticket,
                            request_id,
                        },
                    );
                    self.notify(ticket, frame, clients, poll);
                }
                ServeEvent::Deferred { ticket, attempts } => {
                    tracing::debug!(ticket, attempts, "admission deferred");
                }
                ServeEvent::Finished(result) => {
                    let ticket = result.correlation_id;
                    self.running.remove(&result.request_id);
                    if result.is_error() {
                        self.metrics.failed += 1;
                    } else {
                        self.metrics.completed += 1;
                    }
                    let record = result.to_record();
                    let frame = data_frame("result", &record);
                    self.notify(ticket, frame, clients, poll);
                    self.retain_outcome(ticket, Outcome::Done(record));
                }
                ServeEvent::Failed { ticket, reason } => {
                    self.metrics.failed += 1;
                    let frame = data_frame(
                        "rejected",
                        &RejectedEvent {
                            correlation_id: ticket,
                            error: reason.clone(),
                        },
                    );
                    self.notify(ticket, frame, clients, poll);
                    self.retain_outcome(ticket, Outcome::Rejected(reason));
                }
            }
        }
        Ok(())
    }

    fn notify(
        &self,
        ticket: Ticket,
        frame: Option<Vec<u8>>,
        clients: &mut HashMap<Token, Client>,
        poll: &Poll,
    ) {
        let (Some(frame), Some(&owner)) = (frame, self.owners.get(&ticket)) else {
            return;
        };
        let token = Token(owner);
        let Some(client) = clients.get_mut(&token) else {
            return;
        };
        client.outbox.push(&frame);
        if let Err(e) = poll.registry().reregister(
            &mut client.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            // The frame stays queued and goes out with the next reply.
            tracing::warn!(client_id = owner, ticket, error = %e, "cannot arm client for writing");
        }
    }
}

fn data_frame<T: Serialize>(kind: &str, value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(json) => Some(response_data(kind, &json)),
        Err(e) => {
            tracing::error!(kind, error = %e, "cannot serialize event");
            None
        }
    }
}

/// Serves until `shutdown` is set (by a `SHUTDOWN` command or externally), then
/// flushes pending replies and shuts the engine down.
pub fn run_server(
    session: InferenceSession,
    listener: StdTcpListener,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let mut server = TcpListener::from_std(listener);

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);
    poll.registry()
        .register(&mut server, SERVER, Interest::READABLE)?;

    let mut clients: HashMap<Token, Client> = HashMap::new();
    let mut unique_token = Token(SERVER.0 + 1);
    let mut state = ServerState::new(session, shutdown);

    tracing::info!(%addr, "session server listening");

    while !state.shutdown_requested() {
        poll.poll(&mut events, Some(Duration::ZERO))?;

        for event in events.iter() {
            match event.token() {
                SERVER => loop {
                    match server.accept() {
                        Ok((mut stream, peer)) => {
                            let token = unique_token;
                            unique_token.0 += 1;
                            log_event("connect", token.0, None, &peer.to_string());
                            poll.registry()
                                .register(&mut stream, token, Interest::READABLE)?;
                            clients.insert(token, Client::new(stream));
                        }
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                },
                token => {
                    let Some(client) = clients.get_mut(&token) else {
                        continue;
                    };
                    let mut should_close = false;
                    if event.is_readable() && handle_read(client, &mut state, token.0) {
                        should_close = true;
                    }
                    if !should_close && !client.outbox.is_empty() {
                        if handle_write(client) {
                            should_close = true;
                        } else {
                            let interest = if client.outbox.is_empty() {
                                Interest::READABLE
                            } else {
                                Interest::READABLE | Interest::WRITABLE
                            };
                            poll.registry()
                                .reregister(&mut client.stream, token, interest)?;
                        }
                    }
                    if should_close {
                        log_event("disconnect", token.0, None, "");
                        clients.remove(&token);
                        state.forget_client(token.0);
                    }
                }
            }
        }

        if state.shutdown_requested() {
            break;
        }
        state.tick(&mut clients, &poll)?;
    }

    for client in clients.values_mut() {
        let _ = handle_write(client);
    }
    tracing::info!(
        queued = state.serve.queued(),
        outstanding = state.session.outstanding(),
        "server stopping"
    );
    state.session.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{LoopbackEngine, LoopbackLauncher};
    use crate::session::{PromptInput, RequestOptions};
    use crate::settings::SessionSettings;
    use crate::testing::{word_level_tokenizer, write_engine_dir};

    fn loopback_state(max_retained_results: usize) -> ServerState {
        let config = EngineConfig::builder()
            .max_beam_width(1)
            .max_batch_size(8)
            .max_num_tokens(256)
            .build()
            .unwrap();
        let tokenizer = word_level_tokenizer();
        let engine = LoopbackEngine::new(&config, tokenizer.end_id());
        let settings = SessionSettings {
            server_poll_timeout_ms: 0,
            max_retained_results,
            ..SessionSettings::default()
        };
        let session = InferenceSession::from_parts(config, settings, tokenizer, Box::new(engine));
        ServerState::new(session, Arc::new(AtomicBool::new(false)))
    }

    fn submit_for(state: &mut ServerState, client_id: usize) -> Ticket {
        let options = RequestOptions {
            max_new_tokens: 2,
            ..RequestOptions::default()
        };
        let request = state
            .session
            .build_request(PromptInput::TokenIds(vec![2, 3]), &options)
            .unwrap();
        let ticket = state.serve.enqueue(request);
        state.register_owner(ticket, client_id);
        ticket
    }

    #[test]
    fn unfetched_outcomes_are_bounded_and_release_their_owner() {
        let mut state = loopback_state(2);
        let poll = Poll::new().unwrap();
        let mut clients = HashMap::new();

        let tickets: Vec<Ticket> = (0..5).map(|_| submit_for(&mut state, 7)).collect();
        for _ in 0..20 {
            state.tick(&mut clients, &poll).unwrap();
        }

        assert_eq!(state.metrics.completed, 5);
        assert_eq!(state.retained(), 2);
        assert!(state.owners.is_empty());
        assert_eq!(state.ticket_state(tickets[0]), TicketState::Unknown);
        assert_eq!(state.ticket_state(tickets[2]), TicketState::Unknown);
        assert_eq!(state.ticket_state(tickets[4]), TicketState::Finished);
        assert!(matches!(state.take_outcome(tickets[4]), Some(Outcome::Done(_))));
        assert_eq!(state.retained(), 1);
    }

    #[test]
    fn zero_retention_keeps_nothing() {
        let mut state = loopback_state(0);
        let poll = Poll::new().unwrap();
        let mut clients = HashMap::new();

        let ticket = submit_for(&mut state, 3);
        for _ in 0..5 {
            state.tick(&mut clients, &poll).unwrap();
        }
        assert_eq!(state.metrics.completed, 1);
        assert_eq!(state.retained(), 0);
        assert_eq!(state.ticket_state(ticket), TicketState::Unknown);
    }

    #[test]
    fn disconnect_forgets_only_that_clients_tickets() {
        let mut state = loopback_state(4);
        let first = submit_for(&mut state, 7);
        let second = submit_for(&mut state, 8);
        let third = submit_for(&mut state, 7);

        state.forget_client(7);
        assert_eq!(state.owners.len(), 1);
        assert_eq!(state.owners.get(&second), Some(&8));
        assert!(!state.owners.contains_key(&first));
        assert!(!state.owners.contains_key(&third));
        // Queued work keeps running without its owner.
        assert_eq!(state.serve.queued(), 3);
    }

    fn read_until(peer: &mut TcpStream, needle: &str, seen: &mut String) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut chunk = [0u8; 4096];
        while !seen.contains(needle) {
            assert!(Instant::now() < deadline, "timed out waiting for {needle:?}, got {seen:?}");
            match peer.read(&mut chunk) {
                Ok(0) => panic!("server closed the connection; got {seen:?}"),
                Ok(n) => seen.push_str(&String::from_utf8_lossy(&chunk[..n])),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    #[test]
    fn submit_streams_result_and_shutdown_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        write_engine_dir(dir.path(), 4, 1);
        let engine_dir = dir.path().to_path_buf();

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = std::thread::spawn(move || {
            let settings = SessionSettings {
                server_poll_timeout_ms: 1,
                ..SessionSettings::default()
            };
            let session = InferenceSession::initialize(&engine_dir, settings, &LoopbackLauncher)?;
            run_server(session, listener, flag)
        });

        let mut peer = TcpStream::connect(addr).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

        let body = br#"{"text":"hello world","max_new_tokens":3}"#;
        peer.write_all(format!("SUBMIT c1 {}\n", body.len()).as_bytes())
            .unwrap();
        peer.write_all(body).unwrap();

        let mut seen = String::new();
        read_until(&mut peer, "+OK SUBMIT", &mut seen);
        read_until(&mut peer, "DATA admitted", &mut seen);
        read_until(&mut peer, "\"finish_reason\":[\"length\"]", &mut seen);
        assert!(seen.contains("\"correlation_id\":1"));
        assert!(seen.contains("DATA result"));

        peer.write_all(b"FETCH c1 1\n1").unwrap();
        read_until(&mut peer, "+OK RESULT", &mut seen);

        peer.write_all(b"SHUTDOWN c1 0\n").unwrap();
        read_until(&mut peer, "+OK SHUTDOWN", &mut seen);

        handle.join().unwrap().unwrap();
        assert!(shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn external_stop_flag_ends_idle_server() {
        let dir = tempfile::tempdir().unwrap();
        write_engine_dir(dir.path(), 1, 1);
        let engine_dir = dir.path().to_path_buf();
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = std::thread::spawn(move || {
            let session = InferenceSession::initialize(
                &engine_dir,
                SessionSettings::default(),
                &LoopbackLauncher,
            )?;
            run_server(session, listener, flag)
        });

        std::thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }
}
