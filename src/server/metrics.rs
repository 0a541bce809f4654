use std::time::Instant;

/// Counters reported by `STATUS`.
#[derive(Debug)]
pub struct ServerMetrics {
    started: Instant,
    pub total_commands: u64,
    pub total_errors: u64,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            total_commands: 0,
            total_errors: 0,
            submitted: 0,
            completed: 0,
            failed: 0,
        }
    }
}

impl ServerMetrics {
    pub fn record_command(&mut self, success: bool) {
        self.total_commands += 1;
        if !success {
            self.total_errors += 1;
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

pub(crate) fn log_event(event: &str, client_id: usize, ticket: Option<u64>, detail: &str) {
    let ticket = ticket.map_or_else(|| "-".to_string(), |t| t.to_string());
    tracing::info!(
        event,
        client_id,
        ticket = %ticket,
        detail,
        "server event"
    );
}
