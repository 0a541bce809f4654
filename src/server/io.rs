use std::io::{self, Read, Write};

use session_protocol::response_err_code;

use super::client::Client;
use super::commands::execute_command;
use super::ServerState;

/// Drains the socket, then runs every complete command. Returns true when the
/// connection should be closed.
pub fn handle_read(client: &mut Client, state: &mut ServerState, client_id: usize) -> bool {
    let mut chunk = [0; 4096];
    let mut closed = false;
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => client.decoder.feed(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                return true;
            }
            Err(e) => {
                tracing::warn!(client_id, error = %e, "read failed");
                return true;
            }
        }
    }

    while let Some(decoded) = client.decoder.next_command() {
        match decoded {
            Ok(command) => execute_command(client, command, state, client_id),
            Err(e) => {
                state.metrics.record_command(false);
                client.outbox.push(&response_err_code("BAD_HEADER", &e.to_string()));
            }
        }
    }
    closed
}

/// Returns true when the connection should be closed.
pub fn handle_write(client: &mut Client) -> bool {
    while !client.outbox.is_empty() {
        match client.stream.write(client.outbox.front()) {
            Ok(0) => return true,
            Ok(n) => client.outbox.consume(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
    false
}
