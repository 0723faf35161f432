//! Stdin event source
//!
//! Reads one JSON event per line from stdin, for integration testing and
//! replay: `python atom_replay.py | pulsed --config metrics.json --stdin`.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tracing::info;

use crate::types::event::Event;

use super::{EventSource, TransportError};

/// Event source that reads newline-delimited JSON events from stdin.
pub struct StdinEventSource {
    reader: Option<BufReader<Stdin>>,
    connected: bool,
    line_buffer: String,
}

impl StdinEventSource {
    pub fn new() -> Self {
        Self {
            reader: None,
            connected: false,
            line_buffer: String::with_capacity(2048),
        }
    }

    fn parse_line(line: &str) -> Result<Event, TransportError> {
        serde_json::from_str::<Event>(line)
            .map(Event::normalized)
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

impl Default for StdinEventSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSource for StdinEventSource {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        self.reader = Some(BufReader::new(tokio::io::stdin()));
        self.connected = true;
        info!("Stdin event source connected - waiting for JSON events");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.reader = None;
        self.connected = false;
        Ok(())
    }

    async fn read(&mut self) -> Result<Event, TransportError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionFailed("not connected".to_string()))?;

        loop {
            self.line_buffer.clear();
            let bytes_read = reader
                .read_line(&mut self.line_buffer)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            if bytes_read == 0 {
                self.connected = false;
                return Err(TransportError::Closed);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            return Self::parse_line(line);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
