//! Event transport pipeline
//!
//! The evaluation core is synchronous and single-threaded; this module is
//! the async shell that feeds it. An [`EventSource`] produces events (the
//! stdin source reads one JSON event per line), and [`run_loop`] drives
//! them into the manager under its lock, in arrival order. The core never
//! reorders by timestamp.

mod stdin_source;

pub use stdin_source::StdinEventSource;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::manager::MetricsManager;
use crate::types::event::Event;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("source connection failed: {0}")]
    ConnectionFailed(String),

    #[error("source closed")]
    Closed,

    #[error("malformed event: {0}")]
    Malformed(String),
}

/// A source of atom events driven by the daemon's transport task.
#[async_trait]
pub trait EventSource: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn disconnect(&mut self) -> Result<(), TransportError>;
    /// Next event. `Err(Closed)` ends the pipeline; malformed input is
    /// reported but does not.
    async fn read(&mut self) -> Result<Event, TransportError>;
    fn is_connected(&self) -> bool;
}

/// Drive events from `source` into `manager` until the source closes.
/// Returns the number of events delivered.
pub async fn run_loop(
    mut source: Box<dyn EventSource>,
    manager: Arc<Mutex<MetricsManager>>,
) -> Result<u64, TransportError> {
    source.connect().await?;
    let mut delivered: u64 = 0;
    loop {
        match source.read().await {
            Ok(event) => {
                if let Ok(mut manager) = manager.lock() {
                    manager.deliver_event(&event);
                    delivered += 1;
                }
            }
            Err(TransportError::Closed) => break,
            Err(TransportError::Malformed(reason)) => {
                warn!(reason, "Skipping malformed event");
            }
            Err(e) => {
                source.disconnect().await.ok();
                return Err(e);
            }
        }
    }
    source.disconnect().await.ok();
    info!(delivered, "Event source closed");
    Ok(delivered)
}
