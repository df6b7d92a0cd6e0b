//! Single-subscriber event multiplexer for one job attempt.
//!
//! The attempt publishes every event in production order. At most one
//! subscriber receives them through a bounded channel; while one is attached
//! a full channel applies backpressure to the attempt, up to the stall
//! timeout; a subscriber that stays full longer is detached. With no
//! subscriber, events are dropped. The terminal event closes the multiplexer: it is
//! delivered once, later publishes are ignored, and a subscriber that
//! attaches afterwards still receives it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::types::{EventStream, JobEvent, MultiplexerError};

/// Default subscriber channel capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Default time a publish may wait on a full subscriber channel.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Slot {
    sender: Option<mpsc::Sender<JobEvent>>,
    attached: bool,
    terminal: Option<JobEvent>,
}

/// Cheap to clone; clones share the same subscriber slot.
#[derive(Clone)]
pub struct EventMultiplexer {
    slot: Arc<Mutex<Slot>>,
    capacity: usize,
    stall_timeout: Duration,
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl std::fmt::Debug for EventMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.lock();
        f.debug_struct("EventMultiplexer")
            .field("capacity", &self.capacity)
            .field("stall_timeout", &self.stall_timeout)
            .field("attached", &slot.attached)
            .field("closed", &slot.terminal.is_some())
            .finish()
    }
}

impl EventMultiplexer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            capacity: capacity.max(1),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// How long a publish may wait on a full subscriber before detaching it.
    #[must_use]
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// A multiplexer with its subscriber already attached.
    pub fn with_subscriber(capacity: usize) -> (Self, EventStream) {
        let mux = Self::new(capacity);
        let (tx, rx) = mpsc::channel(mux.capacity);
        {
            let mut slot = mux.lock();
            slot.attached = true;
            slot.sender = Some(tx);
        }
        (mux, EventStream::new(ReceiverStream::new(rx)))
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the subscriber. Fails if one was ever attached.
    pub fn attach(&self) -> Result<EventStream, MultiplexerError> {
        let mut slot = self.lock();
        if slot.attached {
            return Err(MultiplexerError::AlreadySubscribed);
        }
        slot.attached = true;

        let (tx, rx) = mpsc::channel(self.capacity);
        if let Some(terminal) = slot.terminal.clone() {
            // Late subscriber: replay the outcome and end the stream.
            let _ = tx.try_send(terminal);
        } else {
            slot.sender = Some(tx);
        }
        drop(slot);

        debug!("Subscriber attached");
        Ok(EventStream::new(ReceiverStream::new(rx)))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Publish one event.
    ///
    /// Returns `false` once the terminal event has been published; the
    /// event is then ignored. A `true` return means the event was accepted,
    /// not that anyone received it.
    pub async fn publish(&self, event: JobEvent) -> bool {
        let sender = {
            let mut slot = self.lock();
            if slot.terminal.is_some() {
                return false;
            }
            if event.is_terminal() {
                slot.terminal = Some(event.clone());
                slot.sender.take()
            } else {
                slot.sender.clone()
            }
        };

        let Some(tx) = sender else {
            return true;
        };
        match tokio::time::timeout(self.stall_timeout, tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!("Subscriber went away, dropping further events");
                self.lock().sender = None;
            }
            Err(_) => {
                warn!(
                    stall_timeout = ?self.stall_timeout,
                    "Subscriber stalled, detaching it"
                );
                self.lock().sender = None;
            }
        }
        true
    }
}
