//! Per-session inbound queues used by the bus consumer.
//!
//! A lane holds the envelopes of one session that arrived while an earlier one
//! was being processed. It is bounded like a bus subscription: when full, the
//! oldest pending envelope is discarded. The worker draining a lane closes it
//! once the queue is empty, and the router opens a fresh lane on the next
//! envelope for that session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use clawgate_types::Envelope;
use tracing::debug;

struct LaneState {
    queue: VecDeque<Envelope>,
    closed: bool,
}

pub(crate) struct Lane {
    capacity: usize,
    state: Mutex<LaneState>,
}

/// Outcome of [`Lane::push`].
#[derive(Debug)]
pub(crate) enum Pushed {
    /// Queued without loss.
    Queued,
    /// Queued; the lane was full and this older envelope was discarded.
    Displaced(Envelope),
    /// The lane's worker has exited; the envelope is handed back.
    Closed(Envelope),
}

impl Lane {
    /// Open a lane holding `first`.
    pub(crate) fn new(capacity: usize, first: Envelope) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(first);
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LaneState {
                queue,
                closed: false,
            }),
        }
    }

    pub(crate) fn push(&self, envelope: Envelope) -> Pushed {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Pushed::Closed(envelope);
        }
        let displaced = if state.queue.len() >= self.capacity {
            state.queue.pop_front()
        } else {
            None
        };
        state.queue.push_back(envelope);
        match displaced {
            Some(lost) => Pushed::Displaced(lost),
            None => Pushed::Queued,
        }
    }

    /// Next envelope, or `None` after closing the lane because it is empty.
    pub(crate) fn pop(&self) -> Option<Envelope> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = state.queue.pop_front();
        if next.is_none() {
            state.closed = true;
        }
        next
    }

    /// Close the lane, discarding anything still queued. Returns how many were discarded.
    pub(crate) fn close(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        let discarded = state.queue.len();
        state.queue.clear();
        discarded
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}

/// Closes the lane when its worker exits, including when the worker is aborted.
pub(crate) struct CloseOnExit(pub(crate) Arc<Lane>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        let discarded = self.0.close();
        if discarded > 0 {
            debug!(discarded, "Session lane closed with pending envelopes");
        }
    }
}
