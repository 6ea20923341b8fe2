//! # Streamer
//!
//! Per-connection outbound queue. Any number of subscriptions push prepared
//! frames into it; exactly one writer drains it.
//!
//! The queue, the inbound control slot, and the closed flag live under one
//! mutex. Every state change is followed by a single `notify_one`, and a
//! stored permit guarantees the writer never misses a wakeup that lands
//! between its check and its wait.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use super::msg::PreparedMessage;

/// Producer-side view of a streamer, used by publishers.
pub trait Outbox: Send + Sync {
    /// Append a batch of frames with a single wakeup
    fn push_batch(&self, msgs: Vec<PreparedMessage>);

    /// Close the streamer and wake the writer
    fn close(&self);

    /// Whether the streamer is closed
    fn is_closed(&self) -> bool;
}

/// What woke the writer.
#[derive(Debug)]
pub enum Wakeup<C> {
    /// Streamer closed; the writer must exit
    Closed,
    /// A control message arrived from the reader; queued frames were discarded
    Inbound(C),
    /// Frames to write
    Messages(Vec<PreparedMessage>),
}

#[derive(Debug)]
struct StreamerState<C> {
    msgs: Vec<PreparedMessage>,
    inbound: VecDeque<C>,
    closed: bool,
    signals: u64,
}

/// Outbound queue for one connection, generic over the inbound control message.
#[derive(Debug)]
pub struct Streamer<C> {
    state: Mutex<StreamerState<C>>,
    notify: Notify,
}

impl<C> Default for Streamer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Streamer<C> {
    /// Create an open, empty streamer
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamerState {
                msgs: Vec::new(),
                inbound: VecDeque::new(),
                closed: false,
                signals: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamerState<C>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal(&self, state: &mut StreamerState<C>) {
        state.signals += 1;
        self.notify.notify_one();
    }

    /// Hand a control message from the reader to the writer
    pub fn push_inbound(&self, msg: C) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.inbound.push_back(msg);
        self.signal(&mut state);
    }

    /// Drop frames queued so far
    pub fn discard_pending(&self) -> usize {
        let mut state = self.lock();
        std::mem::take(&mut state.msgs).len()
    }

    /// Number of queued frames
    pub fn pending(&self) -> usize {
        self.lock().msgs.len()
    }

    /// Number of wakeups issued so far
    pub fn signal_count(&self) -> u64 {
        self.lock().signals
    }

    /// Take queued frames without waiting
    pub fn take_pending(&self) -> Vec<PreparedMessage> {
        std::mem::take(&mut self.lock().msgs)
    }

    /// Block until the streamer is closed, a control message arrives, or
    /// frames are queued.
    pub async fn wait(&self) -> Wakeup<C> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return Wakeup::Closed;
                }
                if let Some(msg) = state.inbound.pop_front() {
                    state.msgs.clear();
                    return Wakeup::Inbound(msg);
                }
                if !state.msgs.is_empty() {
                    return Wakeup::Messages(std::mem::take(&mut state.msgs));
                }
            }
            self.notify.notified().await;
        }
    }
}

impl<C: Send> Outbox for Streamer<C> {
    fn push_batch(&self, msgs: Vec<PreparedMessage>) {
        if msgs.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.msgs.extend(msgs);
        self.signal(&mut state);
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.signal(&mut state);
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
