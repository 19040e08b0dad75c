//! The per-partition work queue: thread-safe MPSC in, single owner out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use hornet_common::error::{HornetError, HornetResult};

use crate::messages::InternalMessage;

/// Owner side of the work queue. Only the executor task polls it.
#[derive(Debug)]
pub struct WorkQueue {
    receiver: mpsc::Receiver<InternalMessage>,
    /// Messages the owner pushed back (released blocked work). Served before
    /// anything new from the channel.
    pending: VecDeque<InternalMessage>,
    interrupt: Arc<AtomicBool>,
}

/// Peer side of the work queue. Cloned to every producer.
#[derive(Debug, Clone)]
pub struct WorkSender {
    sender: mpsc::Sender<InternalMessage>,
    interrupt: Arc<AtomicBool>,
}

impl WorkQueue {
    /// Creates a connected queue/sender pair sharing a scan-interrupt flag.
    #[must_use]
    pub fn new() -> (Self, WorkSender) {
        let (sender, receiver) = mpsc::channel();
        let interrupt = Arc::new(AtomicBool::new(false));
        let queue = Self {
            receiver,
            pending: VecDeque::new(),
            interrupt: Arc::clone(&interrupt),
        };
        (queue, WorkSender { sender, interrupt })
    }

    /// Shared flag raised whenever new transactional work arrives.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Polls for the next message, waiting at most `timeout`.
    pub fn poll(&mut self, timeout: Duration) -> Option<InternalMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Polls without waiting.
    pub fn try_poll(&mut self) -> Option<InternalMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        self.receiver.try_recv().ok()
    }

    /// Pushes released messages back for processing ahead of new arrivals.
    pub fn push_back_all<I: IntoIterator<Item = InternalMessage>>(&mut self, messages: I) {
        self.pending.extend(messages);
    }

    /// Pushes one message the owner wants to process soon.
    pub fn push_back(&mut self, message: InternalMessage) {
        self.pending.push_back(message);
    }
}

impl WorkSender {
    /// Enqueues one message for the owning executor.
    ///
    /// Transactional work also raises the scan-interrupt flag so a running
    /// speculative scan yields to the new arrival.
    ///
    /// # Errors
    ///
    /// Returns an error when the owning executor is gone.
    pub fn send(&self, message: InternalMessage) -> HornetResult<()> {
        if message.interrupts_speculative_scan() {
            self.interrupt.store(true, Ordering::Release);
        }
        self.sender
            .send(message)
            .map_err(|_| HornetError::Disconnected("work queue receiver dropped"))
    }
}
