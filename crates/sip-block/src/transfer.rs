//! Handles for in-flight asynchronous block transfers.
//!
//! The transport that actually moves bytes between processes lives outside
//! this crate. Blocks only need to know whether a transfer touching their
//! buffer has completed ([`AsyncTransfer::test`]) and how to block until it
//! does ([`AsyncTransfer::wait`]).
//!
//! [`transfer_channel`] provides an in-process implementation: the
//! [`TransferCompleter`] half is handed to whatever finishes the transfer
//! and the [`PendingTransfer`] half is attached to the block.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// A non-blocking send or receive whose buffer must outlive it.
pub trait AsyncTransfer: Send + fmt::Debug {
    /// Non-blocking completion poll.
    fn test(&mut self) -> bool;

    /// Block until the transfer completes.
    fn wait(&mut self);
}

#[derive(Debug, Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Waiting half of [`transfer_channel`].
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    shared: Arc<Completion>,
}

/// Completing half of [`transfer_channel`].
#[derive(Debug, Clone)]
pub struct TransferCompleter {
    shared: Arc<Completion>,
}

/// Create a linked completer/pending pair.
#[must_use]
pub fn transfer_channel() -> (TransferCompleter, PendingTransfer) {
    let shared = Arc::new(Completion::default());
    (
        TransferCompleter {
            shared: Arc::clone(&shared),
        },
        PendingTransfer { shared },
    )
}

impl TransferCompleter {
    /// Mark the transfer complete and wake every waiter.
    pub fn complete(&self) {
        let mut done = self.shared.done.lock();
        *done = true;
        drop(done);
        self.shared.cond.notify_all();
    }
}

impl AsyncTransfer for PendingTransfer {
    fn test(&mut self) -> bool {
        *self.shared.done.lock()
    }

    fn wait(&mut self) {
        let mut done = self.shared.done.lock();
        while !*done {
            self.shared.cond.wait(&mut done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reports_completion() {
        let (completer, mut pending) = transfer_channel();
        assert!(!pending.test());
        completer.complete();
        assert!(pending.test());
    }

    #[test]
    fn wait_blocks_until_completed_elsewhere() {
        let (completer, mut pending) = transfer_channel();
        let handle = thread::spawn(move || completer.complete());
        pending.wait();
        assert!(pending.test());
        handle.join().expect("completer thread");
    }
}
