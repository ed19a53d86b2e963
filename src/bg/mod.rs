//! Background maintenance: a cooperative token and a thread wrapper.
//!
//! [`BgToken`] is a baton passed between a foreground holder and a
//! background task. The background side [`BgToken::acquire`]s the token to
//! work on shared state and releases it when done; the foreground side
//! [`BgToken::loan`]s the token out and [`BgToken::reclaim`]s it, blocking
//! on a condition variable (never spinning) until the background task lets
//! go.
//!
//! [`MaintenanceThread`] binds a managed dtable to a detached worker: a
//! bounded channel feeds it wake-up messages, a cooperative stop flag ends
//! it, and dropping the handle joins the thread. Each wake-up (explicit
//! [`MaintenanceThread::poke`] or the periodic tick) runs one
//! [`crate::dtable::Dtable::maintain`] pass.

#[cfg(test)]
mod tests;

use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::dtable::{Dtable, managed::ManagedDtable};

// ------------------------------------------------------------------------------------------------
// Background token
// ------------------------------------------------------------------------------------------------

/// Cooperative baton between a foreground owner and one background task.
#[derive(Debug, Default)]
pub struct BgToken {
    state: Mutex<TokenState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct TokenState {
    /// The token is available for the background side to take.
    loaned: bool,
    /// The background side currently holds the token.
    held: bool,
}

impl BgToken {
    /// A token initially held by the foreground.
    pub fn new() -> Self {
        Self::default()
    }

    /// Foreground: makes the token available to the background task.
    pub fn loan(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.loaned = true;
            self.cond.notify_all();
        }
    }

    /// Foreground: takes the token back, blocking until the background
    /// task has released it.
    pub fn reclaim(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.loaned = false;
            while state.held {
                match self.cond.wait(state) {
                    Ok(next) => state = next,
                    Err(_) => return,
                }
            }
        }
    }

    /// Background: takes the token if it is on loan. Returns whether it was
    /// acquired.
    pub fn acquire(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if !state.loaned || state.held {
            return false;
        }
        state.held = true;
        true
    }

    /// Background: blocks until the token is on loan, then takes it.
    pub fn acquire_wait(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        loop {
            if state.loaned && !state.held {
                state.held = true;
                return;
            }
            match self.cond.wait(state) {
                Ok(next) => state = next,
                Err(_) => return,
            }
        }
    }

    /// Background: hands the token back, waking a reclaiming foreground.
    pub fn release(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.held = false;
            self.cond.notify_all();
        }
    }

    /// Whether the background side holds the token right now.
    pub fn held(&self) -> bool {
        self.state.lock().map(|state| state.held).unwrap_or(false)
    }
}

// ------------------------------------------------------------------------------------------------
// Maintenance thread
// ------------------------------------------------------------------------------------------------

enum BgMsg {
    /// Run a maintenance pass now.
    Wake,
}

/// Detached worker running periodic maintenance for one managed dtable.
///
/// Joined (after a cooperative stop) when dropped.
pub struct MaintenanceThread {
    sender: Sender<BgMsg>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceThread {
    /// Spawns a worker that calls `maintain(false)` on `table` every
    /// `period` and on every [`MaintenanceThread::poke`].
    pub fn spawn(table: Arc<ManagedDtable>, period: Duration) -> Self {
        let (sender, receiver): (Sender<BgMsg>, Receiver<BgMsg>) = bounded(4);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            debug!("maintenance thread started");
            loop {
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }
                match receiver.recv_timeout(period) {
                    Ok(BgMsg::Wake) | Err(RecvTimeoutError::Timeout) => {
                        if stop_flag.load(Ordering::Acquire) {
                            break;
                        }
                        if let Err(error) = table.maintain(false) {
                            warn!(%error, "background maintenance failed");
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("maintenance thread stopped");
        });
        Self {
            sender,
            stop,
            handle: Some(handle),
        }
    }

    /// Requests an immediate maintenance pass (non-blocking; a full queue
    /// means one is already pending).
    pub fn poke(&self) {
        let _ = self.sender.try_send(BgMsg::Wake);
    }

    /// Whether the worker has been asked to stop.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Asks the worker to stop and joins it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.sender.try_send(BgMsg::Wake);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MaintenanceThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceThread")
            .field("stopped", &self.stop_requested())
            .finish_non_exhaustive()
    }
}
