//! FIFO read gate
//!
//! When several threads share one file handle (NFS re-entrancy), the
//! engine serializes them by logical offset: each reader announces the
//! offset it wants, sleeps until the stream position reaches it, and
//! releases the next waiter when done. This keeps the underlying DAL
//! stream sequential without a close/reopen per call.
//!
//! Closing the gate wakes every waiter with an error.

use parking_lot::{Condvar, Mutex};

use marfs_core::error::{Error, Result};

struct GateState {
    /// Current logical read position
    position: u64,
    /// Offsets of waiting readers, in arrival order
    waiters: Vec<u64>,
    /// A reader currently holds the stream
    busy: bool,
    /// Gate has been closed; all waiters fail
    closed: bool,
}

/// Offset-keyed FIFO wait queue for shared readers.
pub struct ReadGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl ReadGate {
    /// New gate positioned at offset zero.
    pub fn new() -> Self {
        ReadGate {
            state: Mutex::new(GateState {
                position: 0,
                waiters: Vec::new(),
                busy: false,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Block until the stream position equals `offset` and no other
    /// reader is in flight. Sequential readers pass straight through;
    /// a reader at the wrong offset waits until a completing reader
    /// advances the position to match (or the gate closes).
    ///
    /// A reader whose offset can never be reached (behind the current
    /// position) is admitted immediately as well; the stream layer
    /// handles the reposition; the gate only orders the queue.
    pub fn wait_turn(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.waiters.push(offset);
        loop {
            if state.closed {
                remove_waiter(&mut state.waiters, offset);
                return Err(Error::Fatal("read gate closed".to_string()));
            }
            let eligible = !state.busy
                && (state.position == offset
                    || offset < state.position
                    || !state.waiters.iter().any(|w| *w == state.position));
            if eligible && is_front_most_eligible(&state, offset) {
                remove_waiter(&mut state.waiters, offset);
                state.busy = true;
                return Ok(());
            }
            self.cv.wait(&mut state);
        }
    }

    /// Finish a read, advancing the position and releasing the next
    /// waiter.
    pub fn complete(&self, new_position: u64) {
        let mut state = self.state.lock();
        state.position = new_position;
        state.busy = false;
        drop(state);
        self.cv.notify_all();
    }

    /// Wake every pending reader with an error; used at handle release.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.state.lock().position
    }
}

impl Default for ReadGate {
    fn default() -> Self {
        ReadGate::new()
    }
}

fn remove_waiter(waiters: &mut Vec<u64>, offset: u64) {
    if let Some(idx) = waiters.iter().position(|w| *w == offset) {
        waiters.remove(idx);
    }
}

/// Among waiters that could run now, FIFO order wins: the earliest-queued
/// matching waiter goes first, so a matching-offset reader is never
/// starved by a late discontiguous one.
fn is_front_most_eligible(state: &GateState, offset: u64) -> bool {
    if offset == state.position {
        // the first waiter at the exact position has priority
        return state
            .waiters
            .iter()
            .find(|w| **w == state.position)
            .map_or(false, |w| *w == offset);
    }
    // no exact-match waiter exists; the front of the queue proceeds
    state.waiters.first() == Some(&offset)
}
