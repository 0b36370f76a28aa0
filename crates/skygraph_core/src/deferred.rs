/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One-shot single-producer cells used by the indexer's fan-out stages.
//! A stage publishes its result with `done`, or gives up with `cancel`;
//! any number of sibling stages block in `get` until one or the other.

use std::sync::{Condvar, Mutex};

enum State<T> {
    Pending,
    Ready(T),
    Cancelled,
}

pub struct Deferred<T: Clone> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        Deferred {
            state: Mutex::new(State::Pending),
            ready: Condvar::new(),
        }
    }

    /// Publish the value. First write wins; done after cancel is a no-op.
    pub fn done(&self, value: T) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::Pending) {
            *state = State::Ready(value);
            self.ready.notify_all();
        }
    }

    /// Close without a value. Idempotent; does not override a published
    /// value.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::Pending) {
            *state = State::Cancelled;
            self.ready.notify_all();
        }
    }

    /// Block until the cell resolves. Repeated calls return the same
    /// result.
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        while matches!(*state, State::Pending) {
            state = self.ready.wait(state).unwrap();
        }
        match &*state {
            State::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Guard that cancels the cell when dropped, mirroring the
    /// produce-or-cancel contract of every fan-out stage.
    pub fn cancel_guard(&self) -> CancelGuard<'_, T> {
        CancelGuard { cell: self }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CancelGuard<'a, T: Clone> {
    cell: &'a Deferred<T>,
}

impl<T: Clone> Drop for CancelGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn get_blocks_until_done() {
        let cell = Arc::new(Deferred::new());
        let producer = cell.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.done(7i64);
        });
        assert_eq!(cell.get(), Some(7));
        assert_eq!(cell.get(), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn cancel_unblocks_with_none() {
        let cell = Arc::new(Deferred::<i64>::new());
        let producer = cell.clone();
        let handle = thread::spawn(move || producer.cancel());
        assert_eq!(cell.get(), None);
        handle.join().unwrap();
    }

    #[test]
    fn cancel_is_idempotent_and_done_sticks() {
        let cell = Deferred::new();
        cell.done(vec![1i64, 2]);
        cell.cancel();
        cell.cancel();
        assert_eq!(cell.get(), Some(vec![1, 2]));
    }

    #[test]
    fn guard_cancels_on_drop() {
        let cell = Deferred::<i64>::new();
        {
            let _guard = cell.cancel_guard();
        }
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn guard_does_not_override_done() {
        let cell = Deferred::<i64>::new();
        {
            let _guard = cell.cancel_guard();
            cell.done(3);
        }
        assert_eq!(cell.get(), Some(3));
    }
}
