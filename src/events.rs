// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Named condition-variable events used for all manager coordination.

use std::sync::{Condvar, MutexGuard};
use std::time::Duration;

/// A named condition variable paired with the manager mutex.
///
/// Waiters must re-check their predicate under the returned guard; an
/// `Event` carries no state of its own.
#[derive(Debug)]
pub(crate) struct Event {
    name: &'static str,
    cond: Condvar,
}

impl Event {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            cond: Condvar::new(),
        }
    }

    /// Wake one waiter.
    pub(crate) fn signal(&self) {
        log::trace!("event {}: signal", self.name);
        self.cond.notify_one();
    }

    /// Wake every waiter.
    pub(crate) fn broadcast(&self) {
        log::trace!("event {}: broadcast", self.name);
        self.cond.notify_all();
    }

    /// Release `guard` and sleep until signaled.
    pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        log::trace!("event {}: wait", self.name);
        self.cond.wait(guard).expect("manager mutex poisoned")
    }

    /// Release `guard` and sleep until signaled or `timeout` elapses.
    /// Returns the reacquired guard and whether the wait timed out.
    pub(crate) fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        log::trace!("event {}: wait timeout={timeout:?}", self.name);
        let (guard, result) = self
            .cond
            .wait_timeout(guard, timeout)
            .expect("manager mutex poisoned");
        (guard, result.timed_out())
    }
}

#[cfg(test)]
mod test {
    use super::Event;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn signal_wakes_a_waiter() {
        static EVENT: Event = Event::new("TEST_SIGNAL");
        let state = Arc::new(Mutex::new(false));

        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                let mut guard = state.lock().unwrap();
                while !*guard {
                    guard = EVENT.wait(guard);
                }
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        *state.lock().unwrap() = true;
        EVENT.broadcast();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_expiry() {
        static EVENT: Event = Event::new("TEST_TIMEOUT");
        let state = Mutex::new(());
        let guard = state.lock().unwrap();
        let (_guard, timed_out) = EVENT.wait_timeout(guard, Duration::from_millis(5));
        assert!(timed_out);
    }
}
