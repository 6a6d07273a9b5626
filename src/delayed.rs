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

//! Delayed-work bookkeeping.
//!
//! The watch folds the shortest pending deadline into its poll timeout and
//! promotes due items when it wakes; promoting an item is just clearing its
//! TIME_DELAY bit so the usual classification takes over.

use std::time::Instant;

use crate::work::{Depend, Work, WorkStatus};

/// Shortest absolute deadline among pending delayed work.
pub(crate) fn next_deadline(delayed: &[Work]) -> Option<Instant> {
    delayed.iter().filter_map(|work| work.control.time_begin).min()
}

/// Pull every item whose deadline has passed, ordered by deadline, with the
/// TIME_DELAY dependency bit cleared so each runs normally.
pub(crate) fn take_due(delayed: &mut Vec<Work>, now: Instant) -> Vec<Work> {
    let mut due = Vec::new();
    let mut index = 0;

    while index < delayed.len() {
        let begin = delayed[index]
            .control
            .time_begin
            .expect("delayed work without a wake time");
        if begin <= now {
            due.push(delayed.swap_remove(index));
        } else {
            index += 1;
        }
    }

    due.sort_by_key(|work| work.control.time_begin);
    for work in &mut due {
        debug_assert_eq!(WorkStatus::Pending, work.status);
        work.control.depend = work.control.depend.without(Depend::TIME_DELAY);
    }

    log::trace!("delayed work: {} due, {} deferred", due.len(), delayed.len());
    due
}

/// Flush the whole list with CANCELLED status in a single pass.
pub(crate) fn cancel_all(delayed: &mut Vec<Work>) -> Vec<Work> {
    if delayed.is_empty() {
        return Vec::new();
    }

    log::debug!("cancelling {} delayed work items", delayed.len());

    let mut cancelled = std::mem::take(delayed);
    for work in &mut cancelled {
        work.status = WorkStatus::Cancelled;
        work.control.depend = work.control.depend.without(Depend::TIME_DELAY);
    }
    cancelled
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::work::{Callback, JobKind, WorkControl};
    use std::time::Duration;

    fn delayed_at(begin: Instant) -> Work {
        Work {
            con: None,
            kind: JobKind::User(Callback::new("test_delayed", |_, _| {})),
            control: WorkControl::delayed_abs(begin),
            status: WorkStatus::Pending,
        }
    }

    #[test]
    fn due_items_come_out_in_deadline_order() {
        let now = Instant::now();
        let mut delayed = vec![
            delayed_at(now - Duration::from_millis(5)),
            delayed_at(now + Duration::from_secs(60)),
            delayed_at(now - Duration::from_millis(20)),
            delayed_at(now - Duration::from_millis(10)),
        ];

        let due = take_due(&mut delayed, now);
        assert_eq!(3, due.len());
        assert_eq!(1, delayed.len());

        let times: Vec<_> = due.iter().map(|w| w.control.time_begin.unwrap()).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(sorted, times);

        for work in &due {
            assert!(!work.control.depend.contains(Depend::TIME_DELAY));
        }
    }

    #[test]
    fn next_deadline_is_the_minimum() {
        let now = Instant::now();
        let delayed = vec![
            delayed_at(now + Duration::from_secs(20)),
            delayed_at(now + Duration::from_secs(5)),
            delayed_at(now + Duration::from_secs(10)),
        ];

        assert_eq!(Some(now + Duration::from_secs(5)), next_deadline(&delayed));
        assert_eq!(None, next_deadline(&[]));
    }

    #[test]
    fn cancel_flushes_everything_as_cancelled() {
        let now = Instant::now();
        let mut delayed = vec![
            delayed_at(now + Duration::from_secs(5)),
            delayed_at(now + Duration::from_secs(10)),
        ];

        let cancelled = cancel_all(&mut delayed);
        assert!(delayed.is_empty());
        assert_eq!(2, cancelled.len());
        assert!(cancelled.iter().all(|w| w.status == WorkStatus::Cancelled));
    }
}
