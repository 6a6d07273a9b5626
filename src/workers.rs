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

//! Worker pool: N long-lived threads executing work items off the event
//! loop.
//!
//! Workers block on a channel fed by the watch thread (and by direct
//! dependency-free submissions). Each item runs through a wrapper that logs
//! begin/end and reports completion back under the manager lock, which
//! clears `WORK_ACTIVE` and wakes the watch.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use crate::connection::Connection;
use crate::mgr::{run_con_task, Conmgr};
use crate::work::{JobKind, Work, WorkArgs};

/// One dispatched unit: the work plus the connection it may own.
pub(crate) struct Dispatch {
    pub work: Work,
    pub con: Option<Arc<Mutex<Connection>>>,
}

/// Handles to the spawned worker threads.
#[derive(Debug, Default)]
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers consuming from `queue`.
    pub(crate) fn spawn(count: usize, queue: Receiver<Dispatch>, mgr: Conmgr) -> Self {
        let mut handles = Vec::with_capacity(count);
        for id in 1..=count {
            let queue = queue.clone();
            let mgr = mgr.clone();
            let handle = std::thread::Builder::new()
                .name(format!("conmgr-wrk-{id}"))
                .spawn(move || worker_loop(id, queue, mgr))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self { handles }
    }

    /// Wait for every worker to exit. Callers must have disconnected the
    /// work channel first or this blocks forever.
    pub(crate) fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(id: usize, queue: Receiver<Dispatch>, mgr: Conmgr) {
    log::trace!("worker [{id}] started");

    // A closed channel is the shutdown signal.
    while let Ok(dispatch) = queue.recv() {
        wrap_work(&mgr, dispatch);
    }

    log::trace!("worker [{id}] shutting down");
}

/// Run one work item and notify the manager when it completes.
fn wrap_work(mgr: &Conmgr, dispatch: Dispatch) {
    let Dispatch { work, con } = dispatch;
    let name = work.name();
    let status = work.status;

    match con {
        Some(con_arc) => {
            let mut con = con_arc.lock().expect("connection mutex poisoned");
            log::trace!(
                "[{}] BEGIN func={name} status={}",
                con.name(),
                status.as_str()
            );

            execute(mgr, work, Some(&mut con));

            log::trace!("[{}] END func={name}", con.name());

            let id = con.id;
            let summary = con.summary();
            drop(con);
            mgr.complete_con_work(id, summary);
        }
        None => {
            log::trace!("BEGIN func={name} status={}", status.as_str());
            execute(mgr, work, None);
            log::trace!("END func={name}");
            mgr.complete_work();
        }
    }
}

fn execute(mgr: &Conmgr, work: Work, con: Option<&mut Connection>) {
    let status = work.status;
    match work.kind {
        JobKind::User(callback) => {
            (callback.func)(mgr, WorkArgs { status, con });
        }
        JobKind::Signal(func, _) => {
            func(mgr, WorkArgs { status, con });
        }
        JobKind::Task(task) => {
            let con = con.expect("connection task dispatched without connection");
            run_con_task(mgr, con, task, status);
        }
    }
}
