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

//! The watch loop: the single thread that inspects connection state,
//! promotes work, computes interest sets and deadlines, polls for readiness,
//! and reaps completed connections.

use std::sync::MutexGuard;
use std::time::Instant;

use crate::connection::ConFlags;
use crate::delayed;
use crate::io::buffered_output_bytes;
use crate::mgr::{ConList, Conmgr, Mgr};
use crate::polling::{FdType, Pollctl, Readiness};
use crate::work::{ConTask, JobKind, Work, WorkControl, WorkStatus};

/// Run the watch until there is nothing left to do. Exactly one watch exists
/// at a time; [`Conmgr::run`] enforces that.
pub(crate) fn watch(mgr: Conmgr, mut pollctl: Pollctl) {
    log::debug!("watch started");
    let mut guard = mgr.lock();

    loop {
        if guard.shutdown_requested {
            // shutdown overrides any quiesce in progress
            if guard.quiesce_requested || guard.quiesce_active {
                guard.quiesce_requested = false;
                guard.quiesce_active = false;
                mgr.shared.on_stop_quiesced.broadcast();
            }
            close_all_connections(&mgr, &mut guard);
        } else if guard.quiesce_requested {
            if !guard.quiesce_active && guard.jobs_active == 0 {
                log::debug!("quiesced");
                guard.quiesce_active = true;
                mgr.shared.on_start_quiesced.broadcast();
            }
            if guard.quiesce_active {
                while guard.quiesce_active && !guard.shutdown_requested {
                    guard = mgr.shared.watch_sleep.wait(guard);
                }
                continue;
            }
        }

        // dependency-free work held back by a finished quiesce
        if !guard.quiesce_requested && !guard.quiesce_active && !guard.deferred_work.is_empty() {
            for work in std::mem::take(&mut guard.deferred_work) {
                mgr.dispatch_now_locked(&mut guard, work, None);
            }
        }

        if !guard.shutdown_requested && !guard.signal_subs.is_empty() && guard.signal_con.is_none()
        {
            mgr.ensure_signal_con(&mut guard);
        }

        let now = Instant::now();
        let mut next_deadline = delayed::next_deadline(&guard.delayed_work);
        let promote = !guard.quiesce_requested || guard.shutdown_requested;

        let active_count = guard
            .cons
            .iter()
            .filter(|(_, sched)| sched.list == ConList::Active)
            .count();

        let ids: Vec<usize> = guard.cons.iter().map(|(id, _)| id).collect();
        for id in ids {
            handle_connection(
                &mgr,
                &mut guard,
                id,
                promote,
                active_count,
                &mut pollctl,
                &mut next_deadline,
                now,
            );
        }

        reap_complete(&mut guard);

        if should_exit(&guard) {
            break;
        }

        let timeout = next_deadline.map(|deadline| deadline.saturating_duration_since(now));
        drop(guard);
        if let Err(err) = pollctl.poll(timeout) {
            log::error!("poll failed: {err}");
        }
        guard = mgr.lock();

        let mut events: Vec<(std::os::fd::RawFd, Readiness)> = Vec::new();
        pollctl.for_each_event(|fd, readiness| events.push((fd, readiness)));
        for (fd, readiness) in events {
            apply_event(&mut guard, &mut pollctl, fd, readiness);
        }

        let due = delayed::take_due(&mut guard.delayed_work, Instant::now());
        for work in due {
            mgr.handle_work_locked(&mut guard, work);
        }
    }

    log::debug!(
        "watch returning shutdown_requested={} connections={}",
        guard.shutdown_requested,
        guard.cons.len()
    );
    guard.watching = false;
    guard.pollctl = Some(pollctl);
    mgr.shared.watch_return.broadcast();
}

/// Begin closing every connection and cancel everything still pending.
fn close_all_connections(mgr: &Conmgr, guard: &mut MutexGuard<'_, Mgr>) {
    for (_, sched) in guard.cons.iter_mut() {
        sched.close_requested = true;
        for work in sched
            .work
            .iter_mut()
            .chain(sched.write_complete_work.iter_mut())
        {
            work.status = WorkStatus::Cancelled;
        }
    }

    for work in &mut guard.deferred_work {
        work.status = WorkStatus::Cancelled;
    }

    let cancelled = delayed::cancel_all(&mut guard.delayed_work);
    for work in cancelled {
        mgr.handle_work_locked(guard, work);
    }
}

/// Map connection state to the interest the poller should watch.
fn desired_polling(sched: &crate::mgr::ConSched, accept_ok: bool) -> (FdType, FdType) {
    let flags = sched.flags;

    if flags.has(ConFlags::WORK_ACTIVE)
        || flags.has(ConFlags::QUIESCE)
        || sched.list == ConList::Complete
        || sched.extract.is_some()
    {
        return (FdType::None, FdType::None);
    }

    if flags.has(ConFlags::IS_LISTEN) {
        let listen = if !flags.has(ConFlags::READ_EOF) && accept_ok {
            FdType::Listen
        } else {
            FdType::None
        };
        return (listen, FdType::None);
    }

    let input_open = sched.input_fd.is_some();
    let output_open = sched.output_fd.is_some();
    let read = input_open && !flags.has(ConFlags::READ_EOF);
    let connecting = !flags.has(ConFlags::IS_CONNECTED) && flags.has(ConFlags::IS_SOCKET);
    let write = output_open && (sched.out_count > 0 || connecting);

    if sched.input_fd == sched.output_fd && input_open {
        let combined = match (read, write) {
            (true, true) => FdType::ReadWrite,
            (true, false) => FdType::ReadOnly,
            (false, true) => FdType::WriteOnly,
            // nothing pending: only close and error still matter
            (false, false) => FdType::Connected,
        };
        return (combined, FdType::None);
    }

    (
        if read {
            FdType::ReadOnly
        } else if input_open {
            FdType::Connected
        } else {
            FdType::None
        },
        if write { FdType::WriteOnly } else { FdType::None },
    )
}

fn relink(
    pollctl: &mut Pollctl,
    fd: Option<std::os::fd::RawFd>,
    current: &mut FdType,
    desired: FdType,
    name: &str,
) {
    if *current == desired {
        return;
    }

    let Some(fd) = fd else {
        // descriptor already closed; the kernel dropped the registration
        *current = FdType::None;
        return;
    };

    let result = match (*current, desired) {
        (FdType::None, _) => pollctl.link_fd(fd, desired, name),
        (_, FdType::None) => pollctl.unlink_fd(fd, name),
        (_, _) => pollctl.relink_fd(fd, desired, name),
    };

    match result {
        Ok(()) => *current = desired,
        Err(err) => {
            log::warn!("[{name}] unable to adjust polling on fd {fd}: {err}");
            *current = FdType::None;
        }
    }
}

fn apply_polling(sched: &mut crate::mgr::ConSched, pollctl: &mut Pollctl, accept_ok: bool) {
    let (input, output) = desired_polling(sched, accept_ok);
    let name = sched.name.clone();
    relink(pollctl, sched.input_fd, &mut sched.polling_input, input, &name);

    let shared = sched.input_fd.is_some() && sched.input_fd == sched.output_fd;
    if !shared {
        relink(
            pollctl,
            sched.output_fd,
            &mut sched.polling_output,
            output,
            &name,
        );
    }
}

fn dispatch_task(mgr: &Conmgr, guard: &mut Mgr, id: usize, task: ConTask) {
    let work = Work {
        con: Some(id),
        kind: JobKind::Task(task),
        control: WorkControl::fifo(),
        status: WorkStatus::Pending,
    };
    mgr.dispatch_con_locked(guard, id, work);
}

/// Track the earliest pending deadline.
fn fold_deadline(next_deadline: &mut Option<Instant>, candidate: Instant) {
    match next_deadline {
        Some(current) if *current <= candidate => {}
        _ => *next_deadline = Some(candidate),
    }
}

/// Inspect one connection and apply whatever action its state requires.
#[allow(clippy::too_many_arguments)]
fn handle_connection(
    mgr: &Conmgr,
    guard: &mut MutexGuard<'_, Mgr>,
    id: usize,
    promote: bool,
    active_count: usize,
    pollctl: &mut Pollctl,
    next_deadline: &mut Option<Instant>,
    now: Instant,
) {
    let settings = mgr.settings();
    let accept_ok = active_count < guard.max_connections && !guard.shutdown_requested;

    {
        let sched = &mut guard.cons[id];
        if sched.list == ConList::Complete {
            return;
        }

        // A worker owns this connection: stop watching its fds (interest
        // comes back once it idles) and let readiness latch meanwhile.
        if sched.flags.has(ConFlags::WORK_ACTIVE) {
            log::trace!("[{}] connection has work active", sched.name);
            apply_polling(sched, pollctl, accept_ok);
            return;
        }

        if sched.close_requested {
            sched.close_requested = false;
            sched.flags.set(ConFlags::READ_EOF);
            sched.flags.unset(ConFlags::CAN_READ);
            // a closing connection no longer holds its quiesce
            sched.flags.unset(ConFlags::QUIESCE);
        }

        if sched.close_output_requested {
            sched.close_output_requested = false;
            relink(
                pollctl,
                sched.output_fd,
                &mut sched.polling_output,
                FdType::None,
                &sched.name.clone(),
            );
            let mut con = sched.con.lock().expect("connection mutex poisoned");
            con.close_output();
            sched.out_count = 0;
            sched.output_fd = con.output_fd();
        }

        apply_polling(sched, pollctl, accept_ok);

        if sched.flags.has(ConFlags::QUIESCE) {
            return;
        }
    }

    // queued fd extraction once the connection is idle
    if guard.cons[id].extract.is_some() {
        extract_con_fd(mgr, guard, id, pollctl);
        return;
    }

    let flags = guard.cons[id].flags;

    // always run queued work first
    if !guard.cons[id].work.is_empty() {
        let connecting = !flags.has(ConFlags::IS_CONNECTED)
            && !flags.has(ConFlags::IS_LISTEN)
            && flags.has(ConFlags::IS_SOCKET)
            && !flags.has(ConFlags::READ_EOF);
        if connecting && !flags.has(ConFlags::CAN_WRITE) {
            // on_connection waits for the socket to become writable
            if flags.has(ConFlags::WATCH_CONNECT_TIMEOUT) {
                let deadline = guard.cons[id].last_connect + settings.connect_timeout;
                if now >= deadline {
                    if promote {
                        dispatch_task(mgr, guard, id, ConTask::ConnectTimeout);
                    }
                } else {
                    fold_deadline(next_deadline, deadline);
                }
            }
            return;
        }

        if promote {
            let work = guard.cons[id].work.pop_front().expect("checked non-empty");
            mgr.dispatch_con_locked(guard, id, work);
        }
        return;
    }

    if flags.has(ConFlags::IS_LISTEN) && !flags.has(ConFlags::READ_EOF) {
        if promote && flags.has(ConFlags::CAN_READ) && accept_ok {
            log::trace!("[{}] listener has incoming connection", guard.cons[id].name);
            dispatch_task(mgr, guard, id, ConTask::Accept);
        }
        return;
    }

    // drain outgoing data before anything else
    if !flags.has(ConFlags::IS_LISTEN)
        && guard.cons[id].output_fd.is_some()
        && guard.cons[id].out_count > 0
    {
        if flags.has(ConFlags::CAN_WRITE) {
            if promote {
                dispatch_task(mgr, guard, id, ConTask::Write);
            }
        } else if flags.has(ConFlags::WATCH_WRITE_TIMEOUT) {
            let deadline = guard.cons[id].last_write + settings.write_timeout;
            if now >= deadline {
                if promote {
                    dispatch_task(mgr, guard, id, ConTask::WriteTimeout);
                }
            } else {
                fold_deadline(next_deadline, deadline);
            }
        }
        return;
    }

    // outgoing list empty: write-complete work becomes ordinary work
    if !guard.cons[id].write_complete_work.is_empty() {
        if flags.has(ConFlags::CAN_QUERY_OUTPUT_BUFFER) {
            if let Some(fd) = guard.cons[id].output_fd {
                if matches!(buffered_output_bytes(fd), Ok(n) if n > 0) {
                    // kernel still owns bytes; check again shortly
                    fold_deadline(next_deadline, now + settings.wait_write_delay);
                    return;
                }
            }
        }
        let sched = &mut guard.cons[id];
        log::trace!(
            "[{}] queuing {} write complete work items",
            sched.name,
            sched.write_complete_work.len()
        );
        let mut pending = std::mem::take(&mut sched.write_complete_work);
        sched.work.append(&mut pending);
        return;
    }

    // read as much as possible before processing
    if !flags.has(ConFlags::READ_EOF) && flags.has(ConFlags::CAN_READ) {
        if promote {
            if flags.has(ConFlags::TLS_FINGERPRINT) {
                dispatch_task(mgr, guard, id, ConTask::Fingerprint);
            } else {
                guard.cons[id].flags.unset(ConFlags::ON_DATA_TRIED);
                dispatch_task(mgr, guard, id, ConTask::Read);
            }
        }
        return;
    }

    // process already-buffered data
    if guard.cons[id].in_bytes > 0 && !flags.has(ConFlags::ON_DATA_TRIED) {
        if promote {
            dispatch_task(mgr, guard, id, ConTask::OnData);
        }
        return;
    }

    if !flags.has(ConFlags::READ_EOF) {
        // waiting on the peer
        if flags.has(ConFlags::WATCH_READ_TIMEOUT) && flags.has(ConFlags::IS_CONNECTED) {
            let deadline = guard.cons[id].last_read + settings.read_timeout;
            if now >= deadline {
                if promote {
                    dispatch_task(mgr, guard, id, ConTask::ReadTimeout);
                }
            } else {
                fold_deadline(next_deadline, deadline);
            }
        }
        return;
    }

    // read side is finished: close the input fd
    if guard.cons[id].input_fd.is_some() {
        let sched = &mut guard.cons[id];
        log::trace!("[{}] closing incoming side", sched.name);
        let name = sched.name.clone();
        relink(pollctl, sched.input_fd, &mut sched.polling_input, FdType::None, &name);
        let mut con = sched.con.lock().expect("connection mutex poisoned");
        con.close_input();
        sched.input_fd = con.input_fd();
        sched.output_fd = con.output_fd();
        if sched.output_fd.is_none() {
            sched.out_count = 0;
        }
    }

    if flags.has(ConFlags::WAIT_ON_FINISH) {
        return;
    }

    if !guard.cons[id].finished {
        if promote {
            log::trace!("[{}] queuing up on_finish", guard.cons[id].name);
            guard.cons[id].flags.set(ConFlags::WAIT_ON_FINISH);
            dispatch_task(mgr, guard, id, ConTask::OnFinish);
        }
        return;
    }

    // on_finish may have queued final work; let it drain first
    if !guard.cons[id].work.is_empty() || !guard.cons[id].write_complete_work.is_empty() {
        return;
    }

    // nothing left: close everything and mark for cleanup
    let sched = &mut guard.cons[id];
    let name = sched.name.clone();
    relink(pollctl, sched.output_fd, &mut sched.polling_output, FdType::None, &name);
    {
        let mut con = sched.con.lock().expect("connection mutex poisoned");
        con.close_output();
        con.close_input();
    }
    sched.input_fd = None;
    sched.output_fd = None;
    sched.out_count = 0;
    sched.list = ConList::Complete;
    log::debug!("[{}] closed connection", name);
}

/// Pull the file descriptors out of an idle connection and hand them to the
/// extraction callback; the connection then finishes without closing them.
fn extract_con_fd(mgr: &Conmgr, guard: &mut Mgr, id: usize, pollctl: &mut Pollctl) {
    let sched = &mut guard.cons[id];
    debug_assert!(!sched.flags.has(ConFlags::WORK_ACTIVE));

    let name = sched.name.clone();
    relink(pollctl, sched.input_fd, &mut sched.polling_input, FdType::None, &name);
    relink(pollctl, sched.output_fd, &mut sched.polling_output, FdType::None, &name);

    let mut req = sched.extract.take().expect("extract request present");
    {
        let mut con = sched.con.lock().expect("connection mutex poisoned");
        req.input = con.input.take();
        req.output = con.output.take();
        con.output_closed = true;
    }

    sched.input_fd = None;
    sched.output_fd = None;
    sched.out_count = 0;
    sched.flags.set(ConFlags::READ_EOF);
    sched.flags.unset(ConFlags::CAN_READ.union(ConFlags::CAN_WRITE));

    log::debug!("[{name}] extracting file descriptors");
    dispatch_task(mgr, guard, id, ConTask::Extract(req));
}

/// Update connection readiness from one poll event.
fn apply_event(guard: &mut Mgr, pollctl: &mut Pollctl, fd: std::os::fd::RawFd, readiness: Readiness) {
    let found = guard
        .cons
        .iter_mut()
        .find(|(_, sched)| sched.input_fd == Some(fd) || sched.output_fd == Some(fd));

    let Some((_, sched)) = found else {
        // fd probably got closed between poll start and now
        log::trace!("unable to find connection for fd={fd}");
        return;
    };

    if readiness.has_error() {
        let detail = if sched.flags.has(ConFlags::IS_SOCKET) {
            match crate::io::socket_error(fd) {
                Ok(Some(err)) => err.to_string(),
                _ => "poll error".to_string(),
            }
        } else {
            "poll error".to_string()
        };
        log::error!("[{}] error on fd {fd}: {detail}", sched.name);

        // stop polling the fd immediately so the error cannot storm
        let name = sched.name.clone();
        if sched.input_fd == Some(fd) {
            relink(pollctl, Some(fd), &mut sched.polling_input, FdType::None, &name);
        }
        if sched.output_fd == Some(fd) {
            relink(pollctl, Some(fd), &mut sched.polling_output, FdType::None, &name);
        }
        sched.close_requested = true;
        return;
    }

    if sched.input_fd == Some(fd) && (readiness.can_read() || readiness.has_hangup()) {
        sched.flags.set(ConFlags::CAN_READ);
    }
    if sched.output_fd == Some(fd) && readiness.can_write() {
        sched.flags.set(ConFlags::CAN_WRITE);
    }

    log::trace!(
        "[{}] fd={fd} can_read={} can_write={}",
        sched.name,
        sched.flags.has(ConFlags::CAN_READ),
        sched.flags.has(ConFlags::CAN_WRITE)
    );
}

/// Free completed connections nothing refers to anymore.
fn reap_complete(guard: &mut Mgr) {
    let ready: Vec<usize> = guard
        .cons
        .iter()
        .filter(|(_, sched)| {
            sched.list == ConList::Complete
                && sched.refs == 0
                && !sched.flags.has(ConFlags::WORK_ACTIVE)
                && sched.work.is_empty()
                && sched.write_complete_work.is_empty()
                && sched.extract.is_none()
        })
        .map(|(id, _)| id)
        .collect();

    for id in ready {
        let sched = guard.cons.remove(id);
        log::debug!("[{}] free connection", sched.name);
        if guard.signal_con == Some(id) {
            guard.signal_con = None;
            guard.signal_pipe_write = None;
        }
        // dropping the last Arc closes any remaining descriptors
        drop(sched);
    }
}

/// True when the watch has nothing left to do and may return.
fn should_exit(guard: &Mgr) -> bool {
    guard.cons.is_empty()
        && guard.jobs_active == 0
        && guard.delayed_work.is_empty()
        && guard.deferred_work.is_empty()
}
