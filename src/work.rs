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

//! Work items and their scheduling controls.

use std::fmt::{self, Display};
use std::ops::BitOr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::mgr::Conmgr;

const NSEC_IN_SEC: u64 = 1_000_000_000;

/// Status of a queued work item.
///
/// Always check for [`WorkStatus::Cancelled`] before doing real work: a
/// shutdown converts pending items to cancelled and still runs them so the
/// callback can release resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Queued, waiting on a dependency or a worker.
    Pending,
    /// Handed to a worker.
    Run,
    /// Cancelled by shutdown; the callback should only clean up.
    Cancelled,
}

impl WorkStatus {
    /// Human-readable name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "PENDING",
            WorkStatus::Run => "RUN",
            WorkStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Scheduling policy. Only FIFO exists in v1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Schedule {
    /// Run in queue order.
    #[default]
    Fifo,
}

/// Dependency bitset controlling when work becomes runnable.
///
/// Promoting work from one pending list to the runnable path is just
/// clearing the relevant bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Depend(u32);

impl Depend {
    /// No bits set.
    pub const EMPTY: Depend = Depend(0);
    /// Work has no dependencies.
    pub const NONE: Depend = Depend(1 << 1);
    /// Run once all of the connection's queued writes have drained.
    pub const CON_WRITE_COMPLETE: Depend = Depend(1 << 2);
    /// Run once an absolute wake time passes.
    pub const TIME_DELAY: Depend = Depend(1 << 3);
    /// Run every time a subscribed signal is delivered.
    pub const SIGNAL: Depend = Depend(1 << 4);

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: Depend) -> bool {
        self.0 & other.0 == other.0
    }

    /// Clear the bits of `other`.
    #[must_use]
    pub fn without(self, other: Depend) -> Depend {
        Depend(self.0 & !other.0)
    }

    /// True when no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Depend {
    type Output = Depend;

    fn bitor(self, rhs: Depend) -> Depend {
        Depend(self.0 | rhs.0)
    }
}

impl Display for Depend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut emit = |name: &str, f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)
        };

        if self.contains(Depend::NONE) {
            emit("NONE", f)?;
        }
        if self.contains(Depend::CON_WRITE_COMPLETE) {
            emit("CON_WRITE_COMPLETE", f)?;
        }
        if self.contains(Depend::TIME_DELAY) {
            emit("TIME_DELAY", f)?;
        }
        if self.contains(Depend::SIGNAL) {
            emit("SIGNAL", f)?;
        }
        if first {
            f.write_str("EMPTY")?;
        }
        Ok(())
    }
}

/// Calculate the absolute start time for delayed work.
///
/// Nanoseconds are renormalized into seconds first; the addition against the
/// monotonic clock is overflow-checked and clamps to "now" (with a warning)
/// rather than wrapping.
pub fn calc_work_time_delay(delay_seconds: u64, delay_nanoseconds: u64) -> Instant {
    let seconds = delay_seconds.saturating_add(delay_nanoseconds / NSEC_IN_SEC);
    let nanoseconds = (delay_nanoseconds % NSEC_IN_SEC) as u32;
    let delay = Duration::new(seconds, nanoseconds);

    let now = Instant::now();
    match now.checked_add(delay) {
        Some(begin) => begin,
        None => {
            debug_assert!(false, "time delay overflow");
            log::warn!("work delay of {delay:?} overflows the clock; running immediately");
            now
        }
    }
}

/// Controls determining when a work item runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkControl {
    /// Scheduling policy.
    pub schedule: Schedule,
    /// Dependency bits.
    pub depend: Depend,
    /// Absolute wake time; required with [`Depend::TIME_DELAY`].
    pub time_begin: Option<Instant>,
    /// Signal number; required with [`Depend::SIGNAL`].
    pub on_signal: Option<i32>,
}

impl WorkControl {
    /// Dependency-free FIFO work.
    pub fn fifo() -> Self {
        Self {
            depend: Depend::NONE,
            ..Self::default()
        }
    }

    /// Work delayed by the given offset from now.
    pub fn delayed(delay_seconds: u64, delay_nanoseconds: u64) -> Self {
        Self::delayed_abs(calc_work_time_delay(delay_seconds, delay_nanoseconds))
    }

    /// Work delayed until an absolute wake time.
    pub fn delayed_abs(time_begin: Instant) -> Self {
        Self {
            depend: Depend::TIME_DELAY,
            time_begin: Some(time_begin),
            ..Self::default()
        }
    }

    /// Work deferred until the connection's outgoing list is empty.
    pub fn write_complete() -> Self {
        Self {
            depend: Depend::CON_WRITE_COMPLETE,
            ..Self::default()
        }
    }

    /// Work triggered by each delivery of `signal`.
    pub fn on_signal(signal: i32) -> Self {
        Self {
            depend: Depend::SIGNAL,
            on_signal: Some(signal),
            ..Self::default()
        }
    }
}

/// Boxed one-shot work function.
pub type WorkFunc = Box<dyn FnOnce(&Conmgr, WorkArgs<'_>) + Send + 'static>;

/// Shared work function re-run on every signal delivery.
pub type SignalFunc = Arc<dyn Fn(&Conmgr, WorkArgs<'_>) + Send + Sync + 'static>;

/// Arguments handed to every work callback.
pub struct WorkArgs<'a> {
    /// Run or cancelled.
    pub status: WorkStatus,
    /// Exclusive access to the owning connection, for connection work.
    pub con: Option<&'a mut Connection>,
}

impl fmt::Debug for WorkArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkArgs")
            .field("status", &self.status)
            .field("con", &self.con.as_ref().map(|c| c.name().to_string()))
            .finish()
    }
}

/// A user callback with a symbolic name for logging.
pub struct Callback {
    pub(crate) name: &'static str,
    pub(crate) func: WorkFunc,
}

impl Callback {
    /// Wrap `func` under `name`.
    pub fn new<F>(name: &'static str, func: F) -> Self
    where
        F: FnOnce(&Conmgr, WorkArgs<'_>) + Send + 'static,
    {
        Self {
            name,
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("name", &self.name).finish()
    }
}

/// A subscription created by signal work.
pub(crate) struct SignalSub {
    pub signal: i32,
    pub name: &'static str,
    pub func: SignalFunc,
}

impl fmt::Debug for SignalSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSub")
            .field("signal", &self.signal)
            .field("name", &self.name)
            .finish()
    }
}

/// Request to reclaim a connection's file descriptors from manager control.
pub struct ExtractReq {
    pub(crate) name: &'static str,
    #[allow(clippy::type_complexity)]
    pub(crate) func:
        Box<dyn FnOnce(&Conmgr, WorkStatus, Option<OwnedFd>, Option<OwnedFd>) + Send + 'static>,
    pub(crate) input: Option<OwnedFd>,
    pub(crate) output: Option<OwnedFd>,
}

impl fmt::Debug for ExtractReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractReq").field("name", &self.name).finish()
    }
}

/// Internal connection operations run on worker threads.
#[derive(Debug)]
pub(crate) enum ConTask {
    /// Accept one pending connection from a listener.
    Accept,
    /// Complete connect()/setup and run the `on_connection` callback.
    OnConnection,
    /// Read once from the input fd.
    Read,
    /// Dispatch buffered input to the framing layer or `on_data`.
    OnData,
    /// Drain the outgoing buffer list with writev.
    Write,
    /// Run the `on_finish` callback.
    OnFinish,
    /// Perform the TLS handshake.
    TlsCreate,
    /// Close both directions after a TLS blinding delay.
    DeferredClose,
    /// Peek at first bytes to route TLS vs RPC.
    Fingerprint,
    /// Grow the incoming buffer to hold `0` more bytes.
    GrowBuffer(usize),
    /// Run the read-timeout callback.
    ReadTimeout,
    /// Run the write-timeout callback.
    WriteTimeout,
    /// Run the connect-timeout callback.
    ConnectTimeout,
    /// Hand the raw fds to an extraction callback.
    Extract(ExtractReq),
}

impl ConTask {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ConTask::Accept => "listen_accept",
            ConTask::OnConnection => "wrap_on_connection",
            ConTask::Read => "handle_read",
            ConTask::OnData => "wrap_on_data",
            ConTask::Write => "handle_write",
            ConTask::OnFinish => "wrap_on_finish",
            ConTask::TlsCreate => "tls_create",
            ConTask::DeferredClose => "tls_deferred_close",
            ConTask::Fingerprint => "handle_fingerprint",
            ConTask::GrowBuffer(_) => "resize_input_buffer",
            ConTask::ReadTimeout => "wrap_on_read_timeout",
            ConTask::WriteTimeout => "wrap_on_write_timeout",
            ConTask::ConnectTimeout => "wrap_on_connect_timeout",
            ConTask::Extract(_) => "extract_con_fd",
        }
    }
}

/// What a worker actually executes.
pub(crate) enum JobKind {
    /// One-shot user callback.
    User(Callback),
    /// Signal subscriber instantiated for one delivery.
    Signal(SignalFunc, &'static str),
    /// Internal connection operation.
    Task(ConTask),
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl JobKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            JobKind::User(callback) => callback.name,
            JobKind::Signal(_, name) => name,
            JobKind::Task(task) => task.name(),
        }
    }
}

/// One unit queued for the worker pool.
#[derive(Debug)]
pub(crate) struct Work {
    /// Owning connection id, if any.
    pub con: Option<usize>,
    pub kind: JobKind,
    pub control: WorkControl,
    pub status: WorkStatus,
}

impl Work {
    pub(crate) fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn depend_bits_compose_and_clear() {
        let depend = Depend::TIME_DELAY | Depend::SIGNAL;
        assert!(depend.contains(Depend::TIME_DELAY));
        assert!(depend.contains(Depend::SIGNAL));
        assert!(!depend.contains(Depend::CON_WRITE_COMPLETE));

        let cleared = depend.without(Depend::TIME_DELAY);
        assert!(!cleared.contains(Depend::TIME_DELAY));
        assert!(cleared.contains(Depend::SIGNAL));

        assert_eq!("TIME_DELAY|SIGNAL", depend.to_string());
        assert_eq!("EMPTY", Depend::EMPTY.to_string());
    }

    #[test]
    fn calc_delay_renormalizes_nanoseconds() {
        let before = Instant::now();
        let begin = calc_work_time_delay(1, 2_500_000_000);
        // 1s + 2.5s of nanoseconds = 3.5s out
        assert!(begin >= before + Duration::from_millis(3400));
        assert!(begin <= Instant::now() + Duration::from_millis(3600));
    }

    #[test]
    fn delayed_control_sets_time_and_bit() {
        let control = WorkControl::delayed(0, 1_000_000);
        assert!(control.depend.contains(Depend::TIME_DELAY));
        assert!(control.time_begin.is_some());
    }

    #[test]
    fn signal_control_records_number() {
        let control = WorkControl::on_signal(libc::SIGHUP);
        assert!(control.depend.contains(Depend::SIGNAL));
        assert_eq!(Some(libc::SIGHUP), control.on_signal);
    }
}
