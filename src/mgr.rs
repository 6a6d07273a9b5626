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

//! The connection manager facade and its shared state.
//!
//! One mutex serializes every state mutation; named events and the poller
//! interrupt coordinate the watch thread and the worker pool around it. The
//! mutex is never held across blocking I/O.

use std::collections::VecDeque;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use slab::Slab;

use crate::buffer::{Buffer, OutQueue};
use crate::config::{Settings, THREAD_COUNT_MAX, THREAD_COUNT_MIN};
use crate::connection::{
    fd_kind_flags, set_tcp_nodelay, tcp_mss, ConFlags, Connection, ConnectionEvents,
    ConnectionKind,
};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::io::{set_nonblocking, socket_error};
use crate::polling::{FdType, Interrupter, Pollctl};
use crate::rpc::{frame_msg, RpcCodec};
use crate::signals::{open_signal_pipe, SignalEvents, SignalTable};
use crate::tls::TlsProvider;
use crate::work::{
    Callback, ConTask, Depend, ExtractReq, JobKind, SignalFunc, SignalSub, Work, WorkArgs,
    WorkControl, WorkStatus,
};
use crate::workers::{Dispatch, WorkerPool};

/// Connection flags a listener passes down to its accepted connections.
pub(crate) const INHERIT_MASK: ConFlags = ConFlags::RPC_KEEP_BUFFER
    .union(ConFlags::TCP_NODELAY)
    .union(ConFlags::WATCH_READ_TIMEOUT)
    .union(ConFlags::WATCH_WRITE_TIMEOUT)
    .union(ConFlags::WATCH_CONNECT_TIMEOUT)
    .union(ConFlags::TLS_SERVER)
    .union(ConFlags::TLS_FINGERPRINT)
    .union(ConFlags::TLS_REQUIRED);

/// Host-provided global hooks, fixed at construction.
#[derive(Default)]
pub struct Callbacks {
    /// Codec invoked with each reassembled RPC frame. Without one, raw
    /// payload bytes are passed through as `Box<Vec<u8>>`.
    pub codec: Option<Arc<dyn RpcCodec>>,
    /// TLS implementation; absent means TLS-flagged connections are refused.
    pub tls: Option<Arc<dyn TlsProvider>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("codec", &self.codec.is_some())
            .field("tls", &self.tls.as_ref().map(|t| t.name()))
            .finish()
    }
}

/// Which manager list a connection currently belongs to. A connection is in
/// exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConList {
    Active,
    Listen,
    Complete,
}

/// Manager-side scheduling record for one connection.
///
/// The watch thread makes every decision from this record; it only locks the
/// actual [`Connection`] when no worker owns it.
pub(crate) struct ConSched {
    pub con: Arc<Mutex<Connection>>,
    pub list: ConList,
    pub flags: ConFlags,
    pub name: String,
    pub in_bytes: usize,
    pub out_count: usize,
    pub input_fd: Option<RawFd>,
    pub output_fd: Option<RawFd>,
    pub polling_input: FdType,
    pub polling_output: FdType,
    pub work: VecDeque<Work>,
    pub write_complete_work: VecDeque<Work>,
    pub refs: usize,
    pub extract: Option<ExtractReq>,
    pub close_requested: bool,
    pub close_output_requested: bool,
    pub finished: bool,
    pub last_read: Instant,
    pub last_write: Instant,
    pub last_connect: Instant,
}

impl fmt::Debug for ConSched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConSched")
            .field("name", &self.name)
            .field("list", &self.list)
            .field("flags", &self.flags.to_string())
            .field("work", &self.work.len())
            .field("refs", &self.refs)
            .finish()
    }
}

/// Mutable manager state, guarded by the single manager mutex.
#[derive(Debug)]
pub(crate) struct Mgr {
    pub initialized: bool,
    pub shutdown_requested: bool,
    pub quiesce_requested: bool,
    pub quiesce_active: bool,
    pub exit_on_error: bool,
    pub error: Option<Error>,
    pub max_connections: usize,
    pub cons: Slab<ConSched>,
    pub delayed_work: Vec<Work>,
    /// Dependency-free work held back while quiesced.
    pub deferred_work: Vec<Work>,
    pub signal_subs: Vec<SignalSub>,
    pub signal_table: SignalTable,
    pub signal_con: Option<usize>,
    pub signal_pipe_write: Option<OwnedFd>,
    /// Work dispatched to the pool and not yet completed.
    pub jobs_active: usize,
    pub work_tx: Option<Sender<Dispatch>>,
    pub workers: Option<WorkerPool>,
    pub watch_handle: Option<JoinHandle<()>>,
    pub watching: bool,
    pub pollctl: Option<Pollctl>,
}

/// Process-shared immutable half plus the guarded state.
pub(crate) struct Shared {
    pub mgr: Mutex<Mgr>,
    pub watch_sleep: Event,
    pub watch_return: Event,
    pub worker_return: Event,
    pub on_start_quiesced: Event,
    pub on_stop_quiesced: Event,
    pub interrupter: Interrupter,
    pub settings: Settings,
    pub callbacks: Callbacks,
}

/// Handle to the connection manager. Cheap to clone; all clones refer to the
/// same manager.
#[derive(Clone)]
pub struct Conmgr {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for Conmgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conmgr")
            .field("settings", &self.shared.settings)
            .finish()
    }
}

/// Parameters for registering a new connection.
pub(crate) struct NewConnection {
    pub kind: ConnectionKind,
    pub input: Option<OwnedFd>,
    pub output: Option<OwnedFd>,
    pub shared_fd: bool,
    pub events: Arc<dyn ConnectionEvents>,
    pub flags: ConFlags,
    pub peer: Option<SocketAddr>,
    pub unix_path: Option<String>,
    pub is_listen: bool,
    pub connected: bool,
}

fn connection_name(nc: &NewConnection, input: Option<RawFd>, output: Option<RawFd>) -> String {
    if nc.is_listen {
        match (&nc.unix_path, nc.peer) {
            (Some(path), _) => format!("[unix:{path}]"),
            (None, Some(addr)) => format!("[listen={addr}]"),
            (None, None) => format!("[listen,fd={}]", input.unwrap_or(-1)),
        }
    } else if let Some(peer) = nc.peer {
        format!("[peer={peer},fd={}]", input.or(output).unwrap_or(-1))
    } else {
        format!("[fd={}:{}]", input.unwrap_or(-1), output.unwrap_or(-1))
    }
}

impl Conmgr {
    /// Initialize the manager: spawn the worker pool and create the poller.
    /// The watch loop does not start until [`Conmgr::run`].
    pub fn new(mut settings: Settings, callbacks: Callbacks) -> Result<Self> {
        settings.threads = settings.threads.clamp(THREAD_COUNT_MIN, THREAD_COUNT_MAX);
        settings.max_connections = settings.max_connections.max(1);

        let pollctl = Pollctl::new(settings.poll_mode)?;
        let interrupter = pollctl.interrupter();
        let (work_tx, work_rx) = crossbeam_channel::unbounded();

        let mgr = Mgr {
            initialized: true,
            shutdown_requested: false,
            quiesce_requested: false,
            quiesce_active: false,
            exit_on_error: false,
            error: None,
            max_connections: settings.max_connections,
            cons: Slab::new(),
            delayed_work: Vec::new(),
            deferred_work: Vec::new(),
            signal_subs: Vec::new(),
            signal_table: SignalTable::default(),
            signal_con: None,
            signal_pipe_write: None,
            jobs_active: 0,
            work_tx: Some(work_tx),
            workers: None,
            watch_handle: None,
            watching: false,
            pollctl: Some(pollctl),
        };

        let threads = settings.threads;
        let conmgr = Conmgr {
            shared: Arc::new(Shared {
                mgr: Mutex::new(mgr),
                watch_sleep: Event::new("WATCH_SLEEP"),
                watch_return: Event::new("WATCH_RETURN"),
                worker_return: Event::new("WORKER_RETURN"),
                on_start_quiesced: Event::new("START_QUIESCED"),
                on_stop_quiesced: Event::new("STOP_QUIESCED"),
                interrupter,
                settings,
                callbacks,
            }),
        };

        let pool = WorkerPool::spawn(threads, work_rx, conmgr.clone());
        conmgr.lock().workers = Some(pool);

        Ok(conmgr)
    }

    /// Configuration applied at construction.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Mgr> {
        self.shared.mgr.lock().expect("manager mutex poisoned")
    }

    /// Wake the watch out of poll or its quiesce wait.
    pub(crate) fn wake_watch(&self) {
        self.shared.watch_sleep.signal();
        self.shared.interrupter.interrupt();
    }

    // -----------------------------------------------------------------
    // lifecycle
    // -----------------------------------------------------------------

    /// Run the watch loop until shutdown.
    ///
    /// With `blocking` the calling thread becomes (or waits for) the watch;
    /// otherwise the watch starts on a background thread. Returns the first
    /// recorded error when exit-on-error is set.
    pub fn run(&self, blocking: bool) -> Result<()> {
        let mut guard = self.lock();

        if guard.shutdown_requested {
            log::debug!("refusing to run after shutdown");
            return match guard.error.clone() {
                Some(err) if guard.exit_on_error => Err(err),
                _ => Ok(()),
            };
        }

        if guard.watching {
            if blocking {
                while guard.watching {
                    guard = self.shared.watch_return.wait(guard);
                }
            }
            drop(guard);
        } else {
            let pollctl = guard.pollctl.take().ok_or(Error::ShutDown)?;
            guard.watching = true;

            if blocking {
                drop(guard);
                crate::watch::watch(self.clone(), pollctl);
            } else {
                let mgr = self.clone();
                let handle = std::thread::Builder::new()
                    .name("conmgr-watch".to_string())
                    .spawn(move || crate::watch::watch(mgr, pollctl))
                    .map_err(Error::from)?;
                guard.watch_handle = Some(handle);
                drop(guard);
            }
        }

        let guard = self.lock();
        if guard.exit_on_error {
            if let Some(err) = guard.error.clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Notify the manager to shut down.
    pub fn request_shutdown(&self) {
        log::debug!("shutdown requested");
        let mut guard = self.lock();
        guard.shutdown_requested = true;
        drop(guard);
        self.wake_watch();
    }

    /// Shut down, drain, and release every resource. Safe to call once; later
    /// calls are no-ops.
    pub fn fini(&self) {
        let mut guard = self.lock();
        if !guard.initialized {
            return;
        }
        guard.initialized = false;
        guard.shutdown_requested = true;
        drop(guard);
        self.wake_watch();

        let mut guard = self.lock();
        while guard.watching {
            guard = self.shared.watch_return.wait(guard);
        }

        log::debug!("connection manager shutting down");

        let watch_handle = guard.watch_handle.take();

        // tell straggler timers about the cancellation
        let cancelled = crate::delayed::cancel_all(&mut guard.delayed_work);
        for work in cancelled {
            self.dispatch_now_locked(&mut guard, work, None);
        }

        guard.signal_subs.clear();
        crate::signals::close_signal_pipe();
        guard.signal_pipe_write = None;

        let work_tx = guard.work_tx.take();
        let workers = guard.workers.take();
        drop(guard);

        if let Some(handle) = watch_handle {
            let _ = handle.join();
        }

        // disconnecting the channel is the worker shutdown signal
        drop(work_tx);
        if let Some(pool) = workers {
            pool.join();
        }

        debug_assert_eq!(0, self.lock().jobs_active);
    }

    // -----------------------------------------------------------------
    // registration
    // -----------------------------------------------------------------

    /// Hand a full-duplex file descriptor (socket or character device) to
    /// the manager.
    pub fn process_fd(
        &self,
        kind: ConnectionKind,
        fd: OwnedFd,
        events: Arc<dyn ConnectionEvents>,
        flags: ConFlags,
    ) -> Result<()> {
        self.add_connection(NewConnection {
            kind,
            input: Some(fd),
            output: None,
            shared_fd: true,
            events,
            flags,
            peer: None,
            unix_path: None,
            is_listen: false,
            connected: true,
        })
        .map(|_| ())
    }

    /// Hand distinct input/output descriptors (pipes) to the manager.
    /// Either side may be absent for one-directional connections.
    pub fn process_fd_pair(
        &self,
        kind: ConnectionKind,
        input: Option<OwnedFd>,
        output: Option<OwnedFd>,
        events: Arc<dyn ConnectionEvents>,
        flags: ConFlags,
    ) -> Result<()> {
        if input.is_none() && output.is_none() {
            return Err(Error::NotSupported);
        }
        self.add_connection(NewConnection {
            kind,
            input,
            output,
            shared_fd: false,
            events,
            flags,
            peer: None,
            unix_path: None,
            is_listen: false,
            connected: true,
        })
        .map(|_| ())
    }

    /// Adopt an already-listening socket.
    pub fn process_fd_listen(
        &self,
        fd: OwnedFd,
        kind: ConnectionKind,
        events: Arc<dyn ConnectionEvents>,
        flags: ConFlags,
    ) -> Result<()> {
        self.add_connection(NewConnection {
            kind,
            input: Some(fd),
            output: None,
            shared_fd: true,
            events,
            flags,
            peer: None,
            unix_path: None,
            is_listen: true,
            connected: true,
        })
        .map(|_| ())
    }

    /// Create a listening socket from `host:port` or `unix:/path`.
    pub fn create_listen_socket(
        &self,
        kind: ConnectionKind,
        listen_on: &str,
        events: Arc<dyn ConnectionEvents>,
        flags: ConFlags,
    ) -> Result<()> {
        if let Some(path) = listen_on.strip_prefix("unix:") {
            let listener = std::os::unix::net::UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;
            return self
                .add_connection(NewConnection {
                    kind,
                    input: Some(listener.into()),
                    output: None,
                    shared_fd: true,
                    events,
                    flags,
                    peer: None,
                    unix_path: Some(path.to_string()),
                    is_listen: true,
                    connected: true,
                })
                .map(|_| ());
        }

        let addr = listen_on
            .to_socket_addrs()
            .map_err(|_| Error::InvalidParameter(listen_on.to_string()))?
            .next()
            .ok_or_else(|| Error::InvalidParameter(listen_on.to_string()))?;
        let listener = mio::net::TcpListener::bind(addr)?;
        let local = listener.local_addr().ok();
        // Safety: into_raw_fd transfers ownership of a live descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(listener.into_raw_fd()) };

        self.add_connection(NewConnection {
            kind,
            input: Some(fd),
            output: None,
            shared_fd: true,
            events,
            flags,
            peer: local,
            unix_path: None,
            is_listen: true,
            connected: true,
        })
        .map(|_| ())
    }

    /// Create a socket and connect it to `addr`; `on_connection` runs once
    /// the connect completes.
    pub fn create_connect_socket(
        &self,
        kind: ConnectionKind,
        addr: SocketAddr,
        events: Arc<dyn ConnectionEvents>,
        flags: ConFlags,
    ) -> Result<()> {
        let stream = mio::net::TcpStream::connect(addr)?;
        // Safety: into_raw_fd transfers ownership of a live descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) };

        self.add_connection(NewConnection {
            kind,
            input: Some(fd),
            output: None,
            shared_fd: true,
            events,
            flags,
            peer: Some(addr),
            unix_path: None,
            is_listen: false,
            connected: false,
        })
        .map(|_| ())
    }

    pub(crate) fn add_connection(&self, nc: NewConnection) -> Result<usize> {
        let mut guard = self.lock();
        self.add_connection_locked(&mut guard, nc)
    }

    pub(crate) fn add_connection_locked(
        &self,
        guard: &mut Mgr,
        nc: NewConnection,
    ) -> Result<usize> {
        if !guard.initialized || guard.shutdown_requested {
            return Err(Error::ShutDown);
        }

        let input_fd = nc.input.as_ref().map(|fd| std::os::fd::AsRawFd::as_raw_fd(fd));
        let output_fd = if nc.shared_fd {
            input_fd
        } else {
            nc.output.as_ref().map(|fd| std::os::fd::AsRawFd::as_raw_fd(fd))
        };

        let mut flags = nc.flags;
        for fd in [input_fd, output_fd].into_iter().flatten() {
            set_nonblocking(fd)?;
        }

        if let Some(fd) = input_fd.or(output_fd) {
            flags.set(fd_kind_flags(fd)?);
        }

        let mut mss = None;
        if flags.has(ConFlags::IS_SOCKET) {
            if let Some(fd) = output_fd {
                if flags.has(ConFlags::TCP_NODELAY) && !nc.is_listen {
                    if let Err(err) = set_tcp_nodelay(fd) {
                        log::warn!("unable to set TCP_NODELAY: {err}");
                    }
                }
                if cfg!(target_os = "linux") {
                    flags.set(ConFlags::CAN_QUERY_OUTPUT_BUFFER);
                }
            }
            if let Some(fd) = input_fd {
                mss = tcp_mss(fd);
            }
        }

        if nc.is_listen {
            flags.set(ConFlags::IS_LISTEN);
        }
        if nc.connected {
            flags.set(ConFlags::IS_CONNECTED);
        }

        let name = connection_name(&nc, input_fd, output_fd);
        log::debug!(
            "[{name}] new {} connection flags={flags}",
            nc.kind.as_str()
        );

        let now = Instant::now();
        let entry = guard.cons.vacant_entry();
        let id = entry.key();

        let con = Connection {
            id,
            kind: nc.kind,
            flags,
            input: nc.input,
            output: nc.output,
            shared_fd: nc.shared_fd,
            output_closed: output_fd.is_none(),
            name: name.clone(),
            peer: nc.peer,
            unix_path: nc.unix_path,
            in_buf: Buffer::new(),
            out: OutQueue::default(),
            ctx: None,
            events: nc.events,
            tls: None,
            mss,
            last_read: now,
            last_write: now,
            last_connect: now,
        };

        let mut sched = ConSched {
            con: Arc::new(Mutex::new(con)),
            list: if nc.is_listen {
                ConList::Listen
            } else {
                ConList::Active
            },
            flags,
            name,
            in_bytes: 0,
            out_count: 0,
            input_fd,
            output_fd,
            polling_input: FdType::None,
            polling_output: FdType::None,
            work: VecDeque::new(),
            write_complete_work: VecDeque::new(),
            refs: 0,
            extract: None,
            close_requested: false,
            close_output_requested: false,
            finished: false,
            last_read: now,
            last_write: now,
            last_connect: now,
        };

        sched.work.push_back(Work {
            con: Some(id),
            kind: JobKind::Task(ConTask::OnConnection),
            control: WorkControl::fifo(),
            status: WorkStatus::Pending,
        });

        // handshake immediately unless the fingerprint decides the role
        if flags.has_any(ConFlags::TLS_SERVER.union(ConFlags::TLS_CLIENT))
            && !flags.has(ConFlags::TLS_FINGERPRINT)
            && !nc.is_listen
        {
            sched.work.push_back(Work {
                con: Some(id),
                kind: JobKind::Task(ConTask::TlsCreate),
                control: WorkControl::fifo(),
                status: WorkStatus::Pending,
            });
        }

        entry.insert(sched);
        // interrupting the poller is safe with the manager mutex held
        self.wake_watch();
        Ok(id)
    }

    // -----------------------------------------------------------------
    // work submission
    // -----------------------------------------------------------------

    /// Queue dependency-free or time-delayed work not tied to a connection.
    ///
    /// Signal-dependent work must use [`Conmgr::add_signal_work`] so it can
    /// be re-run on every delivery.
    pub fn add_work(&self, callback: Callback, control: WorkControl) {
        if control.depend.contains(Depend::SIGNAL) {
            log::error!(
                "dropping {}: signal work requires add_signal_work",
                callback.name
            );
            return;
        }

        let mut guard = self.lock();
        self.handle_work_locked(
            &mut guard,
            Work {
                con: None,
                kind: JobKind::User(callback),
                control,
                status: WorkStatus::Pending,
            },
        );
    }

    /// Queue dependency-free FIFO work.
    pub fn add_work_fifo<F>(&self, name: &'static str, func: F)
    where
        F: FnOnce(&Conmgr, WorkArgs<'_>) + Send + 'static,
    {
        self.add_work(Callback::new(name, func), WorkControl::fifo());
    }

    /// Queue work delayed by the given offset from now.
    pub fn add_delayed_work<F>(
        &self,
        name: &'static str,
        func: F,
        delay_seconds: u64,
        delay_nanoseconds: u64,
    ) where
        F: FnOnce(&Conmgr, WorkArgs<'_>) + Send + 'static,
    {
        self.add_work(
            Callback::new(name, func),
            WorkControl::delayed(delay_seconds, delay_nanoseconds),
        );
    }

    /// Subscribe `func` to run on every delivery of `signal`.
    pub fn add_signal_work<F>(&self, signal: i32, name: &'static str, func: F)
    where
        F: Fn(&Conmgr, WorkArgs<'_>) + Send + Sync + 'static,
    {
        let mut guard = self.lock();
        guard.signal_subs.push(SignalSub {
            signal,
            name,
            func: Arc::new(func),
        });

        // the table only grows; install immediately once the pipe exists
        if guard.signal_con.is_some() {
            if let Err(err) = guard.signal_table.install(signal) {
                log::error!("unable to install handler for signal {signal}: {err}");
            }
        }
        drop(guard);
        self.wake_watch();
    }

    /// Queue work owned by `con`, run with exclusive access to it.
    pub fn add_con_work(&self, con: &mut Connection, callback: Callback, control: WorkControl) {
        let mut guard = self.lock();
        self.handle_work_locked(
            &mut guard,
            Work {
                con: Some(con.id),
                kind: JobKind::User(callback),
                control,
                status: WorkStatus::Pending,
            },
        );
    }

    /// Queue connection work from outside a callback.
    pub fn add_con_work_ref(
        &self,
        conref: &ConRef,
        callback: Callback,
        control: WorkControl,
    ) -> Result<()> {
        let mut guard = self.lock();
        if !guard.cons.contains(conref.id) {
            return Err(Error::ShutDown);
        }
        self.handle_work_locked(
            &mut guard,
            Work {
                con: Some(conref.id),
                kind: JobKind::User(callback),
                control,
                status: WorkStatus::Pending,
            },
        );
        Ok(())
    }

    /// Queue work that runs once the connection's outgoing list drains.
    pub fn add_write_complete_work<F>(&self, con: &mut Connection, name: &'static str, func: F)
    where
        F: FnOnce(&Conmgr, WorkArgs<'_>) + Send + 'static,
    {
        self.add_con_work(con, Callback::new(name, func), WorkControl::write_complete());
    }

    pub(crate) fn add_con_task(&self, id: usize, task: ConTask) {
        let mut guard = self.lock();
        self.handle_work_locked(
            &mut guard,
            Work {
                con: Some(id),
                kind: JobKind::Task(task),
                control: WorkControl::fifo(),
                status: WorkStatus::Pending,
            },
        );
    }

    pub(crate) fn add_con_task_delayed(&self, id: usize, task: ConTask, delay: Duration) {
        let begin = Instant::now()
            .checked_add(delay)
            .unwrap_or_else(Instant::now);
        let mut guard = self.lock();
        self.handle_work_locked(
            &mut guard,
            Work {
                con: Some(id),
                kind: JobKind::Task(task),
                control: WorkControl::delayed_abs(begin),
                status: WorkStatus::Pending,
            },
        );
    }

    /// Classify and route one work item. The caller holds the manager lock.
    pub(crate) fn handle_work_locked(&self, guard: &mut Mgr, work: Work) {
        let depend = work.control.depend;

        if depend.contains(Depend::TIME_DELAY) {
            debug_assert!(work.control.time_begin.is_some());
            guard.delayed_work.push(work);
        } else if depend.contains(Depend::CON_WRITE_COMPLETE) && work.con.is_some() {
            let id = work.con.expect("checked");
            match guard.cons.get_mut(id) {
                Some(sched) => sched.write_complete_work.push_back(work),
                None => log::debug!("dropping {} for dead connection", work.name()),
            }
        } else if let Some(id) = work.con {
            match guard.cons.get_mut(id) {
                Some(sched) => {
                    log::trace!(
                        "[{}] queuing pending work {}: {} total",
                        sched.name,
                        work.name(),
                        sched.work.len() + 1
                    );
                    sched.work.push_back(work);
                }
                None => log::debug!("dropping {} for dead connection", work.name()),
            }
        } else {
            self.dispatch_now_locked(guard, work, None);
            return;
        }

        self.shared.watch_sleep.signal();
        self.shared.interrupter.interrupt();
    }

    /// Hand runnable work to the pool. The caller holds the manager lock.
    pub(crate) fn dispatch_now_locked(
        &self,
        guard: &mut Mgr,
        mut work: Work,
        con: Option<Arc<Mutex<Connection>>>,
    ) {
        if work.status == WorkStatus::Pending {
            work.status = WorkStatus::Run;
        }

        // quiesce holds back everything except shutdown cleanup
        if con.is_none()
            && work.status != WorkStatus::Cancelled
            && (guard.quiesce_requested || guard.quiesce_active)
        {
            guard.deferred_work.push(work);
            return;
        }

        match &guard.work_tx {
            Some(tx) => {
                guard.jobs_active += 1;
                if tx.send(Dispatch { work, con }).is_err() {
                    guard.jobs_active -= 1;
                    log::error!("worker channel disconnected");
                }
            }
            None => log::warn!("dropping {} after shutdown", work.name()),
        }
    }

    /// Promote one queued item for an idle connection onto the pool.
    /// The caller holds the manager lock and has verified `WORK_ACTIVE` is
    /// clear.
    pub(crate) fn dispatch_con_locked(&self, guard: &mut Mgr, id: usize, mut work: Work) {
        let sched = &mut guard.cons[id];
        if sched.flags.has(ConFlags::WORK_ACTIVE) {
            debug_assert!(false, "second worker scheduled for {}", sched.name);
            log::error!(
                "[{}] refusing to schedule {} while work is active",
                sched.name,
                work.name()
            );
            sched.work.push_front(work);
            return;
        }

        sched.flags.set(ConFlags::WORK_ACTIVE);
        let arc = Arc::clone(&sched.con);
        {
            let mut con = arc.lock().expect("connection mutex poisoned");
            con.flags = sched.flags.without_mask(ConFlags::WORK_ACTIVE);
        }
        // readiness observed from here on is news the worker has not seen
        sched.flags.unset(ConFlags::CAN_READ.union(ConFlags::CAN_WRITE));

        if work.status == WorkStatus::Pending {
            work.status = WorkStatus::Run;
        }

        log::trace!("[{}] promoting work {}", sched.name, work.name());
        self.dispatch_now_locked(guard, work, Some(arc));
    }

    /// Worker completion for connection work: fold the worker's view back
    /// into the scheduler record and wake the watch.
    pub(crate) fn complete_con_work(&self, id: usize, summary: crate::connection::ConSummary) {
        let mut guard = self.lock();
        guard.jobs_active -= 1;

        if let Some(sched) = guard.cons.get_mut(id) {
            let latched = sched
                .flags
                .masked(ConFlags::CAN_READ.union(ConFlags::CAN_WRITE));
            sched.flags = sched
                .flags
                .without_mask(ConFlags::WORKER_MASK)
                .union(summary.flags.masked(ConFlags::WORKER_MASK))
                .union(latched);
            sched.flags.unset(ConFlags::WORK_ACTIVE);
            sched.in_bytes = summary.in_bytes;
            sched.out_count = summary.out_count;
            sched.input_fd = summary.input_fd;
            sched.output_fd = summary.output_fd;
            sched.last_read = summary.last_read;
            sched.last_write = summary.last_write;
            sched.last_connect = summary.last_connect;
        }

        self.shared.worker_return.broadcast();
        self.shared.watch_sleep.signal();
        drop(guard);
        self.shared.interrupter.interrupt();
    }

    /// Worker completion for unbound work.
    pub(crate) fn complete_work(&self) {
        let mut guard = self.lock();
        guard.jobs_active -= 1;
        self.shared.worker_return.broadcast();
        self.shared.watch_sleep.signal();
        drop(guard);
        self.shared.interrupter.interrupt();
    }

    /// Run every subscriber registered for `signo`, with the SIGNAL
    /// dependency cleared so each runs normally.
    pub(crate) fn dispatch_signal(&self, signo: i32) {
        let mut guard = self.lock();

        let matched: Vec<(SignalFunc, &'static str)> = guard
            .signal_subs
            .iter()
            .filter(|sub| sub.signal == signo)
            .map(|sub| (Arc::clone(&sub.func), sub.name))
            .collect();

        if matched.is_empty() {
            log::warn!("caught and ignoring signal {signo}");
            return;
        }

        for (func, name) in matched {
            let work = Work {
                con: None,
                kind: JobKind::Signal(func, name),
                control: WorkControl {
                    depend: Depend::EMPTY,
                    on_signal: Some(signo),
                    ..WorkControl::default()
                },
                status: WorkStatus::Pending,
            };
            self.dispatch_now_locked(&mut guard, work, None);
        }
    }

    /// Create the self-pipe connection on first use and install handlers for
    /// every current subscription. The caller holds the manager lock.
    pub(crate) fn ensure_signal_con(&self, guard: &mut Mgr) {
        if guard.signal_con.is_some() {
            return;
        }

        let (read_end, write_end) = match open_signal_pipe() {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("unable to create signal pipe: {err}");
                return;
            }
        };

        guard.signal_pipe_write = Some(write_end);

        match self.add_connection_locked(
            guard,
            NewConnection {
                kind: ConnectionKind::Raw,
                input: Some(read_end),
                output: None,
                shared_fd: false,
                events: Arc::new(SignalEvents),
                flags: ConFlags::NONE,
                peer: None,
                unix_path: None,
                is_listen: false,
                connected: true,
            },
        ) {
            Ok(id) => guard.signal_con = Some(id),
            Err(err) => {
                log::error!("unable to register signal connection: {err}");
                crate::signals::close_signal_pipe();
                guard.signal_pipe_write = None;
                return;
            }
        }

        let signals: Vec<i32> = guard.signal_subs.iter().map(|sub| sub.signal).collect();
        for signal in signals {
            if let Err(err) = guard.signal_table.install(signal) {
                log::error!("unable to install handler for signal {signal}: {err}");
            }
        }
    }

    // -----------------------------------------------------------------
    // connection operations (callback context)
    // -----------------------------------------------------------------

    /// Copy `data` into the connection's outgoing list; list order is send
    /// order.
    pub fn queue_write_data(&self, con: &mut Connection, data: &[u8]) -> Result<()> {
        log::trace!("[{}] write of {} bytes queued", con.name(), data.len());
        con.out.push(data.to_vec());
        if con.flags.has(ConFlags::WATCH_WRITE_TIMEOUT) {
            con.last_write = Instant::now();
        }
        self.wake_watch();
        Ok(())
    }

    /// Frame `payload` with its length prefix and queue it.
    pub fn queue_write_msg(&self, con: &mut Connection, payload: &[u8]) -> Result<()> {
        let framed = frame_msg(payload, self.shared.settings.max_msg_size)?;
        self.queue_write_data(con, &framed)
    }

    /// Stop reading; buffered output still drains before the connection
    /// finishes. Unconsumed incoming bytes stay readable for callbacks that
    /// run before the connection is freed.
    pub fn close_con(&self, con: &mut Connection) {
        if con.flags.has(ConFlags::READ_EOF) {
            return;
        }
        log::debug!("[{}] close requested", con.name());
        con.flags.set(ConFlags::READ_EOF);
        con.flags.unset(ConFlags::CAN_READ);
    }

    /// Stop writing and drop any remaining outbound buffers.
    pub fn close_con_output(&self, con: &mut Connection) {
        log::debug!("[{}] output close requested", con.name());
        con.close_output();
    }

    /// Request a soft close from outside a callback.
    pub fn queue_close(&self, conref: &ConRef) {
        let mut guard = self.lock();
        if let Some(sched) = guard.cons.get_mut(conref.id) {
            sched.close_requested = true;
        }
        drop(guard);
        self.wake_watch();
    }

    /// Change the connection's framing mode.
    pub fn change_mode(&self, con: &mut Connection, kind: ConnectionKind) -> Result<()> {
        if con.flags.has(ConFlags::IS_LISTEN) {
            return Err(Error::NotSupported);
        }
        log::debug!(
            "[{}] changing mode {} -> {}",
            con.name(),
            con.kind.as_str(),
            kind.as_str()
        );
        con.kind = kind;
        Ok(())
    }

    /// Pause scheduling and polling for one connection; queued work holds
    /// until unquiesced.
    pub fn quiesce_fd(&self, conref: &ConRef) -> Result<()> {
        let mut guard = self.lock();
        let sched = guard.cons.get_mut(conref.id).ok_or(Error::ShutDown)?;
        sched.flags.set(ConFlags::QUIESCE);
        drop(guard);
        self.wake_watch();
        Ok(())
    }

    /// Resume a quiesced connection.
    pub fn unquiesce_fd(&self, conref: &ConRef) -> Result<()> {
        let mut guard = self.lock();
        let sched = guard.cons.get_mut(conref.id).ok_or(Error::ShutDown)?;
        sched.flags.unset(ConFlags::QUIESCE);
        drop(guard);
        self.wake_watch();
        Ok(())
    }

    /// Create a reference that pins the connection in memory until dropped.
    pub fn fd_new_ref(&self, con: &Connection) -> ConRef {
        let mut guard = self.lock();
        let sched = guard
            .cons
            .get_mut(con.id)
            .expect("referenced connection vanished");
        sched.refs += 1;
        ConRef {
            id: con.id,
            name: sched.name.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue extraction of the connection's file descriptors. The watch
    /// waits for any active work, removes the fds from polling, and hands
    /// ownership to `func`.
    pub fn queue_extract_fd<F>(
        &self,
        con: &mut Connection,
        name: &'static str,
        func: F,
    ) -> Result<()>
    where
        F: FnOnce(&Conmgr, WorkStatus, Option<OwnedFd>, Option<OwnedFd>) + Send + 'static,
    {
        let mut guard = self.lock();
        let sched = guard.cons.get_mut(con.id).ok_or(Error::ShutDown)?;
        if sched.extract.is_some() {
            return Err(Error::NotSupported);
        }
        sched.extract = Some(ExtractReq {
            name,
            func: Box::new(func),
            input: None,
            output: None,
        });
        drop(guard);
        self.wake_watch();
        Ok(())
    }

    // -----------------------------------------------------------------
    // quiesce
    // -----------------------------------------------------------------

    /// Block until the manager is quiesced: no worker makes progress on any
    /// pending work until [`Conmgr::unquiesce`].
    pub fn quiesce(&self, caller: &str) {
        let mut guard = self.lock();
        log::debug!("{caller}: quiesce requested");

        // wait for any other quiesce request to fully complete
        while guard.quiesce_requested {
            guard = self.shared.on_stop_quiesced.wait(guard);
        }

        debug_assert!(!guard.quiesce_active);
        guard.quiesce_requested = true;

        while !guard.quiesce_active && !guard.shutdown_requested {
            self.shared.watch_sleep.signal();
            self.shared.interrupter.interrupt();
            let (reacquired, timed_out) = self
                .shared
                .on_start_quiesced
                .wait_timeout(guard, self.shared.settings.quiesce_timeout);
            guard = reacquired;
            if timed_out {
                log::warn!("{caller}: still waiting on quiesce");
            }
        }
    }

    /// Resume scheduling after [`Conmgr::quiesce`].
    pub fn unquiesce(&self, caller: &str) {
        let mut guard = self.lock();
        log::debug!("{caller}: unquiesce requested");
        guard.quiesce_requested = false;
        guard.quiesce_active = false;
        self.shared.on_stop_quiesced.broadcast();
        drop(guard);
        self.wake_watch();
    }

    // -----------------------------------------------------------------
    // errors
    // -----------------------------------------------------------------

    /// Store the first non-recoverable error and honor exit-on-error.
    pub(crate) fn record_error(&self, err: Error) {
        let mut guard = self.lock();
        self.record_error_locked(&mut guard, err);
        drop(guard);
        self.wake_watch();
    }

    pub(crate) fn record_error_locked(&self, guard: &mut Mgr, err: Error) {
        if guard.error.is_none() {
            guard.error = Some(err);
        }
        if guard.exit_on_error {
            guard.shutdown_requested = true;
        }
    }

    /// Shut down on the first recorded error.
    pub fn set_exit_on_error(&self, exit_on_error: bool) {
        self.lock().exit_on_error = exit_on_error;
    }

    /// Current exit-on-error policy.
    pub fn get_exit_on_error(&self) -> bool {
        self.lock().exit_on_error
    }

    /// First error recorded by the manager, if any.
    pub fn get_error(&self) -> Option<Error> {
        self.lock().error.clone()
    }

    pub(crate) fn codec(&self) -> Option<Arc<dyn RpcCodec>> {
        self.shared.callbacks.codec.clone()
    }

    pub(crate) fn tls_provider(&self) -> Option<Arc<dyn TlsProvider>> {
        self.shared.callbacks.tls.clone()
    }

    pub(crate) fn finish_complete(&self, id: usize) {
        let mut guard = self.lock();
        if let Some(sched) = guard.cons.get_mut(id) {
            sched.flags.unset(ConFlags::WAIT_ON_FINISH);
            sched.finished = true;
        }
    }
}

// ---------------------------------------------------------------------------
// internal connection tasks
// ---------------------------------------------------------------------------

fn sockaddr_to_socketaddr(
    storage: &libc::sockaddr_storage,
    _len: libc::socklen_t,
) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // Safety: family says this is a sockaddr_in.
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::from((
                std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // Safety: family says this is a sockaddr_in6.
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::from((
                std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
            )))
        }
        _ => None,
    }
}

fn task_accept(mgr: &Conmgr, con: &mut Connection) {
    con.flags.unset(ConFlags::CAN_READ);

    let Some(fd) = con.input_fd() else {
        log::debug!("[{}] skipping accept on closed connection", con.name());
        return;
    };

    // Readiness is edge-triggered: drain the backlog until it blocks.
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::accept4(
                fd,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
                libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            )
        };

        if rc == -1 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error().unwrap_or(0) {
                libc::EINTR => continue,
                libc::EAGAIN => return,
                // transient resource exhaustion, retry on the next event
                libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                    log::error!("[{}] retry accept on error: {err}", con.name());
                    return;
                }
                _ => {
                    log::error!("[{}] error on accept socket: {err}", con.name());
                    mgr.close_con(con);
                    return;
                }
            }
        }

        // Safety: accept4 returned a fresh descriptor we now own.
        let new_fd = unsafe { OwnedFd::from_raw_fd(rc) };
        let peer = sockaddr_to_socketaddr(&storage, len);
        let unix_path = if storage.ss_family as libc::c_int == libc::AF_UNIX {
            con.unix_path.clone()
        } else {
            None
        };

        let inherited = con.flags.masked(INHERIT_MASK);
        if let Err(err) = mgr.add_connection(NewConnection {
            kind: con.kind(),
            input: Some(new_fd),
            output: None,
            shared_fd: true,
            events: con.events(),
            flags: inherited,
            peer,
            unix_path,
            is_listen: false,
            connected: true,
        }) {
            log::error!("[{}] unable to register new connection: {err}", con.name());
            return;
        }
    }
}

fn task_on_connection(mgr: &Conmgr, con: &mut Connection) {
    let events = con.events();

    if con.flags.has(ConFlags::IS_LISTEN) {
        let ctx = events.on_listen_connect(mgr, con);
        con.set_ctx(ctx);
        return;
    }

    if !con.flags.has(ConFlags::IS_CONNECTED) {
        if let Some(fd) = con.output_fd() {
            match socket_error(fd) {
                Ok(None) => {}
                Ok(Some(err)) => {
                    log::debug!("[{}] connect failed: {err}", con.name());
                    mgr.close_con(con);
                    mgr.close_con_output(con);
                    return;
                }
                Err(err) => {
                    log::debug!("[{}] unable to query connect result: {err}", con.name());
                    mgr.close_con(con);
                    mgr.close_con_output(con);
                    return;
                }
            }
        }
        log::debug!("[{}] connect completed", con.name());
        con.flags.set(ConFlags::IS_CONNECTED);
    }

    let ctx = events.on_connection(mgr, con);
    con.set_ctx(ctx);
}

fn task_on_finish(mgr: &Conmgr, con: &mut Connection) {
    let events = con.events();
    let ctx = con.take_ctx();
    events.on_finish(mgr, con, ctx);
    mgr.finish_complete(con.id);
}

fn task_grow_buffer(mgr: &Conmgr, con: &mut Connection, need: usize) {
    let have = con.in_buf.len();
    if need <= have {
        return;
    }
    if let Err(err) = con.in_buf.try_grow(need - have) {
        log::error!(
            "[{}] unable to grow input buffer by {} bytes: {err}",
            con.name(),
            need - have
        );
        mgr.close_con(con);
    }
}

enum TimeoutKind {
    Read,
    Write,
    Connect,
}

fn task_timeout(mgr: &Conmgr, con: &mut Connection, kind: TimeoutKind) {
    let events = con.events();
    let now = Instant::now();

    let result = match kind {
        TimeoutKind::Read => events.on_read_timeout(mgr, con),
        TimeoutKind::Write => events.on_write_timeout(mgr, con),
        TimeoutKind::Connect => events.on_connect_timeout(mgr, con),
    };

    match result {
        Ok(()) => match kind {
            // re-arm
            TimeoutKind::Read => con.last_read = now,
            TimeoutKind::Write => con.last_write = now,
            TimeoutKind::Connect => con.last_connect = now,
        },
        Err(err) => {
            log::debug!("[{}] timeout callback closing connection: {err}", con.name());
            mgr.close_con(con);
            if matches!(kind, TimeoutKind::Connect) {
                mgr.close_con_output(con);
            }
        }
    }
}

/// Execute one internal connection task on a worker thread.
pub(crate) fn run_con_task(mgr: &Conmgr, con: &mut Connection, task: ConTask, status: WorkStatus) {
    if status == WorkStatus::Cancelled {
        // cleanup only; extraction still transfers descriptor ownership
        if let ConTask::Extract(req) = task {
            (req.func)(mgr, status, req.input, req.output);
        }
        return;
    }

    match task {
        ConTask::Accept => task_accept(mgr, con),
        ConTask::OnConnection => task_on_connection(mgr, con),
        ConTask::Read => crate::io::handle_read(mgr, con),
        ConTask::OnData => crate::io::wrap_on_data(mgr, con),
        ConTask::Write => crate::io::handle_write(mgr, con),
        ConTask::OnFinish => task_on_finish(mgr, con),
        ConTask::TlsCreate => crate::tls::tls_create(mgr, con),
        ConTask::DeferredClose => crate::tls::deferred_close(mgr, con),
        ConTask::Fingerprint => crate::tls::handle_fingerprint(mgr, con),
        ConTask::GrowBuffer(need) => task_grow_buffer(mgr, con, need),
        ConTask::ReadTimeout => task_timeout(mgr, con, TimeoutKind::Read),
        ConTask::WriteTimeout => task_timeout(mgr, con, TimeoutKind::Write),
        ConTask::ConnectTimeout => task_timeout(mgr, con, TimeoutKind::Connect),
        ConTask::Extract(req) => (req.func)(mgr, status, req.input, req.output),
    }
}

// ---------------------------------------------------------------------------
// connection references
// ---------------------------------------------------------------------------

/// A handle whose existence pins a connection in memory.
///
/// The connection may not be freed while references exist; dropping the
/// handle releases it and wakes the watch.
pub struct ConRef {
    id: usize,
    name: String,
    shared: Arc<Shared>,
}

impl fmt::Debug for ConRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConRef")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl ConRef {
    /// Name of the referenced connection.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Clone for ConRef {
    fn clone(&self) -> Self {
        let mut guard = self.shared.mgr.lock().expect("manager mutex poisoned");
        if let Some(sched) = guard.cons.get_mut(self.id) {
            sched.refs += 1;
        }
        Self {
            id: self.id,
            name: self.name.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ConRef {
    fn drop(&mut self) {
        let mut guard = self.shared.mgr.lock().expect("manager mutex poisoned");
        if let Some(sched) = guard.cons.get_mut(self.id) {
            debug_assert!(sched.refs > 0);
            sched.refs = sched.refs.saturating_sub(1);
        }
        self.shared.watch_sleep.signal();
        drop(guard);
        self.shared.interrupter.interrupt();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::Ctx;
    use crate::rpc::{RpcCodec, RpcMsg, UnpackError};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    fn test_settings() -> Settings {
        Settings {
            threads: 2,
            ..Settings::default()
        }
    }

    fn bound_listener() -> (OwnedFd, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        (listener.into(), addr)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[derive(Default)]
    struct CountingCodec {
        sizes: StdMutex<Vec<usize>>,
    }

    impl RpcCodec for CountingCodec {
        fn unpack(
            &self,
            _con: &Connection,
            payload: &[u8],
        ) -> std::result::Result<RpcMsg, UnpackError> {
            self.sizes.lock().unwrap().push(payload.len());
            Ok(Box::new(payload.to_vec()))
        }
    }

    struct EchoEvents;

    impl ConnectionEvents for EchoEvents {
        fn on_msg(
            &self,
            mgr: &Conmgr,
            con: &mut Connection,
            msg: std::result::Result<RpcMsg, UnpackError>,
            _raw: Option<Vec<u8>>,
        ) -> std::io::Result<()> {
            let msg = msg
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
            let payload = msg.downcast::<Vec<u8>>().expect("codec returns Vec<u8>");
            mgr.queue_write_msg(con, &payload)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        }
    }

    #[test]
    fn rpc_frames_echo_across_chunked_reads() {
        let codec = Arc::new(CountingCodec::default());
        let mgr = Conmgr::new(
            test_settings(),
            Callbacks {
                codec: Some(codec.clone()),
                tls: None,
            },
        )
        .unwrap();

        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(fd, ConnectionKind::Rpc, Arc::new(EchoEvents), ConFlags::NONE)
            .unwrap();
        mgr.run(false).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // two frames of 100 and 7 payload bytes, chunked as 1, 3, 102, 5
        let mut wire = Vec::new();
        wire.extend_from_slice(&100u32.to_be_bytes());
        wire.extend_from_slice(&[0xaa; 100]);
        wire.extend_from_slice(&7u32.to_be_bytes());
        wire.extend_from_slice(b"0123456");

        let mut offset = 0;
        for chunk in [1usize, 3, 102, 5] {
            client.write_all(&wire[offset..offset + chunk]).unwrap();
            offset += chunk;
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(offset, wire.len());

        let mut reply = vec![0u8; wire.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(wire, reply);

        // the codec saw exactly two frames of the exact payload sizes
        assert_eq!(vec![100, 7], *codec.sizes.lock().unwrap());

        mgr.request_shutdown();
        mgr.fini();
    }

    #[test]
    fn oversized_length_prefix_closes_and_records_error() {
        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();

        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(fd, ConnectionKind::Rpc, Arc::new(EchoEvents), ConFlags::NONE)
            .unwrap();
        mgr.run(false).unwrap();

        let max = mgr.settings().max_msg_size;
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&(max + 1).to_be_bytes()).unwrap();

        wait_for("insane length error", || {
            matches!(mgr.get_error(), Some(Error::InsaneMsgLength(_)))
        });
        assert_eq!(Some(Error::InsaneMsgLength(max + 1)), mgr.get_error());

        // server closed the connection
        let mut buf = [0u8; 1];
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));

        mgr.request_shutdown();
        mgr.fini();
    }

    #[test]
    fn fingerprint_routes_plaintext_to_rpc() {
        let codec = Arc::new(CountingCodec::default());
        let mgr = Conmgr::new(
            test_settings(),
            Callbacks {
                codec: Some(codec.clone()),
                tls: None,
            },
        )
        .unwrap();

        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(
            fd,
            ConnectionKind::Rpc,
            Arc::new(EchoEvents),
            ConFlags::TLS_FINGERPRINT,
        )
        .unwrap();
        mgr.run(false).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut frame = 7u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"sniffme");
        client.write_all(&frame).unwrap();

        let mut reply = vec![0u8; frame.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(frame, reply);
        assert_eq!(vec![7], *codec.sizes.lock().unwrap());

        mgr.request_shutdown();
        mgr.fini();
    }

    #[derive(Default)]
    struct TlsRequiredEvents {
        finished: AtomicUsize,
    }

    impl ConnectionEvents for TlsRequiredEvents {
        fn on_data(&self, mgr: &Conmgr, con: &mut Connection) -> std::io::Result<()> {
            // the peer never offered TLS: send one diagnostic reply and close
            let pending = con.in_buffer().len();
            assert!(pending > 0, "rejected peer's bytes must reach the host");
            con.mark_consumed(pending);
            mgr.queue_write_data(con, b"tls required")
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            mgr.close_con(con);
            Ok(())
        }

        fn on_finish(&self, _mgr: &Conmgr, _con: &mut Connection, _ctx: Option<Ctx>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tls_required_rejects_plaintext_after_host_reply() {
        let events = Arc::new(TlsRequiredEvents::default());
        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();

        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(
            fd,
            ConnectionKind::Rpc,
            events.clone(),
            ConFlags::TLS_FINGERPRINT.union(ConFlags::TLS_REQUIRED),
        )
        .unwrap();
        mgr.run(false).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // a plaintext RPC frame on a listener that requires TLS
        let mut frame = 7u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"noctls!");
        client.write_all(&frame).unwrap();

        // the host's single failure reply drains before the close
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(b"tls required".as_slice(), &reply);

        assert_eq!(Some(Error::TlsRequired), mgr.get_error());
        wait_for("rejected connection finished", || {
            events.finished.load(Ordering::SeqCst) == 1
        });

        mgr.request_shutdown();
        mgr.fini();
    }

    #[derive(Default)]
    struct LifecycleEvents {
        connected: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ConnectionEvents for LifecycleEvents {
        fn on_connection(&self, _mgr: &Conmgr, _con: &mut Connection) -> Option<Ctx> {
            self.connected.fetch_add(1, Ordering::SeqCst);
            None
        }

        fn on_data(&self, _mgr: &Conmgr, _con: &mut Connection) -> std::io::Result<()> {
            // consume nothing so the bytes stay pending
            Ok(())
        }

        fn on_finish(&self, _mgr: &Conmgr, _con: &mut Connection, _ctx: Option<Ctx>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn shutdown_finishes_every_connection_exactly_once() {
        let events = Arc::new(LifecycleEvents::default());
        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();

        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(fd, ConnectionKind::Raw, events.clone(), ConFlags::NONE)
            .unwrap();
        mgr.run(false).unwrap();

        let clients: Vec<TcpStream> = (0..20)
            .map(|_| TcpStream::connect(addr).unwrap())
            .collect();
        for client in &clients {
            (&*client).write_all(b"x").unwrap();
        }

        wait_for("all clients connected", || {
            events.connected.load(Ordering::SeqCst) == clients.len()
        });

        mgr.request_shutdown();
        mgr.fini();

        // every connection plus the listener finished exactly once
        assert_eq!(
            events.connected.load(Ordering::SeqCst) + 1,
            events.finished.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn delayed_work_fires_in_deadline_order() {
        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();
        let fired: Arc<StdMutex<Vec<(&'static str, Instant)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let base = Instant::now();

        for (tag, delay_ms) in [("first", 50u64), ("third", 200), ("second", 100)] {
            let fired = Arc::clone(&fired);
            mgr.add_work(
                Callback::new("delayed_probe", move |_, args| {
                    if args.status == WorkStatus::Cancelled {
                        return;
                    }
                    fired.lock().unwrap().push((tag, Instant::now()));
                }),
                WorkControl::delayed_abs(base + Duration::from_millis(delay_ms)),
            );
        }

        mgr.run(false).unwrap();
        wait_for("all delayed work", || fired.lock().unwrap().len() == 3);

        let entries = fired.lock().unwrap().clone();
        let tags: Vec<&str> = entries.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(vec!["first", "second", "third"], tags);

        let tolerance = Duration::from_millis(2);
        for (tag, at) in &entries {
            let deadline = match *tag {
                "first" => base + Duration::from_millis(50),
                "second" => base + Duration::from_millis(100),
                _ => base + Duration::from_millis(200),
            };
            assert!(
                *at + tolerance >= deadline,
                "{tag} fired before its deadline"
            );
        }

        mgr.fini();
    }

    #[test]
    fn quiesce_holds_back_new_work() {
        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();

        // keep the watch alive across the quiesce window
        let (fd, _addr) = bound_listener();
        mgr.process_fd_listen(
            fd,
            ConnectionKind::Raw,
            Arc::new(LifecycleEvents::default()),
            ConFlags::NONE,
        )
        .unwrap();
        mgr.run(false).unwrap();

        mgr.quiesce("quiesce_holds_back_new_work");

        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        mgr.add_work_fifo("quiesced_probe", move |_, args| {
            if args.status != WorkStatus::Cancelled {
                probe.fetch_add(1, Ordering::SeqCst);
            }
        });

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(0, counter.load(Ordering::SeqCst), "work ran while quiesced");

        mgr.unquiesce("quiesce_holds_back_new_work");
        wait_for("deferred work after unquiesce", || {
            counter.load(Ordering::SeqCst) == 1
        });

        mgr.request_shutdown();
        mgr.fini();
    }

    #[test]
    fn signal_work_runs_once_per_delivery() {
        let _serial = crate::signals::SIGNAL_TEST_LOCK
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&count);

        mgr.add_signal_work(libc::SIGUSR2, "count_usr2", move |_, args| {
            if args.status != WorkStatus::Cancelled {
                probe.fetch_add(1, Ordering::SeqCst);
            }
        });
        mgr.run(false).unwrap();

        // give the watch a moment to create the pipe and install the handler
        std::thread::sleep(Duration::from_millis(100));

        for _ in 0..3 {
            unsafe { libc::raise(libc::SIGUSR2) };
            std::thread::sleep(Duration::from_millis(30));
        }

        wait_for("three signal callbacks", || count.load(Ordering::SeqCst) == 3);
        assert_eq!(3, count.load(Ordering::SeqCst));

        mgr.request_shutdown();
        mgr.fini();
    }

    struct ExtractEvents {
        tx: StdMutex<Option<mpsc::Sender<Option<OwnedFd>>>>,
    }

    impl ConnectionEvents for ExtractEvents {
        fn on_connection(&self, mgr: &Conmgr, con: &mut Connection) -> Option<Ctx> {
            if let Some(tx) = self.tx.lock().unwrap().take() {
                mgr.queue_extract_fd(con, "extract_probe", move |_, _, input, _output| {
                    let _ = tx.send(input);
                })
                .unwrap();
            }
            None
        }
    }

    #[test]
    fn extract_transfers_descriptor_ownership() {
        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();
        let (pipe_read, pipe_write) = crate::io::pipe_pair().unwrap();
        let (tx, rx) = mpsc::channel();

        mgr.process_fd_pair(
            ConnectionKind::Raw,
            Some(pipe_read),
            None,
            Arc::new(ExtractEvents {
                tx: StdMutex::new(Some(tx)),
            }),
            ConFlags::NONE,
        )
        .unwrap();
        mgr.run(false).unwrap();

        let extracted = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("extraction callback ran")
            .expect("input fd transferred");

        // the descriptor is alive and usable outside the manager
        crate::io::write_fd(std::os::fd::AsRawFd::as_raw_fd(&pipe_write), b"ping").unwrap();
        let mut buf = [0u8; 4];
        crate::io::set_blocking(std::os::fd::AsRawFd::as_raw_fd(&extracted)).unwrap();
        let got =
            crate::io::read_fd(std::os::fd::AsRawFd::as_raw_fd(&extracted), &mut buf).unwrap();
        assert_eq!(b"ping", &buf[..got]);

        mgr.request_shutdown();
        mgr.fini();
    }

    struct GreetEvents;

    impl ConnectionEvents for GreetEvents {
        fn on_connection(&self, mgr: &Conmgr, con: &mut Connection) -> Option<Ctx> {
            mgr.queue_write_data(con, b"hi").unwrap();
            None
        }
    }

    #[test]
    fn connect_socket_completes_and_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();
        mgr.create_connect_socket(
            ConnectionKind::Raw,
            addr,
            Arc::new(GreetEvents),
            ConFlags::NONE,
        )
        .unwrap();
        mgr.run(false).unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(b"hi", &buf);

        mgr.request_shutdown();
        mgr.fini();
    }

    #[test]
    fn read_timeout_closes_idle_connection() {
        let events = Arc::new(LifecycleEvents::default());
        let settings = Settings {
            threads: 2,
            read_timeout: Duration::from_millis(100),
            ..Settings::default()
        };
        let mgr = Conmgr::new(settings, Callbacks::default()).unwrap();

        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(
            fd,
            ConnectionKind::Raw,
            events.clone(),
            ConFlags::WATCH_READ_TIMEOUT,
        )
        .unwrap();
        mgr.run(false).unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        wait_for("accepted connection", || {
            events.connected.load(Ordering::SeqCst) == 1
        });

        // the default on_read_timeout closes the idle connection
        wait_for("idle connection finished", || {
            events.finished.load(Ordering::SeqCst) == 1
        });

        mgr.request_shutdown();
        mgr.fini();
    }

    #[test]
    fn write_complete_work_runs_after_drain() {
        struct WriteCompleteEvents {
            done: Arc<AtomicUsize>,
        }

        impl ConnectionEvents for WriteCompleteEvents {
            fn on_connection(&self, mgr: &Conmgr, con: &mut Connection) -> Option<Ctx> {
                mgr.queue_write_data(con, b"payload").unwrap();
                let done = Arc::clone(&self.done);
                mgr.add_write_complete_work(con, "drained_probe", move |_, args| {
                    if args.status != WorkStatus::Cancelled {
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                });
                None
            }
        }

        let done = Arc::new(AtomicUsize::new(0));
        let settings = Settings {
            threads: 2,
            wait_write_delay: Duration::from_millis(50),
            ..Settings::default()
        };
        let mgr = Conmgr::new(settings, Callbacks::default()).unwrap();
        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(
            fd,
            ConnectionKind::Raw,
            Arc::new(WriteCompleteEvents {
                done: Arc::clone(&done),
            }),
            ConFlags::NONE,
        )
        .unwrap();
        mgr.run(false).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(b"payload", &buf);

        wait_for("write complete work", || done.load(Ordering::SeqCst) == 1);

        mgr.request_shutdown();
        mgr.fini();
    }

    #[test]
    fn references_pin_connections_until_dropped() {
        struct RefEvents {
            tx: StdMutex<Option<mpsc::Sender<ConRef>>>,
        }

        impl ConnectionEvents for RefEvents {
            fn on_connection(&self, mgr: &Conmgr, con: &mut Connection) -> Option<Ctx> {
                if let Some(tx) = self.tx.lock().unwrap().take() {
                    let _ = tx.send(mgr.fd_new_ref(con));
                }
                None
            }
        }

        let mgr = Conmgr::new(test_settings(), Callbacks::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let (fd, addr) = bound_listener();
        mgr.process_fd_listen(
            fd,
            ConnectionKind::Raw,
            Arc::new(RefEvents {
                tx: StdMutex::new(Some(tx)),
            }),
            ConFlags::NONE,
        )
        .unwrap();
        mgr.run(false).unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let conref = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(conref.name().starts_with("[peer="));
        drop(client);

        // the held reference pins the connection, so the watch cannot drain
        mgr.request_shutdown();
        std::thread::sleep(Duration::from_millis(100));
        assert!(
            mgr.lock().watching,
            "watch exited while a reference was held"
        );

        drop(conref);
        wait_for("watch drained after reference drop", || !mgr.lock().watching);
        mgr.fini();
    }
}
