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

//! Readiness polling abstraction.
//!
//! Maps per-fd interest types onto one of two backends: the edge/level system
//! facility via [`mio`], or a level-triggered `poll(2)` array. Both expose
//! the same surface: link/relink/unlink, a blocking poll bounded by a
//! deadline, an exactly-once event walk, and an interrupt handle that is safe
//! to fire from any thread, including with the manager mutex held.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::io::{pipe_pair, set_nonblocking};

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Which readiness backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Edge/level system facility (epoll on Linux) via mio.
    Epoll,
    /// Level-triggered `poll(2)` over a rebuilt fd array.
    Poll,
}

/// Interest registered for a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdType {
    /// Not polled at all.
    None,
    /// Watch only for close or error.
    Connected,
    /// Watch for incoming data.
    ReadOnly,
    /// Watch for incoming data and write space.
    ReadWrite,
    /// Watch for write space.
    WriteOnly,
    /// Watch for incoming connections.
    Listen,
}

impl FdType {
    /// Human-readable name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            FdType::None => "NONE",
            FdType::Connected => "CONNECTED",
            FdType::ReadOnly => "READ_ONLY",
            FdType::ReadWrite => "READ_WRITE",
            FdType::WriteOnly => "WRITE_ONLY",
            FdType::Listen => "LISTEN",
        }
    }
}

/// Readiness reported for one file descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    read: bool,
    write: bool,
    error: bool,
    hangup: bool,
}

impl Readiness {
    /// Data (or a pending accept) can be read.
    pub fn can_read(self) -> bool {
        self.read
    }

    /// The fd can accept writes.
    pub fn can_write(self) -> bool {
        self.write
    }

    /// The fd is in an error state (POLLERR/POLLNVAL equivalents).
    pub fn has_error(self) -> bool {
        self.error
    }

    /// The peer hung up.
    pub fn has_hangup(self) -> bool {
        self.hangup
    }
}

/// Handle that wakes a blocked [`Pollctl::poll`] from another thread.
#[derive(Debug, Clone)]
pub(crate) struct Interrupter {
    inner: InterruptInner,
}

#[derive(Debug, Clone)]
enum InterruptInner {
    Waker(Arc<Waker>),
    Pipe(Arc<OwnedFd>),
}

impl Interrupter {
    /// Wake the poller. Never blocks; failures are logged and dropped
    /// because a full self-pipe already guarantees a pending wakeup.
    pub(crate) fn interrupt(&self) {
        match &self.inner {
            InterruptInner::Waker(waker) => {
                if let Err(err) = waker.wake() {
                    log::warn!("pollctl: waker failed: {err}");
                }
            }
            InterruptInner::Pipe(fd) => {
                let rc = unsafe {
                    libc::write(fd.as_raw_fd(), b"!".as_ptr().cast(), 1)
                };
                if rc == -1 {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::BrokenPipe => {}
                        _ => log::warn!("pollctl: interrupt pipe failed: {err}"),
                    }
                }
            }
        }
    }
}

/// Poll controller owned by the watch thread.
#[derive(Debug)]
pub(crate) struct Pollctl {
    backend: Backend,
    collected: Vec<(RawFd, Readiness)>,
}

#[derive(Debug)]
enum Backend {
    Epoll(EpollBackend),
    Array(ArrayBackend),
}

impl Pollctl {
    pub(crate) fn new(mode: PollMode) -> io::Result<Self> {
        let backend = match mode {
            PollMode::Epoll => Backend::Epoll(EpollBackend::new()?),
            PollMode::Poll => Backend::Array(ArrayBackend::new()?),
        };
        Ok(Self {
            backend,
            collected: Vec::new(),
        })
    }

    pub(crate) fn interrupter(&self) -> Interrupter {
        let inner = match &self.backend {
            Backend::Epoll(epoll) => InterruptInner::Waker(Arc::clone(&epoll.waker)),
            Backend::Array(array) => InterruptInner::Pipe(Arc::clone(&array.pipe_write)),
        };
        Interrupter { inner }
    }

    /// Register `fd` with the given interest.
    pub(crate) fn link_fd(&mut self, fd: RawFd, fd_type: FdType, name: &str) -> io::Result<()> {
        debug_assert!(fd_type != FdType::None, "link with NONE interest");
        log::trace!("pollctl: [{name}] link fd={fd} type={}", fd_type.as_str());
        match &mut self.backend {
            Backend::Epoll(epoll) => epoll.link(fd, fd_type),
            Backend::Array(array) => array.link(fd, fd_type),
        }
    }

    /// Adjust the interest of an already linked `fd`.
    pub(crate) fn relink_fd(&mut self, fd: RawFd, fd_type: FdType, name: &str) -> io::Result<()> {
        debug_assert!(fd_type != FdType::None, "relink with NONE interest");
        log::trace!("pollctl: [{name}] relink fd={fd} type={}", fd_type.as_str());
        match &mut self.backend {
            Backend::Epoll(epoll) => epoll.relink(fd, fd_type),
            Backend::Array(array) => array.relink(fd, fd_type),
        }
    }

    /// Remove `fd` from the interest set.
    pub(crate) fn unlink_fd(&mut self, fd: RawFd, name: &str) -> io::Result<()> {
        log::trace!("pollctl: [{name}] unlink fd={fd}");
        match &mut self.backend {
            Backend::Epoll(epoll) => epoll.unlink(fd),
            Backend::Array(array) => array.unlink(fd),
        }
    }

    /// Block until at least one fd is ready, the timeout elapses, or an
    /// interrupt arrives. EINTR is treated as a spurious wakeup.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.collected.clear();
        match &mut self.backend {
            Backend::Epoll(epoll) => epoll.poll(timeout, &mut self.collected),
            Backend::Array(array) => array.poll(timeout, &mut self.collected),
        }
    }

    /// Walk the events surfaced by the last poll, exactly once.
    pub(crate) fn for_each_event<F>(&mut self, mut func: F)
    where
        F: FnMut(RawFd, Readiness),
    {
        for (fd, readiness) in std::mem::take(&mut self.collected) {
            func(fd, readiness);
        }
    }
}

#[derive(Debug)]
struct EpollBackend {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl EpollBackend {
    fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
        })
    }

    fn interest(fd_type: FdType) -> Interest {
        match fd_type {
            FdType::ReadWrite => Interest::READABLE | Interest::WRITABLE,
            FdType::WriteOnly => Interest::WRITABLE,
            // Hangup and error are always surfaced; READABLE is the
            // narrowest interest mio will register.
            FdType::ReadOnly | FdType::Listen | FdType::Connected => Interest::READABLE,
            FdType::None => unreachable!("NONE is unlinked, not registered"),
        }
    }

    fn link(&mut self, fd: RawFd, fd_type: FdType) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), Self::interest(fd_type))
    }

    fn relink(&mut self, fd: RawFd, fd_type: FdType) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), Self::interest(fd_type))
    }

    fn unlink(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        collected: &mut Vec<(RawFd, Readiness)>,
    ) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }

            collected.push((
                event.token().0 as RawFd,
                Readiness {
                    read: event.is_readable(),
                    write: event.is_writable(),
                    error: event.is_error(),
                    hangup: event.is_read_closed(),
                },
            ));
        }

        Ok(())
    }
}

#[derive(Debug)]
struct ArrayBackend {
    fds: Vec<(RawFd, FdType)>,
    pipe_read: OwnedFd,
    pipe_write: Arc<OwnedFd>,
}

impl ArrayBackend {
    fn new() -> io::Result<Self> {
        let (pipe_read, pipe_write) = pipe_pair()?;
        set_nonblocking(pipe_read.as_raw_fd())?;
        set_nonblocking(pipe_write.as_raw_fd())?;
        Ok(Self {
            fds: Vec::new(),
            pipe_read,
            pipe_write: Arc::new(pipe_write),
        })
    }

    fn link(&mut self, fd: RawFd, fd_type: FdType) -> io::Result<()> {
        if self.fds.iter().any(|(linked, _)| *linked == fd) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        self.fds.push((fd, fd_type));
        Ok(())
    }

    fn relink(&mut self, fd: RawFd, fd_type: FdType) -> io::Result<()> {
        match self.fds.iter_mut().find(|(linked, _)| *linked == fd) {
            Some(entry) => {
                entry.1 = fd_type;
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn unlink(&mut self, fd: RawFd) -> io::Result<()> {
        match self.fds.iter().position(|(linked, _)| *linked == fd) {
            Some(index) => {
                self.fds.swap_remove(index);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn events_for(fd_type: FdType) -> libc::c_short {
        match fd_type {
            FdType::ReadOnly | FdType::Listen => libc::POLLIN,
            FdType::ReadWrite => libc::POLLIN | libc::POLLOUT,
            FdType::WriteOnly => libc::POLLOUT,
            // Errors and hangups are reported regardless of the event mask.
            FdType::Connected => 0,
            FdType::None => unreachable!("NONE is unlinked, not registered"),
        }
    }

    fn drain_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(
                    self.pipe_read.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if rc <= 0 {
                return;
            }
        }
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        collected: &mut Vec<(RawFd, Readiness)>,
    ) -> io::Result<()> {
        let mut pollfds = Vec::with_capacity(self.fds.len() + 1);
        pollfds.push(libc::pollfd {
            fd: self.pipe_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for &(fd, fd_type) in &self.fds {
            pollfds.push(libc::pollfd {
                fd,
                events: Self::events_for(fd_type),
                revents: 0,
            });
        }

        let timeout_ms = match timeout {
            // Round sub-millisecond deadlines up so a short sleep never
            // becomes a busy spin.
            Some(t) => t.as_millis().clamp(1, i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if pollfds[0].revents != 0 {
            self.drain_pipe();
        }

        for pollfd in &pollfds[1..] {
            if pollfd.revents == 0 {
                continue;
            }
            collected.push((
                pollfd.fd,
                Readiness {
                    read: pollfd.revents & libc::POLLIN != 0,
                    write: pollfd.revents & libc::POLLOUT != 0,
                    error: pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                    hangup: pollfd.revents & libc::POLLHUP != 0,
                },
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{FdType, PollMode, Pollctl};
    use crate::io::pipe_pair;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};

    fn readable_pipe_is_reported(mode: PollMode) {
        let mut pollctl = Pollctl::new(mode).unwrap();
        let (read_end, write_end) = pipe_pair().unwrap();
        crate::io::set_nonblocking(read_end.as_raw_fd()).unwrap();

        pollctl
            .link_fd(read_end.as_raw_fd(), FdType::ReadOnly, "test")
            .unwrap();

        let rc = unsafe { libc::write(write_end.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(1, rc);

        pollctl.poll(Some(Duration::from_millis(500))).unwrap();

        let mut seen = Vec::new();
        pollctl.for_each_event(|fd, readiness| {
            assert!(readiness.can_read());
            seen.push(fd);
        });
        assert_eq!(vec![read_end.as_raw_fd()], seen);

        // the walk consumes events exactly once
        let mut again = 0;
        pollctl.for_each_event(|_, _| again += 1);
        assert_eq!(0, again);

        pollctl.unlink_fd(read_end.as_raw_fd(), "test").unwrap();
    }

    #[test]
    fn epoll_reports_readable_pipe() {
        readable_pipe_is_reported(PollMode::Epoll);
    }

    #[test]
    fn poll_array_reports_readable_pipe() {
        readable_pipe_is_reported(PollMode::Poll);
    }

    fn interrupt_wakes_poll(mode: PollMode) {
        let mut pollctl = Pollctl::new(mode).unwrap();
        let interrupter = pollctl.interrupter();

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });

        let start = Instant::now();
        pollctl.poll(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));

        let mut events = 0;
        pollctl.for_each_event(|_, _| events += 1);
        assert_eq!(0, events);

        waker.join().unwrap();
    }

    #[test]
    fn epoll_interrupt_wakes_poll() {
        interrupt_wakes_poll(PollMode::Epoll);
    }

    #[test]
    fn poll_array_interrupt_wakes_poll() {
        interrupt_wakes_poll(PollMode::Poll);
    }

    #[test]
    fn relink_adjusts_interest() {
        let mut pollctl = Pollctl::new(PollMode::Poll).unwrap();
        let (read_end, _write_end) = pipe_pair().unwrap();

        pollctl
            .link_fd(read_end.as_raw_fd(), FdType::ReadOnly, "test")
            .unwrap();
        pollctl
            .relink_fd(read_end.as_raw_fd(), FdType::Connected, "test")
            .unwrap();

        // nothing written: a CONNECTED pipe must not report readability
        pollctl.poll(Some(Duration::from_millis(10))).unwrap();
        let mut events = 0;
        pollctl.for_each_event(|_, _| events += 1);
        assert_eq!(0, events);
    }
}
