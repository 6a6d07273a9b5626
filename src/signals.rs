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

//! Signal handling over a self-pipe.
//!
//! A single async-signal-safe handler writes the signal number into a
//! non-blocking pipe. The pipe's read side is an ordinary RAW connection
//! whose `on_data` decodes successive integers and re-queues every
//! subscribed work item with the SIGNAL dependency cleared.
//!
//! The handler may not allocate or lock, so the pipe's write fd is the one
//! process-global in the crate.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::connection::{Connection, ConnectionEvents};
use crate::io::{pipe_pair, set_nonblocking};
use crate::mgr::Conmgr;

/// Write side of the self-pipe, or -1 when no manager is listening.
static SIGNAL_PIPE_FD: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe handler: write the signal number, nothing else.
extern "C" fn signal_handler(signo: libc::c_int) {
    // A forked child inherits the handler registration but not the manager;
    // ignore signals until a new pipe exists.
    let fd = SIGNAL_PIPE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    let bytes = signo.to_ne_bytes();
    loop {
        let rc = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if rc == bytes.len() as isize {
            return;
        }

        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        match errno {
            libc::EINTR => continue,
            // Pipe already full: drop the signal, something is badly wedged
            // anyway and the exact count no longer matters.
            libc::EAGAIN => return,
            // Raced with manager shutdown closing the pipe.
            libc::EPIPE | libc::EBADF => {
                SIGNAL_PIPE_FD.store(-1, Ordering::Relaxed);
                return;
            }
            _ => return,
        }
    }
}

/// Create the self-pipe and publish its write side to the handler.
pub(crate) fn open_signal_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = pipe_pair()?;
    set_nonblocking(write_end.as_raw_fd())?;
    SIGNAL_PIPE_FD.store(write_end.as_raw_fd(), Ordering::Relaxed);
    Ok((read_end, write_end))
}

/// Detach the handler from the pipe before it closes.
pub(crate) fn close_signal_pipe() {
    SIGNAL_PIPE_FD.store(-1, Ordering::Relaxed);
}

/// Registered process-wide signal handlers. The table grows monotonically;
/// handlers are never uninstalled.
#[derive(Debug, Default)]
pub(crate) struct SignalTable {
    installed: Vec<i32>,
}

impl SignalTable {
    /// Install the shared handler for `signal` if not yet installed.
    pub(crate) fn install(&mut self, signal: i32) -> io::Result<()> {
        if self.installed.contains(&signal) {
            return Ok(());
        }

        // Safety: sigaction with a handler that only calls write(2).
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = signal_handler as usize;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        log::debug!("installed handler for signal {signal}");
        self.installed.push(signal);
        Ok(())
    }
}

/// Callback table for the pipe's read-side connection.
#[derive(Debug, Default)]
pub(crate) struct SignalEvents;

impl ConnectionEvents for SignalEvents {
    fn on_data(&self, mgr: &Conmgr, con: &mut Connection) -> io::Result<()> {
        const INT_SIZE: usize = std::mem::size_of::<libc::c_int>();

        let mut consumed = 0;
        {
            let data = con.in_buffer();
            while consumed + INT_SIZE <= data.len() {
                let signo = libc::c_int::from_ne_bytes(
                    data[consumed..consumed + INT_SIZE]
                        .try_into()
                        .expect("int-sized slice"),
                );
                log::debug!("[{}] got signal {signo}", con.name());
                mgr.dispatch_signal(signo);
                consumed += INT_SIZE;
            }
        }

        con.mark_consumed(consumed);
        Ok(())
    }

    fn on_finish(
        &self,
        _mgr: &Conmgr,
        con: &mut Connection,
        _ctx: Option<crate::connection::Ctx>,
    ) {
        log::debug!("[{}] signal connection finished", con.name());
        close_signal_pipe();
    }
}

/// True when `fd` is the live signal-pipe write side (test hook).
#[cfg(test)]
pub(crate) fn pipe_fd_is(fd: std::os::fd::RawFd) -> bool {
    SIGNAL_PIPE_FD.load(Ordering::Relaxed) == fd
}

/// Serializes tests that touch the process-global signal pipe.
#[cfg(test)]
pub(crate) static SIGNAL_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::read_fd;

    #[test]
    fn handler_writes_signal_number_to_pipe() {
        let _serial = SIGNAL_TEST_LOCK.lock().unwrap();
        let (read_end, write_end) = open_signal_pipe().unwrap();
        assert!(pipe_fd_is(write_end.as_raw_fd()));

        signal_handler(libc::SIGHUP);
        signal_handler(libc::SIGUSR1);

        let mut buf = [0u8; 8];
        let got = read_fd(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(8, got);
        assert_eq!(libc::SIGHUP, libc::c_int::from_ne_bytes(buf[..4].try_into().unwrap()));
        assert_eq!(libc::SIGUSR1, libc::c_int::from_ne_bytes(buf[4..].try_into().unwrap()));

        close_signal_pipe();
        signal_handler(libc::SIGHUP); // dropped, pipe detached
        crate::io::set_nonblocking(read_end.as_raw_fd()).unwrap();
        assert!(read_fd(read_end.as_raw_fd(), &mut buf).is_err());
    }
}
