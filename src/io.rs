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

//! Connection I/O: the read and writev paths, on-data dispatch, and the thin
//! libc wrappers the rest of the crate shares.

use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::connection::{ConFlags, Connection, ConnectionKind};
use crate::error::Error;
use crate::mgr::Conmgr;
use crate::rpc;

/// Fallback read size when the kernel cannot report a byte count.
pub(crate) const DEFAULT_READ_BYTES: usize = 512;

/// Number of iovecs kept on the stack before falling back to the heap.
const IOV_STACK_COUNT: usize = 16;
// libc does not expose IOV_MAX on this platform; POSIX guarantees at least 1024 on Linux.
const IOV_MAX: usize = 1024;

// ---------------------------------------------------------------------------
// fd helpers
// ---------------------------------------------------------------------------

/// Create a close-on-exec pipe, returning (read, write) ends.
pub(crate) fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    // Safety: pipe2 returned two fresh descriptors we now own.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn set_flag_state(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }

    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    set_flag_state(fd, true)
}

pub(crate) fn set_blocking(fd: RawFd) -> io::Result<()> {
    set_flag_state(fd, false)
}

/// Scope guard that flips fds to blocking and restores non-blocking mode on
/// every exit path.
#[derive(Debug)]
pub(crate) struct BlockingGuard {
    fds: Vec<RawFd>,
}

impl BlockingGuard {
    pub(crate) fn new(input: RawFd, output: RawFd) -> io::Result<Self> {
        let mut fds = vec![input];
        if output != input {
            fds.push(output);
        }
        for &fd in &fds {
            set_blocking(fd)?;
        }
        Ok(Self { fds })
    }
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        for &fd in &self.fds {
            if let Err(err) = set_nonblocking(fd) {
                log::error!("unable to restore non-blocking mode on fd {fd}: {err}");
            }
        }
    }
}

/// Bytes the kernel reports as immediately readable (FIONREAD).
pub(crate) fn readable_bytes(fd: RawFd) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(count.max(0) as usize)
}

/// Bytes buffered in the kernel's send queue for `fd`.
#[cfg(target_os = "linux")]
pub(crate) fn buffered_output_bytes(fd: RawFd) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut count) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(count.max(0) as usize)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn buffered_output_bytes(_fd: RawFd) -> io::Result<usize> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Pending socket error (SO_ERROR), if any.
pub(crate) fn socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Peek at pending socket bytes without consuming them.
pub(crate) fn recv_peek(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_PEEK) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Raw-fd adapter implementing [`Read`] and [`Write`] for the TLS layer.
#[derive(Debug)]
pub(crate) struct FdIo {
    pub input: RawFd,
    pub output: RawFd,
}

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.input, buf)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_fd(self.output, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// read path
// ---------------------------------------------------------------------------

fn fd_readable(con: &Connection, fd: RawFd, max_msg_size: u32) -> usize {
    let mut readable = match readable_bytes(fd) {
        Ok(0) | Err(_) => con.mss.unwrap_or(DEFAULT_READ_BYTES),
        Ok(n) => n,
    };

    // Limit read byte count to avoid creating huge buffers from a huge MSS
    // on a loopback device or a buggy device driver.
    readable = readable.min(max_msg_size as usize);

    // Even with zero readable bytes the read must still happen so a
    // shutdown(SHUT_RDWR) descriptor gets its final read()=0.
    readable.max(DEFAULT_READ_BYTES)
}

/// Read once from the connection's input fd into the incoming buffer.
pub(crate) fn handle_read(mgr: &Conmgr, con: &mut Connection) {
    con.flags.unset(ConFlags::CAN_READ);

    let Some(fd) = con.input_fd() else {
        log::debug!("[{}] read called on closed connection", con.name());
        return;
    };

    let readable = fd_readable(con, fd, mgr.settings().max_msg_size);

    let result = if con.flags.has(ConFlags::IS_TLS_CONNECTED) {
        let mut session = con.tls.take().expect("TLS connected without session");
        let rc = session.recv(fd, &mut con.in_buf, readable);
        con.tls = Some(session);
        rc
    } else {
        con.in_buf.fill_from(readable, |area| read_fd(fd, area))
    };

    match result {
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            log::trace!("[{}] socket would block on read", con.name());
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {
            log::trace!("[{}] read interrupted", con.name());
        }
        Err(err) if err.kind() == io::ErrorKind::OutOfMemory => {
            log::error!("[{}] unable to allocate larger input buffer", con.name());
            mgr.close_con(con);
        }
        Err(err) => {
            log::debug!("[{}] error while reading: {err}", con.name());
            mgr.close_con(con);
        }
        Ok(0) => {
            log::trace!(
                "[{}] read EOF with {} bytes to process already in buffer",
                con.name(),
                con.in_buf.len()
            );
            con.flags.set(ConFlags::READ_EOF);
        }
        Ok(read) => {
            log::trace!(
                "[{}] read {read} bytes with {} bytes to process already in buffer",
                con.name(),
                con.in_buf.len() - read
            );
            if con.flags.has(ConFlags::WATCH_READ_TIMEOUT) {
                con.last_read = std::time::Instant::now();
            }
            if read == readable {
                // the kernel may hold more; readiness is edge-triggered so
                // request another pass instead of waiting for a new edge
                con.flags.set(ConFlags::CAN_READ);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// write path
// ---------------------------------------------------------------------------

fn writev_fd(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    let rc = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

fn handle_writev(mgr: &Conmgr, con: &mut Connection, fd: RawFd) {
    let iov_count = con.out.count().min(IOV_MAX);
    let mut iov_stack = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; IOV_STACK_COUNT];
    let mut iov_heap;

    // Use the stack for small write counts when possible.
    let iov: &mut [libc::iovec] = if iov_count <= IOV_STACK_COUNT {
        &mut iov_stack[..iov_count]
    } else {
        iov_heap = vec![
            libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            };
            iov_count
        ];
        &mut iov_heap[..]
    };

    for (slot, buf) in iov.iter_mut().zip(con.out.iter()) {
        let remaining = buf.remaining();
        slot.iov_base = remaining.as_ptr() as *mut libc::c_void;
        slot.iov_len = remaining.len();
    }

    match writev_fd(fd, iov) {
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::Interrupted =>
        {
            log::trace!("[{}] retry write: {err}", con.name());
        }
        Err(err) => {
            log::error!("[{}] writev({fd}) failed: {err}", con.name());
            // drop outbound data on the floor
            con.out.clear();
            mgr.close_con(con);
            mgr.close_con_output(con);
        }
        Ok(0) => {
            log::trace!("[{}] wrote 0 bytes", con.name());
        }
        Ok(wrote) => {
            log::trace!("[{}] wrote {wrote} bytes", con.name());
            let attempted: usize = iov.iter().map(|slot| slot.iov_len).sum();
            con.out.advance(wrote);
            if con.flags.has(ConFlags::WATCH_WRITE_TIMEOUT) {
                con.last_write = std::time::Instant::now();
            }
            if wrote == attempted && !con.out.is_empty() {
                // everything offered was taken but more buffers remain past
                // the iovec window; no new edge will arrive for them
                con.flags.set(ConFlags::CAN_WRITE);
            }
        }
    }
}

fn handle_tls_write(mgr: &Conmgr, con: &mut Connection, fd: RawFd) {
    let mut session = con.tls.take().expect("TLS connected without session");

    let result = loop {
        let Some(front) = con.out.iter().next() else {
            // no plaintext left: push any buffered ciphertext out
            break session.send(fd, &[]).map(|_| ());
        };

        match session.send(fd, front.remaining()) {
            Ok(0) => break Ok(()),
            Ok(accepted) => con.out.advance(accepted),
            Err(err) => break Err(err),
        }
    };

    con.tls = Some(session);

    match result {
        Ok(()) => {
            if con.flags.has(ConFlags::WATCH_WRITE_TIMEOUT) {
                con.last_write = std::time::Instant::now();
            }
            if !con.out.is_empty() {
                // the session stopped accepting plaintext; come back around
                con.flags.set(ConFlags::CAN_WRITE);
            }
        }
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::Interrupted =>
        {
            log::trace!("[{}] retry TLS write: {err}", con.name());
        }
        Err(err) => {
            log::error!("[{}] TLS write failed: {err}", con.name());
            con.out.clear();
            mgr.close_con(con);
            mgr.close_con_output(con);
        }
    }
}

/// Drain as much of the outgoing list as the kernel will take.
pub(crate) fn handle_write(mgr: &Conmgr, con: &mut Connection) {
    con.flags.unset(ConFlags::CAN_WRITE);

    let Some(fd) = con.output_fd() else {
        log::debug!("[{}] write called on closed connection", con.name());
        con.out.clear();
        return;
    };

    if con.flags.has(ConFlags::IS_TLS_CONNECTED) {
        handle_tls_write(mgr, con, fd);
        return;
    }

    if con.out.is_empty() {
        log::trace!("[{}] skipping attempt with zero writes", con.name());
        return;
    }

    handle_writev(mgr, con, fd);
}

// ---------------------------------------------------------------------------
// on-data dispatch
// ---------------------------------------------------------------------------

/// Hand buffered input to the framing layer (RPC) or the host (RAW).
pub(crate) fn wrap_on_data(mgr: &Conmgr, con: &mut Connection) {
    let avail = con.in_buf.len();
    if avail == 0 {
        return;
    }

    let events = con.events();
    let result = match con.kind() {
        ConnectionKind::Raw => {
            log::trace!("[{}] on_data BEGIN bytes={avail}", con.name());
            let rc = events.on_data(mgr, con).map_err(Error::from);
            log::trace!("[{}] on_data END ok={}", con.name(), rc.is_ok());
            rc
        }
        ConnectionKind::Rpc => rpc::on_rpc_data(mgr, con),
        ConnectionKind::None => {
            log::error!(
                "[{}] data arrived before a connection mode was chosen",
                con.name()
            );
            Err(Error::NotSupported)
        }
    };

    if let Err(err) = result {
        log::error!("[{}] on_data failed: {err}", con.name());
        mgr.record_error(err);

        // processing failed, drop any pending data on the floor
        log::debug!(
            "[{}] purging the remaining {} bytes of pending input",
            con.name(),
            con.in_buf.len()
        );
        con.in_buf.reset();
        mgr.close_con(con);
        return;
    }

    if con.in_buf.is_empty() {
        return;
    }

    if con.in_buf.len() == avail {
        // parser refused to read anything, wait for more data
        log::trace!(
            "[{}] parser refused to read {avail} bytes, waiting for more data",
            con.name()
        );
        con.flags.set(ConFlags::ON_DATA_TRIED);
    } else {
        // partial read, shift the remainder to the start of the buffer
        log::trace!(
            "[{}] partial read {}/{avail} bytes",
            con.name(),
            avail - con.in_buf.len()
        );
        con.in_buf.compact();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_read_write_roundtrip() {
        let (read_end, write_end) = pipe_pair().unwrap();
        assert_eq!(5, write_fd(write_end.as_raw_fd(), b"hello").unwrap());

        let mut buf = [0u8; 16];
        let got = read_fd(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(b"hello", &buf[..got]);
    }

    #[test]
    fn readable_bytes_reports_pending_pipe_data() {
        let (read_end, write_end) = pipe_pair().unwrap();
        write_fd(write_end.as_raw_fd(), b"abcdef").unwrap();
        assert_eq!(6, readable_bytes(read_end.as_raw_fd()).unwrap());
    }

    #[test]
    fn blocking_guard_restores_nonblocking() {
        let (read_end, _write_end) = pipe_pair().unwrap();
        let fd = read_end.as_raw_fd();
        set_nonblocking(fd).unwrap();

        {
            let _guard = BlockingGuard::new(fd, fd).unwrap();
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            assert_eq!(0, flags & libc::O_NONBLOCK);
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(0, flags & libc::O_NONBLOCK);
    }

    #[test]
    fn nonblocking_read_would_block_on_empty_pipe() {
        let (read_end, _write_end) = pipe_pair().unwrap();
        set_nonblocking(read_end.as_raw_fd()).unwrap();

        let mut buf = [0u8; 4];
        let err = read_fd(read_end.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(io::ErrorKind::WouldBlock, err.kind());
    }
}
