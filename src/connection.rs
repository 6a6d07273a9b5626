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

//! Per-connection state: the flag bitfield, connection kinds, the callback
//! table, and the connection object handed to callbacks.

use std::any::Any;
use std::fmt::{self, Display};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{Buffer, OutQueue};
use crate::error::{Error, Result};
use crate::mgr::Conmgr;
use crate::rpc::{RpcMsg, UnpackError};
use crate::tls::TlsSession;

/// Arbitrary per-connection context returned by `on_connection` and threaded
/// through subsequent callbacks.
pub type Ctx = Box<dyn Any + Send>;

/// Connection flag bitfield.
///
/// A subset is accepted at registration time (`RPC_KEEP_BUFFER`,
/// `TCP_NODELAY`, the `WATCH_*_TIMEOUT` bits, and the TLS routing bits); the
/// rest track internal connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConFlags(u32);

impl ConFlags {
    /// No flags.
    pub const NONE: ConFlags = ConFlags(0);
    /// `on_data` was called against the current buffer and wants more bytes.
    pub const ON_DATA_TRIED: ConFlags = ConFlags(1 << 0);
    /// The fd is a socket.
    pub const IS_SOCKET: ConFlags = ConFlags(1 << 1);
    /// The fd is a listening socket.
    pub const IS_LISTEN: ConFlags = ConFlags(1 << 2);
    /// `on_finish` has been queued but has not completed.
    pub const WAIT_ON_FINISH: ConFlags = ConFlags(1 << 3);
    /// Last poll indicated write readiness.
    pub const CAN_WRITE: ConFlags = ConFlags(1 << 4);
    /// Last poll indicated read readiness.
    pub const CAN_READ: ConFlags = ConFlags(1 << 5);
    /// The read side has returned 0.
    pub const READ_EOF: ConFlags = ConFlags(1 << 6);
    /// connect() completed, or was never needed.
    pub const IS_CONNECTED: ConFlags = ConFlags(1 << 7);
    /// A worker currently owns this connection; exclusive.
    pub const WORK_ACTIVE: ConFlags = ConFlags(1 << 8);
    /// After parsing an RPC, also hand the caller the full raw frame.
    pub const RPC_KEEP_BUFFER: ConFlags = ConFlags(1 << 9);
    /// New work may queue but nothing is scheduled or polled.
    pub const QUIESCE: ConFlags = ConFlags(1 << 10);
    /// Kernel exposes buffered-output byte counts for this fd.
    pub const CAN_QUERY_OUTPUT_BUFFER: ConFlags = ConFlags(1 << 11);
    /// The fd is a pipe.
    pub const IS_FIFO: ConFlags = ConFlags(1 << 12);
    /// The fd is a character special device.
    pub const IS_CHR: ConFlags = ConFlags(1 << 13);
    /// Apply TCP_NODELAY on sockets.
    pub const TCP_NODELAY: ConFlags = ConFlags(1 << 14);
    /// Enable the write-timeout callback.
    pub const WATCH_WRITE_TIMEOUT: ConFlags = ConFlags(1 << 15);
    /// Enable the read-timeout callback.
    pub const WATCH_READ_TIMEOUT: ConFlags = ConFlags(1 << 16);
    /// Enable the connect-timeout callback.
    pub const WATCH_CONNECT_TIMEOUT: ConFlags = ConFlags(1 << 17);
    /// Connection takes the client role in a TLS handshake.
    pub const TLS_CLIENT: ConFlags = ConFlags(1 << 18);
    /// Connection takes the server role in a TLS handshake.
    pub const TLS_SERVER: ConFlags = ConFlags(1 << 19);
    /// TLS handshake has completed.
    pub const IS_TLS_CONNECTED: ConFlags = ConFlags(1 << 20);
    /// Sniff the first bytes to route TLS vs plaintext RPC.
    pub const TLS_FINGERPRINT: ConFlags = ConFlags(1 << 21);
    /// Close the connection if the peer does not offer TLS.
    pub const TLS_REQUIRED: ConFlags = ConFlags(1 << 22);

    /// Bits owned by the worker while `WORK_ACTIVE`; merged back into the
    /// scheduler's view when the work completes.
    pub(crate) const WORKER_MASK: ConFlags = ConFlags(
        Self::ON_DATA_TRIED.0
            | Self::CAN_WRITE.0
            | Self::CAN_READ.0
            | Self::READ_EOF.0
            | Self::IS_CONNECTED.0
            | Self::RPC_KEEP_BUFFER.0
            | Self::CAN_QUERY_OUTPUT_BUFFER.0
            | Self::TCP_NODELAY.0
            | Self::TLS_CLIENT.0
            | Self::TLS_SERVER.0
            | Self::IS_TLS_CONNECTED.0
            | Self::TLS_FINGERPRINT.0
            | Self::TLS_REQUIRED.0,
    );

    /// True if every bit of `other` is set.
    pub fn has(self, other: ConFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set.
    pub fn has_any(self, other: ConFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Set the bits of `other`.
    pub fn set(&mut self, other: ConFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn unset(&mut self, other: ConFlags) {
        self.0 &= !other.0;
    }

    /// Union of both flag sets.
    #[must_use]
    pub const fn union(self, other: ConFlags) -> ConFlags {
        ConFlags(self.0 | other.0)
    }

    /// Bits of `self` restricted to `mask`.
    #[must_use]
    pub(crate) fn masked(self, mask: ConFlags) -> ConFlags {
        ConFlags(self.0 & mask.0)
    }

    /// Bits of `self` outside of `mask`.
    #[must_use]
    pub(crate) fn without_mask(self, mask: ConFlags) -> ConFlags {
        ConFlags(self.0 & !mask.0)
    }
}

impl Display for ConFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(ConFlags, &str)] = &[
            (ConFlags::ON_DATA_TRIED, "ON_DATA_TRIED"),
            (ConFlags::IS_SOCKET, "IS_SOCKET"),
            (ConFlags::IS_LISTEN, "IS_LISTEN"),
            (ConFlags::WAIT_ON_FINISH, "WAIT_ON_FINISH"),
            (ConFlags::CAN_WRITE, "CAN_WRITE"),
            (ConFlags::CAN_READ, "CAN_READ"),
            (ConFlags::READ_EOF, "READ_EOF"),
            (ConFlags::IS_CONNECTED, "IS_CONNECTED"),
            (ConFlags::WORK_ACTIVE, "WORK_ACTIVE"),
            (ConFlags::RPC_KEEP_BUFFER, "RPC_KEEP_BUFFER"),
            (ConFlags::QUIESCE, "QUIESCE"),
            (ConFlags::CAN_QUERY_OUTPUT_BUFFER, "CAN_QUERY_OUTPUT_BUFFER"),
            (ConFlags::IS_FIFO, "IS_FIFO"),
            (ConFlags::IS_CHR, "IS_CHR"),
            (ConFlags::TCP_NODELAY, "TCP_NODELAY"),
            (ConFlags::WATCH_WRITE_TIMEOUT, "WATCH_WRITE_TIMEOUT"),
            (ConFlags::WATCH_READ_TIMEOUT, "WATCH_READ_TIMEOUT"),
            (ConFlags::WATCH_CONNECT_TIMEOUT, "WATCH_CONNECT_TIMEOUT"),
            (ConFlags::TLS_CLIENT, "TLS_CLIENT"),
            (ConFlags::TLS_SERVER, "TLS_SERVER"),
            (ConFlags::IS_TLS_CONNECTED, "IS_TLS_CONNECTED"),
            (ConFlags::TLS_FINGERPRINT, "TLS_FINGERPRINT"),
            (ConFlags::TLS_REQUIRED, "TLS_REQUIRED"),
        ];

        let mut first = true;
        for &(flag, name) in NAMES {
            if self.has(flag) {
                if !first {
                    f.write_str("|")?;
                }
                first = false;
                f.write_str(name)?;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// How inbound bytes are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Initialized state; no framing chosen yet.
    None,
    /// Bytes are handed to `on_data` unprocessed.
    Raw,
    /// Bytes are reassembled into length-prefixed RPC messages.
    Rpc,
}

impl ConnectionKind {
    /// Human-readable name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::None => "NONE",
            ConnectionKind::Raw => "RAW",
            ConnectionKind::Rpc => "RPC",
        }
    }
}

/// Point-in-time connection facts.
#[derive(Debug, Clone)]
pub struct ConStatus {
    /// This is a socket fd.
    pub is_socket: bool,
    /// Path to the unix socket, if it is one.
    pub unix_socket: Option<String>,
    /// This is a listen-only socket.
    pub is_listen: bool,
    /// Read EOF has been received.
    pub read_eof: bool,
    /// Connection is fully established with the remote.
    pub is_connected: bool,
}

/// Peer credentials of a unix-socket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCreds {
    /// Peer process uid.
    pub uid: u32,
    /// Peer process gid.
    pub gid: u32,
    /// Peer process id.
    pub pid: i32,
}

/// Callback table for connection events. Every method has a default so hosts
/// implement only what they need.
///
/// All callbacks run on worker threads with exclusive access to the
/// connection; at most one runs at a time per connection, in queue order.
#[allow(unused_variables)]
pub trait ConnectionEvents: Send + Sync {
    /// Called once when a listener is ready to accept. The returned context
    /// is threaded through subsequent listener callbacks.
    fn on_listen_connect(&self, mgr: &Conmgr, con: &mut Connection) -> Option<Ctx> {
        None
    }

    /// First call on any new fd; the returned context is handed to
    /// subsequent callbacks via [`Connection::ctx_mut`].
    fn on_connection(&self, mgr: &Conmgr, con: &mut Connection) -> Option<Ctx> {
        None
    }

    /// RAW mode: data is ready in the incoming buffer. Consume via
    /// [`Connection::in_buffer`] and [`Connection::mark_consumed`]; an error
    /// closes the connection.
    fn on_data(&self, mgr: &Conmgr, con: &mut Connection) -> io::Result<()> {
        Ok(())
    }

    /// RPC mode: a complete frame was reassembled and run through the codec.
    /// `msg` carries the codec result; always check it before trusting the
    /// message. `raw` is the full frame when `RPC_KEEP_BUFFER` is set. An
    /// error closes the connection.
    fn on_msg(
        &self,
        mgr: &Conmgr,
        con: &mut Connection,
        msg: std::result::Result<RpcMsg, UnpackError>,
        raw: Option<Vec<u8>>,
    ) -> io::Result<()> {
        Ok(())
    }

    /// A read has been pending longer than the configured timeout.
    /// Return `Ok` to re-arm, an error to close.
    fn on_read_timeout(&self, mgr: &Conmgr, con: &mut Connection) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    /// A write has been pending longer than the configured timeout.
    /// Return `Ok` to re-arm, an error to close.
    fn on_write_timeout(&self, mgr: &Conmgr, con: &mut Connection) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    /// connect() has been pending longer than the configured timeout.
    /// Return `Ok` to re-arm, an error to close.
    fn on_connect_timeout(&self, mgr: &Conmgr, con: &mut Connection) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    /// Last call on the connection; ownership of the context returns to the
    /// caller.
    fn on_finish(&self, mgr: &Conmgr, con: &mut Connection, ctx: Option<Ctx>) {}
}

/// Detect the kernel object kind behind `fd`.
pub(crate) fn fd_kind_flags(fd: RawFd) -> io::Result<ConFlags> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    let mode = unsafe { stat.assume_init() }.st_mode & libc::S_IFMT;

    let mut flags = ConFlags::NONE;
    match mode {
        libc::S_IFSOCK => flags.set(ConFlags::IS_SOCKET),
        libc::S_IFIFO => flags.set(ConFlags::IS_FIFO),
        libc::S_IFCHR => flags.set(ConFlags::IS_CHR),
        _ => {}
    }
    Ok(flags)
}

/// Socket maximum segment size, when the kernel will share it.
pub(crate) fn tcp_mss(fd: RawFd) -> Option<usize> {
    let mut mss: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            (&mut mss as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc == -1 || mss <= 0 {
        None
    } else {
        Some(mss as usize)
    }
}

pub(crate) fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            (&enable as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One managed file descriptor pair.
///
/// Workers receive `&mut Connection` for the duration of each callback;
/// the watch thread never touches a connection while its work is active.
pub struct Connection {
    pub(crate) id: usize,
    pub(crate) kind: ConnectionKind,
    pub(crate) flags: ConFlags,
    pub(crate) input: Option<OwnedFd>,
    pub(crate) output: Option<OwnedFd>,
    /// input and output are the same descriptor
    pub(crate) shared_fd: bool,
    /// output side has been shut; the shared fd may still serve reads
    pub(crate) output_closed: bool,
    pub(crate) name: String,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) unix_path: Option<String>,
    pub(crate) in_buf: Buffer,
    pub(crate) out: OutQueue,
    pub(crate) ctx: Option<Ctx>,
    pub(crate) events: Arc<dyn ConnectionEvents>,
    pub(crate) tls: Option<Box<dyn TlsSession>>,
    pub(crate) mss: Option<usize>,
    pub(crate) last_read: Instant,
    pub(crate) last_write: Instant,
    pub(crate) last_connect: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.as_str())
            .field("flags", &self.flags.to_string())
            .field("input_fd", &self.input_fd())
            .field("output_fd", &self.output_fd())
            .finish()
    }
}

/// Scheduler-visible digest of a connection, captured when a worker finishes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConSummary {
    pub flags: ConFlags,
    pub in_bytes: usize,
    pub out_count: usize,
    pub input_fd: Option<RawFd>,
    pub output_fd: Option<RawFd>,
    pub last_read: Instant,
    pub last_write: Instant,
    pub last_connect: Instant,
}

impl Connection {
    /// Stable human-readable label, e.g. `[peer=ip:port,fd=7]`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current framing mode.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Peer address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Input file descriptor, valid only for the duration of the callback.
    pub fn input_fd(&self) -> Option<RawFd> {
        self.input.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Output file descriptor, valid only for the duration of the callback.
    pub fn output_fd(&self) -> Option<RawFd> {
        if self.output_closed {
            None
        } else if self.shared_fd {
            self.input_fd()
        } else {
            self.output.as_ref().map(|fd| fd.as_raw_fd())
        }
    }

    /// Unconsumed bytes of the incoming buffer.
    pub fn in_buffer(&self) -> &[u8] {
        self.in_buf.readable()
    }

    /// Mark `bytes` of the incoming buffer as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds the buffered length.
    pub fn mark_consumed(&mut self, bytes: usize) {
        self.in_buf.mark_consumed(bytes);
    }

    /// Move the entire incoming buffer out, leaving it empty.
    pub fn take_in_buffer(&mut self) -> Vec<u8> {
        let data = self.in_buf.readable().to_vec();
        self.in_buf.reset();
        data
    }

    /// The context produced by `on_connection`, if any.
    pub fn ctx_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.ctx.as_deref_mut()
    }

    /// Replace the connection context.
    pub fn set_ctx(&mut self, ctx: Option<Ctx>) {
        self.ctx = ctx;
    }

    /// Snapshot of connection facts.
    pub fn status(&self) -> ConStatus {
        ConStatus {
            is_socket: self.flags.has(ConFlags::IS_SOCKET),
            unix_socket: self.unix_path.clone(),
            is_listen: self.flags.has(ConFlags::IS_LISTEN),
            read_eof: self.flags.has(ConFlags::READ_EOF),
            is_connected: self.flags.has(ConFlags::IS_CONNECTED),
        }
    }

    /// Whether the output side can, in theory, still accept writes.
    ///
    /// Inherently racy; use only to skip expensive work on a dead peer.
    pub fn is_output_open(&self) -> bool {
        self.output_fd().is_some()
    }

    /// Kernel-reported credentials of a unix-socket peer.
    pub fn get_auth_creds(&self) -> Result<PeerCreds> {
        let fd = self.input_fd().ok_or(Error::NotSupported)?;
        if !self.flags.has(ConFlags::IS_SOCKET) {
            return Err(Error::NotSupported);
        }

        let mut creds = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut creds as *mut libc::ucred).cast(),
                &mut len,
            )
        };
        if rc == -1 {
            return Err(crate::error::last_os_error());
        }

        Ok(PeerCreds {
            uid: creds.uid,
            gid: creds.gid,
            pid: creds.pid,
        })
    }

    /// Callback table, cloned so callers can invoke it while holding the
    /// connection mutably.
    pub(crate) fn events(&self) -> Arc<dyn ConnectionEvents> {
        Arc::clone(&self.events)
    }

    pub(crate) fn take_ctx(&mut self) -> Option<Ctx> {
        self.ctx.take()
    }

    /// Close the read side; with a shared descriptor this closes both.
    pub(crate) fn close_input(&mut self) {
        self.input = None;
    }

    /// Drop queued output and forget the write side. A shared descriptor is
    /// kept open for the read side and closed when the input closes.
    pub(crate) fn close_output(&mut self) {
        self.out.clear();
        self.output_closed = true;
        if !self.shared_fd {
            self.output = None;
        }
    }

    /// Digest for the scheduler, captured while the worker still owns the
    /// connection.
    pub(crate) fn summary(&self) -> ConSummary {
        let tls_pending = self
            .tls
            .as_ref()
            .map(|session| session.pending() > 0)
            .unwrap_or(false);

        ConSummary {
            flags: self.flags,
            in_bytes: self.in_buf.len(),
            // unflushed TLS ciphertext keeps the write path scheduled
            out_count: self.out.count() + usize::from(tls_pending),
            input_fd: self.input_fd(),
            output_fd: self.output_fd(),
            last_read: self.last_read,
            last_write: self.last_write,
            last_connect: self.last_connect,
        }
    }
}

#[cfg(test)]
mod test {
    use super::ConFlags;

    #[test]
    fn flags_set_unset_and_test() {
        let mut flags = ConFlags::NONE;
        flags.set(ConFlags::CAN_READ);
        flags.set(ConFlags::READ_EOF);

        assert!(flags.has(ConFlags::CAN_READ));
        assert!(flags.has(ConFlags::CAN_READ.union(ConFlags::READ_EOF)));
        assert!(!flags.has(ConFlags::WORK_ACTIVE));

        flags.unset(ConFlags::CAN_READ);
        assert!(!flags.has(ConFlags::CAN_READ));
        assert!(flags.has(ConFlags::READ_EOF));
    }

    #[test]
    fn worker_mask_excludes_scheduler_bits() {
        assert!(!ConFlags::WORKER_MASK.has(ConFlags::WORK_ACTIVE));
        assert!(!ConFlags::WORKER_MASK.has(ConFlags::WAIT_ON_FINISH));
        assert!(!ConFlags::WORKER_MASK.has(ConFlags::QUIESCE));
        assert!(ConFlags::WORKER_MASK.has(ConFlags::READ_EOF));
    }

    #[test]
    fn flags_render_for_logging() {
        let mut flags = ConFlags::NONE;
        assert_eq!("NONE", flags.to_string());

        flags.set(ConFlags::IS_SOCKET);
        flags.set(ConFlags::CAN_READ);
        assert_eq!("IS_SOCKET|CAN_READ", flags.to_string());
    }
}
