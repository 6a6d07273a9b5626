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

//! TLS integration: the pluggable session seam, the rustls-backed provider,
//! the handshake fingerprint detector, and blinding-delay deferred close.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::buffer::Buffer;
use crate::connection::{ConFlags, Connection, ConnectionKind};
use crate::error::{Error, Result};
use crate::io::{recv_peek, BlockingGuard, FdIo};
use crate::mgr::Conmgr;
use crate::work::ConTask;

/// SSLv3 record header: handshake(22).
const HEADER_MSG_TYPE_HANDSHAKE: u8 = 0x16;
/// TLSv1.x handshake header: client_hello(1).
const HEADER_MSG_TYPE_CLIENT_HELLO: u8 = 0x01;
const HEADER_LENGTH_MIN: u32 = 2;
const HEADER_LENGTH_MAX: u32 = 0x0fff;
const PROTOCOL_VERSION_MIN: u16 = 0x0300;
const PROTOCOL_VERSION_MAX: u16 = 0x03ff;

/// Default blinding delay applied after a failed handshake.
const DEFAULT_BLINDING_DELAY: Duration = Duration::from_secs(2);

/// Role taken during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// We initiate the handshake.
    Client,
    /// The peer initiates the handshake.
    Server,
}

/// One negotiated (or negotiating) TLS session attached to a connection.
///
/// The handshake contract requires blocking fds; the manager flips the fds
/// around the call and restores non-blocking mode on every exit path.
pub trait TlsSession: Send {
    /// Drive the handshake to completion on blocking fds.
    fn handshake(&mut self, input_fd: RawFd, output_fd: RawFd) -> io::Result<()>;

    /// Decrypt available ciphertext into `buf`, appending up to `max`
    /// plaintext bytes. `Ok(0)` means the peer closed cleanly.
    fn recv(&mut self, fd: RawFd, buf: &mut Buffer, max: usize) -> io::Result<usize>;

    /// Encrypt and write `data`, returning how many plaintext bytes were
    /// accepted. An empty `data` flushes buffered ciphertext.
    fn send(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize>;

    /// Unflushed ciphertext still owed to the kernel.
    fn pending(&self) -> usize;

    /// Minimum interval to hold a failed connection open, defeating timing
    /// side channels.
    fn get_delay(&self) -> Duration;
}

/// Factory chosen at manager construction.
pub trait TlsProvider: Send + Sync {
    /// Implementation name (`"rustls"`, `"none"`).
    fn name(&self) -> &'static str;

    /// True iff TLS is available and usable.
    fn enabled(&self) -> bool;

    /// Create a session for `mode`.
    fn create(&self, mode: TlsMode) -> Result<Box<dyn TlsSession>>;
}

/// TLS provider backed by rustls.
pub struct RustlsProvider {
    server: Option<Arc<ServerConfig>>,
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    delay: Duration,
}

impl fmt::Debug for RustlsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsProvider")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .field("delay", &self.delay)
            .finish()
    }
}

impl RustlsProvider {
    /// Provider with neither role configured; add roles with the builders.
    pub fn new() -> Self {
        Self {
            server: None,
            client: None,
            delay: DEFAULT_BLINDING_DELAY,
        }
    }

    /// Accept handshakes with this server configuration.
    #[must_use]
    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// Initiate handshakes with this client configuration, verifying the
    /// peer as `server_name`.
    #[must_use]
    pub fn with_client(mut self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        self.client = Some((config, server_name));
        self
    }

    /// Override the post-failure blinding delay.
    #[must_use]
    pub fn with_blinding_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RustlsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsProvider for RustlsProvider {
    fn name(&self) -> &'static str {
        "rustls"
    }

    fn enabled(&self) -> bool {
        self.server.is_some() || self.client.is_some()
    }

    fn create(&self, mode: TlsMode) -> Result<Box<dyn TlsSession>> {
        let session = match mode {
            TlsMode::Server => {
                let config = self.server.as_ref().ok_or(Error::TlsUnavailable)?;
                let conn = ServerConnection::new(Arc::clone(config))
                    .map_err(|err| Error::Io(io::ErrorKind::InvalidData, err.to_string()))?;
                RustlsSession {
                    conn: Session::Server(conn),
                    delay: self.delay,
                }
            }
            TlsMode::Client => {
                let (config, name) = self.client.as_ref().ok_or(Error::TlsUnavailable)?;
                let conn = ClientConnection::new(Arc::clone(config), name.clone())
                    .map_err(|err| Error::Io(io::ErrorKind::InvalidData, err.to_string()))?;
                RustlsSession {
                    conn: Session::Client(conn),
                    delay: self.delay,
                }
            }
        };

        Ok(Box::new(session))
    }
}

/// Provider used when TLS is configured off. `enabled` reports false and
/// every create fails.
#[derive(Debug, Default)]
pub struct NullTlsProvider;

impl TlsProvider for NullTlsProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    fn enabled(&self) -> bool {
        false
    }

    fn create(&self, _mode: TlsMode) -> Result<Box<dyn TlsSession>> {
        Err(Error::TlsUnavailable)
    }
}

/// Select a built-in provider by name. Providers needing configuration
/// (rustls) are constructed directly by the host instead.
pub fn select_provider(name: &str) -> Option<Arc<dyn TlsProvider>> {
    match name {
        "none" => Some(Arc::new(NullTlsProvider)),
        _ => None,
    }
}

enum Session {
    Server(ServerConnection),
    Client(ClientConnection),
}

struct RustlsSession {
    conn: Session,
    delay: Duration,
}

macro_rules! with_conn {
    ($self:expr, $conn:ident => $body:expr) => {
        match &mut $self.conn {
            Session::Server($conn) => $body,
            Session::Client($conn) => $body,
        }
    };
}

impl TlsSession for RustlsSession {
    fn handshake(&mut self, input_fd: RawFd, output_fd: RawFd) -> io::Result<()> {
        let mut io = FdIo {
            input: input_fd,
            output: output_fd,
        };
        with_conn!(self, conn => {
            while conn.is_handshaking() {
                conn.complete_io(&mut io)?;
            }
        });
        Ok(())
    }

    fn recv(&mut self, fd: RawFd, buf: &mut Buffer, max: usize) -> io::Result<usize> {
        let mut io = FdIo {
            input: fd,
            output: fd,
        };

        with_conn!(self, conn => {
            match conn.read_tls(&mut io) {
                // transport EOF
                Ok(0) => return Ok(0),
                Ok(_) => {
                    conn.process_new_packets().map_err(|err| {
                        io::Error::new(io::ErrorKind::InvalidData, err.to_string())
                    })?;
                }
                // no new ciphertext; decrypted bytes may still be pending
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }

            let mut total = 0;
            let mut closed = false;
            while total < max {
                let appended = buf.fill_from(max - total, |area| {
                    match conn.reader().read(area) {
                        Ok(0) => {
                            closed = true;
                            Ok(0)
                        }
                        Ok(n) => Ok(n),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
                        Err(err) => Err(err),
                    }
                })?;
                if appended == 0 {
                    break;
                }
                total += appended;
            }

            if total == 0 {
                if closed {
                    // close_notify received
                    return Ok(0);
                }
                // handshake or session traffic only
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }

            Ok(total)
        })
    }

    fn send(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        let mut io = FdIo {
            input: fd,
            output: fd,
        };

        with_conn!(self, conn => {
            let accepted = if data.is_empty() {
                0
            } else {
                conn.writer().write(data)?
            };

            while conn.wants_write() {
                match conn.write_tls(&mut io) {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        if accepted == 0 {
                            return Err(err);
                        }
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            Ok(accepted)
        })
    }

    fn pending(&self) -> usize {
        let wants_write = match &self.conn {
            Session::Server(conn) => conn.wants_write(),
            Session::Client(conn) => conn.wants_write(),
        };
        usize::from(wants_write)
    }

    fn get_delay(&self) -> Duration {
        self.delay
    }
}

// ---------------------------------------------------------------------------
// fingerprinting
// ---------------------------------------------------------------------------

/// Result of sniffing the first bytes of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint {
    /// Bytes match a TLS/SSLv3 handshake prefix.
    TlsHandshake,
    /// Too few bytes to decide; re-check on the next readable event.
    NeedMoreBytes,
    /// Definitely not a TLS handshake.
    NoMatch,
}

enum HeaderMatch {
    Match,
    Short,
    Miss,
}

/// Match per SSLv3 RFC 6101:
///
/// ```text
/// | 8 - msg_type | 16 - SSL version | 16 - packet length |
/// ```
///
/// Example record headers: `0x16 03 01 02 00`, `0x16 03 01 00 f4`.
fn is_sslv3_handshake(buf: &[u8]) -> HeaderMatch {
    if buf.len() < 5 {
        return HeaderMatch::Short;
    }

    if buf[0] != HEADER_MSG_TYPE_HANDSHAKE {
        return HeaderMatch::Miss;
    }

    let protocol_version = u16::from_be_bytes([buf[1], buf[2]]);
    if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&protocol_version) {
        return HeaderMatch::Miss;
    }

    let length = u16::from_be_bytes([buf[3], buf[4]]) as u32;
    if !(HEADER_LENGTH_MIN..=HEADER_LENGTH_MAX).contains(&length) {
        return HeaderMatch::Miss;
    }

    HeaderMatch::Match
}

/// Match per TLSv1.x RFC 8446:
///
/// ```text
/// | 8 - msg_type | 24 - length | 16 - protocol version |
/// ```
///
/// Example hello: `0x01 00 01 fc 03 03`.
fn is_tls_client_hello(buf: &[u8]) -> HeaderMatch {
    if buf.len() < 6 {
        return HeaderMatch::Short;
    }

    if buf[0] != HEADER_MSG_TYPE_CLIENT_HELLO {
        return HeaderMatch::Miss;
    }

    let length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
    if !(HEADER_LENGTH_MIN..=HEADER_LENGTH_MAX).contains(&length) {
        return HeaderMatch::Miss;
    }

    let protocol_version = u16::from_be_bytes([buf[4], buf[5]]);
    if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&protocol_version) {
        return HeaderMatch::Miss;
    }

    HeaderMatch::Match
}

/// Sniff the first bytes of a stream for a TLS handshake.
pub fn fingerprint(buf: &[u8]) -> Fingerprint {
    let ssl = is_sslv3_handshake(buf);
    if matches!(ssl, HeaderMatch::Match) {
        return Fingerprint::TlsHandshake;
    }

    let tls = is_tls_client_hello(buf);
    if matches!(tls, HeaderMatch::Match) {
        return Fingerprint::TlsHandshake;
    }

    if matches!(ssl, HeaderMatch::Short) || matches!(tls, HeaderMatch::Short) {
        return Fingerprint::NeedMoreBytes;
    }

    Fingerprint::NoMatch
}

// ---------------------------------------------------------------------------
// worker tasks
// ---------------------------------------------------------------------------

/// Peek at pending bytes and route the connection to TLS or plaintext RPC.
pub(crate) fn handle_fingerprint(mgr: &Conmgr, con: &mut Connection) {
    con.flags.unset(ConFlags::CAN_READ);

    let Some(fd) = con.input_fd() else {
        return;
    };

    let mut peek = [0u8; 6];
    let peeked = match recv_peek(fd, &mut peek) {
        Ok(0) => {
            log::debug!("[{}] EOF before fingerprint", con.name());
            con.flags.set(ConFlags::READ_EOF);
            return;
        }
        Ok(n) => n,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
        Err(err) => {
            log::debug!("[{}] fingerprint peek failed: {err}", con.name());
            mgr.close_con(con);
            return;
        }
    };

    match fingerprint(&peek[..peeked]) {
        Fingerprint::TlsHandshake => {
            log::debug!("[{}] TLS handshake fingerprint matched", con.name());
            con.flags.unset(ConFlags::TLS_FINGERPRINT);
            con.flags.set(ConFlags::TLS_SERVER);
            mgr.add_con_task(con.id, ConTask::TlsCreate);
        }
        Fingerprint::NeedMoreBytes => {
            log::trace!(
                "[{}] waiting for more bytes to fingerprint match TLS handshake",
                con.name()
            );
        }
        Fingerprint::NoMatch => {
            log::debug!("[{}] TLS not detected", con.name());
            con.flags.unset(ConFlags::TLS_FINGERPRINT);
            // the peeked bytes are still unread and their readiness edge
            // was consumed by this task
            con.flags.set(ConFlags::CAN_READ);

            if con.flags.has(ConFlags::TLS_REQUIRED) {
                log::error!("[{}] rejecting non-TLS RPC connection", con.name());
                mgr.record_error(Error::TlsRequired);
                // route the raw bytes to `on_data` so the host can send a
                // single failure reply and close
                con.kind = ConnectionKind::Raw;
            } else {
                con.kind = ConnectionKind::Rpc;
            }
        }
    }
}

/// Create the TLS session and perform the handshake on temporarily-blocking
/// fds.
pub(crate) fn tls_create(mgr: &Conmgr, con: &mut Connection) {
    let provider = mgr.tls_provider();
    let enabled = provider.as_ref().map(|p| p.enabled()).unwrap_or(false);
    if !enabled {
        log::warn!(
            "[{}] TLS disabled: unable to secure connection, closing",
            con.name()
        );
        mgr.record_error(Error::TlsUnavailable);
        mgr.close_con(con);
        mgr.close_con_output(con);
        return;
    }
    let provider = provider.expect("enabled TLS without provider");

    debug_assert!(
        con.flags.has(ConFlags::TLS_CLIENT) ^ con.flags.has(ConFlags::TLS_SERVER),
        "TLS role must be exactly one of client or server"
    );
    let mode = if con.flags.has(ConFlags::TLS_CLIENT) {
        TlsMode::Client
    } else {
        TlsMode::Server
    };

    let (Some(input_fd), Some(output_fd)) = (con.input_fd(), con.output_fd()) else {
        log::debug!("[{}] skipping TLS create on closed connection", con.name());
        return;
    };

    let mut session = match provider.create(mode) {
        Ok(session) => session,
        Err(err) => {
            log::error!("[{}] unable to create TLS session: {err}", con.name());
            mgr.record_error(err);
            mgr.close_con(con);
            mgr.close_con_output(con);
            return;
        }
    };

    // TLS operations require blocking fds; restore on all paths.
    let handshake = match BlockingGuard::new(input_fd, output_fd) {
        Ok(_guard) => session.handshake(input_fd, output_fd),
        Err(err) => Err(err),
    };

    match handshake {
        Ok(()) => {
            log::debug!("[{}] TLS handshake completed successfully", con.name());
            con.flags.set(ConFlags::IS_TLS_CONNECTED);
            // application data may have ridden in with the final handshake
            // flight; probe for it rather than waiting on a fresh edge
            con.flags.set(ConFlags::CAN_READ);
            con.tls = Some(session);
        }
        Err(err) => {
            log::warn!("[{}] TLS handshake failed: {err}", con.name());
            tls_wait_close(mgr, con, session.get_delay());
        }
    }
}

/// Soft close after a handshake failure, deferred by the blinding delay.
pub(crate) fn tls_wait_close(mgr: &Conmgr, con: &mut Connection, delay: Duration) {
    con.flags.set(ConFlags::READ_EOF);
    con.flags.unset(ConFlags::CAN_READ);
    con.flags.unset(ConFlags::CAN_WRITE);

    if delay.is_zero() {
        log::debug!("[{}] closing now", con.name());
        mgr.close_con(con);
        mgr.close_con_output(con);
    } else {
        log::debug!("[{}] deferring close by {delay:?}", con.name());
        mgr.add_con_task_delayed(con.id, ConTask::DeferredClose, delay);
    }
}

/// Deferred-close work body.
pub(crate) fn deferred_close(mgr: &Conmgr, con: &mut Connection) {
    log::debug!("[{}] close wait complete", con.name());
    mgr.close_con(con);
    mgr.close_con_output(con);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sslv3_record_header_matches() {
        assert_eq!(
            Fingerprint::TlsHandshake,
            fingerprint(&[0x16, 0x03, 0x03, 0x00, 0x05, 0x00])
        );
        assert_eq!(
            Fingerprint::TlsHandshake,
            fingerprint(&[0x16, 0x03, 0x01, 0x00, 0xf4])
        );
    }

    #[test]
    fn tls_client_hello_matches() {
        assert_eq!(
            Fingerprint::TlsHandshake,
            fingerprint(&[0x01, 0x00, 0x01, 0xfc, 0x03, 0x03])
        );
    }

    #[test]
    fn rpc_length_prefix_does_not_match() {
        // a 7-byte RPC frame prefix must route to plaintext
        assert_eq!(
            Fingerprint::NoMatch,
            fingerprint(&[0x00, 0x00, 0x00, 0x07, 0xaa, 0xbb])
        );
    }

    #[test]
    fn short_prefixes_wait_for_more_bytes() {
        assert_eq!(Fingerprint::NeedMoreBytes, fingerprint(&[]));
        assert_eq!(Fingerprint::NeedMoreBytes, fingerprint(&[0x16, 0x03]));
        // 5 bytes that miss SSLv3 could still be a client hello
        assert_eq!(
            Fingerprint::NeedMoreBytes,
            fingerprint(&[0x01, 0x00, 0x01, 0xfc, 0x03])
        );
    }

    #[test]
    fn bad_versions_and_lengths_miss() {
        // version 0x0200 predates SSLv3
        assert_eq!(
            Fingerprint::NoMatch,
            fingerprint(&[0x16, 0x02, 0x00, 0x00, 0x05, 0x00])
        );
        // oversized record length
        assert_eq!(
            Fingerprint::NoMatch,
            fingerprint(&[0x16, 0x03, 0x03, 0xff, 0xff, 0x00])
        );
    }

    #[test]
    fn null_provider_is_disabled() {
        let provider = NullTlsProvider;
        assert!(!provider.enabled());
        assert!(provider.create(TlsMode::Server).is_err());
        assert_eq!("none", provider.name());

        let by_name = select_provider("none").unwrap();
        assert!(!by_name.enabled());
        assert!(select_provider("bogus").is_none());
    }

    #[test]
    fn rustls_provider_reports_roles() {
        let provider = RustlsProvider::new();
        assert!(!provider.enabled());
        assert!(provider.create(TlsMode::Server).is_err());
        assert_eq!("rustls", provider.name());
    }
}
