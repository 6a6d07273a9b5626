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

//! Error taxonomy for the connection manager

use std::fmt::Display;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents possible failures surfaced by the manager.
///
/// The first non-recoverable error observed is stored on the manager and
/// returned from [`Conmgr::run`] when exit-on-error is set.
///
/// [`Conmgr::run`]: crate::mgr::Conmgr::run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Underlying I/O failure. The original [`std::io::Error`] is flattened
    /// into its kind and rendered message so errors stay cloneable.
    Io(io::ErrorKind, String),
    /// RPC length prefix outside (0, max_msg_size].
    InsaneMsgLength(u32),
    /// Connection count reached the configured cap.
    TooManyConnections,
    /// Malformed `CONMGR_*` parameter token.
    InvalidParameter(String),
    /// Peer did not offer TLS on a connection that requires it.
    TlsRequired,
    /// TLS was requested but no usable provider is configured.
    TlsUnavailable,
    /// Operation is not valid for this connection or platform.
    NotSupported,
    /// Manager has shut down and refuses new work.
    ShutDown,
}

impl Error {
    fn description_str(&self) -> &'static str {
        match *self {
            Error::Io(..) => "I/O error",
            Error::InsaneMsgLength(_) => "insane msg length",
            Error::TooManyConnections => "too many connections",
            Error::InvalidParameter(_) => "invalid parameter",
            Error::TlsRequired => "TLS required by configuration",
            Error::TlsUnavailable => "TLS unavailable",
            Error::NotSupported => "not supported",
            Error::ShutDown => "connection manager shut down",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(kind, msg) => write!(f, "I/O error: {msg} ({kind:?})"),
            Error::InsaneMsgLength(len) => {
                write!(f, "insane msg length: {len}")
            }
            Error::InvalidParameter(tok) => {
                write!(f, "invalid parameter: {tok}")
            }
            _ => f.write_str(self.description_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.kind(), err.to_string())
    }
}

/// Last OS error as a crate [`Error`].
pub(crate) fn last_os_error() -> Error {
    Error::from(io::Error::last_os_error())
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn insane_msg_length_names_itself() {
        let err = Error::InsaneMsgLength(131073);
        assert!(err.to_string().starts_with("insane msg length"));
    }

    #[test]
    fn io_errors_flatten_to_kind_and_message() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err = Error::from(io);
        assert_eq!(err, Error::Io(std::io::ErrorKind::BrokenPipe, "gone".into()));
    }
}
