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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! conmgr is an event-driven, thread-pooled connection manager for systems
//! daemons.
//!
//! One watch thread multiplexes readiness notifications across every managed
//! file descriptor (sockets, pipes, character devices); a small worker pool
//! runs connection callbacks off the event loop. Inbound bytes are handed to
//! the host either raw or reassembled into 32-bit length-prefixed RPC
//! messages, and a single listening port can serve both TLS and plaintext
//! RPC peers via a handshake fingerprint.
//!
//! The pieces fit together like this: register file descriptors or create
//! sockets on a [`Conmgr`], supply a [`ConnectionEvents`] table per
//! registration, then call [`Conmgr::run`]. Work can also be queued
//! directly, including time-delayed work and work triggered by process
//! signals.
//!
//! ## Examples
//!
//! A runnable length-prefixed echo server lives in the `demos` directory of
//! the source tree.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod mgr;
pub mod polling;
pub mod rpc;
pub mod tls;
pub mod work;

mod delayed;
mod events;
mod io;
mod signals;
mod watch;
mod workers;

pub use config::Settings;
pub use connection::{ConFlags, Connection, ConnectionEvents, ConnectionKind, Ctx};
pub use error::{Error, Result};
pub use mgr::{Callbacks, ConRef, Conmgr};
pub use rpc::{RpcCodec, RpcMsg, UnpackError};
pub use tls::{TlsProvider, TlsSession};
pub use work::{Callback, WorkArgs, WorkControl, WorkStatus};
