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

//! RPC framing: 32-bit big-endian length-prefixed message reassembly and the
//! pluggable codec seam.

use std::any::Any;
use std::fmt::Display;

use crate::connection::{ConFlags, Connection};
use crate::error::{Error, Result};
use crate::mgr::Conmgr;
use crate::work::ConTask;

/// Size of the length prefix on the wire.
pub const LENGTH_PREFIX: usize = 4;

/// A decoded message produced by the external codec.
pub type RpcMsg = Box<dyn Any + Send>;

/// Failure reported by the external codec.
///
/// Handed to `on_msg` once so the host can send a final reply before the
/// connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackError {
    message: String,
}

impl UnpackError {
    /// Wrap a codec failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for UnpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unpack failed: {}", self.message)
    }
}

impl std::error::Error for UnpackError {}

/// Payload codec called with a shadow buffer of exactly one frame.
///
/// The manager does not interpret payloads; when no codec is configured the
/// raw payload bytes are passed through as a `Box<Vec<u8>>`.
pub trait RpcCodec: Send + Sync {
    /// Decode one frame. The buffer is valid only for the duration of the
    /// call.
    fn unpack(&self, con: &Connection, payload: &[u8]) -> std::result::Result<RpcMsg, UnpackError>;
}

/// Incremental examination of the reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Fewer than 4 bytes buffered.
    NeedLength,
    /// Prefix parsed; the carried total byte count (prefix included) is
    /// required before the frame completes.
    NeedBytes(usize),
    /// A complete frame is buffered; carries the payload length.
    Payload(usize),
    /// Length prefix outside (0, max_msg_size].
    Insane(u32),
}

/// Examine the front of `buf` for a frame without consuming anything.
pub fn examine(buf: &[u8], max_msg_size: u32) -> Frame {
    let Some(prefix) = buf.get(..LENGTH_PREFIX) else {
        return Frame::NeedLength;
    };

    let msglen = u32::from_be_bytes(prefix.try_into().expect("4-byte slice"));
    if msglen == 0 || msglen > max_msg_size {
        return Frame::Insane(msglen);
    }

    let need = LENGTH_PREFIX + msglen as usize;
    if buf.len() < need {
        Frame::NeedBytes(need)
    } else {
        Frame::Payload(msglen as usize)
    }
}

/// Frame an outbound payload with its length prefix.
pub(crate) fn frame_msg(payload: &[u8], max_msg_size: u32) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > max_msg_size as usize {
        return Err(Error::InsaneMsgLength(payload.len() as u32));
    }

    let mut framed = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Try to parse and dispatch one RPC from the connection's incoming buffer.
///
/// Re-entrant: called repeatedly as chunks arrive, it consumes exactly one
/// frame per complete message and leaves partial frames in place.
pub(crate) fn on_rpc_data(mgr: &Conmgr, con: &mut Connection) -> Result<()> {
    let pending = con.in_buf.len();
    log::trace!("[{}] got {pending} bytes pending for RPC connection", con.name());

    match examine(con.in_buffer(), mgr.settings().max_msg_size) {
        Frame::NeedLength => {
            log::trace!("[{}] waiting for message length", con.name());
            Ok(())
        }
        Frame::NeedBytes(need) => {
            log::trace!(
                "[{}] waiting for {pending}/{need} bytes of RPC message",
                con.name()
            );
            // must defer resizing until outside the I/O handler
            mgr.add_con_task(con.id, ConTask::GrowBuffer(need));
            Ok(())
        }
        Frame::Insane(msglen) => {
            log::debug!("[{}] rejecting RPC message length: {msglen}", con.name());
            Err(Error::InsaneMsgLength(msglen))
        }
        Frame::Payload(msglen) => dispatch_rpc(mgr, con, msglen),
    }
}

fn dispatch_rpc(mgr: &Conmgr, con: &mut Connection, msglen: usize) -> Result<()> {
    let need = LENGTH_PREFIX + msglen;

    let msg = {
        let payload = &con.in_buffer()[LENGTH_PREFIX..need];
        match mgr.codec() {
            Some(codec) => codec.unpack(con, payload),
            None => Ok(Box::new(payload.to_vec()) as RpcMsg),
        }
    };

    let raw = if con.flags.has(ConFlags::RPC_KEEP_BUFFER) {
        Some(con.in_buffer()[LENGTH_PREFIX..need].to_vec())
    } else {
        None
    };

    match &msg {
        Ok(_) => {
            log::trace!("[{}] unpacked {need} byte RPC", con.name());
            // notify the manager we processed the frame
            con.mark_consumed(need);
        }
        Err(err) => {
            log::debug!("[{}] codec failed: {err}", con.name());
            // Another RPC cannot be parsed safely on this stream; close the
            // read side and let the callback decide about the write side.
            mgr.close_con(con);
        }
    }

    let events = con.events();
    log::trace!("[{}] RPC BEGIN on_msg", con.name());
    let rc = events.on_msg(mgr, con, msg, raw);
    log::trace!("[{}] RPC END on_msg ok={}", con.name(), rc.is_ok());

    rc.map_err(Error::from)
}

#[cfg(test)]
mod test {
    use super::*;

    const MAX: u32 = 128 * 1024;

    #[test]
    fn examine_waits_for_the_length_prefix() {
        assert_eq!(Frame::NeedLength, examine(b"", MAX));
        assert_eq!(Frame::NeedLength, examine(b"\x00\x00\x00", MAX));
    }

    #[test]
    fn examine_waits_for_the_full_frame() {
        let mut buf = 100u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 42]);
        assert_eq!(Frame::NeedBytes(104), examine(&buf, MAX));
    }

    #[test]
    fn examine_finds_a_complete_frame() {
        let mut buf = 7u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"payload");
        buf.extend_from_slice(b"extra");
        assert_eq!(Frame::Payload(7), examine(&buf, MAX));
    }

    #[test]
    fn examine_rejects_insane_lengths() {
        assert_eq!(Frame::Insane(0), examine(&0u32.to_be_bytes(), MAX));
        assert_eq!(Frame::Insane(MAX + 1), examine(&(MAX + 1).to_be_bytes(), MAX));
    }

    #[test]
    fn frames_reassemble_regardless_of_chunking() {
        // two frames of 100 and 7 payload bytes delivered as reads of
        // 1, 3, 102, and 5 bytes
        let mut wire = Vec::new();
        wire.extend_from_slice(&100u32.to_be_bytes());
        wire.extend_from_slice(&[0xaa; 100]);
        wire.extend_from_slice(&7u32.to_be_bytes());
        wire.extend_from_slice(b"0123456");

        let mut buffered: Vec<u8> = Vec::new();
        let mut frames = Vec::new();
        let mut offset = 0;

        for chunk in [1usize, 3, 102, 5] {
            buffered.extend_from_slice(&wire[offset..offset + chunk]);
            offset += chunk;

            // drain every complete frame currently buffered
            while let Frame::Payload(len) = examine(&buffered, MAX) {
                frames.push(buffered[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec());
                buffered.drain(..LENGTH_PREFIX + len);
            }
        }

        assert_eq!(offset, wire.len());
        assert_eq!(2, frames.len());
        assert_eq!(100, frames[0].len());
        assert_eq!(b"0123456".as_slice(), &frames[1]);
        assert!(buffered.is_empty());
    }

    #[test]
    fn frame_msg_round_trips_through_examine() {
        let framed = frame_msg(b"hello", MAX).unwrap();
        assert_eq!(Frame::Payload(5), examine(&framed, MAX));
        assert_eq!(b"hello", &framed[LENGTH_PREFIX..]);
    }

    #[test]
    fn frame_msg_rejects_empty_and_oversized_payloads() {
        assert!(frame_msg(b"", MAX).is_err());
        let big = vec![0u8; MAX as usize + 1];
        assert!(matches!(
            frame_msg(&big, MAX),
            Err(Error::InsaneMsgLength(_))
        ));
    }
}
