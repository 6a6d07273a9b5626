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

//! Connection buffers: a growable incoming buffer with a processed offset,
//! and the ordered outgoing buffer queue.

use std::collections::VecDeque;
use std::io;

/// Default incoming buffer size: 1 page.
pub const BUFFER_START_SIZE: usize = 4096;

/// A growable, contiguous incoming byte buffer.
///
/// Bytes are appended by I/O (`fill_from`) and consumed by parsers
/// (`mark_consumed`). The processed offset never exceeds the written length;
/// after a partial consume the remainder can be moved to the front with
/// `compact`.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates an empty buffer with one page of capacity.
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUFFER_START_SIZE),
            read_offset: 0,
        }
    }

    /// Bytes available to read.
    pub fn len(&self) -> usize {
        self.data.len() - self.read_offset
    }

    /// True when no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unconsumed bytes.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_offset..]
    }

    /// Mark `amount` bytes as consumed, freeing them for removal.
    ///
    /// # Panics
    ///
    /// Panics if `amount` exceeds the readable length.
    pub fn mark_consumed(&mut self, amount: usize) {
        assert!(amount <= self.len(), "consumed beyond buffer size");
        self.read_offset += amount;
        if self.read_offset == self.data.len() {
            self.reset();
        }
    }

    /// Move any unconsumed remainder to the front of the buffer.
    pub fn compact(&mut self) {
        if self.read_offset == 0 {
            return;
        }
        self.data.copy_within(self.read_offset.., 0);
        self.data.truncate(self.len());
        self.read_offset = 0;
    }

    /// Reset to a clean, empty state without releasing capacity.
    pub fn reset(&mut self) {
        self.data.clear();
        self.read_offset = 0;
    }

    /// Grow so at least `additional` more bytes can be written.
    ///
    /// Allocation failure is reported instead of aborting so the connection
    /// can be closed on ENOMEM.
    pub fn try_grow(&mut self, additional: usize) -> io::Result<()> {
        self.data
            .try_reserve(additional)
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    /// Append up to `max` bytes produced by `fill`, which receives a zeroed
    /// writable area and returns how many bytes it actually wrote.
    ///
    /// On error the buffer is left exactly as it was.
    pub fn fill_from<F>(&mut self, max: usize, fill: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let used = self.data.len();
        self.try_grow(max)?;
        self.data.resize(used + max, 0);

        match fill(&mut self.data[used..]) {
            Ok(got) => {
                debug_assert!(got <= max);
                self.data.truncate(used + got.min(max));
                Ok(got)
            }
            Err(err) => {
                self.data.truncate(used);
                Err(err)
            }
        }
    }
}

/// One queued outgoing buffer with its sent offset.
#[derive(Debug)]
pub struct OutBuf {
    data: Vec<u8>,
    sent: usize,
}

impl OutBuf {
    /// Bytes still waiting to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.sent..]
    }
}

/// Ordered sequence of outgoing buffers; list order is send order.
#[derive(Debug, Default)]
pub struct OutQueue {
    bufs: VecDeque<OutBuf>,
}

impl OutQueue {
    /// Number of queued buffers.
    pub fn count(&self) -> usize {
        self.bufs.len()
    }

    /// True when nothing is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Total unsent bytes across all queued buffers.
    pub fn remaining_bytes(&self) -> usize {
        self.bufs.iter().map(|b| b.data.len() - b.sent).sum()
    }

    /// Append a buffer to the send queue.
    pub fn push(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.bufs.push_back(OutBuf { data, sent: 0 });
        }
    }

    /// Iterate the queued buffers in send order.
    pub fn iter(&self) -> impl Iterator<Item = &OutBuf> {
        self.bufs.iter()
    }

    /// Flush `wrote` bytes off the front of the queue, advancing the sent
    /// offset of each buffer in order and deleting fully-sent ones.
    pub fn advance(&mut self, mut wrote: usize) {
        while wrote > 0 {
            let front = self
                .bufs
                .front_mut()
                .expect("advanced past queued output");
            let left = front.data.len() - front.sent;

            if wrote >= left {
                wrote -= left;
                self.bufs.pop_front();
            } else {
                front.sent += wrote;
                wrote = 0;
            }
        }
    }

    /// Drop all queued output on the floor.
    pub fn clear(&mut self) {
        self.bufs.clear();
    }
}

#[cfg(test)]
mod test {
    use super::{Buffer, OutQueue};

    #[test]
    fn buffer_fill_and_consume() {
        let mut buf = Buffer::new();
        let got = buf
            .fill_from(8, |area| {
                area[..3].copy_from_slice(b"abc");
                Ok(3)
            })
            .unwrap();
        assert_eq!(3, got);
        assert_eq!(b"abc", buf.readable());

        buf.mark_consumed(1);
        assert_eq!(b"bc", buf.readable());

        buf.mark_consumed(2);
        assert!(buf.is_empty());
        assert_eq!(0, buf.read_offset);
    }

    #[test]
    fn buffer_fill_error_leaves_state_unchanged() {
        let mut buf = Buffer::new();
        buf.fill_from(4, |area| {
            area.copy_from_slice(b"wxyz");
            Ok(4)
        })
        .unwrap();

        let err = buf.fill_from(16, |_| {
            Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
        });
        assert!(err.is_err());
        assert_eq!(b"wxyz", buf.readable());
    }

    #[test]
    fn buffer_compact_moves_remainder_to_front() {
        let mut buf = Buffer::new();
        buf.fill_from(10, |area| {
            area.copy_from_slice(b"0123456789");
            Ok(10)
        })
        .unwrap();
        buf.mark_consumed(6);
        buf.compact();
        assert_eq!(b"6789", buf.readable());
        assert_eq!(0, buf.read_offset);
    }

    #[test]
    #[should_panic(expected = "consumed beyond buffer size")]
    fn buffer_overconsume_panics() {
        let mut buf = Buffer::new();
        buf.fill_from(2, |area| {
            area.copy_from_slice(b"ab");
            Ok(2)
        })
        .unwrap();
        buf.mark_consumed(3);
    }

    #[test]
    fn out_queue_advances_across_buffers() {
        let mut out = OutQueue::default();
        out.push(b"hello".to_vec());
        out.push(b"world".to_vec());
        assert_eq!(10, out.remaining_bytes());

        out.advance(7);
        assert_eq!(1, out.count());
        assert_eq!(b"rld", out.iter().next().unwrap().remaining());

        out.advance(3);
        assert!(out.is_empty());
    }

    #[test]
    fn out_queue_ignores_empty_buffers() {
        let mut out = OutQueue::default();
        out.push(Vec::new());
        assert!(out.is_empty());
    }
}
