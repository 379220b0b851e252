// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Header storage for one decoded message.
//!
//! All header values of a message live in a single contiguous
//! [`HeaderBuffer`]; parsed headers are `(command, offset, length)` records
//! pointing into it. The records stay valid until the buffer is reset, which
//! happens when the owning request context is reused.

use std::str;

use bitflags::bitflags;

use crate::frame::{self, HeaderCommand};

bitflags! {
  /// Outcome of a header parse. An empty set is a clean parse.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct ParseStatus: u8 {
    /// The decoded values no longer fit the header buffer; remaining
    /// headers were skipped but the message is still deliverable.
    const HEADER_OUT_OF_MEM = 0b0000_0001;
    /// A nonempty line carried no decodable value and was skipped.
    const INVALID_HEADER_READ = 0b0000_0010;
  }
}

/// One parsed header: a command byte plus a slice of the header buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderEntry {
  pub command: HeaderCommand,
  offset: u32,
  len: u32,
}

/// A fixed-capacity arena for the decoded header values of one message.
pub struct HeaderBuffer {
  buf: Box<[u8]>,
  used: usize,
}

impl HeaderBuffer {
  pub fn new(capacity: usize) -> Self {
    Self {
      buf: vec![0u8; capacity].into_boxed_slice(),
      used: 0,
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.buf.len()
  }

  #[inline]
  pub fn used(&self) -> usize {
    self.used
  }

  /// Invalidates every [`HeaderEntry`] handed out so far.
  #[inline]
  pub fn reset(&mut self) {
    self.used = 0;
  }

  fn push(&mut self, value: &str) -> Option<(u32, u32)> {
    let bytes = value.as_bytes();
    if bytes.len() > self.buf.len() - self.used {
      return None;
    }
    let offset = self.used;
    self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    self.used += bytes.len();
    Some((offset as u32, bytes.len() as u32))
  }

  /// The value an entry points at.
  pub fn get(&self, entry: &HeaderEntry) -> &str {
    let start = entry.offset as usize;
    let end = start + entry.len as usize;
    // Entries are only ever created over bytes copied from a validated
    // `&str`, on char boundaries by construction.
    unsafe { str::from_utf8_unchecked(&self.buf[start..end]) }
  }
}

/// Parses header lines from `buf` starting at `pos` until the end-of-headers
/// line, decoding values into `headers` and recording entries in `entries`.
///
/// On return `pos` sits on the first payload byte. Lines with a zero-length
/// or non-UTF-8 value (including a zeroed command byte) are skipped with
/// [`ParseStatus::INVALID_HEADER_READ`]; once the buffer is exhausted the
/// remaining headers are skipped with [`ParseStatus::HEADER_OUT_OF_MEM`] and
/// the entries parsed so far are preserved.
pub fn parse_headers(
  buf: &[u8],
  pos: &mut usize,
  headers: &mut HeaderBuffer,
  entries: &mut Vec<HeaderEntry>,
) -> ParseStatus {
  let mut status = ParseStatus::empty();

  loop {
    let line = frame::read_line(buf, pos);
    if line.is_empty() {
      break;
    }

    let command = match HeaderCommand::custom(line[0]) {
      Some(command) => command,
      None => {
        status |= ParseStatus::INVALID_HEADER_READ;
        continue;
      }
    };
    let value = match str::from_utf8(&line[1..]) {
      Ok(value) if !value.is_empty() => value,
      _ => {
        status |= ParseStatus::INVALID_HEADER_READ;
        continue;
      }
    };

    match headers.push(value) {
      Some((offset, len)) => entries.push(HeaderEntry { command, offset, len }),
      None => {
        status |= ParseStatus::HEADER_OUT_OF_MEM;
        // Skip to the end-of-headers line so the payload stays reachable.
        while !frame::read_line(buf, pos).is_empty() {}
        break;
      }
    }
  }

  status
}
