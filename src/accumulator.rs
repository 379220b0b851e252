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

use crate::error::FbmError;

/// A sliding-window writer over a fixed-size byte buffer.
///
/// The window splits the buffer into an accumulated prefix (committed bytes)
/// and a remaining suffix (writable bytes). An optional reserved prefix sits
/// in front of the accumulated region and survives [`reset`](Self::reset),
/// so a length or id field can be patched in after the payload is known.
pub struct Accumulator {
  buf: Box<[u8]>,
  prefix: usize,
  accumulated: usize,
}

impl Accumulator {
  pub fn new(capacity: usize) -> Self {
    Self::with_prefix(capacity, 0)
  }

  /// Creates an accumulator whose first `prefix` bytes are reserved for
  /// back-patching via [`prefix_mut`](Self::prefix_mut).
  pub fn with_prefix(capacity: usize, prefix: usize) -> Self {
    assert!(prefix <= capacity, "reserved prefix exceeds capacity");
    Self {
      buf: vec![0u8; capacity].into_boxed_slice(),
      prefix,
      accumulated: 0,
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.buf.len()
  }

  /// Committed bytes, including the reserved prefix.
  #[inline]
  pub fn accumulated(&self) -> &[u8] {
    &self.buf[..self.prefix + self.accumulated]
  }

  #[inline]
  pub fn accumulated_len(&self) -> usize {
    self.prefix + self.accumulated
  }

  /// Writable capacity left behind the committed window.
  #[inline]
  pub fn remaining(&self) -> usize {
    self.buf.len() - self.prefix - self.accumulated
  }

  /// Slice of the writable suffix. Commit writes with
  /// [`advance`](Self::advance).
  #[inline]
  pub fn remaining_mut(&mut self) -> &mut [u8] {
    &mut self.buf[self.prefix + self.accumulated..]
  }

  /// The reserved prefix region, for late back-patching.
  #[inline]
  pub fn prefix_mut(&mut self) -> &mut [u8] {
    &mut self.buf[..self.prefix]
  }

  /// Commit `count` bytes previously written through
  /// [`remaining_mut`](Self::remaining_mut).
  #[inline]
  pub fn advance(&mut self, count: usize) {
    if self.prefix + self.accumulated + count > self.buf.len() {
      panic!("attempted to advance past the accumulator capacity");
    }
    self.accumulated += count;
  }

  /// Checked append of `data` to the committed window.
  pub fn write(&mut self, data: &[u8]) -> Result<(), FbmError> {
    if data.len() > self.remaining() {
      return Err(FbmError::BufferTooSmall {
        needed: data.len(),
        remaining: self.remaining(),
      });
    }
    let start = self.prefix + self.accumulated;
    self.buf[start..start + data.len()].copy_from_slice(data);
    self.accumulated += data.len();
    Ok(())
  }

  /// Drops the committed window. The reserved prefix stays reserved.
  #[inline]
  pub fn reset(&mut self) {
    self.accumulated = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_advances_the_window() {
    let mut acc = Accumulator::new(8);
    acc.write(&[1, 2, 3]).unwrap();
    assert_eq!(acc.accumulated(), &[1, 2, 3]);
    assert_eq!(acc.remaining(), 5);
    acc.write(&[4]).unwrap();
    assert_eq!(acc.accumulated(), &[1, 2, 3, 4]);
  }

  #[test]
  fn write_rejects_overflow() {
    let mut acc = Accumulator::new(4);
    acc.write(&[0; 3]).unwrap();
    let err = acc.write(&[0; 2]).unwrap_err();
    assert!(matches!(
      err,
      FbmError::BufferTooSmall { needed: 2, remaining: 1 }
    ));
    // The failed write must not commit anything.
    assert_eq!(acc.accumulated_len(), 3);
  }

  #[test]
  fn reset_clears_committed_bytes() {
    let mut acc = Accumulator::new(8);
    acc.write(&[1, 2, 3]).unwrap();
    acc.reset();
    assert_eq!(acc.accumulated_len(), 0);
    assert_eq!(acc.remaining(), 8);
    acc.reset();
    assert_eq!(acc.accumulated_len(), 0);
  }

  #[test]
  fn prefix_survives_reset_and_backpatch() {
    let mut acc = Accumulator::with_prefix(8, 2);
    acc.write(&[9, 9]).unwrap();
    acc.prefix_mut().copy_from_slice(&[0xAA, 0xBB]);
    assert_eq!(acc.accumulated(), &[0xAA, 0xBB, 9, 9]);
    acc.reset();
    assert_eq!(acc.accumulated(), &[0xAA, 0xBB]);
    assert_eq!(acc.remaining(), 6);
  }

  #[test]
  fn advance_commits_manual_writes() {
    let mut acc = Accumulator::new(4);
    acc.remaining_mut()[..2].copy_from_slice(&[7, 8]);
    acc.advance(2);
    assert_eq!(acc.accumulated(), &[7, 8]);
  }

  #[test]
  #[should_panic(expected = "advance past")]
  fn advance_past_capacity_panics() {
    let mut acc = Accumulator::new(2);
    acc.advance(3);
  }
}
