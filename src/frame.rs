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

//! The FBM wire codec.
//!
//! One logical message is a message-id line, zero or more header lines, an
//! empty line, then the opaque payload:
//!
//! ```text
//! [0x01][i32 BE][0xFF 0xF1]      message id line
//! [cmd != 0][utf8 ...][0xFF 0xF1] header line, repeated
//! [0xFF 0xF1]                     end of headers
//! [payload ...]                   until end of the logical message
//! ```
//!
//! All functions here are pure over byte buffers and an [`Accumulator`].

use crate::accumulator::Accumulator;
use crate::error::FbmError;

/// The two-byte line terminator, everywhere a line ends.
pub const TERMINATOR: [u8; 2] = [0xFF, 0xF1];

/// Reserved message id for out-of-band per-connection signaling.
pub const CONTROL_FRAME_ID: i32 = -500;

/// Full length of an encoded message-id line: command + id + terminator.
pub const MESSAGE_ID_LINE_LEN: usize = 1 + 4 + TERMINATOR.len();

/// The shortest prefix from which a message id can be extracted.
pub(crate) const MIN_MESSAGE_ID_LINE: usize = 5;

/// A single-byte header command.
///
/// Byte value `0` never names a header; [`HeaderCommand::custom`] rejects it.
/// Values outside the predefined set are application-assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeaderCommand(u8);

impl HeaderCommand {
  /// First header of every message.
  pub const MESSAGE_ID: HeaderCommand = HeaderCommand(0x01);
  /// Content type of the payload body.
  pub const CONTENT_TYPE: HeaderCommand = HeaderCommand(0x02);
  /// Response status.
  pub const STATUS: HeaderCommand = HeaderCommand(0x03);

  /// An application-assigned header command. Returns `None` for byte `0`.
  pub const fn custom(value: u8) -> Option<HeaderCommand> {
    if value == 0 {
      None
    } else {
      Some(HeaderCommand(value))
    }
  }

  #[inline]
  pub const fn value(self) -> u8 {
    self.0
  }
}

/// Appends the message-id line: `[0x01][id BE][terminator]`.
pub fn write_message_id(
  acc: &mut Accumulator,
  id: i32,
) -> Result<(), FbmError> {
  if id == 0 {
    return Err(FbmError::InvalidMessageId(id));
  }
  if acc.remaining() < MESSAGE_ID_LINE_LEN {
    return Err(FbmError::BufferTooSmall {
      needed: MESSAGE_ID_LINE_LEN,
      remaining: acc.remaining(),
    });
  }
  acc.write(&[HeaderCommand::MESSAGE_ID.value()])?;
  acc.write(&id.to_be_bytes())?;
  acc.write(&TERMINATOR)
}

/// Appends one header line: `[cmd][utf8 value][terminator]`.
pub fn write_header(
  acc: &mut Accumulator,
  command: HeaderCommand,
  value: &str,
) -> Result<(), FbmError> {
  let needed = 1 + value.len() + TERMINATOR.len();
  if acc.remaining() < needed {
    return Err(FbmError::BufferTooSmall {
      needed,
      remaining: acc.remaining(),
    });
  }
  acc.write(&[command.value()])?;
  acc.write(value.as_bytes())?;
  acc.write(&TERMINATOR)
}

/// Appends the content-type header, the end-of-headers line and the body.
///
/// The content type is an opaque application byte; see
/// [`write_content_type`] for the value encoding.
pub fn write_body(
  acc: &mut Accumulator,
  content_type: u8,
  body: &[u8],
) -> Result<(), FbmError> {
  let needed = 3 + 2 * TERMINATOR.len() + body.len();
  if acc.remaining() < needed {
    return Err(FbmError::BufferTooSmall {
      needed,
      remaining: acc.remaining(),
    });
  }
  write_content_type(acc, content_type)?;
  acc.write(&TERMINATOR)?;
  acc.write(body)
}

/// Appends the content-type header line with a one-byte value.
pub fn write_content_type(
  acc: &mut Accumulator,
  content_type: u8,
) -> Result<(), FbmError> {
  let needed = 2 + TERMINATOR.len();
  if acc.remaining() < needed {
    return Err(FbmError::BufferTooSmall {
      needed,
      remaining: acc.remaining(),
    });
  }
  acc.write(&[HeaderCommand::CONTENT_TYPE.value(), content_type])?;
  acc.write(&TERMINATOR)
}

/// Returns the next line, excluding its terminator, advancing `pos` past the
/// terminator. Returns an empty slice when no terminator is found or the
/// terminator sits at `pos` (the end-of-headers line).
pub fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> &'a [u8] {
  match find_terminator(&buf[*pos..]) {
    Some(at) => {
      let line = &buf[*pos..*pos + at];
      *pos += at + TERMINATOR.len();
      line
    }
    None => &[],
  }
}

/// Extracts the message id from a message-id line.
///
/// The line must be at least five bytes and start with the
/// [`MESSAGE_ID`](HeaderCommand::MESSAGE_ID) command byte; the id itself is
/// big-endian.
pub fn message_id(line: &[u8]) -> Result<i32, FbmError> {
  if line.len() < MIN_MESSAGE_ID_LINE {
    return Err(FbmError::Protocol("message id line too short"));
  }
  if line[0] != HeaderCommand::MESSAGE_ID.value() {
    return Err(FbmError::Protocol("message does not start with a message id"));
  }
  let mut raw = [0u8; 4];
  raw.copy_from_slice(&line[1..5]);
  Ok(i32::from_be_bytes(raw))
}

/// Byte-pattern search for the terminator, at any alignment.
fn find_terminator(buf: &[u8]) -> Option<usize> {
  buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_id_line_layout() {
    let mut acc = Accumulator::new(16);
    write_message_id(&mut acc, 0x01020304).unwrap();
    assert_eq!(
      acc.accumulated(),
      &[0x01, 0x01, 0x02, 0x03, 0x04, 0xFF, 0xF1]
    );
  }

  #[test]
  fn message_id_is_big_endian() {
    let mut acc = Accumulator::new(16);
    write_message_id(&mut acc, -500).unwrap();
    let mut pos = 0;
    let line = read_line(acc.accumulated(), &mut pos);
    assert_eq!(message_id(line).unwrap(), -500);
  }

  #[test]
  fn zero_message_id_is_rejected() {
    let mut acc = Accumulator::new(16);
    assert!(matches!(
      write_message_id(&mut acc, 0),
      Err(FbmError::InvalidMessageId(0))
    ));
  }

  #[test]
  fn header_command_zero_is_invalid() {
    assert!(HeaderCommand::custom(0).is_none());
    assert_eq!(HeaderCommand::custom(0x10).unwrap().value(), 0x10);
  }

  #[test]
  fn short_line_and_wrong_command_are_distinct_errors() {
    assert!(matches!(
      message_id(&[0x01, 0x00, 0x00]),
      Err(FbmError::Protocol("message id line too short"))
    ));
    assert!(matches!(
      message_id(&[0x07, 0x00, 0x00, 0x00, 0x01]),
      Err(FbmError::Protocol(_))
    ));
  }

  #[test]
  fn read_line_walks_terminated_lines() {
    let buf = [b'a', b'b', 0xFF, 0xF1, b'c', 0xFF, 0xF1, 0xFF, 0xF1, b'p'];
    let mut pos = 0;
    assert_eq!(read_line(&buf, &mut pos), b"ab");
    assert_eq!(read_line(&buf, &mut pos), b"c");
    // Empty line: terminator at the current position.
    assert_eq!(read_line(&buf, &mut pos), b"");
    assert_eq!(pos, 9);
    // No terminator in the tail.
    assert_eq!(read_line(&buf, &mut pos), b"");
    assert_eq!(pos, 9);
  }

  #[test]
  fn terminator_is_matched_at_any_alignment() {
    // A lone 0xFF must not terminate; the pair may start on an odd offset.
    let buf = [0xFF, b'x', 0xFF, 0xF1, b'y'];
    let mut pos = 0;
    assert_eq!(read_line(&buf, &mut pos), &[0xFF, b'x']);
    assert_eq!(pos, 4);
  }

  #[test]
  fn body_write_terminates_headers() {
    let mut acc = Accumulator::new(64);
    write_message_id(&mut acc, 7).unwrap();
    write_body(&mut acc, 0x01, &[0xDE, 0xAD]).unwrap();
    let bytes = acc.accumulated();
    // id line + content type line + empty line + payload
    assert_eq!(&bytes[7..11], &[0x02, 0x01, 0xFF, 0xF1]);
    assert_eq!(&bytes[11..13], &TERMINATOR);
    assert_eq!(&bytes[13..], &[0xDE, 0xAD]);
  }

  #[test]
  fn writes_fail_cleanly_when_capacity_runs_out() {
    let mut acc = Accumulator::new(MESSAGE_ID_LINE_LEN + 4);
    write_message_id(&mut acc, 1).unwrap();
    let before = acc.accumulated_len();
    assert!(matches!(
      write_header(
        &mut acc,
        HeaderCommand::custom(0x10).unwrap(),
        "too long"
      ),
      Err(FbmError::BufferTooSmall { .. })
    ));
    assert_eq!(acc.accumulated_len(), before);
  }
}
