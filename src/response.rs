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

use bytes::Bytes;

use crate::error::FbmError;
use crate::frame::{self, HeaderCommand};
use crate::headers::{self, HeaderBuffer, HeaderEntry, ParseStatus};

/// A parsed view over one received FBM message.
///
/// Owns the frozen message buffer; headers are decoded into an internal
/// header buffer and the payload is exposed as a view over the message tail.
pub struct Response {
  buf: Bytes,
  message_id: i32,
  entries: Vec<HeaderEntry>,
  headers: HeaderBuffer,
  payload_start: usize,
  status: ParseStatus,
}

impl Response {
  /// Parses a complete message. The leading message-id line has already
  /// been validated by the receive loop; it is consumed again here so the
  /// view is self-contained.
  pub fn parse(
    buf: Bytes,
    header_capacity: usize,
  ) -> Result<Response, FbmError> {
    let mut pos = 0;
    let id_line = frame::read_line(&buf, &mut pos);
    let message_id = frame::message_id(id_line)?;

    let mut headers = HeaderBuffer::new(header_capacity);
    let mut entries = Vec::new();
    let status = headers::parse_headers(&buf, &mut pos, &mut headers, &mut entries);

    Ok(Response {
      message_id,
      entries,
      headers,
      payload_start: pos,
      status,
      buf,
    })
  }

  #[inline]
  pub fn message_id(&self) -> i32 {
    self.message_id
  }

  /// Parse outcome; partial-header delivery is flagged here, not raised.
  #[inline]
  pub fn status(&self) -> ParseStatus {
    self.status
  }

  /// All parsed headers, in wire order.
  pub fn headers(&self) -> impl Iterator<Item = (HeaderCommand, &str)> {
    self
      .entries
      .iter()
      .map(|entry| (entry.command, self.headers.get(entry)))
  }

  /// First header with the given command, if any.
  pub fn header(&self, command: HeaderCommand) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|entry| entry.command == command)
      .map(|entry| self.headers.get(entry))
  }

  /// The opaque payload tail of the message.
  #[inline]
  pub fn payload(&self) -> &[u8] {
    &self.buf[self.payload_start..]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::accumulator::Accumulator;

  fn message(id: i32, headers: &[(u8, &str)], payload: &[u8]) -> Bytes {
    let mut acc = Accumulator::new(1024);
    frame::write_message_id(&mut acc, id).unwrap();
    for &(cmd, value) in headers {
      frame::write_header(&mut acc, HeaderCommand::custom(cmd).unwrap(), value)
        .unwrap();
    }
    frame::write_body(&mut acc, 0x01, payload).unwrap();
    Bytes::copy_from_slice(acc.accumulated())
  }

  #[test]
  fn round_trip_preserves_headers_and_payload() {
    let buf = message(42, &[(0x10, "Hello"), (0x11, "World")], &[1, 2, 3]);
    let response = Response::parse(buf, 256).unwrap();

    assert_eq!(response.message_id(), 42);
    assert_eq!(response.status(), ParseStatus::empty());
    let parsed: Vec<_> = response
      .headers()
      .map(|(cmd, value)| (cmd.value(), value.to_owned()))
      .collect();
    assert_eq!(
      parsed,
      vec![
        (0x10, "Hello".to_owned()),
        (0x11, "World".to_owned()),
        (HeaderCommand::CONTENT_TYPE.value(), "\u{1}".to_owned()),
      ]
    );
    assert_eq!(response.payload(), &[1, 2, 3]);
  }

  #[test]
  fn parse_twice_yields_equal_header_lists() {
    let buf = message(7, &[(0x21, "a"), (0x22, "bb")], b"tail");
    let first = Response::parse(buf.clone(), 64).unwrap();
    let second = Response::parse(buf, 64).unwrap();
    let collect = |r: &Response| {
      r.headers()
        .map(|(cmd, v)| (cmd.value(), v.as_bytes().to_vec()))
        .collect::<Vec<_>>()
    };
    assert_eq!(collect(&first), collect(&second));
  }

  #[test]
  fn header_lookup_finds_first_match() {
    let buf = message(7, &[(0x30, "one"), (0x30, "two")], b"");
    let response = Response::parse(buf, 64).unwrap();
    assert_eq!(
      response.header(HeaderCommand::custom(0x30).unwrap()),
      Some("one")
    );
    assert_eq!(response.header(HeaderCommand::STATUS), None);
  }

  #[test]
  fn rejects_a_buffer_without_message_id() {
    let buf = Bytes::from_static(&[0xFF, 0xF1, 0xFF, 0xF1]);
    assert!(Response::parse(buf, 64).is_err());
  }
}
