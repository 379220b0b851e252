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

use bytes::BytesMut;

use crate::error::FbmError;
use crate::frame::MIN_MESSAGE_ID_LINE;
use crate::transport::{MessageKind, TransportReader};

/// Outcome of assembling one logical message.
pub(crate) enum Received {
  /// A complete message within the size limit.
  Message(BytesMut),
  /// The message exceeded the limit and was drained off the wire.
  Oversize,
  /// The message ended before a message id could fit.
  Short,
  /// The peer closed the transport.
  Closed,
}

/// Reads transport chunks into `scratch` until end-of-message, accumulating
/// at most `max_message` bytes.
///
/// Both engines drive their receive loops through this: a message of exactly
/// `max_message` bytes is accepted, one more byte is not. Oversize messages
/// are drained to the end-of-message boundary so the session can continue.
pub(crate) async fn read_message(
  reader: &mut dyn TransportReader,
  scratch: &mut [u8],
  max_message: usize,
) -> Result<Received, FbmError> {
  let first = reader.recv(scratch).await?;
  if first.kind == MessageKind::Close {
    return Ok(Received::Closed);
  }
  if first.end_of_message && first.len < MIN_MESSAGE_ID_LINE - 1 {
    return Ok(Received::Short);
  }

  let mut message = BytesMut::with_capacity(first.len);
  let mut event = first;
  loop {
    if message.len() + event.len > max_message {
      let mut done = event.end_of_message;
      while !done {
        let drained = reader.recv(scratch).await?;
        if drained.kind == MessageKind::Close {
          return Ok(Received::Closed);
        }
        done = drained.end_of_message;
      }
      return Ok(Received::Oversize);
    }
    message.extend_from_slice(&scratch[..event.len]);
    if event.end_of_message {
      return Ok(Received::Message(message));
    }
    let next = reader.recv(scratch).await?;
    if next.kind == MessageKind::Close {
      return Ok(Received::Closed);
    }
    event = next;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::collections::VecDeque;

  struct ScriptedReader {
    chunks: VecDeque<(Vec<u8>, bool, MessageKind)>,
  }

  impl ScriptedReader {
    fn new(chunks: Vec<(Vec<u8>, bool, MessageKind)>) -> Self {
      Self { chunks: chunks.into() }
    }
  }

  #[async_trait]
  impl TransportReader for ScriptedReader {
    async fn recv(
      &mut self,
      buf: &mut [u8],
    ) -> Result<crate::transport::RecvEvent, FbmError> {
      let (data, end_of_message, kind) = self
        .chunks
        .pop_front()
        .ok_or(FbmError::Protocol("read past the scripted stream"))?;
      buf[..data.len()].copy_from_slice(&data);
      Ok(crate::transport::RecvEvent { len: data.len(), end_of_message, kind })
    }
  }

  fn binary(data: &[u8], end: bool) -> (Vec<u8>, bool, MessageKind) {
    (data.to_vec(), end, MessageKind::Binary)
  }

  #[tokio::test]
  async fn assembles_fragmented_messages() {
    let mut reader = ScriptedReader::new(vec![
      binary(b"abcd", false),
      binary(b"efgh", false),
      binary(b"i", true),
    ]);
    let mut scratch = [0u8; 16];
    match read_message(&mut reader, &mut scratch, 64).await.unwrap() {
      Received::Message(buf) => assert_eq!(&buf[..], b"abcdefghi"),
      _ => panic!("expected a complete message"),
    }
  }

  #[tokio::test]
  async fn exact_limit_accepted_one_more_rejected() {
    let mut scratch = [0u8; 16];

    let mut reader = ScriptedReader::new(vec![
      binary(&[0u8; 8], false),
      binary(&[0u8; 8], true),
    ]);
    assert!(matches!(
      read_message(&mut reader, &mut scratch, 16).await.unwrap(),
      Received::Message(_)
    ));

    let mut reader = ScriptedReader::new(vec![
      binary(&[0u8; 8], false),
      binary(&[0u8; 9], true),
    ]);
    assert!(matches!(
      read_message(&mut reader, &mut scratch, 16).await.unwrap(),
      Received::Oversize
    ));
  }

  #[tokio::test]
  async fn oversize_drains_to_message_end() {
    let mut reader = ScriptedReader::new(vec![
      binary(&[0u8; 10], false),
      binary(&[0u8; 10], false),
      binary(&[0u8; 2], true),
      binary(b"next", true),
    ]);
    let mut scratch = [0u8; 16];
    assert!(matches!(
      read_message(&mut reader, &mut scratch, 12).await.unwrap(),
      Received::Oversize
    ));
    // The following message is still readable.
    match read_message(&mut reader, &mut scratch, 12).await.unwrap() {
      Received::Message(buf) => assert_eq!(&buf[..], b"next"),
      _ => panic!("expected the next message"),
    }
  }

  #[tokio::test]
  async fn close_and_short_are_reported() {
    let mut scratch = [0u8; 16];

    let mut reader =
      ScriptedReader::new(vec![(Vec::new(), true, MessageKind::Close)]);
    assert!(matches!(
      read_message(&mut reader, &mut scratch, 16).await.unwrap(),
      Received::Closed
    ));

    let mut reader = ScriptedReader::new(vec![binary(&[1, 2], true)]);
    assert!(matches!(
      read_message(&mut reader, &mut scratch, 16).await.unwrap(),
      Received::Short
    ));
  }
}
