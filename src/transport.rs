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

//! Contracts for the underlying message-frame transport.
//!
//! FBM rides an already-established WebSocket; the engines only ever see
//! these traits. An implementation adapts a concrete WebSocket crate (or,
//! in tests, an in-memory duplex) by mapping its frames onto
//! [`RecvEvent`]s: one logical FBM message is the run of chunks up to and
//! including the one with `end_of_message` set.

use async_trait::async_trait;
use url::Url;

use crate::error::FbmError;

/// Normal closure, as carried by the transport's close frame.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation, used when negotiation is rejected.
pub const CLOSE_POLICY: u16 = 1008;
/// The peer sent a message the negotiated limits do not allow.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// What kind of transport message a chunk belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
  Binary,
  Text,
  Close,
}

/// One received transport chunk, read into the caller's buffer.
#[derive(Clone, Copy, Debug)]
pub struct RecvEvent {
  /// Bytes written into the receive buffer.
  pub len: usize,
  /// Whether this chunk completes the logical message.
  pub end_of_message: bool,
  pub kind: MessageKind,
}

/// The receiving half of an established transport.
#[async_trait]
pub trait TransportReader: Send {
  /// Reads the next chunk into `buf`. A `Close` event ends the stream;
  /// reading past it is a transport error.
  async fn recv(&mut self, buf: &mut [u8]) -> Result<RecvEvent, FbmError>;
}

/// The sending half of an established transport.
#[async_trait]
pub trait TransportWriter: Send {
  /// Sends one binary chunk; `end_of_message` finishes the logical message.
  async fn send(
    &mut self,
    data: &[u8],
    end_of_message: bool,
  ) -> Result<(), FbmError>;

  /// Initiates a close handshake.
  async fn close(&mut self, code: u16, reason: &str) -> Result<(), FbmError>;
}

/// Establishes a transport for a client connection.
#[async_trait]
pub trait Connect: Send + Sync {
  async fn connect(
    &self,
    url: &Url,
  ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), FbmError>;
}

const QUERY_RECV_BUFFER: &str = "b";
const QUERY_HEADER_BUFFER: &str = "hb";
const QUERY_MAX_MESSAGE: &str = "mx";

/// Buffer sizes negotiated at the upgrade handshake, carried as query
/// parameters `b`, `hb` and `mx`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiationParams {
  /// Receive-buffer size in bytes.
  pub recv_buffer: usize,
  /// Maximum header-buffer size in bytes.
  pub max_header_buffer: usize,
  /// Maximum size of one logical message in bytes.
  pub max_message: usize,
}

impl NegotiationParams {
  /// Appends the negotiation query to a connect URL.
  pub fn apply(&self, url: &mut Url) {
    url
      .query_pairs_mut()
      .append_pair(QUERY_RECV_BUFFER, &self.recv_buffer.to_string())
      .append_pair(QUERY_HEADER_BUFFER, &self.max_header_buffer.to_string())
      .append_pair(QUERY_MAX_MESSAGE, &self.max_message.to_string());
  }

  /// Reads the negotiation query from an upgrade request URL.
  pub fn from_url(url: &Url) -> Result<NegotiationParams, FbmError> {
    let mut recv_buffer = None;
    let mut max_header_buffer = None;
    let mut max_message = None;
    for (key, value) in url.query_pairs() {
      let slot = match key.as_ref() {
        QUERY_RECV_BUFFER => &mut recv_buffer,
        QUERY_HEADER_BUFFER => &mut max_header_buffer,
        QUERY_MAX_MESSAGE => &mut max_message,
        _ => continue,
      };
      let parsed: usize = value
        .parse()
        .map_err(|_| FbmError::Negotiation("parameter is not a size"))?;
      if parsed == 0 {
        return Err(FbmError::Negotiation("zero-sized parameter"));
      }
      *slot = Some(parsed);
    }
    Ok(NegotiationParams {
      recv_buffer: recv_buffer
        .ok_or(FbmError::Negotiation("missing receive-buffer size"))?,
      max_header_buffer: max_header_buffer
        .ok_or(FbmError::Negotiation("missing header-buffer size"))?,
      max_message: max_message
        .ok_or(FbmError::Negotiation("missing maximum message size"))?,
    })
  }

  /// Server-side validation against the deployment ceilings; a rejected
  /// negotiation closes the socket with [`CLOSE_POLICY`].
  pub fn validate(&self, limits: &NegotiationParams) -> Result<(), FbmError> {
    if self.recv_buffer > limits.recv_buffer {
      return Err(FbmError::Negotiation("receive buffer over the limit"));
    }
    if self.max_header_buffer > limits.max_header_buffer {
      return Err(FbmError::Negotiation("header buffer over the limit"));
    }
    if self.max_message > limits.max_message {
      return Err(FbmError::Negotiation("maximum message size over the limit"));
    }
    Ok(())
  }
}
