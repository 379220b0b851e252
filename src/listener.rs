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

//! The FBM server listener engine.
//!
//! One listener session serves one upgraded connection: a receive loop
//! assembles requests, rents a context per request, dispatches the user
//! handler on a background task and serializes the response under the
//! shared send mutex, so handler output order determines transmission
//! order while the receive loop never blocks on handler work.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::accumulator::Accumulator;
use crate::error::FbmError;
use crate::frame::{self, HeaderCommand, CONTROL_FRAME_ID, TERMINATOR};
use crate::headers::{self, HeaderBuffer, HeaderEntry, ParseStatus};
use crate::pool::ObjectPool;
use crate::recv::{self, Received};
use crate::transport::{
  NegotiationParams, TransportReader, TransportWriter, CLOSE_NORMAL,
  CLOSE_POLICY, CLOSE_TOO_BIG,
};

/// Per-session deployment parameters. The negotiated sizes usually come
/// from the upgrade query via [`ListenerParams::from_negotiation`].
#[derive(Clone, Copy, Debug)]
pub struct ListenerParams {
  /// Largest logical message accepted from the client.
  pub max_message_size: usize,
  /// Transport receive-buffer size.
  pub recv_buffer_size: usize,
  /// Capacity of each context's header buffer.
  pub header_buffer_size: usize,
  /// Capacity of each context's response accumulator.
  pub response_buffer_size: usize,
  /// Cached-context quota of the per-session pool.
  pub context_quota: usize,
}

impl Default for ListenerParams {
  fn default() -> Self {
    Self {
      max_message_size: 4 << 20,
      recv_buffer_size: 4096,
      header_buffer_size: 1024,
      response_buffer_size: 4096,
      context_quota: 32,
    }
  }
}

impl ListenerParams {
  /// Accepts a client's negotiation offer against `limits` and derives the
  /// session parameters from it. A rejected offer should close the socket
  /// with [`CLOSE_POLICY`].
  pub fn from_negotiation(
    offer: &NegotiationParams,
    limits: &ListenerParams,
  ) -> Result<ListenerParams, FbmError> {
    offer.validate(&NegotiationParams {
      recv_buffer: limits.recv_buffer_size,
      max_header_buffer: limits.header_buffer_size,
      max_message: limits.max_message_size,
    })?;
    Ok(ListenerParams {
      max_message_size: offer.max_message,
      recv_buffer_size: offer.recv_buffer,
      header_buffer_size: offer.max_header_buffer,
      response_buffer_size: limits.response_buffer_size,
      context_quota: limits.context_quota,
    })
  }
}

/// The user side of a listener session.
#[async_trait]
pub trait RequestHandler: Send + Sync {
  /// Serves one request by filling the response side of the context.
  async fn handle(&self, ctx: &mut FbmContext) -> Result<(), FbmError>;

  /// Processes an out-of-band control frame. The default ignores it.
  async fn handle_control(&self, _payload: &[u8]) -> Result<(), FbmError> {
    Ok(())
  }
}

/// A per-dispatch bundle: the copied request bytes with their parsed
/// headers, and the response accumulator the handler writes into.
///
/// Contexts are pooled per session; header views stay valid until the
/// context is returned.
pub struct FbmContext {
  message_id: i32,
  request: BytesMut,
  entries: Vec<HeaderEntry>,
  headers: HeaderBuffer,
  payload_start: usize,
  status: ParseStatus,
  response: Accumulator,
  response_body_written: bool,
  cancel: CancellationToken,
}

impl FbmContext {
  fn new(header_capacity: usize, response_capacity: usize) -> FbmContext {
    assert!(
      response_capacity >= frame::MESSAGE_ID_LINE_LEN,
      "response buffer cannot hold the message id line"
    );
    FbmContext {
      message_id: 0,
      request: BytesMut::new(),
      entries: Vec::new(),
      headers: HeaderBuffer::new(header_capacity),
      payload_start: 0,
      status: ParseStatus::empty(),
      response: Accumulator::new(response_capacity),
      response_body_written: false,
      cancel: CancellationToken::new(),
    }
  }

  /// Loads one validated request into the context and seeds the response
  /// with its message-id line.
  fn prepare(&mut self, id: i32, message: &[u8], cancel: CancellationToken) {
    self.message_id = id;
    self.request.clear();
    self.request.extend_from_slice(message);
    self.entries.clear();
    self.headers.reset();

    let mut pos = 0;
    frame::read_line(&self.request, &mut pos);
    self.status = headers::parse_headers(
      &self.request,
      &mut pos,
      &mut self.headers,
      &mut self.entries,
    );
    self.payload_start = pos;

    self.response.reset();
    frame::write_message_id(&mut self.response, id)
      .expect("response buffer holds at least the message id line");
    self.response_body_written = false;
    self.cancel = cancel;
  }

  /// Rent hook: a rented context never carries the previous dispatch.
  fn reset(&mut self) {
    self.message_id = 0;
    self.request.clear();
    self.entries.clear();
    self.headers.reset();
    self.payload_start = 0;
    self.status = ParseStatus::empty();
    self.response.reset();
    self.response_body_written = false;
  }

  #[inline]
  pub fn message_id(&self) -> i32 {
    self.message_id
  }

  /// Parse outcome of the request headers.
  #[inline]
  pub fn parse_status(&self) -> ParseStatus {
    self.status
  }

  /// The session cancellation token, observable from handler code.
  #[inline]
  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Request headers in wire order.
  pub fn headers(&self) -> impl Iterator<Item = (HeaderCommand, &str)> {
    self
      .entries
      .iter()
      .map(|entry| (entry.command, self.headers.get(entry)))
  }

  /// First request header with the given command, if any.
  pub fn header(&self, command: HeaderCommand) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|entry| entry.command == command)
      .map(|entry| self.headers.get(entry))
  }

  /// The request payload tail.
  #[inline]
  pub fn payload(&self) -> &[u8] {
    &self.request[self.payload_start..]
  }

  /// Appends one response header line.
  pub fn write_header(
    &mut self,
    command: HeaderCommand,
    value: &str,
  ) -> Result<(), FbmError> {
    if self.response_body_written {
      return Err(FbmError::InvalidRequest("headers cannot follow the body"));
    }
    frame::write_header(&mut self.response, command, value)
  }

  /// Appends the response content type, end-of-headers and body. One-shot.
  pub fn write_body(
    &mut self,
    content_type: u8,
    body: &[u8],
  ) -> Result<(), FbmError> {
    if self.response_body_written {
      return Err(FbmError::InvalidRequest("body already written"));
    }
    frame::write_body(&mut self.response, content_type, body)?;
    self.response_body_written = true;
    Ok(())
  }

  fn finish_response(&mut self) -> Result<(), FbmError> {
    if !self.response_body_written {
      self.response.write(&TERMINATOR)?;
      self.response_body_written = true;
    }
    Ok(())
  }

  fn response_bytes(&self) -> &[u8] {
    self.response.accumulated()
  }
}

enum SessionEnd {
  Closed,
  Cancelled,
  Oversize,
  Protocol,
  Errored(FbmError),
}

/// The FBM server endpoint for one connection.
pub struct FbmListener {
  params: ListenerParams,
}

impl FbmListener {
  pub fn new(params: ListenerParams) -> FbmListener {
    FbmListener { params }
  }

  /// Serves the session until close, cancellation or transport failure.
  ///
  /// Handlers run on background tasks; the receive loop keeps draining the
  /// transport meanwhile. Responses are serialized one logical message at a
  /// time under the shared send mutex, which is fair, so frames of
  /// different responses never interleave.
  pub async fn listen(
    &self,
    mut reader: Box<dyn TransportReader>,
    writer: Box<dyn TransportWriter>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
  ) -> Result<(), FbmError> {
    let writer = Arc::new(Mutex::new(writer));
    let header_capacity = self.params.header_buffer_size;
    let response_capacity = self.params.response_buffer_size;
    let pool = Arc::new(
      ObjectPool::new(self.params.context_quota, move || {
        FbmContext::new(header_capacity, response_capacity)
      })
      .on_rent(FbmContext::reset),
    );
    let session = cancel.child_token();
    let mut dispatches = JoinSet::new();
    let mut scratch = vec![0u8; self.params.recv_buffer_size];

    let end = loop {
      let received = tokio::select! {
        _ = cancel.cancelled() => break SessionEnd::Cancelled,
        received = recv::read_message(
          &mut *reader,
          &mut scratch,
          self.params.max_message_size,
        ) => received,
      };
      match received {
        Ok(Received::Message(buf)) => {
          self.dispatch(buf, &handler, &writer, &pool, &session, &mut dispatches)
            .await;
          while dispatches.try_join_next().is_some() {}
        }
        Ok(Received::Oversize) => {
          warn!(
            "closing session: message over the {} byte limit",
            self.params.max_message_size
          );
          break SessionEnd::Oversize;
        }
        Ok(Received::Short) => {
          warn!("closing session: truncated message");
          break SessionEnd::Protocol;
        }
        Ok(Received::Closed) => break SessionEnd::Closed,
        Err(error) => break SessionEnd::Errored(error),
      }
    };

    // Terminal states: stop handler work, flush dispatch tasks, clear the
    // context cache, close the transport.
    if matches!(end, SessionEnd::Cancelled | SessionEnd::Errored(_)) {
      session.cancel();
    }
    while dispatches.join_next().await.is_some() {}
    pool.clear();

    let close = match &end {
      SessionEnd::Closed | SessionEnd::Cancelled => Some(CLOSE_NORMAL),
      SessionEnd::Oversize => Some(CLOSE_TOO_BIG),
      SessionEnd::Protocol => Some(CLOSE_POLICY),
      SessionEnd::Errored(_) => None,
    };
    if let Some(code) = close {
      let mut guard = writer.lock().await;
      if let Err(error) = guard.close(code, "").await {
        debug!("close handshake failed: {error}");
      }
    }

    match end {
      SessionEnd::Cancelled => Err(FbmError::Cancelled),
      SessionEnd::Errored(error) => Err(error),
      _ => Ok(()),
    }
  }

  /// Validates one inbound message and hands it to a background dispatch.
  async fn dispatch(
    &self,
    buf: BytesMut,
    handler: &Arc<dyn RequestHandler>,
    writer: &Arc<Mutex<Box<dyn TransportWriter>>>,
    pool: &Arc<ObjectPool<FbmContext>>,
    session: &CancellationToken,
    dispatches: &mut JoinSet<()>,
  ) {
    let mut pos = 0;
    let line = frame::read_line(&buf, &mut pos);
    let id = match frame::message_id(line) {
      Ok(id) => id,
      Err(error) => {
        warn!("dropping malformed request: {error}");
        return;
      }
    };

    if id == CONTROL_FRAME_ID {
      // Control handlers see the payload only; headers are skipped.
      while !frame::read_line(&buf, &mut pos).is_empty() {}
      if let Err(error) = handler.handle_control(&buf[pos..]).await {
        warn!("control frame handler failed: {error}");
      }
      return;
    }
    if id <= 0 {
      debug!("dropping request with reserved id {id}");
      return;
    }

    let mut ctx = pool.rent();
    ctx.prepare(id, &buf, session.clone());
    let handler = handler.clone();
    let writer = writer.clone();
    let pool = pool.clone();
    let session = session.clone();
    dispatches.spawn(async move {
      let handled = tokio::select! {
        _ = session.cancelled() => Err(FbmError::Cancelled),
        handled = handler.handle(&mut ctx) => handled,
      };
      match handled {
        Ok(()) => {
          if let Err(error) = ctx.finish_response() {
            warn!("response for id {} overflowed: {error}", ctx.message_id());
          } else {
            let mut guard = writer.lock().await;
            if let Err(error) = guard.send(ctx.response_bytes(), true).await {
              warn!("failed to send response for id {}: {error}", ctx.message_id());
            }
          }
        }
        Err(FbmError::Cancelled) => {}
        Err(error) => {
          warn!("handler failed for id {}: {error}", ctx.message_id());
        }
      }
      pool.reclaim(ctx);
    });
  }
}
