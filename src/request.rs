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

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::accumulator::Accumulator;
use crate::error::FbmError;
use crate::frame::{self, HeaderCommand, MESSAGE_ID_LINE_LEN};
use crate::response::Response;

/// A reusable request builder.
///
/// Owns a fixed-size accumulator holding the outgoing message bytes and the
/// response slot the receive loop completes. After [`reset`](Self::reset)
/// the accumulator contains exactly the message-id line; headers and a body
/// may be appended before the request is sent. While a request is in flight
/// the engine holds it via `&mut`, so no other caller can touch the bytes.
pub struct Request {
  message_id: i32,
  acc: Accumulator,
  header_capacity: usize,
  body_written: bool,
  slot: Arc<ResponseSlot>,
}

impl Request {
  /// Creates a request with a fixed nonzero positive message id.
  ///
  /// `buffer_size` bounds the total encoded request; it must at least hold
  /// the message-id line.
  pub fn new(
    message_id: i32,
    buffer_size: usize,
    header_capacity: usize,
  ) -> Request {
    assert!(message_id > 0, "caller message ids are positive and nonzero");
    assert!(
      buffer_size >= MESSAGE_ID_LINE_LEN,
      "request buffer cannot hold the message id line"
    );
    let mut request = Request {
      message_id,
      acc: Accumulator::new(buffer_size),
      header_capacity,
      body_written: false,
      slot: Arc::new(ResponseSlot::new()),
    };
    request.reset();
    request
  }

  #[inline]
  pub fn message_id(&self) -> i32 {
    self.message_id
  }

  /// Encoded length so far, message-id line included.
  #[inline]
  pub fn len(&self) -> usize {
    self.acc.accumulated_len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    // Never true after construction; the id line is always present.
    self.acc.accumulated_len() == 0
  }

  /// Rewinds the request to just the message-id line and clears the
  /// response slot. Idempotent.
  pub fn reset(&mut self) {
    self.acc.reset();
    self.body_written = false;
    frame::write_message_id(&mut self.acc, self.message_id)
      .expect("buffer holds at least the message id line");
    self.slot.reset();
  }

  /// Appends one header line.
  pub fn write_header(
    &mut self,
    command: HeaderCommand,
    value: &str,
  ) -> Result<(), FbmError> {
    if self.body_written {
      return Err(FbmError::InvalidRequest("headers cannot follow the body"));
    }
    frame::write_header(&mut self.acc, command, value)
  }

  /// Appends the content type, the end-of-headers line and the body.
  /// One-shot; must be the last write before the request is sent.
  pub fn write_body(
    &mut self,
    content_type: u8,
    body: &[u8],
  ) -> Result<(), FbmError> {
    if self.body_written {
      return Err(FbmError::InvalidRequest("body already written"));
    }
    frame::write_body(&mut self.acc, content_type, body)?;
    self.body_written = true;
    Ok(())
  }

  /// Suspends until the receive loop stores a response or the token fires.
  pub async fn wait_for_response(
    &self,
    cancel: &CancellationToken,
  ) -> Result<Response, FbmError> {
    let buf = self.slot.wait(cancel).await?;
    Response::parse(buf.freeze(), self.header_capacity)
  }

  #[inline]
  pub(crate) fn bytes(&self) -> &[u8] {
    self.acc.accumulated()
  }

  /// Terminates the header section when no body was written, so every
  /// message leaving the engine carries an end-of-headers line.
  pub(crate) fn finish(&mut self) -> Result<(), FbmError> {
    if !self.body_written {
      self.acc.write(&frame::TERMINATOR)?;
      self.body_written = true;
    }
    Ok(())
  }

  pub(crate) fn slot(&self) -> Arc<ResponseSlot> {
    self.slot.clone()
  }
}

/// Why an in-flight request was failed rather than answered.
#[derive(Clone, Debug)]
pub(crate) enum FailReason {
  Closed,
  Error(Arc<str>),
  Cancelled,
}

impl From<FailReason> for FbmError {
  fn from(reason: FailReason) -> FbmError {
    match reason {
      FailReason::Closed => FbmError::ConnectionClosed,
      FailReason::Error(message) => FbmError::ClosedOnError(message.to_string()),
      FailReason::Cancelled => FbmError::Cancelled,
    }
  }
}

enum SlotState {
  Pending,
  Ready(BytesMut),
  Failed(FailReason),
}

/// The single-producer one-shot response signal of a request.
///
/// Completing it is idempotent: the first [`set`](Self::set) or
/// [`fail`](Self::fail) wins and later ones are dropped. [`reset`](Self::reset)
/// rearms the slot for the next flight of the pooled request.
pub(crate) struct ResponseSlot {
  state: Mutex<SlotState>,
  notify: Notify,
}

impl ResponseSlot {
  pub(crate) fn new() -> ResponseSlot {
    ResponseSlot {
      state: Mutex::new(SlotState::Pending),
      notify: Notify::new(),
    }
  }

  /// Stores the response buffer. Returns `false` when the slot was already
  /// completed and the buffer was dropped.
  pub(crate) fn set(&self, buf: BytesMut) -> bool {
    let mut state = self.lock();
    if matches!(*state, SlotState::Pending) {
      *state = SlotState::Ready(buf);
      drop(state);
      self.notify.notify_one();
      true
    } else {
      false
    }
  }

  /// Completes the slot with a failure so no awaiter hangs. Idempotent; a
  /// stored response is never overwritten.
  pub(crate) fn fail(&self, reason: FailReason) {
    let mut state = self.lock();
    if matches!(*state, SlotState::Pending) {
      *state = SlotState::Failed(reason);
      drop(state);
      self.notify.notify_one();
    }
  }

  pub(crate) fn reset(&self) {
    *self.lock() = SlotState::Pending;
  }

  pub(crate) async fn wait(
    &self,
    cancel: &CancellationToken,
  ) -> Result<BytesMut, FbmError> {
    loop {
      {
        let mut state = self.lock();
        match mem::replace(&mut *state, SlotState::Pending) {
          SlotState::Ready(buf) => return Ok(buf),
          SlotState::Failed(reason) => {
            // Keep the failure for any other waiter.
            *state = SlotState::Failed(reason.clone());
            return Err(reason.into());
          }
          SlotState::Pending => {}
        }
      }
      tokio::select! {
        _ = self.notify.notified() => {}
        _ = cancel.cancelled() => return Err(FbmError::Cancelled),
      }
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
