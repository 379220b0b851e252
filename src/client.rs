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

//! The FBM client engine.
//!
//! Multiplexes many in-flight requests over one connection: every request
//! carries a unique positive message id, a background receive loop
//! correlates responses by id, and a single send mutex keeps the frames of
//! one logical message contiguous on the wire.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::accumulator::Accumulator;
use crate::error::FbmError;
use crate::frame::{self, HeaderCommand, CONTROL_FRAME_ID, MIN_MESSAGE_ID_LINE, TERMINATOR};
use crate::pool::ObjectPool;
use crate::recv::{self, Received};
use crate::request::{FailReason, Request, ResponseSlot};
use crate::response::Response;
use crate::transport::{
  Connect, NegotiationParams, TransportReader, TransportWriter, CLOSE_NORMAL,
};

/// How a connection ended, observed through
/// [`FbmClient::closed_events`].
#[derive(Clone, Debug)]
pub enum ClosedEvent {
  /// Clean close, locally or by the remote end.
  Normal,
  /// The transport failed underneath the connection.
  Error(String),
}

/// Client configuration. The negotiation fields are offered to the server
/// as the `b`/`hb`/`mx` upgrade query.
#[derive(Clone, Copy, Debug)]
pub struct FbmClientConfig {
  /// Capacity of each pooled request accumulator.
  pub request_buffer_size: usize,
  /// Chunk buffer size for [`FbmClient::send_stream`].
  pub message_buffer_size: usize,
  /// Transport receive-buffer size.
  pub recv_buffer_size: usize,
  /// Capacity of the header buffer a response is decoded into.
  pub max_header_buffer_size: usize,
  /// Largest logical message accepted or produced.
  pub max_message_size: usize,
  /// Cached-request quota of the internal pool.
  pub request_pool_quota: usize,
}

impl Default for FbmClientConfig {
  fn default() -> Self {
    Self {
      request_buffer_size: 4096,
      message_buffer_size: 64 << 10,
      recv_buffer_size: 4096,
      max_header_buffer_size: 1024,
      max_message_size: 4 << 20,
      request_pool_quota: 64,
    }
  }
}

type ControlHandler = Box<dyn Fn(Response) + Send + Sync>;

struct Shared {
  /// In-flight requests by message id; removal is atomic with completion.
  active: DashMap<i32, Arc<ResponseSlot>>,
  /// Serializes every logical send; `None` while disconnected.
  writer: Mutex<Option<Box<dyn TransportWriter>>>,
  /// Level signal: `true` = disconnected.
  disconnected: watch::Sender<bool>,
  closed: broadcast::Sender<ClosedEvent>,
  control: std::sync::Mutex<Option<ControlHandler>>,
  max_header_buffer: usize,
}

/// The FBM client endpoint.
pub struct FbmClient {
  config: FbmClientConfig,
  shared: Arc<Shared>,
  pool: ObjectPool<Request>,
  recv_task: Option<JoinHandle<()>>,
}

impl FbmClient {
  pub fn new(config: FbmClientConfig) -> FbmClient {
    let (disconnected, _) = watch::channel(true);
    let (closed, _) = broadcast::channel(16);
    let shared = Arc::new(Shared {
      active: DashMap::new(),
      writer: Mutex::new(None),
      disconnected,
      closed,
      control: std::sync::Mutex::new(None),
      max_header_buffer: config.max_header_buffer_size,
    });
    let counter = Arc::new(AtomicI32::new(1));
    let request_buffer = config.request_buffer_size;
    let header_buffer = config.max_header_buffer_size;
    let pool = ObjectPool::new(config.request_pool_quota, move || {
      Request::new(next_message_id(&counter), request_buffer, header_buffer)
    })
    .on_rent(Request::reset);

    FbmClient { config, shared, pool, recv_task: None }
  }

  /// Registers the handler invoked for received control frames.
  pub fn set_control_handler(
    &self,
    handler: impl Fn(Response) + Send + Sync + 'static,
  ) {
    *lock_control(&self.shared) = Some(Box::new(handler));
  }

  /// Appends the negotiation query to `url`, connects the transport and
  /// spawns the receive loop.
  pub async fn connect(
    &mut self,
    connector: &dyn Connect,
    url: &Url,
    cancel: &CancellationToken,
  ) -> Result<(), FbmError> {
    if self.is_connected() {
      return Err(FbmError::InvalidRequest("already connected"));
    }
    if let Some(task) = self.recv_task.take() {
      // Previous session already tore down; reap the loop.
      task.abort();
    }

    let mut url = url.clone();
    self.negotiation().apply(&mut url);
    let (reader, writer) = tokio::select! {
      connected = connector.connect(&url) => connected?,
      _ = cancel.cancelled() => return Err(FbmError::Cancelled),
    };

    *self.shared.writer.lock().await = Some(writer);
    self.shared.disconnected.send_replace(false);
    self.recv_task = Some(tokio::spawn(recv_loop(
      reader,
      self.shared.clone(),
      self.config.recv_buffer_size,
      self.config.max_message_size,
    )));
    Ok(())
  }

  /// The `b`/`hb`/`mx` values this client offers at upgrade.
  pub fn negotiation(&self) -> NegotiationParams {
    NegotiationParams {
      recv_buffer: self.config.recv_buffer_size,
      max_header_buffer: self.config.max_header_buffer_size,
      max_message: self.config.max_message_size,
    }
  }

  #[inline]
  pub fn is_connected(&self) -> bool {
    !*self.shared.disconnected.borrow()
  }

  /// A receiver observing each connection close exactly once.
  pub fn closed_events(&self) -> broadcast::Receiver<ClosedEvent> {
    self.shared.closed.subscribe()
  }

  /// Rents a reset request with a unique positive message id.
  pub fn rent_request(&self) -> Request {
    self.pool.rent()
  }

  /// Hands a request back to the pool.
  pub fn return_request(&self, request: Request) {
    self.pool.reclaim(request);
  }

  /// Sends a built request as one logical message and awaits its response.
  ///
  /// The request must not be touched until this returns. A request over the
  /// configured maximum message size fails with
  /// [`MessageTooLarge`](FbmError::MessageTooLarge) before anything is
  /// enqueued or transmitted. On any failure between enqueueing and
  /// completion the active-table entry is removed and the response slot is
  /// failed, so no awaiter can hang.
  pub async fn send(
    &self,
    request: &mut Request,
    cancel: &CancellationToken,
  ) -> Result<Response, FbmError> {
    request.finish()?;
    self.check_outgoing(request.len())?;
    let (id, slot) = self.enqueue(request)?;
    let result = async {
      self.transmit(request.bytes(), true, cancel).await?;
      request.wait_for_response(cancel).await
    }
    .await;
    if let Err(error) = &result {
      self.abandon(id, &slot, error);
    }
    result
  }

  /// Sends the request headers followed by a payload streamed from
  /// `payload`, all as one logical message, and awaits the response.
  ///
  /// The chunk buffer is `size_hint` clamped between the configured
  /// message-buffer size and the maximum message size. The logical message
  /// is always explicitly terminated, with an empty final chunk when the
  /// last read filled the buffer exactly. A stream whose total would cross
  /// the maximum message size is terminated early and fails with
  /// [`MessageTooLarge`](FbmError::MessageTooLarge).
  pub async fn send_stream<R>(
    &self,
    request: &mut Request,
    payload: &mut R,
    content_type: u8,
    size_hint: Option<usize>,
    cancel: &CancellationToken,
  ) -> Result<Response, FbmError>
  where
    R: AsyncRead + Unpin + Send + ?Sized,
  {
    request.write_body(content_type, &[])?;
    self.check_outgoing(request.len())?;
    let (id, slot) = self.enqueue(request)?;
    let floor = self
      .config
      .message_buffer_size
      .min(self.config.max_message_size);
    let chunk_size = size_hint
      .unwrap_or(floor)
      .clamp(floor, self.config.max_message_size);

    let result = async {
      {
        let mut guard = self.lock_writer(cancel).await?;
        let writer = guard.as_mut().ok_or(FbmError::ConnectionClosed)?;
        writer.send(request.bytes(), false).await?;

        let mut buf = vec![0u8; chunk_size];
        let mut total = request.len();
        let mut terminated = false;
        loop {
          if cancel.is_cancelled() {
            return Err(FbmError::Cancelled);
          }
          let n = payload.read(&mut buf).await?;
          if n == 0 {
            break;
          }
          if total + n > self.config.max_message_size {
            // Terminate the logical message so later sends cannot
            // interleave with the aborted one.
            writer.send(&[], true).await?;
            return Err(FbmError::MessageTooLarge {
              size: total + n,
              max: self.config.max_message_size,
            });
          }
          total += n;
          if n < buf.len() {
            writer.send(&buf[..n], true).await?;
            terminated = true;
            break;
          }
          writer.send(&buf, false).await?;
        }
        if !terminated {
          writer.send(&[], true).await?;
        }
      }
      request.wait_for_response(cancel).await
    }
    .await;
    if let Err(error) = &result {
      self.abandon(id, &slot, error);
    }
    result
  }

  /// Sends an out-of-band control frame. Control frames are never entered
  /// into the active-request table and receive no response.
  pub async fn send_control(
    &self,
    headers: &[(HeaderCommand, &str)],
    payload: &[u8],
    cancel: &CancellationToken,
  ) -> Result<(), FbmError> {
    let mut acc = Accumulator::new(self.config.request_buffer_size);
    frame::write_message_id(&mut acc, CONTROL_FRAME_ID)?;
    for (command, value) in headers {
      frame::write_header(&mut acc, *command, value)?;
    }
    acc.write(&TERMINATOR)?;
    acc.write(payload)?;
    self.transmit(acc.accumulated(), true, cancel).await
  }

  /// Initiates a clean close. The receive loop observes the remote close
  /// echo and runs teardown; this waits for it to finish.
  pub async fn disconnect(
    &mut self,
    cancel: &CancellationToken,
  ) -> Result<(), FbmError> {
    {
      let mut guard = self.lock_writer(cancel).await?;
      if let Some(writer) = guard.as_mut() {
        writer.close(CLOSE_NORMAL, "").await?;
      }
    }
    if let Some(task) = self.recv_task.take() {
      tokio::select! {
        _ = task => {}
        _ = cancel.cancelled() => return Err(FbmError::Cancelled),
      }
    }
    Ok(())
  }

  /// Outgoing messages obey the same size ceiling as inbound ones.
  fn check_outgoing(&self, size: usize) -> Result<(), FbmError> {
    if size > self.config.max_message_size {
      return Err(FbmError::MessageTooLarge {
        size,
        max: self.config.max_message_size,
      });
    }
    Ok(())
  }

  /// Resets the slot and claims the message id in the active table.
  fn enqueue(
    &self,
    request: &Request,
  ) -> Result<(i32, Arc<ResponseSlot>), FbmError> {
    if request.len() < MIN_MESSAGE_ID_LINE {
      return Err(FbmError::InvalidRequest(
        "request is missing the message id line",
      ));
    }
    let id = request.message_id();
    let slot = request.slot();
    slot.reset();
    match self.shared.active.entry(id) {
      dashmap::mapref::entry::Entry::Occupied(_) => {
        Err(FbmError::DuplicateMessageId(id))
      }
      dashmap::mapref::entry::Entry::Vacant(vacant) => {
        vacant.insert(slot.clone());
        Ok((id, slot))
      }
    }
  }

  /// Failure path between enqueue and completion: drop the table entry and
  /// complete the slot so later waits return immediately.
  fn abandon(&self, id: i32, slot: &ResponseSlot, error: &FbmError) {
    self.shared.active.remove(&id);
    match error {
      FbmError::Cancelled => slot.fail(FailReason::Cancelled),
      other => slot.fail(FailReason::Error(other.to_string().into())),
    }
  }

  async fn transmit(
    &self,
    bytes: &[u8],
    end_of_message: bool,
    cancel: &CancellationToken,
  ) -> Result<(), FbmError> {
    let mut guard = self.lock_writer(cancel).await?;
    let writer = guard.as_mut().ok_or(FbmError::ConnectionClosed)?;
    writer.send(bytes, end_of_message).await
  }

  async fn lock_writer(
    &self,
    cancel: &CancellationToken,
  ) -> Result<tokio::sync::MutexGuard<'_, Option<Box<dyn TransportWriter>>>, FbmError>
  {
    tokio::select! {
      guard = self.shared.writer.lock() => Ok(guard),
      _ = cancel.cancelled() => Err(FbmError::Cancelled),
    }
  }
}

impl Drop for FbmClient {
  fn drop(&mut self) {
    if let Some(task) = &self.recv_task {
      task.abort();
    }
  }
}

/// Draws the next positive message id, restarting the sequence on wrap.
fn next_message_id(counter: &AtomicI32) -> i32 {
  loop {
    let id = counter.fetch_add(1, Ordering::Relaxed);
    if id > 0 {
      return id;
    }
    counter.store(1, Ordering::Relaxed);
  }
}

fn lock_control(
  shared: &Shared,
) -> std::sync::MutexGuard<'_, Option<ControlHandler>> {
  shared
    .control
    .lock()
    .unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn recv_loop(
  mut reader: Box<dyn TransportReader>,
  shared: Arc<Shared>,
  recv_buffer: usize,
  max_message: usize,
) {
  let mut scratch = vec![0u8; recv_buffer];
  let reason = loop {
    match recv::read_message(&mut *reader, &mut scratch, max_message).await {
      Ok(Received::Message(buf)) => dispatch_message(&shared, buf),
      Ok(Received::Oversize) => {
        warn!("dropping message over the {max_message} byte limit");
      }
      Ok(Received::Short) => debug!("dropping truncated message"),
      Ok(Received::Closed) => break FailReason::Closed,
      Err(error) => {
        warn!("receive loop ended: {error}");
        break FailReason::Error(error.to_string().into());
      }
    }
  };
  teardown(&shared, reason).await;
}

/// Routes one complete inbound message: control frames to the handler,
/// correlated responses to their slot, everything else to the floor.
fn dispatch_message(shared: &Shared, buf: BytesMut) {
  let mut pos = 0;
  let line = frame::read_line(&buf, &mut pos);
  let id = match frame::message_id(line) {
    Ok(id) => id,
    Err(error) => {
      debug!("dropping malformed message: {error}");
      return;
    }
  };

  if id == CONTROL_FRAME_ID {
    let handler = lock_control(shared);
    if let Some(handler) = handler.as_ref() {
      match Response::parse(buf.freeze(), shared.max_header_buffer) {
        Ok(response) => handler(response),
        Err(error) => debug!("dropping malformed control frame: {error}"),
      }
    }
    return;
  }
  if id < 0 {
    debug!("dropping message with reserved id {id}");
    return;
  }
  match shared.active.remove(&id) {
    Some((_, slot)) => {
      slot.set(buf);
    }
    None => debug!("dropping unsolicited response for id {id}"),
  }
}

/// Runs the teardown invariants: no awaiter hangs, the table is empty, the
/// writer is gone, the status level is set and one close event is emitted.
async fn teardown(shared: &Shared, reason: FailReason) {
  shared.writer.lock().await.take();
  let ids: Vec<i32> = shared.active.iter().map(|entry| *entry.key()).collect();
  for id in ids {
    if let Some((_, slot)) = shared.active.remove(&id) {
      slot.fail(reason.clone());
    }
  }
  shared.disconnected.send_replace(true);
  let event = match reason {
    FailReason::Error(message) => ClosedEvent::Error(message.to_string()),
    _ => ClosedEvent::Normal,
  };
  let _ = shared.closed.send(event);
}
