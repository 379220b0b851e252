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

//! An in-memory duplex transport for exercising both engines end to end.
//!
//! Chunks larger than the receiving side's buffer are split, so small
//! receive buffers see real fragmentation.

use std::sync::Mutex;

use async_trait::async_trait;
use fbm::transport::{
  Connect, MessageKind, RecvEvent, TransportReader, TransportWriter,
};
use fbm::FbmError;
use tokio::sync::mpsc;
use url::Url;

struct Chunk {
  data: Vec<u8>,
  end_of_message: bool,
  kind: MessageKind,
}

pub struct DuplexReader {
  rx: mpsc::Receiver<Chunk>,
  pending: Option<Chunk>,
}

pub struct DuplexWriter {
  tx: mpsc::Sender<Chunk>,
  closed: bool,
}

/// Two connected endpoints, each a reader/writer pair.
pub fn duplex_pair() -> (
  (DuplexReader, DuplexWriter),
  (DuplexReader, DuplexWriter),
) {
  let (a_tx, a_rx) = mpsc::channel(64);
  let (b_tx, b_rx) = mpsc::channel(64);
  (
    (
      DuplexReader { rx: a_rx, pending: None },
      DuplexWriter { tx: b_tx, closed: false },
    ),
    (
      DuplexReader { rx: b_rx, pending: None },
      DuplexWriter { tx: a_tx, closed: false },
    ),
  )
}

#[async_trait]
impl TransportReader for DuplexReader {
  async fn recv(&mut self, buf: &mut [u8]) -> Result<RecvEvent, FbmError> {
    let chunk = match self.pending.take() {
      Some(chunk) => chunk,
      None => self
        .rx
        .recv()
        .await
        .ok_or_else(|| FbmError::ClosedOnError("transport gone".into()))?,
    };

    if chunk.data.len() > buf.len() {
      let (now, rest) = chunk.data.split_at(buf.len());
      buf.copy_from_slice(now);
      let len = now.len();
      self.pending = Some(Chunk {
        data: rest.to_vec(),
        end_of_message: chunk.end_of_message,
        kind: chunk.kind,
      });
      return Ok(RecvEvent { len, end_of_message: false, kind: chunk.kind });
    }

    buf[..chunk.data.len()].copy_from_slice(&chunk.data);
    Ok(RecvEvent {
      len: chunk.data.len(),
      end_of_message: chunk.end_of_message,
      kind: chunk.kind,
    })
  }
}

#[async_trait]
impl TransportWriter for DuplexWriter {
  async fn send(
    &mut self,
    data: &[u8],
    end_of_message: bool,
  ) -> Result<(), FbmError> {
    if self.closed {
      return Err(FbmError::ConnectionClosed);
    }
    self
      .tx
      .send(Chunk { data: data.to_vec(), end_of_message, kind: MessageKind::Binary })
      .await
      .map_err(|_| FbmError::ConnectionClosed)
  }

  async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), FbmError> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    // The peer may already be gone; a close past that is still clean.
    let _ = self
      .tx
      .send(Chunk { data: Vec::new(), end_of_message: true, kind: MessageKind::Close })
      .await;
    Ok(())
  }
}

/// Hands out one pre-established endpoint and records the connect URL.
pub struct TestConnector {
  endpoint: Mutex<Option<(DuplexReader, DuplexWriter)>>,
  last_url: Mutex<Option<Url>>,
}

impl TestConnector {
  pub fn new(endpoint: (DuplexReader, DuplexWriter)) -> Self {
    Self {
      endpoint: Mutex::new(Some(endpoint)),
      last_url: Mutex::new(None),
    }
  }

  pub fn connect_url(&self) -> Option<Url> {
    self.last_url.lock().unwrap().clone()
  }
}

#[async_trait]
impl Connect for TestConnector {
  async fn connect(
    &self,
    url: &Url,
  ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), FbmError>
  {
    *self.last_url.lock().unwrap() = Some(url.clone());
    let (reader, writer) = self
      .endpoint
      .lock()
      .unwrap()
      .take()
      .ok_or(FbmError::InvalidRequest("endpoint already taken"))?;
    Ok((Box::new(reader), Box::new(writer)))
  }
}
