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

use std::io;

/// Errors produced by the FBM codec and the client/listener engines.
#[derive(Debug, thiserror::Error)]
pub enum FbmError {
  /// A request with the same message id is already in flight.
  #[error("message id {0} is already in flight")]
  DuplicateMessageId(i32),
  /// The operation violated a caller-side contract.
  #[error("invalid request: {0}")]
  InvalidRequest(&'static str),
  /// The accumulator cannot hold the bytes being written.
  #[error("buffer too small: {needed} bytes needed, {remaining} remaining")]
  BufferTooSmall { needed: usize, remaining: usize },
  /// Zero or a reserved message id was used where a caller id is required.
  #[error("invalid message id {0}")]
  InvalidMessageId(i32),
  /// An outgoing message would exceed the negotiated maximum.
  #[error("message of {size} bytes exceeds the {max} byte maximum")]
  MessageTooLarge { size: usize, max: usize },
  /// A malformed inbound message.
  #[error("protocol violation: {0}")]
  Protocol(&'static str),
  /// The negotiation query was missing, malformed or over the server limits.
  #[error("negotiation rejected: {0}")]
  Negotiation(&'static str),
  /// The connection was closed cleanly by the remote end.
  #[error("connection closed")]
  ConnectionClosed,
  /// The connection was torn down by a transport failure.
  #[error("connection closed on error: {0}")]
  ClosedOnError(String),
  /// The caller's cancellation token fired.
  #[error("operation cancelled")]
  Cancelled,
  #[error(transparent)]
  Io(#[from] io::Error),
}
