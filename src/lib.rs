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

//! _fbm_ is a Fixed Buffer Messaging engine: a full-duplex, binary
//! request/response layer over an established WebSocket transport.
//!
//! Many in-flight requests are multiplexed over one connection by tagging
//! each with a 32-bit message id and correlating responses as they arrive,
//! in any order. Message buffers are fixed-size and pooled, so steady-state
//! traffic runs without per-message allocation.
//!
//! The transport itself is abstract: adapt your WebSocket crate of choice
//! (or an in-memory duplex in tests) to the [`transport`] traits. One FBM
//! message is one logical WebSocket binary message, possibly spanning many
//! frames.
//!
//! # Building a request
//!
//! ```
//! use fbm::{HeaderCommand, Request};
//!
//! let mut request = Request::new(1, 512, 256);
//! request
//!   .write_header(HeaderCommand::custom(0x10).unwrap(), "Hello")
//!   .unwrap();
//! request.write_body(0x01, &[1, 2, 3]).unwrap();
//! assert_eq!(request.message_id(), 1);
//! ```
//!
//! # Client
//!
//! ```no_run
//! use fbm::{Connect, FbmClient, FbmClientConfig, HeaderCommand};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! async fn round_trip(connector: &dyn Connect) -> Result<(), fbm::FbmError> {
//!   let mut client = FbmClient::new(FbmClientConfig::default());
//!   let url = Url::parse("ws://localhost:9001/fbm").unwrap();
//!   let cancel = CancellationToken::new();
//!   client.connect(connector, &url, &cancel).await?;
//!
//!   let mut request = client.rent_request();
//!   request.write_header(HeaderCommand::custom(0x10).unwrap(), "Hello")?;
//!   request.write_body(0x01, &[1, 2, 3])?;
//!   let response = client.send(&mut request, &cancel).await?;
//!   println!("{} payload bytes", response.payload().len());
//!   client.return_request(request);
//!   client.disconnect(&cancel).await
//! }
//! ```
//!
//! # Listener
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use fbm::transport::{TransportReader, TransportWriter};
//! use fbm::{FbmContext, FbmError, FbmListener, ListenerParams, RequestHandler};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl RequestHandler for Echo {
//!   async fn handle(&self, ctx: &mut FbmContext) -> Result<(), FbmError> {
//!     let payload = ctx.payload().to_vec();
//!     ctx.write_body(0x01, &payload)
//!   }
//! }
//!
//! async fn session(
//!   reader: Box<dyn TransportReader>,
//!   writer: Box<dyn TransportWriter>,
//! ) -> Result<(), FbmError> {
//!   let listener = FbmListener::new(ListenerParams::default());
//!   listener
//!     .listen(reader, writer, Arc::new(Echo), CancellationToken::new())
//!     .await
//! }
//! ```

mod accumulator;
mod client;
mod error;
/// The FBM wire codec.
pub mod frame;
mod headers;
mod listener;
mod pool;
mod recv;
mod request;
mod response;
/// Transport contracts and upgrade negotiation.
pub mod transport;

pub use crate::accumulator::Accumulator;
pub use crate::client::ClosedEvent;
pub use crate::client::FbmClient;
pub use crate::client::FbmClientConfig;
pub use crate::error::FbmError;
pub use crate::frame::HeaderCommand;
pub use crate::frame::CONTROL_FRAME_ID;
pub use crate::headers::parse_headers;
pub use crate::headers::HeaderBuffer;
pub use crate::headers::HeaderEntry;
pub use crate::headers::ParseStatus;
pub use crate::listener::FbmContext;
pub use crate::listener::FbmListener;
pub use crate::listener::ListenerParams;
pub use crate::listener::RequestHandler;
pub use crate::pool::ObjectPool;
pub use crate::pool::ThreadCachedPool;
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::transport::Connect;
pub use crate::transport::NegotiationParams;
