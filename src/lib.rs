//! # iproto
//!
//! Binary RPC runtime for the iproto wire protocol. Many concurrent
//! logical requests are multiplexed over a small number of duplex TCP
//! connections; each request traverses an atomic lifecycle driven through
//! an ordered middleware chain, with per-request deadlines, bounded
//! parallelism and hierarchical cancellation.
//!
//! ## Architecture
//!
//! ```text
//! caller ─► Context ─► Request ─► ParallelService ─► Connection ─► wire
//!                         ▲                                │
//!                         └── middleware chain ◄───────────┘
//!                               (response / cancel / timeout)
//! ```
//!
//! Outbound, a caller allocates a [`Request`] (usually through a
//! [`Context`], which ties it into the cancellation tree), and hands it to
//! a [`Service`]. A [`ParallelService`] bounds how many requests are in
//! flight downstream; a [`Connection`] assigns wire ids, writes frames and
//! resolves responses back to their requests. Inbound, a [`Server`] accepts
//! connections and fans each decoded frame to an endpoint service.
//!
//! Outcomes are never errors: every request receives exactly one terminal
//! [`Response`] whose [`RetCode`] distinguishes success, application
//! failures, restartable transport failures and fatal ones.
//!
//! ## Example
//!
//! ```ignore
//! use iproto::{Context, ParallelService};
//! use iproto::net::{ClientConf, Connection};
//! use std::sync::Arc;
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> iproto::Result<()> {
//!     let conn = Connection::dial(ClientConf::default(), 1).await?;
//!     let serv = ParallelService::new(64, conn.clone());
//!     let cx = Context::new();
//!     if let Some(res) = cx.call(&*serv, 17, Bytes::from_static(b"\x01")).await {
//!         println!("code {} body {:?}", res.code, res.body);
//!     }
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod middleware;
pub mod net;
pub mod parallel;
pub mod request;
pub mod response;
pub mod service;
pub mod wait_group;

pub use context::{Canceler, Context};
pub use error::{IprotoError, Result};
pub use middleware::{BasicMiddleware, Deadline, Middleware};
pub use net::{ClientConf, Connection, Server, ServerConf};
pub use parallel::ParallelService;
pub use request::{Request, PING, PING_REQUEST_ID};
pub use response::{rc, Callback, RequestType, Responder, Response, RetCode};
pub use service::{BoxFuture, FuncService, Point, Service};
pub use wait_group::WaitGroup;
