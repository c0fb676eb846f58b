//! # stdiowire
//!
//! Bidirectional, message-framed JSON-RPC 2.0 transport over a process's
//! standard input and output.
//!
//! The transport frames outgoing payloads as `Content-Length:` headers,
//! reassembles inbound frames from partial reads, correlates concurrent
//! outstanding requests by id, applies per-request deadlines, and bounds
//! outbound buffering with a byte-budgeted write queue.
//!
//! ## Architecture
//!
//! - **Reader thread**: waits on stdin plus an OS wakeup primitive
//!   (Linux eventfd / POSIX self-pipe / Windows event), extracts frames,
//!   and dispatches requests, responses, and notifications.
//! - **Writer thread**: drains the bounded queue and writes frames in
//!   full with non-blocking I/O and an optional per-frame deadline.
//! - **Timer thread**: sleeps until the earliest request deadline and
//!   fails expired requests with a JSON-RPC internal error.
//!
//! The transport is one-shot: [`StdioTransport::close`] is terminal and
//! bounded (~1.5 s worst case), and every outstanding request slot always
//! resolves.
//!
//! ## Example
//!
//! ```no_run
//! use stdiowire::{Request, Response, StdioTransport};
//!
//! let transport = StdioTransport::new();
//! transport.set_request_handler(|request| {
//!     Ok(Response::success(request.id.clone(), "pong".into()))
//! });
//! transport.set_error_handler(|message| eprintln!("transport error: {message}"));
//! transport.start().unwrap();
//!
//! let response = transport.send_request(Request::new("ping", None)).recv();
//! assert!(!response.is_error());
//! transport.close();
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use protocol::{ErrorObject, Message, Notification, Request, RequestId, Response};
pub use transport::{HandlerError, ResponseSlot, StdioTransport};
