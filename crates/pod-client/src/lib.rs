//! pod-client: client side of the pod control protocol
//!
//! One persistent duplex connection carries many independent method calls
//! and an unbounded stream of unsolicited events. This crate owns the hard
//! part of that arrangement: correlating each response back to its caller,
//! fanning events out to subscribers, and failing everything cleanly when
//! the connection goes away.
//!
//! The connection itself is injected: anything `AsyncRead + AsyncWrite`
//! works, which keeps the client independent of the transport and testable
//! against an in-process peer.

pub mod attach;
pub mod client;
pub mod error;
pub mod lifecycle;

mod correlation;

pub use attach::AttachSession;
pub use client::{ClientConfig, PodClient};
pub use error::ClientError;
pub use lifecycle::{CloseReason, ConnState};
