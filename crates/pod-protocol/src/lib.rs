//! pod-protocol: Wire protocol for the pod control channel
//!
//! This crate defines the line-oriented JSON records exchanged between a
//! client and a pod server over a single persistent duplex connection, and
//! the codec that frames them.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{RecordCodec, MAX_RECORD_LEN};
pub use error::ProtocolError;
pub use message::{
    event, method, Event, Inbound, Pod, PodIdBody, PodListBody, PodOutput, Request, RequestId,
    Response,
};
