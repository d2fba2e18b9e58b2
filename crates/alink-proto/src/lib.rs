//! # Alink Protocol
//!
//! Topic scheme and wire envelopes for the Alink device protocol.
//!
//! ## Topics
//!
//! Topic scheme: `[/<root>]/<prefix>/<productKey>/<deviceName>/<operation>[/<extra>]`
//!
//! Correlated replies arrive on the request topic with a `_reply` suffix.
//! The optional root segment is prepended by bridged transports (CoAP, HTTP).
//!
//! ## Messages
//!
//! - `Request`: `{id, version, method, params}`
//! - `Reply`: `{id, code, data, message?}`
//! - `PushRequest`: platform-initiated request on a push topic

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    MessageError, NtpRequest, NtpResponse, PushRequest, Reply, Request, RequestId, SignedDevice,
    TopoChange, TopoChangeStatus,
};
pub use topics::{ops, Operation, Prefix, PushKind, SegmentPositions, TopicLayout, TopicParts};
