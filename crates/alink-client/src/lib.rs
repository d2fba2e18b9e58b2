//! # Alink Client
//!
//! Turns the asynchronous, multiplexed Alink pub/sub channel into a client API.
//!
//! ## Components
//!
//! - [`RequestIds`]: wait-free request-ID allocator
//! - [`CorrelationTable`]: pending-request table with bounded waits and TTL eviction
//! - [`Session`]: correlated `call`, fire-and-forget publish, inbound `dispatch`
//! - [`Gateway`]: sub-device register → topology-add → login → subscribe
//! - [`Transport`]: the publish/subscribe collaborator, with an MQTT binding in [`mqtt`]
//!
//! ## Data flow
//!
//! `call` allocates an id, registers a waiter, publishes, and waits. The
//! transport feeds every inbound message to [`Session::dispatch`], which
//! resolves the waiter for replies or runs the registered push handler.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod ids;
pub mod mqtt;
pub mod session;
pub mod transport;

pub use correlation::{CorrelationTable, Waiter};
pub use dispatch::Routed;
pub use error::{ClientResult, Error, Step};
pub use gateway::{parse_sub_devices, Gateway};
pub use handlers::{HandlerTable, PushEvent, PushHandler};
pub use ids::RequestIds;
pub use mqtt::{drive, MqttTransport};
pub use session::{Features, Session, SessionConfig};
pub use transport::{Qos, Transport, TransportError};
