//! Error taxonomy for client operations.

use crate::transport::TransportError;
use alink_core::{DeviceKey, RegistryError};
use alink_proto::messages::MessageError;
use alink_proto::topics::TopicError;
use alink_proto::RequestId;
use std::fmt;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, Error>;

/// Sub-device lifecycle step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Dynamic registration
    Register,
    /// Topology add
    TopologyAdd,
    /// Combine-login
    Login,
    /// Topic subscription
    Subscribe,
    /// Topic unsubscription
    Unsubscribe,
    /// Combine-logout
    Logout,
    /// Topology delete
    TopologyDelete,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Register => "register",
            Self::TopologyAdd => "topology-add",
            Self::Login => "combine-login",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Logout => "combine-logout",
            Self::TopologyDelete => "topology-delete",
        })
    }
}

/// Errors returned by the session and gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Bad caller input; never retried
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Unknown device
    #[error("device {0} not found")]
    NotFound(DeviceKey),
    /// Device is not online yet
    #[error("device {0} is not online")]
    NotActive(DeviceKey),
    /// Device was disabled by the platform
    #[error("device {0} is disabled")]
    NotAvailable(DeviceKey),
    /// Capability not enabled on this client
    #[error("feature '{0}' is not enabled")]
    NotSupportedFeature(&'static str),
    /// Inbound topic does not match the scheme
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
    /// No reply before the deadline
    #[error("request {0} timed out")]
    Timeout(RequestId),
    /// The platform rejected the request
    #[error("remote error {code}: {message}")]
    Remote {
        /// Platform result code
        code: i64,
        /// Platform description
        message: String,
    },
    /// Publish or subscribe failed
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Envelope could not be encoded or decoded
    #[error("decode error: {0}")]
    Decode(String),
    /// A waiter for this id is already registered
    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),
    /// Another combine-login for the device is running
    #[error("combine-login already in progress for {0}")]
    LoginInProgress(DeviceKey),
    /// No handler pattern matches the topic
    #[error("no route for topic '{0}'")]
    Unroutable(String),
    /// A sub-device lifecycle step failed
    #[error("{step} failed: {source}")]
    Step {
        /// Step that failed
        step: Step,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the lifecycle step it came from.
    #[must_use]
    pub fn at(step: Step) -> impl FnOnce(Self) -> Self {
        move |source| Self::Step {
            step,
            source: Box::new(source),
        }
    }

    /// The failing step, if this is a step error.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The innermost error, unwrapping step context.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// No answer arrived in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout(_))
    }

    /// Platform result code of a negative answer.
    #[must_use]
    pub fn remote_code(&self) -> Option<i64> {
        match self.root_cause() {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(key) => Self::NotFound(key),
            other => Self::InvalidParameter(other.to_string()),
        }
    }
}

impl From<TopicError> for Error {
    fn from(err: TopicError) -> Self {
        match err {
            TopicError::InvalidTopic(topic) => Self::InvalidTopic(topic),
        }
    }
}

impl From<MessageError> for Error {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Serialize(msg) => Self::InvalidParameter(msg),
            MessageError::Deserialize(msg) => Self::Decode(msg),
        }
    }
}
