//! Topic scheme for the Alink protocol.
//!
//! Topic structure: `[/<root>]/<prefix>/<productKey>/<deviceName>/<operation>[/<extra>]`
//!
//! - `prefix` is one or two segments (`sys`, `ext/session`, `ext/ntp`, `ext/error`)
//! - `root` is an optional extra leading segment required by bridged transports
//! - replies use the request topic with a `_reply` suffix
//!
//! Segment positions depend on both the prefix depth and the transport's root
//! offset, so they are computed by [`TopicLayout::positions`] instead of being
//! indexed with fixed numbers.

use alink_core::DeviceKey;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Suffix appended to a request topic to form its reply topic.
pub const REPLY_SUFFIX: &str = "_reply";

/// Topic prefix families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
    /// `/sys/{pk}/{dn}/...` thing model and gateway operations
    Sys,
    /// `/ext/session/{pk}/{dn}/...` sub-device sessions
    ExtSession,
    /// `/ext/ntp/{pk}/{dn}/...` clock synchronisation
    ExtNtp,
    /// `/ext/error/{pk}/{dn}` session error notifications
    ExtError,
}

impl Prefix {
    /// Literal segments of the prefix.
    #[must_use]
    pub fn segments(self) -> &'static [&'static str] {
        match self {
            Self::Sys => &["sys"],
            Self::ExtSession => &["ext", "session"],
            Self::ExtNtp => &["ext", "ntp"],
            Self::ExtError => &["ext", "error"],
        }
    }

    fn depth(self) -> usize {
        self.segments().len()
    }

    fn detect(segments: &[&str]) -> Option<Self> {
        match segments {
            ["sys", ..] => Some(Self::Sys),
            ["ext", "session", ..] => Some(Self::ExtSession),
            ["ext", "ntp", ..] => Some(Self::ExtNtp),
            ["ext", "error", ..] => Some(Self::ExtError),
            _ => None,
        }
    }
}

/// One entry of the operation catalogue: where it is published and which
/// `method` the envelope carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Prefix family
    pub prefix: Prefix,
    /// Path after `{pk}/{dn}`, `/`-separated
    pub path: Cow<'static, str>,
    /// Envelope method name
    pub method: Cow<'static, str>,
}

impl Operation {
    /// A catalogue entry with static path and method.
    #[must_use]
    pub const fn fixed(prefix: Prefix, path: &'static str, method: &'static str) -> Self {
        Self {
            prefix,
            path: Cow::Borrowed(path),
            method: Cow::Borrowed(method),
        }
    }

    /// `thing/event/{identifier}/post`
    #[must_use]
    pub fn event_post(identifier: &str) -> Self {
        Self {
            prefix: Prefix::Sys,
            path: Cow::Owned(format!("thing/event/{identifier}/post")),
            method: Cow::Owned(format!("thing.event.{identifier}.post")),
        }
    }
}

/// The operation catalogue.
pub mod ops {
    use super::{Operation, Prefix};

    /// Property report
    pub const PROPERTY_POST: Operation =
        Operation::fixed(Prefix::Sys, "thing/event/property/post", "thing.event.property.post");
    /// Remote configuration fetch
    pub const CONFIG_GET: Operation =
        Operation::fixed(Prefix::Sys, "thing/config/get", "thing.config.get");
    /// Dynamic sub-device registration
    pub const SUB_REGISTER: Operation =
        Operation::fixed(Prefix::Sys, "thing/sub/register", "thing.sub.register");
    /// Gateway topology add
    pub const TOPO_ADD: Operation =
        Operation::fixed(Prefix::Sys, "thing/topo/add", "thing.topo.add");
    /// Gateway topology delete
    pub const TOPO_DELETE: Operation =
        Operation::fixed(Prefix::Sys, "thing/topo/delete", "thing.topo.delete");
    /// Gateway topology query
    pub const TOPO_GET: Operation =
        Operation::fixed(Prefix::Sys, "thing/topo/get", "thing.topo.get");
    /// Sub-device combine-login
    pub const COMBINE_LOGIN: Operation =
        Operation::fixed(Prefix::ExtSession, "combine/login", "combine.login");
    /// Batch combine-login
    pub const COMBINE_BATCH_LOGIN: Operation =
        Operation::fixed(Prefix::ExtSession, "combine/batch_login", "combine.batch.login");
    /// Sub-device combine-logout
    pub const COMBINE_LOGOUT: Operation =
        Operation::fixed(Prefix::ExtSession, "combine/logout", "combine.logout");
    /// NTP probe
    pub const NTP_REQUEST: Operation = Operation::fixed(Prefix::ExtNtp, "request", "ntp.request");
}

/// Unsolicited messages the platform pushes to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    /// `thing/service/property/set`
    PropertySet,
    /// `thing/service/{identifier}`
    ServiceCall,
    /// `thing/config/push`
    ConfigPush,
    /// `thing/topo/add/notify`: platform asks the gateway to add devices
    TopoAddNotify,
    /// `thing/topo/change`
    TopoChange,
    /// `thing/disable`
    Disable,
    /// `thing/enable`
    Enable,
    /// `thing/delete`
    Delete,
    /// `/ext/ntp/.../response`
    NtpResponse,
    /// `/ext/error/...`
    SessionError,
}

impl PushKind {
    /// Classify a non-reply topic.
    #[must_use]
    pub fn classify(prefix: Prefix, operation: &str) -> Option<Self> {
        match (prefix, operation) {
            (Prefix::Sys, "thing/service/property/set") => Some(Self::PropertySet),
            (Prefix::Sys, "thing/config/push") => Some(Self::ConfigPush),
            (Prefix::Sys, "thing/topo/add/notify") => Some(Self::TopoAddNotify),
            (Prefix::Sys, "thing/topo/change") => Some(Self::TopoChange),
            (Prefix::Sys, "thing/disable") => Some(Self::Disable),
            (Prefix::Sys, "thing/enable") => Some(Self::Enable),
            (Prefix::Sys, "thing/delete") => Some(Self::Delete),
            (Prefix::Sys, op) => op
                .strip_prefix("thing/service/")
                .filter(|id| !id.is_empty() && !id.contains('/'))
                .map(|_| Self::ServiceCall),
            (Prefix::ExtNtp, "response") => Some(Self::NtpResponse),
            (Prefix::ExtError, "") => Some(Self::SessionError),
            _ => None,
        }
    }

    /// Whether the platform expects a `_reply` acknowledgement.
    #[must_use]
    pub fn expects_ack(self) -> bool {
        matches!(
            self,
            Self::Disable | Self::Enable | Self::Delete | Self::TopoAddNotify | Self::TopoChange
        )
    }
}

/// Named segment indices for one prefix under one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPositions {
    offset: usize,
    depth: usize,
}

impl SegmentPositions {
    /// Index of the product key.
    #[must_use]
    pub fn product_key_segment(self) -> usize {
        self.offset + self.depth
    }

    /// Index of the device name.
    #[must_use]
    pub fn device_name_segment(self) -> usize {
        self.product_key_segment() + 1
    }

    /// Index of the first operation segment.
    #[must_use]
    pub fn operation_segment(self) -> usize {
        self.device_name_segment() + 1
    }

    /// Minimum number of segments a topic needs for these positions.
    #[must_use]
    pub fn min_len(self) -> usize {
        self.operation_segment()
    }
}

/// A parsed inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    /// Prefix family
    pub prefix: Prefix,
    /// Device addressed by the topic
    pub device: DeviceKey,
    /// Operation path with any `_reply` suffix removed (may be empty)
    pub operation: String,
    /// Whether the topic carried the `_reply` suffix
    pub reply: bool,
}

/// Topic construction rules for the active transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicLayout {
    /// Extra leading segments (empty for plain MQTT)
    pub root: Vec<String>,
}

impl TopicLayout {
    /// Plain MQTT layout.
    #[must_use]
    pub fn mqtt() -> Self {
        Self::default()
    }

    /// Layout for transports bridged under `/topic` (CoAP, HTTP).
    #[must_use]
    pub fn bridged() -> Self {
        Self::with_root("topic")
    }

    /// Layout with a single extra leading segment.
    #[must_use]
    pub fn with_root(segment: impl Into<String>) -> Self {
        Self {
            root: vec![segment.into()],
        }
    }

    /// Number of leading segments before the prefix.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.root.len()
    }

    /// Segment positions for a prefix under this layout.
    #[must_use]
    pub fn positions(&self, prefix: Prefix) -> SegmentPositions {
        SegmentPositions {
            offset: self.offset(),
            depth: prefix.depth(),
        }
    }

    /// Build a topic string.
    #[must_use]
    pub fn build(
        &self,
        prefix: Prefix,
        path: &str,
        product_key: &str,
        device_name: &str,
        extra: Option<&str>,
    ) -> String {
        let mut topic = String::new();
        let head = self
            .root
            .iter()
            .map(String::as_str)
            .chain(prefix.segments().iter().copied())
            .chain([product_key, device_name]);
        for segment in head {
            topic.push('/');
            topic.push_str(segment);
        }
        for tail in [Some(path), extra].into_iter().flatten() {
            if !tail.is_empty() {
                topic.push('/');
                topic.push_str(tail.trim_matches('/'));
            }
        }
        topic
    }

    /// Topic of a catalogue operation for a device.
    #[must_use]
    pub fn topic(&self, op: &Operation, device: &DeviceKey) -> String {
        self.build(op.prefix, &op.path, &device.product_key, &device.device_name, None)
    }

    /// Reply topic of a catalogue operation for a device.
    #[must_use]
    pub fn reply_topic(&self, op: &Operation, device: &DeviceKey) -> String {
        Self::reply_topic_of(&self.topic(op, device))
    }

    /// Reply topic for a request topic.
    #[must_use]
    pub fn reply_topic_of(request_topic: &str) -> String {
        format!("{request_topic}{REPLY_SUFFIX}")
    }

    /// Split a topic into its segments, ignoring the leading separator.
    #[must_use]
    pub fn split(topic: &str) -> Vec<&str> {
        topic.strip_prefix('/').unwrap_or(topic).split('/').collect()
    }

    /// Parse an inbound topic.
    ///
    /// # Errors
    ///
    /// Returns error if the root segments do not match, the prefix is unknown,
    /// or the topic is too short to carry a product key and device name.
    pub fn parse(&self, topic: &str) -> Result<TopicParts, TopicError> {
        let invalid = || TopicError::InvalidTopic(topic.to_string());
        let segments = Self::split(topic);

        if segments.len() < self.offset()
            || segments
                .iter()
                .zip(&self.root)
                .any(|(segment, root)| segment != root)
        {
            return Err(invalid());
        }

        let prefix = Prefix::detect(&segments[self.offset()..]).ok_or_else(invalid)?;
        let positions = self.positions(prefix);
        if segments.len() < positions.min_len() {
            return Err(invalid());
        }

        let device = DeviceKey::new(
            segments[positions.product_key_segment()],
            segments[positions.device_name_segment()],
        );
        if !device.is_valid() {
            return Err(invalid());
        }

        let mut operation = segments[positions.operation_segment()..].join("/");
        let reply = match operation.strip_suffix(REPLY_SUFFIX) {
            Some(stripped) => {
                operation = stripped.to_string();
                true
            }
            None => false,
        };

        Ok(TopicParts {
            prefix,
            device,
            operation,
            reply,
        })
    }

    /// Topics a sub-device (or the root) subscribes to for its own replies
    /// and pushes.
    #[must_use]
    pub fn device_subscriptions(&self, device: &DeviceKey) -> Vec<String> {
        let sys = |path: &str| {
            self.build(Prefix::Sys, path, &device.product_key, &device.device_name, None)
        };
        vec![
            sys("thing/event/property/post_reply"),
            sys("thing/event/+/post_reply"),
            sys("thing/config/get_reply"),
            sys("thing/config/push"),
            sys("thing/service/property/set"),
            sys("thing/service/+"),
            sys("thing/disable"),
            sys("thing/enable"),
            sys("thing/delete"),
        ]
    }

    /// Extra topics the gateway (root device) subscribes to.
    #[must_use]
    pub fn gateway_subscriptions(&self, root: &DeviceKey) -> Vec<String> {
        let mut topics = self.device_subscriptions(root);
        for op in [
            &ops::SUB_REGISTER,
            &ops::TOPO_ADD,
            &ops::TOPO_DELETE,
            &ops::TOPO_GET,
            &ops::COMBINE_LOGIN,
            &ops::COMBINE_BATCH_LOGIN,
            &ops::COMBINE_LOGOUT,
        ] {
            topics.push(self.reply_topic(op, root));
        }
        let (pk, dn) = (&root.product_key, &root.device_name);
        topics.push(self.build(Prefix::Sys, "thing/topo/add/notify", pk, dn, None));
        topics.push(self.build(Prefix::Sys, "thing/topo/change", pk, dn, None));
        topics.push(self.build(Prefix::ExtNtp, "response", pk, dn, None));
        topics.push(self.build(Prefix::ExtError, "", pk, dn, None));
        topics
    }
}

/// Errors for topic parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// The topic does not match the scheme
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
}
