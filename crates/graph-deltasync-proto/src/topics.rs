//! Channel naming for delta replication.
//!
//! Channel structure: `graph-deltasync/v1/{tenant}/{channel}`
//!
//! This allows:
//! - Tenant isolation
//! - Separate subscriptions for updates, acknowledgements and resync traffic

use crate::messages::WireMessage;
use serde::{Deserialize, Serialize};

/// Protocol version for the channel scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered messages and groups
    Updates,
    /// Acknowledgement batches
    Acks,
    /// Resync requests
    Resync,
}

impl Channel {
    /// All channels.
    pub const ALL: [Channel; 3] = [Channel::Updates, Channel::Acks, Channel::Resync];

    /// Path segment of the channel.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Updates => "updates",
            Channel::Acks => "acks",
            Channel::Resync => "resync",
        }
    }

    /// Channel a wire message travels on.
    #[must_use]
    pub fn for_message(message: &WireMessage) -> Self {
        match message {
            WireMessage::Ordered(_) | WireMessage::Group(_) => Channel::Updates,
            WireMessage::Ack(_) => Channel::Acks,
            WireMessage::Resync(_) => Channel::Resync,
        }
    }
}

/// Channel scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Channel prefix (default: "graph-deltasync")
    pub prefix: String,
}

impl Default for ChannelScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl ChannelScheme {
    /// Create a new channel scheme for the given tenant.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: "graph-deltasync".to_string(),
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    /// Full topic of a channel.
    #[must_use]
    pub fn topic(&self, channel: Channel) -> String {
        format!("{}/{}", self.base(), channel.as_str())
    }

    /// Topic a wire message is published on.
    #[must_use]
    pub fn topic_for(&self, message: &WireMessage) -> String {
        self.topic(Channel::for_message(message))
    }

    /// Wildcard subscription for all channels of the tenant.
    #[must_use]
    pub fn tenant_wildcard(&self) -> String {
        format!("{}/#", self.base())
    }

    /// Parse a topic back into its channel.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<Channel> {
        let rest = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        Channel::ALL.into_iter().find(|c| c.as_str() == rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AckBatch;

    #[test]
    fn topic_generation() {
        let scheme = ChannelScheme::new("lab-a");

        assert_eq!(scheme.topic(Channel::Updates), "graph-deltasync/v1/lab-a/updates");
        assert_eq!(scheme.topic(Channel::Acks), "graph-deltasync/v1/lab-a/acks");
        assert_eq!(scheme.tenant_wildcard(), "graph-deltasync/v1/lab-a/#");
    }

    #[test]
    fn topic_parsing() {
        let scheme = ChannelScheme::new("lab-a");

        assert_eq!(scheme.parse("graph-deltasync/v1/lab-a/resync"), Some(Channel::Resync));
        assert_eq!(scheme.parse("graph-deltasync/v1/lab-b/resync"), None);
        assert_eq!(scheme.parse("graph-deltasync/v1/lab-a/other"), None);
        assert_eq!(scheme.parse("graph-deltasync/v1/lab-aresync"), None);
    }

    #[test]
    fn routes_by_variant() {
        let scheme = ChannelScheme::default();
        let ack = WireMessage::Ack(AckBatch {
            acker_id: "a".to_string(),
            source_id: "b".to_string(),
            ids: vec![],
        });
        assert_eq!(scheme.topic_for(&ack), "graph-deltasync/v1/default/acks");
    }
}
