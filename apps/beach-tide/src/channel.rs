//! Outbound data channels as seen by the replay scheduler.

use async_trait::async_trait;
use thiserror::Error;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReliability {
    /// Ordered with unlimited retransmits.
    Reliable,
    /// Unordered, no retransmits.
    Unreliable,
}

impl From<ChannelReliability> for RTCDataChannelInit {
    fn from(value: ChannelReliability) -> Self {
        match value {
            ChannelReliability::Reliable => RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            },
            ChannelReliability::Unreliable => RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub label: String,
    pub reliability: ChannelReliability,
}

impl ChannelSpec {
    pub fn new(label: impl Into<String>, reliability: ChannelReliability) -> Self {
        Self {
            label: label.into(),
            reliability,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("data channel {0} is closed")]
    Closed(String),
    #[error("data channel {label} is backed up ({buffered} bytes buffered)")]
    Backpressure { label: String, buffered: usize },
    #[error("data channel send failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait OutboundChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Resolves once the channel is open, or fails if it closes first.
    async fn wait_open(&self) -> Result<(), ChannelError>;

    async fn send_text(&self, text: String) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliability_maps_to_channel_init() {
        let reliable: RTCDataChannelInit = ChannelReliability::Reliable.into();
        assert_eq!(reliable.ordered, Some(true));
        assert_eq!(reliable.max_retransmits, None);

        let unreliable: RTCDataChannelInit = ChannelReliability::Unreliable.into();
        assert_eq!(unreliable.ordered, Some(false));
        assert_eq!(unreliable.max_retransmits, Some(0));
    }
}
