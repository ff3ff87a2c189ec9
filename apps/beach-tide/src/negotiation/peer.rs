//! Host capabilities the negotiator drives. The `webrtc` crate backs them in
//! production (see [`super::rtc`]); tests use in-memory doubles.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{ChannelSpec, OutboundChannel};
use crate::signaling::{IceCandidate, Jsep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate; `None` once gathering is complete.
    LocalCandidate(Option<IceCandidate>),
    NegotiationNeeded,
    StateChanged(PeerState),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PeerError(pub String);

impl PeerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<Jsep, PeerError>;

    async fn apply_local(&self, offer: &Jsep) -> Result<(), PeerError>;

    async fn apply_remote(&self, answer: &Jsep) -> Result<(), PeerError>;

    async fn open_channel(&self, spec: &ChannelSpec)
    -> Result<Arc<dyn OutboundChannel>, PeerError>;

    /// Adds receive-only media so the next offer asks for remote tracks.
    async fn receive_media(&self) -> Result<(), PeerError>;

    /// Candidate, renegotiation and state events. Can be taken once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerLink>, PeerError>;
}
