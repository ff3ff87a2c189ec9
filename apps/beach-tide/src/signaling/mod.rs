//! Transaction-correlated signaling with the SFU gateway.

pub mod envelope;
pub mod handle;
pub mod plugin;
pub mod session;
pub mod transport;

use std::time::Duration;
use thiserror::Error;

pub use envelope::{
    Envelope, HandleId, IceCandidate, Inbound, Jsep, JsepKind, PluginReply, Request, SessionId,
};
pub use handle::{HandleEvent, HandleState, PluginHandle};
pub use plugin::{
    JoinResponse, PluginEvent, PluginRequest, RoomId, SFU_PLUGIN, SubscriptionSpec, UserId,
};
pub use session::{Session, SessionConfig, SessionState};
pub use transport::SignalLink;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling transport closed: {0}")]
    Transport(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("gateway rejected request ({code}): {reason}")]
    Gateway { code: i64, reason: String },
    #[error("signaling protocol error: {0}")]
    Protocol(String),
    #[error("plugin handle is not attached")]
    Detached,
}
