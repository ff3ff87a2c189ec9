//! Timed replay of recorded data-channel traffic.

pub mod record;
pub mod rewrite;
pub mod scheduler;

pub use record::{RecordedEvent, RecordingError, load, parse_recording};
pub use rewrite::{localize, localize_payload};
pub use scheduler::{
    DEFAULT_TICK, ReplayChannels, ReplayError, ReplayHandle, ReplayOptions, ReplayState,
    ReplaySummary, run,
};
