pub mod channel;
pub mod cli;
pub mod config;
pub mod negotiation;
pub mod orchestrator;
pub mod replay;
pub mod signaling;
pub mod telemetry;
pub mod testing;
