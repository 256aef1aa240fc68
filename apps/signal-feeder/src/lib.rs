pub mod config;
pub mod encoder;
pub mod handoff;
pub mod pipeline;
pub mod publisher;
pub mod signal;
pub mod telemetry;
