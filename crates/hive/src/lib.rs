//! Hive - remote-chat control plane for conversational robot devices.
//!
//! Library exposing the service's parts for the binary and for tests.

pub mod app;
pub mod catalog;
pub mod devices;
pub mod global_commands;
pub mod markup;
pub mod publisher;
pub mod router;
pub mod sandbox;
pub mod sessions;
pub mod stt;
pub mod telemetry;
pub mod transport;
pub mod workers;
