//! Protocol types for the Hive remote-chat device bus.
//!
//! Devices talk to Hive over a publish/subscribe broker. Most topics carry
//! JSON; the `zmq` topics carry binary bridge frames. This crate owns the
//! value objects on both sides of that wire:
//!
//! - [`DeviceRequest`] and [`RemoteChatEvent`] - inbound remote-chat traffic
//! - [`ResponseEnvelope`] and [`ResponseAction`] - what goes back
//! - [`Volley`] - a request paired with the response being built for it
//! - [`directives`] - `<launch:...>` style tags in generated speech
//! - [`topic`] - topic parsing and outbound topic names
//! - [`bridge`] - `name:protobuf` frames for speech streaming
//! - [`service`] - schedule, mentor behavior and license queries

pub mod bridge;
pub mod directives;
pub mod envelope;
pub mod error;
pub mod request;
pub mod service;
pub mod topic;
pub mod volley;

pub use bridge::{BridgeFrame, BridgeMessage, ProtoSubscribe, SttRequest, SttResponse, VadState};
pub use envelope::{
    ActionKind, EventSubscription, Output, OutputType, ResponseAction, ResponseEnvelope,
    FALLBACK_TEXT,
};
pub use error::ProtoError;
pub use request::{ChatCommand, DeviceRequest, ExtraLine, ModuleRef, Recommend, RemoteChatEvent};
pub use topic::InboundTopic;
pub use volley::{LocalData, RobotSnapshot, Volley};
