//! Broker topic grammar.
//!
//! Inbound (device → service):
//! - `/devices/{id}/events/{name}`
//! - `/devices/{id}/state`
//! - `$SYS/broker/log/{level}`
//! - `$SYS/broker/clients/{metric}`
//!
//! Outbound (service → device):
//! - `/devices/{id}/commands/{command}`
//! - `/devices/{id}/config`

/// Subscription filters the bridge must forward to us.
pub const INBOUND_FILTERS: [&str; 4] = [
    "/devices/+/events/#",
    "/devices/+/state",
    "$SYS/broker/clients/#",
    "$SYS/broker/log/#",
];

pub const EVENT_REMOTE_CHAT: &str = "remote-chat";
pub const EVENT_REMOTE_CHAT_STAGING: &str = "remote-chat-staging";
pub const EVENT_SERVICE_ACTIVITY: &str = "client-service-activity-log";
pub const EVENT_ZMQ_BRIDGE: &str = "zmq";
pub const EVENT_DEVICE_LOGS: &str = "device-logs";

pub const COMMAND_REMOTE_CHAT: &str = "remote_chat";
pub const COMMAND_QUERY_RESULT: &str = "query_result";
pub const COMMAND_ZMQ_BRIDGE: &str = "zmq";
pub const COMMAND_WAKEUP: &str = "wakeup";
pub const COMMAND_TELEHEALTH: &str = "telehealth";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    Event { device_id: &'a str, name: &'a str },
    State { device_id: &'a str },
    BrokerLog { level: &'a str },
    BrokerClients { metric: &'a str },
}

impl<'a> InboundTopic<'a> {
    /// Classify a topic. Returns `None` for anything we do not subscribe to.
    pub fn parse(topic: &'a str) -> Option<Self> {
        if let Some(rest) = topic.strip_prefix("/devices/") {
            let (device_id, rest) = rest.split_once('/')?;
            if device_id.is_empty() {
                return None;
            }
            if rest == "state" {
                return Some(InboundTopic::State { device_id });
            }
            let name = rest.strip_prefix("events/")?;
            if name.is_empty() {
                return None;
            }
            return Some(InboundTopic::Event { device_id, name });
        }

        if let Some(level) = topic.strip_prefix("$SYS/broker/log/") {
            return Some(InboundTopic::BrokerLog { level });
        }
        if let Some(metric) = topic.strip_prefix("$SYS/broker/clients/") {
            return Some(InboundTopic::BrokerClients { metric });
        }
        None
    }

    /// The device this topic belongs to, for device topics.
    pub fn device_id(&self) -> Option<&'a str> {
        match self {
            InboundTopic::Event { device_id, .. } | InboundTopic::State { device_id } => {
                Some(device_id)
            }
            _ => None,
        }
    }
}

pub fn command_topic(device_id: &str, command: &str) -> String {
    format!("/devices/{device_id}/commands/{command}")
}

pub fn config_topic(device_id: &str) -> String {
    format!("/devices/{device_id}/config")
}
