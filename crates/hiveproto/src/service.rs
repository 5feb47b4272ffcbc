//! Service activity messages and data replies.
//!
//! The `client-service-activity-log` event started as an activity report
//! and grew subtopics for queries and telehealth.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceActivity {
    Query { query: QueryKind, request_id: Value },
    MentorBehavior(Value),
    Telehealth(Value),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Schedule,
    MentorBehaviors,
    License,
    Unknown(String),
}

impl QueryKind {
    fn from_name(name: &str) -> Self {
        match name {
            "schedule" => QueryKind::Schedule,
            "mentor_behaviors" => QueryKind::MentorBehaviors,
            "license" => QueryKind::License,
            other => QueryKind::Unknown(other.to_string()),
        }
    }
}

impl ServiceActivity {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let msg: Value = serde_json::from_slice(payload)?;
        let subtopic = msg.get("subtopic").and_then(Value::as_str);

        if subtopic == Some("query") {
            let query = msg.get("query").and_then(Value::as_str).unwrap_or_default();
            return Ok(ServiceActivity::Query {
                query: QueryKind::from_name(query),
                request_id: msg.get("request_id").cloned().unwrap_or(Value::Null),
            });
        }
        if let Some(mbh) = msg.get("mentor_behavior") {
            return Ok(ServiceActivity::MentorBehavior(mbh.clone()));
        }
        if subtopic == Some("telehealth") {
            return Ok(ServiceActivity::Telehealth(
                msg.get("message").cloned().unwrap_or(Value::Null),
            ));
        }
        Ok(ServiceActivity::Other)
    }
}

/// One license handed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseValue {
    pub id: String,
    pub license: String,
}

/// Reply payload for `commands/query_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub command: String,
    pub query: String,
    pub request_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentor_behaviors: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_values: Option<Vec<LicenseValue>>,
}

impl QueryResult {
    fn new(query: &str, request_id: Value) -> Self {
        Self {
            command: "query_result".to_string(),
            query: query.to_string(),
            request_id,
            schedule: None,
            mentor_behaviors: None,
            license_values: None,
        }
    }

    pub fn schedule(request_id: Value, schedule: Value) -> Self {
        Self {
            schedule: Some(schedule),
            ..Self::new("schedule", request_id)
        }
    }

    pub fn mentor_behaviors(request_id: Value, records: Vec<Value>) -> Self {
        Self {
            mentor_behaviors: Some(records),
            ..Self::new("mentor_behaviors", request_id)
        }
    }

    pub fn licenses(request_id: Value, values: Vec<LicenseValue>) -> Self {
        Self {
            license_values: Some(values),
            ..Self::new("license", request_id)
        }
    }
}

/// One remote module advertised to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub info: InfoId,
    pub rules: String,
    pub source: String,
    pub content_infos: Vec<ContentInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub info: InfoId,
}

impl ModuleInfo {
    pub fn remote(module_id: &str, content_ids: &[String]) -> Self {
        Self {
            info: InfoId {
                id: module_id.to_string(),
            },
            rules: "RANDOM".to_string(),
            source: "REMOTE_CHAT".to_string(),
            content_infos: content_ids
                .iter()
                .map(|id| ContentInfo {
                    info: InfoId { id: id.clone() },
                })
                .collect(),
        }
    }
}

/// The full module list, as answered on `commands/remote_chat`.
pub fn modules_reply(event_id: &str, modules: Vec<ModuleInfo>) -> Value {
    serde_json::json!({
        "command": "remote_chat",
        "result": 0,
        "event_id": event_id,
        "query_data": {
            "modules": modules,
            "version": "openmoxie_v1",
        },
    })
}
