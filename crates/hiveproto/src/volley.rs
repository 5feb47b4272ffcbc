//! A request paired with the response being built for it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{OutputType, ResponseEnvelope};
use crate::request::DeviceRequest;

/// Per-session scratch data visible to handlers and scripts.
pub type LocalData = Map<String, Value>;

/// Device data attached to every volley: its config, last reported state
/// and anything persisted on its behalf.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RobotSnapshot {
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub persist: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volley {
    pub device_id: Option<String>,
    pub request: DeviceRequest,
    pub response: ResponseEnvelope,
    pub local_data: LocalData,
    pub robot: RobotSnapshot,
    data_only: bool,
}

impl Volley {
    pub fn new(device_id: Option<&str>, request: DeviceRequest) -> Self {
        let response = ResponseEnvelope::new_response(&request, OutputType::GlobalResponse);
        Self {
            device_id: device_id.map(str::to_string),
            request,
            response,
            local_data: LocalData::new(),
            robot: RobotSnapshot::default(),
            data_only: false,
        }
    }

    /// A volley carrying only session data, handed to completion hooks.
    /// There is no request to answer and nothing will be sent.
    pub fn data_only(device_id: Option<&str>, local_data: LocalData) -> Self {
        let request = DeviceRequest::from_speech(None, None, None);
        let mut volley = Self::new(device_id, request);
        volley.local_data = local_data;
        volley.data_only = true;
        volley
    }

    /// Volley for the given speech, as a device would have sent it.
    pub fn from_speech(
        speech: Option<&str>,
        device_id: Option<&str>,
        module_id: Option<&str>,
        content_id: Option<&str>,
    ) -> Self {
        Self::new(device_id, DeviceRequest::from_speech(speech, module_id, content_id))
    }

    pub fn with_robot(mut self, robot: RobotSnapshot) -> Self {
        self.robot = robot;
        self
    }

    pub fn is_data_only(&self) -> bool {
        self.data_only
    }

    /// Entities extracted by a global pattern, if any.
    pub fn entities(&self) -> Vec<String> {
        self.local_data
            .get("entities")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_entities(&mut self, entities: &[String]) {
        self.local_data.insert(
            "entities".to_string(),
            Value::Array(entities.iter().cloned().map(Value::String).collect()),
        );
    }

    pub fn set_output(&mut self, text: &str, markup: Option<&str>) {
        self.response.set_output(text, markup, None);
    }

    pub fn ingest_action_tags(&mut self) {
        self.response.ingest_action_tags(Some(&self.request));
    }

    pub fn add_launch_or_exit(&mut self) {
        self.response.add_launch_or_exit(&self.request);
    }

    /// Reset the response to a fresh envelope for the same request.
    pub fn reset_response(&mut self) {
        self.response = ResponseEnvelope::new_response(&self.request, OutputType::GlobalResponse);
    }

    /// Script-facing view: `{request, response, local_data, config, state,
    /// persist}`.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "device_id": self.device_id,
            "request": self.request,
            "response": self.response.to_json(),
            "local_data": Value::Object(self.local_data.clone()),
            "config": self.robot.config,
            "state": self.robot.state,
            "persist": self.robot.persist,
        })
    }

    /// Apply a script's edits to the response and local data. Keys that are
    /// missing or do not parse leave the volley unchanged.
    pub fn apply_json(&mut self, value: &Value) -> Result<(), serde_json::Error> {
        if let Some(response) = value.get("response").filter(|v| v.is_object()) {
            self.response = serde_json::from_value(response.clone())?;
        }
        if let Some(Value::Object(local)) = value.get("local_data") {
            self.local_data = local.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ActionKind;
    use serde_json::json;

    #[test]
    fn test_entities_round_trip_through_local_data() {
        let mut volley = Volley::from_speech(Some("weather in paris"), Some("d_1"), None, None);
        volley.set_entities(&["paris".to_string()]);
        assert_eq!(volley.entities(), vec!["paris".to_string()]);
        assert_eq!(volley.local_data["entities"], json!(["paris"]));
    }

    #[test]
    fn test_data_only() {
        let mut local = LocalData::new();
        local.insert("turns".to_string(), json!(3));
        let volley = Volley::data_only(Some("d_1"), local);
        assert!(volley.is_data_only());
        assert_eq!(volley.local_data["turns"], json!(3));
    }

    #[test]
    fn test_apply_json_updates_response_and_local_data() {
        let mut volley = Volley::from_speech(Some("hi"), None, Some("M"), None);
        let mut view = volley.to_json();
        view["response"]["output"]["text"] = json!("changed");
        view["response"]["response_actions"] = json!([{"action": "sleep", "output_type": "GLOBAL_RESPONSE"}]);
        view["local_data"]["seen"] = json!(true);

        volley.apply_json(&view).unwrap();
        assert_eq!(volley.response.output.text, "changed");
        assert_eq!(volley.response.primary().action, ActionKind::Sleep);
        assert_eq!(volley.local_data["seen"], json!(true));
    }

    #[test]
    fn test_ingest_uses_request_exits() {
        let mut volley = Volley::from_speech(Some("bye"), None, None, None);
        volley.set_output("Bye <exit>", None);
        volley.ingest_action_tags();
        assert_eq!(volley.response.primary().action, ActionKind::ExitModule);
        assert_eq!(volley.response.output.text, "Bye ");
    }
}
