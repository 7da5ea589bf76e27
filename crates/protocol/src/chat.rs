//! Payload of the `chat` event stream.
//!
//! Every delta carries the full text produced so far, not an increment.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Error,
    Aborted,
    /// Progress markers (thinking, tool calls, iterations).
    #[serde(other)]
    Other,
}

impl ChatState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Error | Self::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
    pub state: ChatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ChatEvent {
    /// Text carried by the event: explicit `text`, else `message` as a plain
    /// string, else the joined text parts of `message.content`.
    pub fn content(&self) -> Option<String> {
        if let Some(text) = &self.text {
            return Some(text.clone());
        }
        let message = self.message.as_ref()?;
        if let Some(s) = message.as_str() {
            return Some(s.to_string());
        }
        if let Some(s) = message.get("text").and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
        match message.get("content")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(parts) => {
                let text: Vec<&str> = parts
                    .iter()
                    .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join(""))
                }
            },
            _ => None,
        }
    }

    /// Human-readable failure reason for `error`/`aborted` events.
    pub fn failure_reason(&self) -> String {
        self.error_message
            .clone()
            .or_else(|| {
                self.message
                    .as_ref()
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| match self.state {
                ChatState::Aborted => "run aborted".to_string(),
                _ => "run failed".to_string(),
            })
    }
}
