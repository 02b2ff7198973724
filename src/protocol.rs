//! Socket channel envelopes
//!
//! Messages exchanged with extension peers. Every inbound text frame goes
//! through [`parse_extension_message`]; nothing past that point handles
//! untyped JSON envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relay -> extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
    /// Sent once to a newly connected peer
    Registered { id: String },

    /// Current topology, broadcast to every peer
    #[serde(rename_all = "camelCase")]
    State {
        active_id: Option<String>,
        /// Connected tool consumers
        count: usize,
        /// Connected extension peers
        extensions: usize,
        /// Bound socket channel port
        port: u16,
        asset_server_url: String,
    },

    /// A tool call the active extension should serve
    ToolCall { id: String, payload: ToolCallPayload },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Extension -> relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExtensionMessage {
    /// The peer asks to become the active extension
    Activate {},

    /// Reply to a previous `toolCall`
    ToolResult {
        id: String,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
}

/// Outcome carried by a `toolResult`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Payload(Value),
    Error(String),
}

impl ExtensionMessage {
    /// Collapse a `toolResult` into its outcome. An `error` field wins over a
    /// payload; a reply with neither resolves to `null`.
    pub fn into_outcome(payload: Option<Value>, error: Option<Value>) -> ToolOutcome {
        match error {
            Some(Value::Null) | None => ToolOutcome::Payload(payload.unwrap_or(Value::Null)),
            Some(Value::String(message)) => ToolOutcome::Error(message),
            Some(Value::Object(obj)) if obj.get("message").and_then(Value::as_str).is_some() => {
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                ToolOutcome::Error(message.to_string())
            }
            Some(other) => ToolOutcome::Error(other.to_string()),
        }
    }
}

/// Parse an inbound text frame.
pub fn parse_extension_message(text: &str) -> Result<ExtensionMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("Malformed extension message: {}", e))
}

/// Serialize an outbound message.
pub fn encode_hub_message(message: &HubMessage) -> Result<String, String> {
    serde_json::to_string(message).map_err(|e| format!("Failed to encode message: {}", e))
}
