use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SHUTDOWN_NOTICE: &str = "Agent is shutting down.";

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Everything the agent sends to the worker. Serialized as
/// `{"type": "...", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    Metadata(BTreeMap<String, String>),
    HistoryDump(Vec<String>),
    Log(String),
    Health(HealthSample),
    AgentShutdown(String),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Metadata(_) => "METADATA",
            Outbound::HistoryDump(_) => "HISTORY_DUMP",
            Outbound::Log(_) => "LOG",
            Outbound::Health(_) => "HEALTH",
            Outbound::AgentShutdown(_) => "AGENT_SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub cpu_percent: f64,
    pub disk_percent: f64,
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// First decoding phase: the kind is known but the payload is left generic,
/// so a payload of the wrong shape only fails this one message.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(String),
    Script(ScriptPayload),
}

impl TryFrom<InboundEnvelope> for Inbound {
    type Error = ProtocolError;

    fn try_from(envelope: InboundEnvelope) -> Result<Self, Self::Error> {
        match envelope.kind.as_str() {
            "COMMAND" => serde_json::from_value(envelope.payload)
                .map(Inbound::Command)
                .map_err(|e| ProtocolError::Payload {
                    kind: envelope.kind,
                    source: e,
                }),
            "SCRIPT" => serde_json::from_value(envelope.payload)
                .map(Inbound::Script)
                .map_err(|e| ProtocolError::Payload {
                    kind: envelope.kind,
                    source: e,
                }),
            _ => Err(ProtocolError::UnknownKind(envelope.kind)),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        source: serde_json::Error,
    },
    #[error("unknown message type: {0}")]
    UnknownKind(String),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn encode_outbound(msg: &Outbound) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let envelope: InboundEnvelope = serde_json::from_str(text)?;
    Inbound::try_from(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(msg: &Outbound) -> serde_json::Value {
        serde_json::from_str(&encode_outbound(msg).unwrap()).unwrap()
    }

    #[test]
    fn test_metadata_wire_shape() {
        let mut fields = BTreeMap::new();
        fields.insert("branch".to_string(), "x86-64".to_string());
        fields.insert("gameVersion".to_string(), "2024.06.28".to_string());
        assert_eq!(
            encoded(&Outbound::Metadata(fields)),
            json!({
                "type": "METADATA",
                "payload": { "branch": "x86-64", "gameVersion": "2024.06.28" }
            })
        );
    }

    #[test]
    fn test_history_dump_wire_shape() {
        let msg = Outbound::HistoryDump(vec!["line1".into(), "line2".into()]);
        assert_eq!(
            encoded(&msg),
            json!({ "type": "HISTORY_DUMP", "payload": ["line1", "line2"] })
        );
    }

    #[test]
    fn test_health_wire_shape() {
        let msg = Outbound::Health(HealthSample {
            cpu_percent: 12.5,
            disk_percent: 40.0,
        });
        assert_eq!(
            encoded(&msg),
            json!({
                "type": "HEALTH",
                "payload": { "cpu_percent": 12.5, "disk_percent": 40.0 }
            })
        );
    }

    #[test]
    fn test_log_and_shutdown_kinds() {
        assert_eq!(
            encoded(&Outbound::Log("hello".into())),
            json!({ "type": "LOG", "payload": "hello" })
        );
        let shutdown = Outbound::AgentShutdown(SHUTDOWN_NOTICE.into());
        assert_eq!(shutdown.kind(), "AGENT_SHUTDOWN");
        assert_eq!(encoded(&shutdown)["type"], "AGENT_SHUTDOWN");
    }

    #[test]
    fn test_decode_command() {
        let msg = decode_inbound(r#"{"type":"COMMAND","payload":"status"}"#).unwrap();
        assert_eq!(msg, Inbound::Command("status".to_string()));
    }

    #[test]
    fn test_decode_script() {
        let msg = decode_inbound(
            r#"{"type":"SCRIPT","payload":{"name":"init","content":"print(1)"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Inbound::Script(ScriptPayload {
                name: "init".to_string(),
                content: "print(1)".to_string(),
            })
        );
    }

    #[test]
    fn test_command_with_non_string_payload_is_payload_error() {
        let err = decode_inbound(r#"{"type":"COMMAND","payload":{"cmd":"status"}}"#).unwrap_err();
        assert!(
            matches!(err, ProtocolError::Payload { ref kind, .. } if kind == "COMMAND"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_script_missing_field_is_payload_error() {
        let err = decode_inbound(r#"{"type":"SCRIPT","payload":{"name":"x"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Payload { ref kind, .. } if kind == "SCRIPT"));
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let err = decode_inbound(r#"{"type":"COMMAND"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Payload { .. }));
    }

    #[test]
    fn test_unknown_kind() {
        let err = decode_inbound(r#"{"type":"REBOOT","payload":null}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(ref k) if k == "REBOOT"));
    }

    #[test]
    fn test_not_json() {
        let err = decode_inbound("definitely not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
