//! JSON messages exchanged with an external UI surface.
//!
//! One message per line in each direction. Client messages submit code
//! blocks and answer input requests; server messages stream output
//! replacements and one terminal report per execution.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::output::{CellId, OutputItem};

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Run a code block.
    Execute {
        cell_id: CellId,
        language: String,
        source: String,
        /// Run in a throwaway session instead of the shared one.
        #[serde(default)]
        stateless: bool,
        /// Skip execution entirely.
        #[serde(default)]
        readonly: bool,
    },

    /// Answer an input request. Without `request_id` the oldest pending
    /// request is answered.
    InputResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        value: String,
    },

    /// Stop one running block.
    Cancel { cell_id: CellId },

    /// Interrupt the shared interpreter.
    Interrupt,

    /// Discard the shared interpreter; the next block starts a fresh one.
    Restart,

    /// Stop serving.
    Shutdown,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Replace a block's displayed output.
    CellUpdate {
        cell_id: CellId,
        outputs: Vec<OutputItem>,
    },

    /// A block finished successfully.
    CellCompleted {
        cell_id: CellId,
        execution_order: u64,
        outputs: Vec<OutputItem>,
    },

    /// A block failed or was stopped.
    CellFailed {
        cell_id: CellId,
        execution_order: u64,
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },

    /// A client message could not be handled.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_message_defaults() {
        let json = r#"{"type":"execute","cellId":"c1","language":"python","source":"print(1)"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Execute {
                cell_id: CellId::new("c1"),
                language: "python".to_string(),
                source: "print(1)".to_string(),
                stateless: false,
                readonly: false,
            }
        );
    }

    #[test]
    fn test_input_response_without_id() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"input-response","value":"Ada"}"#).unwrap();
        match parsed {
            ClientMessage::InputResponse { request_id, value } => {
                assert_eq!(request_id, None);
                assert_eq!(value, "Ada");
            }
            _ => panic!("Wrong message type"),
        }

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"input-response","requestId":"r1","value":""}"#)
                .unwrap();
        assert!(matches!(
            parsed,
            ClientMessage::InputResponse { request_id: Some(id), .. } if id == "r1"
        ));
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::CellFailed {
            cell_id: CellId::new("c2"),
            execution_order: 3,
            kind: ErrorKind::CompileFailure,
            message: "error: expected ';'".to_string(),
            hint: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "cell-failed");
        assert_eq!(json["cellId"], "c2");
        assert_eq!(json["executionOrder"], 3);
        assert_eq!(json["kind"], "compile-failure");
        assert!(json.get("hint").is_none());
    }

    #[test]
    fn test_unit_messages() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"restart"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Restart);

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"cancel","cellId":"c9"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Cancel {
                cell_id: CellId::new("c9")
            }
        );
    }
}
