//! Bounded JSON codec for wire messages.
//!
//! Size limits are enforced on both encode and decode, and every embedded
//! operation, value, or name is structurally validated before a message is
//! handed to a dispatcher. Decode failures are typed; the dispatcher
//! decides whether to drop, answer with an error, or close.

use serde_json::Value;

use crate::error::{ProtoError, Result};
use crate::message::{ClientMessage, ServerMessage};
use crate::validate::{
    check_function_name, check_message_size, check_value, check_value_size, MAX_MESSAGE_SIZE,
};

/// Longest accepted room id.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Encode a client message, enforcing the wire size cap.
pub fn encode_client(msg: &ClientMessage) -> Result<String> {
    let encoded = serde_json::to_string(msg)?;
    check_message_size(encoded.len(), MAX_MESSAGE_SIZE)?;
    Ok(encoded)
}

/// Decode and validate a client message with the default size cap.
pub fn decode_client(raw: &str) -> Result<ClientMessage> {
    decode_client_bounded(raw, MAX_MESSAGE_SIZE)
}

/// Decode and validate a client message with an explicit size cap.
pub fn decode_client_bounded(raw: &str, max_size: usize) -> Result<ClientMessage> {
    check_message_size(raw.len(), max_size)?;
    let msg: ClientMessage = serde_json::from_str(raw).map_err(|e| ProtoError::InvalidMessage {
        reason: format!("malformed envelope: {e}"),
    })?;
    validate_client(&msg)?;
    Ok(msg)
}

/// Encode a server message, enforcing the wire size cap.
pub fn encode_server(msg: &ServerMessage) -> Result<String> {
    let encoded = serde_json::to_string(msg)?;
    check_message_size(encoded.len(), MAX_MESSAGE_SIZE)?;
    Ok(encoded)
}

/// Decode and validate a server message.
pub fn decode_server(raw: &str) -> Result<ServerMessage> {
    check_message_size(raw.len(), MAX_MESSAGE_SIZE)?;
    let msg: ServerMessage = serde_json::from_str(raw).map_err(|e| ProtoError::InvalidMessage {
        reason: format!("malformed envelope: {e}"),
    })?;
    validate_server(&msg)?;
    Ok(msg)
}

fn check_room_id(room_id: &str) -> Result<()> {
    if room_id.is_empty() {
        return Err(ProtoError::InvalidMessage { reason: "empty room_id".into() });
    }
    if room_id.len() > MAX_ROOM_ID_LEN {
        return Err(ProtoError::InvalidMessage {
            reason: format!("room_id longer than {MAX_ROOM_ID_LEN} bytes"),
        });
    }
    Ok(())
}

fn check_payload(value: &Value) -> Result<()> {
    check_value(value)?;
    check_value_size(value)
}

/// Structural validation of a decoded client message.
pub fn validate_client(msg: &ClientMessage) -> Result<()> {
    if let Some(room_id) = msg.room_id() {
        check_room_id(room_id)?;
    }
    match msg {
        ClientMessage::Operation { op, .. } => op.validate(),
        ClientMessage::Call { call_id, function_name, args, .. } => {
            if call_id.is_empty() {
                return Err(ProtoError::InvalidMessage { reason: "empty call_id".into() });
            }
            check_function_name(function_name)?;
            check_payload(args)
        }
        ClientMessage::Presence { data, .. } => check_payload(data),
        ClientMessage::RtcOffer { target_user_id, sdp, .. }
        | ClientMessage::RtcAnswer { target_user_id, sdp, .. } => {
            check_target(target_user_id)?;
            check_value_size(sdp)
        }
        ClientMessage::RtcIceCandidate { target_user_id, candidate, .. } => {
            check_target(target_user_id)?;
            check_value_size(candidate)
        }
        ClientMessage::RemoteControlRequest { target_user_id, .. }
        | ClientMessage::RemoteControlResponse { target_user_id, .. } => {
            check_target(target_user_id)
        }
        _ => Ok(()),
    }
}

fn check_target(target_user_id: &str) -> Result<()> {
    if target_user_id.is_empty() {
        return Err(ProtoError::InvalidMessage { reason: "empty target_user_id".into() });
    }
    Ok(())
}

/// Structural validation of a decoded server message.
pub fn validate_server(msg: &ServerMessage) -> Result<()> {
    match msg {
        ServerMessage::Operation { op, .. } => op.validate(),
        ServerMessage::Sync { operations, .. } => {
            for op in operations {
                op.validate()?;
            }
            Ok(())
        }
        ServerMessage::Presence { data, .. } => check_payload(data),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;
    use crate::op::Operation;
    use serde_json::json;

    #[test]
    fn test_client_round_trip() {
        let op = Operation::set("node-a", vec!["x".into()], json!(1)).unwrap();
        let msg = ClientMessage::Operation { room_id: "lobby".into(), op };
        let encoded = encode_client(&msg).unwrap();
        let decoded = decode_client(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_server_round_trip() {
        let msg = ServerMessage::error(ErrorCode::RateLimited, "slow down", Some("r".into()));
        let encoded = encode_server(&msg).unwrap();
        let decoded = decode_server(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_oversize_rejected_on_decode() {
        let huge = format!(
            "{{\"type\":\"presence\",\"room_id\":\"r\",\"data\":\"{}\"}}",
            "x".repeat(MAX_MESSAGE_SIZE)
        );
        assert!(matches!(
            decode_client(&huge).unwrap_err(),
            ProtoError::MessageTooLong { .. }
        ));
    }

    #[test]
    fn test_size_cap_configurable() {
        let msg = r#"{"type":"ping"}"#;
        assert!(decode_client_bounded(msg, 4).is_err());
        assert!(decode_client_bounded(msg, 1024).is_ok());
    }

    #[test]
    fn test_malformed_envelope_is_typed() {
        let err = decode_client("{not json").unwrap_err();
        assert!(matches!(err, ProtoError::InvalidMessage { .. }));
    }

    #[test]
    fn test_dangerous_operation_rejected_at_decode() {
        let raw = json!({
            "type": "operation",
            "room_id": "r",
            "op": {
                "id": uuid::Uuid::new_v4(),
                "timestamp": 1.0,
                "node_id": "evil",
                "path": ["__proto__", "polluted"],
                "op_type": "set",
                "value": true,
            },
        })
        .to_string();
        assert!(matches!(
            decode_client(&raw).unwrap_err(),
            ProtoError::DangerousKey { .. }
        ));
    }

    #[test]
    fn test_bad_function_name_rejected() {
        let raw = json!({
            "type": "call",
            "room_id": "r",
            "call_id": "c1",
            "function_name": "rm -rf",
            "args": {},
        })
        .to_string();
        assert!(matches!(
            decode_client(&raw).unwrap_err(),
            ProtoError::InvalidFunctionName { .. }
        ));
    }

    #[test]
    fn test_empty_room_id_rejected() {
        let raw = json!({"type": "join", "room_id": ""}).to_string();
        assert!(decode_client(&raw).is_err());
    }

    #[test]
    fn test_dangerous_presence_rejected() {
        let raw = json!({
            "type": "presence",
            "room_id": "r",
            "data": {"constructor": {"oops": 1}},
        })
        .to_string();
        assert!(matches!(
            decode_client(&raw).unwrap_err(),
            ProtoError::DangerousKey { .. }
        ));
    }

    #[test]
    fn test_rtc_payload_is_opaque_but_bounded() {
        // Dangerous-looking keys inside SDP are fine: the broker relays
        // without inspecting. Only the size is checked.
        let raw = json!({
            "type": "rtc_offer",
            "room_id": "r",
            "target_user_id": "u2",
            "sdp": {"sdp": "v=0...", "notes": {"prototype": "harmless here"}},
        })
        .to_string();
        assert!(decode_client(&raw).is_ok());
    }
}
