//! The broker-protocol JSON envelope and its validation rules (§4.D.1).

use mesh_error::{ErrorCode, MeshError};
use mesh_ids::{ConversationId, MessageId, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum MessageType {
    BackendAssociateTargetPeerId,
    AsyncRpcDispatch,
    Notification,
}

/// `authenticationToken{type, data}` or `securityPrincipal{sid, ...}`,
/// exactly one of which may be present on an envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationToken {
    #[serde(rename = "type")]
    pub token_type: String,
    pub data: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPrincipal {
    pub sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalIdentityInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<AuthenticationToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_principal: Option<SecurityPrincipal>,
}

impl PrincipalIdentityInfo {
    fn is_exactly_one(&self) -> bool {
        self.authentication_token.is_some() ^ self.security_principal.is_some()
    }
}

/// `asyncRpcRequest` / `asyncRpcResponse`, exactly one for `AsyncRpcDispatch`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncRpcPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_rpc_request: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_rpc_response: Option<serde_json::Value>,
}

impl AsyncRpcPayload {
    fn is_exactly_one(&self) -> bool {
        self.async_rpc_request.is_some() ^ self.async_rpc_response.is_some()
    }
}

/// Structured envelope: `{messageType, messageId, conversationId,
/// sourcePeerId, targetPeerId, principalIdentityInfo?}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerProtocolMessage {
    pub message_type: MessageType,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub source_peer_id: PeerId,
    pub target_peer_id: PeerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_identity_info: Option<PrincipalIdentityInfo>,
}

impl BrokerProtocolMessage {
    pub fn associate(source: PeerId, target: PeerId) -> Self {
        Self {
            message_type: MessageType::BackendAssociateTargetPeerId,
            message_id: MessageId::new(),
            conversation_id: ConversationId::new(),
            source_peer_id: source,
            target_peer_id: target,
            principal_identity_info: None,
        }
    }

    /// Serialises this envelope as packed JSON (no extraneous whitespace),
    /// per the wire format's requirement.
    pub fn to_packed_json(&self) -> Result<Vec<u8>, MeshError> {
        serde_json::to_vec(self)
            .map_err(|e| MeshError::fatal(format!("failed to serialize broker message: {e}")))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, MeshError> {
        serde_json::from_slice(bytes).map_err(|e| {
            MeshError::server(
                ErrorCode::ProtocolValidationFailed,
                format!("malformed broker protocol message: {e}"),
            )
        })
    }
}

/// A valid broker-protocol message has non-empty `messageId`, non-empty
/// `conversationId`, a `messageType` from the enumerated set (guaranteed by
/// the type system once deserialisation succeeds). If
/// `principalIdentityInfo` is present it carries exactly one of
/// `authenticationToken` or `securityPrincipal`; tokens must have non-empty
/// `type`/`data`; principals must have non-empty `sid`.
pub fn validate_envelope(message: &BrokerProtocolMessage) -> Result<(), MeshError> {
    if message.message_id.is_nil() {
        return Err(protocol_validation_failed("messageId must not be nil"));
    }
    if message.conversation_id.is_nil() {
        return Err(protocol_validation_failed("conversationId must not be nil"));
    }
    if let Some(info) = &message.principal_identity_info {
        if !info.is_exactly_one() {
            return Err(protocol_validation_failed(
                "principalIdentityInfo must carry exactly one of authenticationToken or \
                 securityPrincipal",
            ));
        }
        if let Some(token) = &info.authentication_token {
            if token.token_type.is_empty() || token.data.is_empty() {
                return Err(protocol_validation_failed(
                    "authenticationToken requires non-empty type and data",
                ));
            }
        }
        if let Some(principal) = &info.security_principal {
            if principal.sid.is_empty() {
                return Err(protocol_validation_failed("securityPrincipal requires non-empty sid"));
            }
        }
    }
    Ok(())
}

/// For `AsyncRpcDispatch`, the payload must carry exactly one of request or
/// response.
pub fn validate_async_rpc_payload(payload: &AsyncRpcPayload) -> Result<(), MeshError> {
    if !payload.is_exactly_one() {
        return Err(protocol_validation_failed(
            "AsyncRpcDispatch payload must carry exactly one of asyncRpcRequest or \
             asyncRpcResponse",
        ));
    }
    Ok(())
}

fn protocol_validation_failed(message: impl Into<String>) -> MeshError {
    MeshError::server(ErrorCode::ProtocolValidationFailed, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn associate_message_round_trips_through_json() {
        let source = PeerId::new();
        let target = PeerId::new();
        let message = BrokerProtocolMessage::associate(source, target);
        let json = message.to_packed_json().expect("serialize");
        assert!(!json.iter().any(|&b| b == b'\n'), "packed JSON must have no newlines");
        let decoded = BrokerProtocolMessage::from_json(&json).expect("deserialize");
        assert_eq!(decoded.source_peer_id, source);
        assert_eq!(decoded.target_peer_id, target);
        assert!(matches!(decoded.message_type, MessageType::BackendAssociateTargetPeerId));
        validate_envelope(&decoded).expect("valid");
    }

    #[test]
    fn rejects_both_principal_variants_present() {
        let mut message = BrokerProtocolMessage::associate(PeerId::new(), PeerId::new());
        message.principal_identity_info = Some(PrincipalIdentityInfo {
            authentication_token: Some(AuthenticationToken {
                token_type: "bearer".into(),
                data: "abc".into(),
            }),
            security_principal: Some(SecurityPrincipal { sid: "S-1-5".into(), ..Default::default() }),
        });
        let err = validate_envelope(&message).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolValidationFailed);
    }

    #[test]
    fn rejects_empty_token_fields() {
        let mut message = BrokerProtocolMessage::associate(PeerId::new(), PeerId::new());
        message.principal_identity_info = Some(PrincipalIdentityInfo {
            authentication_token: Some(AuthenticationToken {
                token_type: String::new(),
                data: "abc".into(),
            }),
            security_principal: None,
        });
        assert!(validate_envelope(&message).is_err());
    }

    #[test]
    fn async_rpc_payload_requires_exactly_one_side() {
        let neither = AsyncRpcPayload::default();
        assert!(validate_async_rpc_payload(&neither).is_err());
        let both = AsyncRpcPayload {
            async_rpc_request: Some(serde_json::json!({})),
            async_rpc_response: Some(serde_json::json!({})),
        };
        assert!(validate_async_rpc_payload(&both).is_err());
        let request_only =
            AsyncRpcPayload { async_rpc_request: Some(serde_json::json!({})), ..Default::default() };
        assert!(validate_async_rpc_payload(&request_only).is_ok());
    }
}
