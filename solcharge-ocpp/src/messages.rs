//! OCPP-J message framing
//!
//! Stations speak JSON arrays over WebSocket with a numeric type tag:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Either side may initiate a CALL; the message id correlates the eventual
//! CALLRESULT/CALLERROR back to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// Error codes carried by CALLERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    NotImplemented,
    NotSupported,
    ProtocolError,
    SecurityError,
}

/// Known action names. Decoded CALLs keep the raw string so an unknown
/// action reaches the dispatcher (NotSupported fault) instead of failing
/// the decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    // Station -> server
    BootNotification,
    Heartbeat,
    StatusNotification,
    Authorize,
    StartTransaction,
    StopTransaction,
    MeterValues,

    // Server -> station
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "Authorize" => Ok(Action::Authorize),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StopTransaction" => Ok(Action::StopTransaction),
            "MeterValues" => Ok(Action::MeterValues),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "Reset" => Ok(Action::Reset),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// CALL frame (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a CALL with a fresh correlation id
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Wire format: [2, messageId, action, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// CALLRESULT frame (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Wire format: [3, messageId, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }

    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// CALLERROR frame
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// Any parsed frame
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse a frame. Structural mismatches (wrong type tag, wrong element
    /// count, wrong element types) are malformed; the engine logs and drops.
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| OcppError::Malformed(format!("not a JSON array: {}", e)))?;

        if array.is_empty() {
            return Err(OcppError::Malformed("empty array".to_string()));
        }

        let msg_type = array[0]
            .as_i64()
            .ok_or_else(|| OcppError::Malformed("type tag is not an integer".to_string()))?;

        let element = |i: usize, what: &str| -> Result<&str, OcppError> {
            array
                .get(i)
                .and_then(Value::as_str)
                .ok_or_else(|| OcppError::Malformed(format!("{} is not a string", what)))
        };

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(OcppError::Malformed(format!(
                        "CALL has {} elements, expected 4",
                        array.len()
                    )));
                }
                Ok(OcppMessage::Call(Call {
                    message_id: element(1, "message id")?.to_string(),
                    action: element(2, "action")?.to_string(),
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(OcppError::Malformed(format!(
                        "CALLRESULT has {} elements, expected 3",
                        array.len()
                    )));
                }
                Ok(OcppMessage::CallResult(CallResult {
                    message_id: element(1, "message id")?.to_string(),
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(OcppError::Malformed(format!(
                        "CALLERROR has {} elements, expected 5",
                        array.len()
                    )));
                }
                let error_code = serde_json::from_value(array[2].clone())
                    .unwrap_or(ErrorCode::GenericError);
                Ok(OcppMessage::CallError(CallError {
                    message_id: element(1, "message id")?.to_string(),
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array[4].clone(),
                }))
            }
            other => Err(OcppError::Malformed(format!(
                "unknown message type {}",
                other
            ))),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    pub fn to_text(&self) -> Result<String, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_text(),
            OcppMessage::CallResult(r) => r.to_text(),
            OcppMessage::CallError(e) => e.to_text(),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload types, camelCase on the wire
// ---------------------------------------------------------------------------

/// The measurand carrying the cumulative energy register in MeterValues
pub const ENERGY_MEASURAND: &str = "Energy.Active.Import.Register";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: Option<String>,
    pub charge_point_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    pub interval: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: Option<i64>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: Option<i64>,
    pub id_tag: Option<String>,
    pub meter_start: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub transaction_id: i64,
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    pub transaction_id: i64,
    pub meter_stop: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub sampled_value: Vec<SampledValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    pub id_tag: String,
    pub connector_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetKind {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetKind,
}

impl MeterValuesRequest {
    /// Extract the cumulative energy register reading, if any sample carries
    /// the energy measurand.
    pub fn energy_register_wh(&self) -> Option<f64> {
        self.meter_value
            .iter()
            .flat_map(|mv| mv.sampled_value.iter())
            .find(|sv| sv.measurand.as_deref() == Some(ENERGY_MEASURAND))
            .and_then(|sv| sv.value.parse::<f64>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_round_trip() {
        let call = Call::new(
            Action::StartTransaction,
            StartTransactionRequest {
                connector_id: Some(1),
                id_tag: Some("TAG42".to_string()),
                meter_start: 1000.0,
                timestamp: None,
            },
        )
        .unwrap();

        let text = call.to_text().unwrap();
        match OcppMessage::parse(&text).unwrap() {
            OcppMessage::Call(parsed) => {
                assert_eq!(parsed.message_id, call.message_id);
                assert_eq!(parsed.action, "StartTransaction");
                assert_eq!(parsed.payload, call.payload);
            }
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_call_result_round_trip() {
        let result = CallResult::new(
            "msg-1",
            BootNotificationResponse {
                status: RegistrationStatus::Accepted,
                current_time: Utc::now(),
                interval: 300,
            },
        )
        .unwrap();

        let text = result.to_text().unwrap();
        match OcppMessage::parse(&text).unwrap() {
            OcppMessage::CallResult(parsed) => {
                assert_eq!(parsed.message_id, "msg-1");
                assert_eq!(parsed.payload, result.payload);
            }
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn test_call_error_round_trip() {
        let error = CallError::new("msg-2", ErrorCode::NotSupported, "no such action");
        let text = error.to_text().unwrap();
        match OcppMessage::parse(&text).unwrap() {
            OcppMessage::CallError(parsed) => {
                assert_eq!(parsed.message_id, "msg-2");
                assert_eq!(parsed.error_code, ErrorCode::NotSupported);
                assert_eq!(parsed.error_description, "no such action");
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_still_parses() {
        let msg = OcppMessage::parse(r#"[2, "m1", "FancyNewAction", {}]"#).unwrap();
        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.action, "FancyNewAction");
                assert!("FancyNewAction".parse::<Action>().is_err());
            }
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_inputs() {
        let cases = [
            "not json",
            "{}",
            "[]",
            r#"["two", "m1", "Heartbeat", {}]"#,
            r#"[7, "m1", {}]"#,
            r#"[2, "m1", "Heartbeat"]"#,
            r#"[2, "m1", 42, {}]"#,
            r#"[3, "m1"]"#,
            r#"[4, "m1", "GenericError", "oops"]"#,
        ];
        for case in cases {
            assert!(
                matches!(OcppMessage::parse(case), Err(OcppError::Malformed(_))),
                "case should be malformed: {}",
                case
            );
        }
    }

    #[test]
    fn test_meter_values_energy_extraction() {
        let json = r#"{
            "connectorId": 1,
            "transactionId": 7,
            "meterValue": [{
                "sampledValue": [
                    {"value": "230.1", "measurand": "Voltage"},
                    {"value": "2500", "measurand": "Energy.Active.Import.Register", "unit": "Wh"}
                ]
            }]
        }"#;
        let req: MeterValuesRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.transaction_id, Some(7));
        assert_eq!(req.energy_register_wh(), Some(2500.0));
    }

    #[test]
    fn test_reset_kind_wire_name() {
        let text = serde_json::to_string(&ResetRequest {
            kind: ResetKind::Soft,
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"Soft"}"#);
    }
}
