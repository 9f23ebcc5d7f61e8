//! Per-connection protocol engine.
//!
//! One engine instance runs per live station connection, inside its own
//! task. The receive loop dispatches inbound CALLs synchronously, so message
//! ordering is preserved per device. Outbound requests arrive over the
//! registry channel and are tracked in the pending map until the station
//! answers or the stale sweep drops them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use solcharge_core::{
    CoreError, MessageDirection, MessageRecord, SessionService, StationId, StationStatus,
    StopReason, Store,
};

use crate::messages::*;
use crate::registry::{ConnectionRegistry, Outbound};

/// Engine tuning knobs shared by every connection
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Heartbeat interval handed to stations in BootNotification replies
    pub heartbeat_interval_secs: i64,
    /// Outbound requests pending longer than this are swept and logged
    pub request_timeout: Duration,
    /// Cadence of the stale-pending sweep
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Map the station-reported status vocabulary onto our status enum.
/// Anything unrecognized is treated as offline.
pub fn map_station_status(reported: &str) -> StationStatus {
    match reported {
        "Available" => StationStatus::Available,
        "Occupied" => StationStatus::Occupied,
        "Faulted" => StationStatus::Offline,
        "Unavailable" => StationStatus::Maintenance,
        _ => StationStatus::Offline,
    }
}

/// An outbound request awaiting its correlated response
struct PendingRequest {
    action: String,
    issued_at: Instant,
}

enum DispatchOutcome {
    Reply(Value),
    Fault(ErrorCode, String),
}

/// Protocol engine for a single station connection
pub struct StationConnection {
    station: StationId,
    conn_id: Uuid,
    sessions: SessionService,
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    config: EngineConfig,
    pending: HashMap<String, PendingRequest>,
}

impl StationConnection {
    pub fn new(
        station: StationId,
        conn_id: Uuid,
        sessions: SessionService,
        registry: Arc<ConnectionRegistry>,
        config: EngineConfig,
    ) -> Self {
        let store = sessions.store().clone();
        Self {
            station,
            conn_id,
            sessions,
            store,
            registry,
            config,
            pending: HashMap::new(),
        }
    }

    /// Run the connection to completion. Consumes the WebSocket; removes the
    /// connection from the registry on the way out.
    pub async fn run<S>(
        mut self,
        ws: WebSocketStream<S>,
        mut rx: mpsc::Receiver<Outbound>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        // Probe the station; an Accepted reply marks it available.
        match Call::new(
            Action::BootNotification,
            serde_json::json!({ "chargePointSerialNumber": self.station }),
        ) {
            Ok(boot) => {
                if let Err(e) = self.send_call(&mut sink, boot).await {
                    warn!(station = %self.station, error = %e, "boot probe failed");
                    self.registry.remove(&self.station, self.conn_id);
                    return;
                }
            }
            Err(e) => error!(station = %self.station, error = %e, "boot probe encode failed"),
        }

        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.on_text(&mut sink, text.as_str()).await {
                            warn!(station = %self.station, error = %e, "send failed, closing");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(station = %self.station, "station closed connection");
                        break;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled by tungstenite
                        debug!(station = %self.station, "ping");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(station = %self.station, error = %e, "websocket error");
                        break;
                    }
                },

                outbound = rx.recv() => match outbound {
                    Some(Outbound::Call(call)) => {
                        if let Err(e) = self.send_call(&mut sink, call).await {
                            warn!(station = %self.station, error = %e, "outbound send failed, closing");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },

                _ = sweep.tick() => self.sweep_pending(),

                changed = shutdown.changed() => {
                    // A dropped sender means the supervisor is gone; stop too
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }

        self.registry.remove(&self.station, self.conn_id);
        info!(station = %self.station, "station disconnected");
    }

    /// Handle one inbound frame. Only transport-level send failures bubble
    /// up; everything else is logged and absorbed here.
    async fn on_text<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        text: &str,
    ) -> Result<(), OcppError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let message = match OcppMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(station = %self.station, error = %e, "malformed message dropped");
                return Ok(());
            }
        };
        self.record(MessageDirection::Incoming, &message);

        match message {
            OcppMessage::Call(call) => {
                let reply = match self.dispatch(&call.action, call.payload) {
                    DispatchOutcome::Reply(payload) => {
                        match CallResult::new(call.message_id, payload) {
                            Ok(result) => OcppMessage::CallResult(result),
                            Err(e) => {
                                error!(station = %self.station, error = %e, "reply encode failed");
                                return Ok(());
                            }
                        }
                    }
                    DispatchOutcome::Fault(code, description) => OcppMessage::CallError(
                        CallError::new(call.message_id, code, description),
                    ),
                };
                self.send_message(sink, reply).await
            }
            OcppMessage::CallResult(result) => {
                self.on_call_result(result);
                Ok(())
            }
            OcppMessage::CallError(fault) => {
                match self.pending.remove(&fault.message_id) {
                    Some(pending) => error!(
                        station = %self.station,
                        action = %pending.action,
                        code = ?fault.error_code,
                        description = %fault.error_description,
                        "station faulted our request"
                    ),
                    None => warn!(
                        station = %self.station,
                        id = %fault.message_id,
                        "fault with unmatched correlation id discarded"
                    ),
                }
                Ok(())
            }
        }
    }

    /// Correlate a response against the pending map
    fn on_call_result(&mut self, result: CallResult) {
        let pending = match self.pending.remove(&result.message_id) {
            Some(p) => p,
            None => {
                warn!(
                    station = %self.station,
                    id = %result.message_id,
                    "response with unmatched correlation id discarded"
                );
                return;
            }
        };

        match pending.action.as_str() {
            "BootNotification" => match result.parse_payload::<BootNotificationResponse>() {
                Ok(resp) if resp.status == RegistrationStatus::Accepted => {
                    info!(station = %self.station, "boot accepted, station available");
                    if let Err(e) = self
                        .store
                        .set_station_status(&self.station, StationStatus::Available)
                    {
                        warn!(station = %self.station, error = %e, "status update failed");
                    }
                    let _ = self.store.touch_station_heartbeat(&self.station, Utc::now());
                }
                Ok(resp) => {
                    warn!(station = %self.station, status = ?resp.status, "boot not accepted, status unresolved");
                }
                Err(e) => {
                    warn!(station = %self.station, error = %e, "unreadable boot reply");
                }
            },
            action => {
                // Remote start/stop/reset acks mean "received", not
                // "complied"; compliance shows up as later events.
                debug!(station = %self.station, action = %action, "request acknowledged");
            }
        }
    }

    fn dispatch(&mut self, action: &str, payload: Value) -> DispatchOutcome {
        let parsed: Action = match action.parse() {
            Ok(a) => a,
            Err(_) => {
                warn!(station = %self.station, action = %action, "unknown action");
                return DispatchOutcome::Fault(
                    ErrorCode::NotSupported,
                    format!("Action {} not supported", action),
                );
            }
        };

        let outcome = match parsed {
            Action::BootNotification => self.handle_boot(payload),
            Action::Heartbeat => self.handle_heartbeat(),
            Action::StatusNotification => self.handle_status(payload),
            Action::Authorize => self.handle_authorize(payload),
            Action::StartTransaction => return self.handle_start(payload),
            Action::StopTransaction => self.handle_stop(payload),
            Action::MeterValues => self.handle_meter_values(payload),
            // Server-initiated actions have no inbound meaning
            Action::RemoteStartTransaction | Action::RemoteStopTransaction | Action::Reset => {
                return DispatchOutcome::Fault(
                    ErrorCode::NotSupported,
                    format!("Action {} is server-initiated", parsed),
                )
            }
        };

        match outcome {
            Ok(payload) => DispatchOutcome::Reply(payload),
            Err(e) => {
                error!(station = %self.station, action = %action, error = %e, "handler failed");
                DispatchOutcome::Fault(ErrorCode::InternalError, e.to_string())
            }
        }
    }

    fn handle_boot(&self, payload: Value) -> Result<Value, CoreError> {
        let req: BootNotificationRequest = decode(payload)?;
        if let Some(ref firmware) = req.firmware_version {
            self.store.set_station_firmware(&self.station, firmware)?;
        }
        self.store
            .touch_station_heartbeat(&self.station, Utc::now())?;
        self.store
            .set_station_status(&self.station, StationStatus::Available)?;

        encode(BootNotificationResponse {
            status: RegistrationStatus::Accepted,
            current_time: Utc::now(),
            interval: self.config.heartbeat_interval_secs,
        })
    }

    /// Heartbeat refreshes the liveness timestamp and nothing else; replays
    /// are harmless.
    fn handle_heartbeat(&self) -> Result<Value, CoreError> {
        self.store
            .touch_station_heartbeat(&self.station, Utc::now())?;
        encode(HeartbeatResponse {
            current_time: Utc::now(),
        })
    }

    fn handle_status(&self, payload: Value) -> Result<Value, CoreError> {
        let req: StatusNotificationRequest = decode(payload)?;
        let status = map_station_status(&req.status);
        self.store.set_station_status(&self.station, status)?;
        debug!(station = %self.station, reported = %req.status, mapped = %status, "status notification");
        Ok(Value::Object(serde_json::Map::new()))
    }

    fn handle_authorize(&self, payload: Value) -> Result<Value, CoreError> {
        // Token validation belongs to the REST collaborator; the device
        // layer accepts and lets StartTransaction enforce the invariants.
        let req: AuthorizeRequest = decode(payload)?;
        debug!(station = %self.station, id_tag = %req.id_tag, "authorize");
        encode(AuthorizeResponse {
            id_tag_info: IdTagInfo {
                status: AuthorizationStatus::Accepted,
            },
        })
    }

    fn handle_start(&self, payload: Value) -> DispatchOutcome {
        let req: StartTransactionRequest = match decode(payload) {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::Fault(ErrorCode::InternalError, e.to_string()),
        };

        match self.sessions.begin_from_station(&self.station, req.meter_start) {
            Ok(session) => {
                info!(
                    station = %self.station,
                    session = %session.session_code,
                    transaction = session.transaction_id,
                    "transaction started"
                );
                match encode(StartTransactionResponse {
                    transaction_id: session.transaction_id,
                    id_tag_info: IdTagInfo {
                        status: AuthorizationStatus::Accepted,
                    },
                }) {
                    Ok(v) => DispatchOutcome::Reply(v),
                    Err(e) => DispatchOutcome::Fault(ErrorCode::InternalError, e.to_string()),
                }
            }
            // Invariant rejection: answer Invalid without minting a session
            Err(CoreError::StationUnavailable(_)) => {
                warn!(station = %self.station, "start rejected, active session exists");
                match encode(StartTransactionResponse {
                    transaction_id: 0,
                    id_tag_info: IdTagInfo {
                        status: AuthorizationStatus::Invalid,
                    },
                }) {
                    Ok(v) => DispatchOutcome::Reply(v),
                    Err(e) => DispatchOutcome::Fault(ErrorCode::InternalError, e.to_string()),
                }
            }
            Err(e) => {
                error!(station = %self.station, error = %e, "start transaction failed");
                DispatchOutcome::Fault(ErrorCode::InternalError, e.to_string())
            }
        }
    }

    fn handle_stop(&self, payload: Value) -> Result<Value, CoreError> {
        let req: StopTransactionRequest = decode(payload)?;
        let reason = StopReason::from_wire(req.reason.as_deref().unwrap_or("user"));

        match self
            .sessions
            .settle_from_station(req.transaction_id, req.meter_stop, reason)?
        {
            Some(session) => info!(
                station = %self.station,
                session = %session.session_code,
                energy = session.energy_delivered,
                "transaction settled"
            ),
            // Station retries are acknowledged so they do not wedge
            None => warn!(
                station = %self.station,
                transaction = req.transaction_id,
                "stop for unknown transaction acknowledged"
            ),
        }

        encode(StopTransactionResponse {
            id_tag_info: IdTagInfo {
                status: AuthorizationStatus::Accepted,
            },
        })
    }

    fn handle_meter_values(&self, payload: Value) -> Result<Value, CoreError> {
        let req: MeterValuesRequest = decode(payload)?;
        if let (Some(transaction_id), Some(wh)) = (req.transaction_id, req.energy_register_wh()) {
            match self.sessions.update_meter(transaction_id, wh) {
                Ok(()) => {}
                Err(CoreError::ProtocolViolation(msg)) => {
                    warn!(station = %self.station, "{}", msg);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Value::Object(serde_json::Map::new()))
    }

    async fn send_call<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        call: Call,
    ) -> Result<(), OcppError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.pending.insert(
            call.message_id.clone(),
            PendingRequest {
                action: call.action.clone(),
                issued_at: Instant::now(),
            },
        );
        self.send_message(sink, OcppMessage::Call(call)).await
    }

    async fn send_message<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        message: OcppMessage,
    ) -> Result<(), OcppError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let text = message.to_text()?;
        self.record(MessageDirection::Outgoing, &message);
        debug!(station = %self.station, frame = %text, "send");
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| OcppError::WebSocket(e.to_string()))
    }

    /// Stale pending entries are a protocol violation: log as error, drop,
    /// keep the connection alive.
    fn sweep_pending(&mut self) {
        let timeout = self.config.request_timeout;
        let station = self.station.clone();
        self.pending.retain(|id, pending| {
            if pending.issued_at.elapsed() > timeout {
                error!(
                    station = %station,
                    action = %pending.action,
                    id = %id,
                    "pending request timed out, dropping"
                );
                false
            } else {
                true
            }
        });
    }

    fn record(&self, direction: MessageDirection, message: &OcppMessage) {
        let (action, payload) = match message {
            OcppMessage::Call(c) => (c.action.clone(), c.payload.clone()),
            OcppMessage::CallResult(r) => ("CallResult".to_string(), r.payload.clone()),
            OcppMessage::CallError(e) => (
                "CallError".to_string(),
                serde_json::json!({
                    "errorCode": format!("{:?}", e.error_code),
                    "errorDescription": e.error_description,
                }),
            ),
        };
        self.store.record_message(MessageRecord {
            station_code: self.station.clone(),
            direction,
            message_type: message.message_type() as u8,
            action,
            message_id: message.message_id().to_string(),
            payload,
            at: Utc::now(),
        });
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, CoreError> {
    serde_json::from_value(payload).map_err(|e| CoreError::MalformedMessage(e.to_string()))
}

fn encode<T: serde::Serialize>(payload: T) -> Result<Value, CoreError> {
    serde_json::to_value(payload).map_err(|e| CoreError::MalformedMessage(e.to_string()))
}
