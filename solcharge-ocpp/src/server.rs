//! WebSocket server for station connections.
//!
//! Accepts `ws://host:port/ocpp/<station-code>`, spawns one engine task per
//! connection and exposes the remote-control API consumed by the fleet
//! supervisor. Remote commands are fire-and-forget: the caller learns only
//! that the frame was handed to a live connection, compliance arrives later
//! as inbound events.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tracing::{info, warn};

use solcharge_core::{
    AuditEvent, ChargingSession, CoreError, SessionCode, SessionService, Store, UserId, VehicleId,
};

use crate::engine::{EngineConfig, StationConnection};
use crate::messages::{
    Action, Call, OcppError, RemoteStartTransactionRequest, RemoteStopTransactionRequest,
    ResetKind, ResetRequest,
};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};

/// Subprotocol echoed back when a station offers it
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

#[derive(Debug, Clone)]
pub struct OcppServerConfig {
    /// Listen address, e.g. "0.0.0.0:9000"
    pub bind_addr: String,
    pub engine: EngineConfig,
}

impl Default for OcppServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

/// Station-side protocol server
pub struct OcppServer {
    config: OcppServerConfig,
    registry: Arc<ConnectionRegistry>,
    sessions: SessionService,
    store: Arc<dyn Store>,
    shutdown: watch::Receiver<bool>,
}

impl OcppServer {
    pub fn new(
        config: OcppServerConfig,
        sessions: SessionService,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let store = sessions.store().clone();
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            sessions,
            store,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until shutdown
    pub async fn serve(self: Arc<Self>) -> Result<(), OcppError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("OCPP server listening on {}", listener.local_addr()?);
        self.serve_on(listener).await
    }

    /// Serve on a pre-bound listener until the shutdown signal flips
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> Result<(), OcppError> {
        let mut shutdown = self.shutdown.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        connections.spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Cooperative shutdown: stop accepting, ask every connection to
        // close, wait for in-flight dispatches to drain.
        info!(
            connections = self.registry.len(),
            "OCPP server stopping"
        );
        self.registry.close_all();
        while connections.join_next().await.is_some() {}
        info!("OCPP server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut path = String::new();
        let callback = |req: &Request, mut resp: Response| {
            path = req.uri().path().to_string();
            let offered = req
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(|protos| protos.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL))
                .unwrap_or(false);
            if offered {
                resp.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(OCPP_SUBPROTOCOL),
                );
            }
            Ok(resp)
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer, error = %e, "websocket handshake failed");
                return;
            }
        };

        // Station identity is the last path segment
        let station = match path.rsplit('/').next().filter(|s| !s.is_empty()) {
            Some(s) => s.to_string(),
            None => {
                warn!(peer = %peer, path = %path, "connection without station id rejected");
                return;
            }
        };

        let (tx, rx) = mpsc::channel::<Outbound>(64);
        let handle = ConnectionHandle::new(station.clone(), tx);
        let conn_id = handle.conn_id;
        if let Some(old) = self.registry.register(handle) {
            info!(station = %station, displaced = %old.conn_id, "displaced previous connection");
        }
        info!(station = %station, peer = %peer, "station connected");

        let engine = StationConnection::new(
            station,
            conn_id,
            self.sessions.clone(),
            self.registry.clone(),
            self.config.engine.clone(),
        );
        engine.run(ws, rx, self.shutdown.clone()).await;
    }

    /// Request a remote start. Pre-creates the `preparing` session unless
    /// the station already has one, so a duplicate command is still sent but
    /// can never mint a second session.
    pub async fn remote_start(
        &self,
        station: &str,
        user_id: UserId,
        vehicle_id: VehicleId,
    ) -> Result<SessionCode, CoreError> {
        let sender = self.registry.sender(station)?;

        let session_code = match self.store.active_session_for_station(station) {
            Some(existing) => existing.session_code,
            None => {
                self.sessions
                    .start(user_id, station, vehicle_id, None)?
                    .session_code
            }
        };

        let call = Call::new(
            Action::RemoteStartTransaction,
            RemoteStartTransactionRequest {
                id_tag: format!("USER{}", user_id),
                connector_id: 1,
            },
        )
        .map_err(|e| CoreError::MalformedMessage(e.to_string()))?;

        sender
            .send(Outbound::Call(call))
            .await
            .map_err(|_| CoreError::DeviceNotConnected(station.to_string()))?;

        self.store.record_event(AuditEvent::info(
            "ocpp",
            "remote start requested",
            serde_json::json!({
                "station": station,
                "user_id": user_id,
                "session_code": session_code,
            }),
        ));
        Ok(session_code)
    }

    /// Request a remote stop of the station's active transaction
    pub async fn remote_stop(&self, station: &str) -> Result<i64, CoreError> {
        let sender = self.registry.sender(station)?;
        let session = self
            .store
            .active_session_for_station(station)
            .ok_or_else(|| CoreError::NoActiveSession(format!("station {}", station)))?;

        let call = Call::new(
            Action::RemoteStopTransaction,
            RemoteStopTransactionRequest {
                transaction_id: session.transaction_id,
            },
        )
        .map_err(|e| CoreError::MalformedMessage(e.to_string()))?;

        sender
            .send(Outbound::Call(call))
            .await
            .map_err(|_| CoreError::DeviceNotConnected(station.to_string()))?;

        self.store.record_event(AuditEvent::info(
            "ocpp",
            "remote stop requested",
            serde_json::json!({
                "station": station,
                "transaction_id": session.transaction_id,
            }),
        ));
        Ok(session.transaction_id)
    }

    /// Request a station reset
    pub async fn reset_station(&self, station: &str, kind: ResetKind) -> Result<(), CoreError> {
        let sender = self.registry.sender(station)?;
        let call = Call::new(Action::Reset, ResetRequest { kind })
            .map_err(|e| CoreError::MalformedMessage(e.to_string()))?;

        sender
            .send(Outbound::Call(call))
            .await
            .map_err(|_| CoreError::DeviceNotConnected(station.to_string()))?;

        self.store.record_event(AuditEvent::info(
            "ocpp",
            "station reset requested",
            serde_json::json!({ "station": station, "kind": format!("{:?}", kind) }),
        ));
        Ok(())
    }

    /// Active session lookup used by REST status queries
    pub fn active_session(&self, station: &str) -> Option<ChargingSession> {
        self.store.active_session_for_station(station)
    }

    pub fn is_connected(&self, station: &str) -> bool {
        self.registry.is_connected(station)
    }

    pub fn connected_stations(&self) -> Vec<String> {
        self.registry.connected_stations()
    }
}
