//! Device fleet supervisor.
//!
//! Owns both device fleets: the OCPP server for stations and one polling
//! task per configured inverter. Exposes the control surface the REST
//! collaborator consumes and coordinates cooperative shutdown: flip the
//! signal, let in-flight work drain, join every task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use solcharge_core::{
    ChargingSession, CoreError, Inverter, InverterId, InverterStatus, SessionCode,
    SessionService, Station, Store, UserId, VehicleId,
};
use solcharge_modbus::{
    InverterEndpoint, InverterPoller, LinkConnector, PollerConfig, PollerHandle,
    TcpLinkConnector,
};
use solcharge_ocpp::{OcppServer, OcppServerConfig, ResetKind};

/// A station with its live connectivity view
#[derive(Debug, Clone, Serialize)]
pub struct StationState {
    #[serde(flatten)]
    pub station: Station,
    pub connected: bool,
    pub online: bool,
}

/// Aggregate production across the inverter fleet
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SolarProduction {
    pub total_power_kw: f64,
    pub total_daily_energy_kwh: f64,
    pub total_energy_kwh: f64,
    pub active_inverters: usize,
    pub total_inverters: usize,
}

pub struct FleetSupervisor {
    store: Arc<dyn Store>,
    sessions: SessionService,
    server: Arc<OcppServer>,
    poller_config: PollerConfig,
    pollers: HashMap<InverterId, PollerHandle>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl FleetSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        ocpp_config: OcppServerConfig,
        poller_config: PollerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions = SessionService::new(store.clone());
        let server = Arc::new(OcppServer::new(ocpp_config, sessions.clone(), shutdown_rx));
        Self {
            store,
            sessions,
            server,
            poller_config,
            pollers: HashMap::new(),
            tasks: Vec::new(),
            shutdown_tx,
        }
    }

    /// Start the OCPP listener and one poller per configured inverter
    pub async fn start(&mut self) {
        let server = self.server.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!(error = %e, "ocpp server failed");
            }
        }));

        let connector: Arc<dyn LinkConnector> = Arc::new(TcpLinkConnector);
        let inverters = self.store.inverters();
        for inverter in &inverters {
            let poller = InverterPoller::new(
                inverter.code.clone(),
                InverterEndpoint {
                    host: inverter.host.clone(),
                    port: inverter.port,
                    unit_id: inverter.unit_id,
                },
                self.store.clone(),
                connector.clone(),
                self.poller_config.clone(),
            );
            let (handle, task) = poller.spawn(self.shutdown_tx.subscribe());
            self.pollers.insert(inverter.code.clone(), handle);
            self.tasks.push(task);
        }

        info!(
            stations = self.store.stations().len(),
            inverters = inverters.len(),
            "fleet supervisor started"
        );
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    // --- Station control pass-through -------------------------------------

    pub async fn remote_start(
        &self,
        station: &str,
        user_id: UserId,
        vehicle_id: VehicleId,
    ) -> Result<SessionCode, CoreError> {
        self.server.remote_start(station, user_id, vehicle_id).await
    }

    pub async fn remote_stop(&self, station: &str) -> Result<i64, CoreError> {
        self.server.remote_stop(station).await
    }

    pub async fn reset_station(&self, station: &str, kind: ResetKind) -> Result<(), CoreError> {
        self.server.reset_station(station, kind).await
    }

    // --- Inverter control pass-through ------------------------------------

    pub async fn restart_inverter(&self, code: &str) -> Result<(), CoreError> {
        self.poller(code)?.restart().await
    }

    pub async fn set_inverter_parameter(
        &self,
        code: &str,
        name: &str,
        value: f64,
    ) -> Result<(), CoreError> {
        self.poller(code)?.set_parameter(name, value).await
    }

    fn poller(&self, code: &str) -> Result<&PollerHandle, CoreError> {
        self.pollers
            .get(code)
            .ok_or_else(|| CoreError::UnknownInverter(code.to_string()))
    }

    // --- Status queries ----------------------------------------------------

    pub fn station_states(&self) -> Vec<StationState> {
        let now = Utc::now();
        self.store
            .stations()
            .into_iter()
            .map(|station| StationState {
                connected: self.server.is_connected(&station.code),
                online: station.is_online(now),
                station,
            })
            .collect()
    }

    pub fn inverter_states(&self) -> Vec<Inverter> {
        self.store.inverters()
    }

    pub fn active_session(&self, station: &str) -> Option<ChargingSession> {
        self.store.active_session_for_station(station)
    }

    /// Fleet-wide production rollup over inverters currently online
    pub fn solar_production(&self) -> SolarProduction {
        let inverters = self.store.inverters();
        let mut production = SolarProduction {
            total_power_kw: 0.0,
            total_daily_energy_kwh: 0.0,
            total_energy_kwh: 0.0,
            active_inverters: 0,
            total_inverters: inverters.len(),
        };
        for inverter in &inverters {
            if inverter.status == InverterStatus::Online {
                production.active_inverters += 1;
                production.total_power_kw += inverter.snapshot.power_kw.unwrap_or(0.0);
                production.total_daily_energy_kwh +=
                    inverter.snapshot.daily_energy_kwh.unwrap_or(0.0);
                production.total_energy_kwh += inverter.snapshot.total_energy_kwh.unwrap_or(0.0);
            }
        }
        production
    }

    /// Cooperative shutdown: stop accepting and polling, close every
    /// connection, wait for all tasks.
    pub async fn shutdown(mut self) {
        info!("fleet supervisor stopping");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("fleet supervisor stopped");
    }
}
