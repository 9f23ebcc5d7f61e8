//! Fleet configuration file.
//!
//! The persistence collaborator owns the real records; the daemon seeds its
//! in-memory store from a JSON file describing the fleet.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use solcharge_core::{
    ConnectorType, Inverter, InverterStatus, Station, StationStatus, Store, Tariff,
    TelemetrySnapshot, UserAccount, Vehicle,
};

fn default_ocpp_bind() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_ocpp_bind")]
    pub ocpp_bind: String,
    #[serde(default)]
    pub stations: Vec<StationSeed>,
    #[serde(default)]
    pub inverters: Vec<InverterSeed>,
    #[serde(default)]
    pub users: Vec<UserSeed>,
    #[serde(default)]
    pub vehicles: Vec<VehicleSeed>,
}

#[derive(Debug, Deserialize)]
pub struct StationSeed {
    pub code: String,
    pub name: String,
    pub power_rating_kw: f64,
    pub connector_type: ConnectorType,
    #[serde(default)]
    pub tariff: Tariff,
}

#[derive(Debug, Deserialize)]
pub struct InverterSeed {
    pub code: String,
    pub model: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub rated_power_kw: f64,
}

#[derive(Debug, Deserialize)]
pub struct UserSeed {
    pub id: i64,
    pub username: String,
    pub balance: f64,
}

#[derive(Debug, Deserialize)]
pub struct VehicleSeed {
    pub id: i64,
    pub user_id: i64,
    pub connector_type: ConnectorType,
    pub battery_capacity_kwh: f64,
    pub max_charging_power_kw: f64,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Seed the store. Devices start offline until their engines hear from
    /// them.
    pub fn seed(&self, store: &dyn Store) {
        for seed in &self.stations {
            store.put_station(Station {
                code: seed.code.clone(),
                name: seed.name.clone(),
                power_rating_kw: seed.power_rating_kw,
                connector_type: seed.connector_type,
                tariff: seed.tariff,
                firmware_version: None,
                last_heartbeat: None,
                status: StationStatus::Offline,
            });
        }
        for seed in &self.inverters {
            store.put_inverter(Inverter {
                code: seed.code.clone(),
                model: seed.model.clone(),
                host: seed.host.clone(),
                port: seed.port,
                unit_id: seed.unit_id,
                rated_power_kw: seed.rated_power_kw,
                status: InverterStatus::Offline,
                snapshot: TelemetrySnapshot::default(),
                last_update: None,
            });
        }
        for seed in &self.users {
            store.put_user(UserAccount {
                id: seed.id,
                username: seed.username.clone(),
                balance: seed.balance,
            });
        }
        for seed in &self.vehicles {
            store.put_vehicle(Vehicle {
                id: seed.id,
                user_id: seed.user_id,
                connector_type: seed.connector_type,
                battery_capacity_kwh: seed.battery_capacity_kwh,
                max_charging_power_kw: seed.max_charging_power_kw,
            });
        }
    }
}
