//! Persistence collaborator boundary.
//!
//! The core never talks to a database directly; it goes through the [`Store`]
//! trait. [`MemoryStore`] is the single-process implementation matching the
//! deployment model: one mutex over the whole state, so multi-row effects
//! (settlement, session start) are atomic by construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::*;

/// Direction of an OCPP message relative to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// One OCPP message as seen on the wire, kept for auditing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub station_code: StationId,
    pub direction: MessageDirection,
    pub message_type: u8,
    pub action: String,
    pub message_id: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Parameters for opening a session. `require_available` is set for
/// user-initiated starts; station-reported starts trust the hardware.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: UserId,
    pub vehicle_id: VehicleId,
    pub station_code: StationId,
    pub status: SessionStatus,
    pub meter_start: Option<f64>,
    pub require_available: bool,
}

/// Finalization of a session. Applied atomically together with the balance
/// debit and the ledger append.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub session_code: SessionCode,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub meter_stop: Option<f64>,
    pub energy_delivered: f64,
    pub energy_from_solar: f64,
    pub energy_from_grid: f64,
    pub cost_energy: f64,
    pub cost_service: f64,
    pub cost_total: f64,
    pub stop_reason: StopReason,
}

/// Interface the core expects from the persistence collaborator.
///
/// Implementations must make `start_session`, `settle` and `top_up` atomic:
/// no concurrent reader may observe a partial application.
pub trait Store: Send + Sync {
    // Stations
    fn station(&self, code: &str) -> Result<Station>;
    fn stations(&self) -> Vec<Station>;
    fn put_station(&self, station: Station);
    fn set_station_status(&self, code: &str, status: StationStatus) -> Result<()>;
    fn touch_station_heartbeat(&self, code: &str, at: DateTime<Utc>) -> Result<()>;
    fn set_station_firmware(&self, code: &str, firmware: &str) -> Result<()>;

    // Users and vehicles
    fn user(&self, id: UserId) -> Result<UserAccount>;
    fn put_user(&self, user: UserAccount);
    fn vehicle(&self, id: VehicleId) -> Result<Vehicle>;
    fn put_vehicle(&self, vehicle: Vehicle);

    // Sessions
    fn start_session(&self, new: NewSession) -> Result<ChargingSession>;
    fn session(&self, code: &str) -> Result<ChargingSession>;
    fn session_by_transaction(&self, transaction_id: i64) -> Option<ChargingSession>;
    fn active_session_for_station(&self, code: &str) -> Option<ChargingSession>;
    fn active_session_for_user(&self, user_id: UserId) -> Option<ChargingSession>;
    /// Any non-terminal session for the user, including suspended/finishing
    fn open_session_for_user(&self, user_id: UserId) -> Option<ChargingSession>;
    fn update_session(&self, session: &ChargingSession) -> Result<()>;
    fn settle(&self, settlement: &Settlement) -> Result<LedgerEntry>;
    fn fault_session(&self, code: &str, reason: StopReason) -> Result<()>;

    // Wallet
    fn top_up(&self, user_id: UserId, amount: f64) -> Result<LedgerEntry>;
    fn ledger_for_user(&self, user_id: UserId) -> Vec<LedgerEntry>;

    // Inverters
    fn inverter(&self, code: &str) -> Result<Inverter>;
    fn inverters(&self) -> Vec<Inverter>;
    fn put_inverter(&self, inverter: Inverter);
    fn set_inverter_status(&self, code: &str, status: InverterStatus) -> Result<()>;
    /// Overwrite the live snapshot wholesale and append a telemetry sample
    fn record_poll(&self, code: &str, reading: TelemetrySnapshot, at: DateTime<Utc>)
        -> Result<()>;
    fn samples_for_inverter(&self, code: &str) -> Vec<TelemetrySample>;

    // Audit
    fn record_event(&self, event: AuditEvent);
    fn record_message(&self, record: MessageRecord);
}

#[derive(Default)]
struct MemoryState {
    stations: HashMap<StationId, Station>,
    users: HashMap<UserId, UserAccount>,
    vehicles: HashMap<VehicleId, Vehicle>,
    sessions: HashMap<SessionCode, ChargingSession>,
    transaction_index: HashMap<i64, SessionCode>,
    inverters: HashMap<InverterId, Inverter>,
    samples: Vec<TelemetrySample>,
    ledger: Vec<LedgerEntry>,
    events: Vec<AuditEvent>,
    messages: Vec<MessageRecord>,
    next_transaction_id: i64,
}

/// In-memory store: one mutex over everything. Critical sections are a few
/// map operations, so readers never stall device I/O for long.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_transaction_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn station(&self, code: &str) -> Result<Station> {
        self.state
            .lock()
            .stations
            .get(code)
            .cloned()
            .ok_or_else(|| CoreError::UnknownStation(code.to_string()))
    }

    fn stations(&self) -> Vec<Station> {
        self.state.lock().stations.values().cloned().collect()
    }

    fn put_station(&self, station: Station) {
        self.state.lock().stations.insert(station.code.clone(), station);
    }

    fn set_station_status(&self, code: &str, status: StationStatus) -> Result<()> {
        let mut state = self.state.lock();
        let station = state
            .stations
            .get_mut(code)
            .ok_or_else(|| CoreError::UnknownStation(code.to_string()))?;
        station.status = status;
        Ok(())
    }

    fn touch_station_heartbeat(&self, code: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        let station = state
            .stations
            .get_mut(code)
            .ok_or_else(|| CoreError::UnknownStation(code.to_string()))?;
        station.last_heartbeat = Some(at);
        Ok(())
    }

    fn set_station_firmware(&self, code: &str, firmware: &str) -> Result<()> {
        let mut state = self.state.lock();
        let station = state
            .stations
            .get_mut(code)
            .ok_or_else(|| CoreError::UnknownStation(code.to_string()))?;
        station.firmware_version = Some(firmware.to_string());
        Ok(())
    }

    fn user(&self, id: UserId) -> Result<UserAccount> {
        self.state
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or(CoreError::UnknownUser(id))
    }

    fn put_user(&self, user: UserAccount) {
        self.state.lock().users.insert(user.id, user);
    }

    fn vehicle(&self, id: VehicleId) -> Result<Vehicle> {
        self.state
            .lock()
            .vehicles
            .get(&id)
            .cloned()
            .ok_or(CoreError::UnknownVehicle(id))
    }

    fn put_vehicle(&self, vehicle: Vehicle) {
        self.state.lock().vehicles.insert(vehicle.id, vehicle);
    }

    fn start_session(&self, new: NewSession) -> Result<ChargingSession> {
        let mut state = self.state.lock();

        let station = state
            .stations
            .get(&new.station_code)
            .ok_or_else(|| CoreError::UnknownStation(new.station_code.clone()))?;
        if new.require_available && !station.is_available() {
            return Err(CoreError::StationUnavailable(new.station_code.clone()));
        }

        // One active session per station and per user, checked under the
        // same lock that inserts.
        if state
            .sessions
            .values()
            .any(|s| s.station_code == new.station_code && s.status.is_active())
        {
            return Err(CoreError::StationUnavailable(new.station_code.clone()));
        }
        if state
            .sessions
            .values()
            .any(|s| s.user_id == new.user_id && s.status.is_active())
        {
            return Err(CoreError::StationUnavailable(new.station_code.clone()));
        }

        let transaction_id = state.next_transaction_id;
        state.next_transaction_id += 1;

        let session = ChargingSession {
            session_code: new_session_code(),
            transaction_id,
            user_id: new.user_id,
            vehicle_id: new.vehicle_id,
            station_code: new.station_code.clone(),
            start_time: Utc::now(),
            end_time: None,
            duration_minutes: 0,
            meter_start: new.meter_start,
            meter_stop: None,
            energy_delivered: 0.0,
            energy_from_solar: 0.0,
            energy_from_grid: 0.0,
            cost_energy: 0.0,
            cost_service: 0.0,
            cost_total: 0.0,
            status: new.status,
            stop_reason: None,
        };

        state
            .transaction_index
            .insert(transaction_id, session.session_code.clone());
        state
            .sessions
            .insert(session.session_code.clone(), session.clone());
        if let Some(station) = state.stations.get_mut(&new.station_code) {
            station.status = StationStatus::Occupied;
        }

        Ok(session)
    }

    fn session(&self, code: &str) -> Result<ChargingSession> {
        self.state
            .lock()
            .sessions
            .get(code)
            .cloned()
            .ok_or_else(|| CoreError::Storage(format!("unknown session {}", code)))
    }

    fn session_by_transaction(&self, transaction_id: i64) -> Option<ChargingSession> {
        let state = self.state.lock();
        let code = state.transaction_index.get(&transaction_id)?;
        state.sessions.get(code).cloned()
    }

    fn active_session_for_station(&self, code: &str) -> Option<ChargingSession> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|s| s.station_code == code && s.status.is_active())
            .cloned()
    }

    fn active_session_for_user(&self, user_id: UserId) -> Option<ChargingSession> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|s| s.user_id == user_id && s.status.is_active())
            .cloned()
    }

    fn open_session_for_user(&self, user_id: UserId) -> Option<ChargingSession> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|s| s.user_id == user_id && !s.status.is_terminal())
            .cloned()
    }

    fn update_session(&self, session: &ChargingSession) -> Result<()> {
        let mut state = self.state.lock();
        match state.sessions.get_mut(&session.session_code) {
            Some(slot) => {
                if slot.status.is_terminal() {
                    return Err(CoreError::InvalidTransition {
                        from: slot.status.to_string(),
                        to: session.status.to_string(),
                    });
                }
                *slot = session.clone();
                Ok(())
            }
            None => Err(CoreError::Storage(format!(
                "unknown session {}",
                session.session_code
            ))),
        }
    }

    fn settle(&self, settlement: &Settlement) -> Result<LedgerEntry> {
        let mut state = self.state.lock();

        // Validate everything before touching anything, so a failure leaves
        // no partial effect.
        let session = state
            .sessions
            .get(&settlement.session_code)
            .ok_or_else(|| CoreError::Storage(format!("unknown session {}", settlement.session_code)))?
            .clone();
        if session.status.is_terminal() {
            return Err(CoreError::InvalidTransition {
                from: session.status.to_string(),
                to: SessionStatus::Completed.to_string(),
            });
        }
        let user = state
            .users
            .get(&session.user_id)
            .ok_or(CoreError::UnknownUser(session.user_id))?
            .clone();

        let balance_before = user.balance;
        let balance_after = balance_before - settlement.cost_total;
        let entry = LedgerEntry {
            code: new_ledger_code(),
            user_id: user.id,
            session_code: Some(session.session_code.clone()),
            kind: LedgerKind::Charge,
            amount: -settlement.cost_total,
            balance_before,
            balance_after,
            created_at: Utc::now(),
        };

        let slot = state
            .sessions
            .get_mut(&settlement.session_code)
            .expect("session checked above");
        slot.end_time = Some(settlement.end_time);
        slot.duration_minutes = settlement.duration_minutes;
        slot.meter_stop = settlement.meter_stop;
        slot.energy_delivered = settlement.energy_delivered;
        slot.energy_from_solar = settlement.energy_from_solar;
        slot.energy_from_grid = settlement.energy_from_grid;
        slot.cost_energy = settlement.cost_energy;
        slot.cost_service = settlement.cost_service;
        slot.cost_total = settlement.cost_total;
        slot.status = SessionStatus::Completed;
        slot.stop_reason = Some(settlement.stop_reason);

        if let Some(user) = state.users.get_mut(&entry.user_id) {
            user.balance = balance_after;
        }
        state.ledger.push(entry.clone());

        Ok(entry)
    }

    fn fault_session(&self, code: &str, reason: StopReason) -> Result<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(code)
            .ok_or_else(|| CoreError::Storage(format!("unknown session {}", code)))?;
        if !session.status.can_transition_to(SessionStatus::Faulted) {
            return Err(CoreError::InvalidTransition {
                from: session.status.to_string(),
                to: SessionStatus::Faulted.to_string(),
            });
        }
        session.status = SessionStatus::Faulted;
        session.stop_reason = Some(reason);
        session.end_time = Some(Utc::now());
        Ok(())
    }

    fn top_up(&self, user_id: UserId, amount: f64) -> Result<LedgerEntry> {
        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(CoreError::UnknownUser(user_id))?;

        let balance_before = user.balance;
        user.balance += amount;
        let entry = LedgerEntry {
            code: new_ledger_code(),
            user_id,
            session_code: None,
            kind: LedgerKind::Topup,
            amount,
            balance_before,
            balance_after: user.balance,
            created_at: Utc::now(),
        };
        state.ledger.push(entry.clone());
        Ok(entry)
    }

    fn ledger_for_user(&self, user_id: UserId) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    fn inverter(&self, code: &str) -> Result<Inverter> {
        self.state
            .lock()
            .inverters
            .get(code)
            .cloned()
            .ok_or_else(|| CoreError::UnknownInverter(code.to_string()))
    }

    fn inverters(&self) -> Vec<Inverter> {
        self.state.lock().inverters.values().cloned().collect()
    }

    fn put_inverter(&self, inverter: Inverter) {
        self.state
            .lock()
            .inverters
            .insert(inverter.code.clone(), inverter);
    }

    fn set_inverter_status(&self, code: &str, status: InverterStatus) -> Result<()> {
        let mut state = self.state.lock();
        let inverter = state
            .inverters
            .get_mut(code)
            .ok_or_else(|| CoreError::UnknownInverter(code.to_string()))?;
        inverter.status = status;
        Ok(())
    }

    fn record_poll(
        &self,
        code: &str,
        reading: TelemetrySnapshot,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let inverter = state
            .inverters
            .get_mut(code)
            .ok_or_else(|| CoreError::UnknownInverter(code.to_string()))?;
        inverter.snapshot = reading;
        inverter.status = InverterStatus::Online;
        inverter.last_update = Some(at);
        state.samples.push(TelemetrySample {
            inverter_code: code.to_string(),
            timestamp: at,
            reading,
        });
        Ok(())
    }

    fn samples_for_inverter(&self, code: &str) -> Vec<TelemetrySample> {
        self.state
            .lock()
            .samples
            .iter()
            .filter(|s| s.inverter_code == code)
            .cloned()
            .collect()
    }

    fn record_event(&self, event: AuditEvent) {
        self.state.lock().events.push(event);
    }

    fn record_message(&self, record: MessageRecord) {
        self.state.lock().messages.push(record);
    }
}
