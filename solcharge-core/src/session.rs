//! Charging session state machine and accounting.
//!
//! Transitions come from two directions: wire events relayed by the protocol
//! engine (StartTransaction, StopTransaction, MeterValues) and authenticated
//! user commands arriving through the REST collaborator (start, stop,
//! estimate, top-up). Settlement finalizes the session row, debits the
//! wallet and appends a ledger entry in one atomic store operation.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::store::{NewSession, Settlement, Store};
use crate::types::*;

/// Fraction of delivered energy billed at the solar rate. A policy constant
/// inherited from the tariff model, not a metered quantity: the site has no
/// instrumentation attributing individual electrons to the array.
pub const SOLAR_SHARE: f64 = 0.70;

/// Energy assumed for the pre-start balance check when the caller gives none
pub const DEFAULT_ESTIMATED_ENERGY_KWH: f64 = 10.0;

/// Energy assumed for a cost estimate when the caller gives none
pub const DEFAULT_TARGET_ENERGY_KWH: f64 = 20.0;

/// Account booked for station-reported starts that carry no authenticated
/// user (walk-up charging with an RFID tag the REST layer has not mapped)
const WALK_UP_USER: UserId = 1;
const WALK_UP_VEHICLE: VehicleId = 1;

/// Cost of a quantity of delivered energy under a station tariff
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CostBreakdown {
    pub solar_energy_kwh: f64,
    pub grid_energy_kwh: f64,
    pub cost_energy: f64,
    pub cost_service: f64,
    pub cost_total: f64,
}

/// Split delivered energy into solar and grid shares at the fixed policy ratio
pub fn split_energy(delivered_kwh: f64) -> (f64, f64) {
    let solar = delivered_kwh * SOLAR_SHARE;
    (solar, delivered_kwh - solar)
}

/// Price a quantity of energy under a tariff:
/// solar_share x solar_rate + grid_share x grid_rate + delivered x service_fee
pub fn cost_for(tariff: &Tariff, delivered_kwh: f64) -> CostBreakdown {
    let (solar, grid) = split_energy(delivered_kwh);
    let cost_energy = solar * tariff.solar_rate + grid * tariff.grid_rate;
    let cost_service = delivered_kwh * tariff.service_fee;
    CostBreakdown {
        solar_energy_kwh: solar,
        grid_energy_kwh: grid,
        cost_energy,
        cost_service,
        cost_total: cost_energy + cost_service,
    }
}

/// Answer to an estimate command
#[derive(Debug, Clone, Serialize)]
pub struct ChargeEstimate {
    pub energy_kwh: f64,
    pub charge_power_kw: f64,
    pub estimated_minutes: i64,
    pub cost: CostBreakdown,
    pub tariff: Tariff,
}

/// Session commands and wire-event transitions over a shared store
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn Store>,
}

impl SessionService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// User-initiated start. Rejection order: station availability, vehicle
    /// compatibility, wallet balance, then the one-active-session invariant
    /// (enforced atomically by the store).
    pub fn start(
        &self,
        user_id: UserId,
        station_code: &str,
        vehicle_id: VehicleId,
        estimated_energy_kwh: Option<f64>,
    ) -> Result<ChargingSession> {
        let station = self.store.station(station_code)?;
        if !station.is_available() {
            return Err(CoreError::StationUnavailable(station_code.to_string()));
        }

        let vehicle = self.store.vehicle(vehicle_id)?;
        if vehicle.user_id != user_id {
            return Err(CoreError::UnknownVehicle(vehicle_id));
        }
        if vehicle.connector_type != station.connector_type {
            return Err(CoreError::VehicleIncompatible {
                station: station_code.to_string(),
            });
        }

        let user = self.store.user(user_id)?;
        let estimate = cost_for(
            &station.tariff,
            estimated_energy_kwh.unwrap_or(DEFAULT_ESTIMATED_ENERGY_KWH),
        );
        if user.balance < estimate.cost_total {
            return Err(CoreError::InsufficientBalance {
                required: estimate.cost_total,
                available: user.balance,
            });
        }

        let session = self.store.start_session(NewSession {
            user_id,
            vehicle_id,
            station_code: station_code.to_string(),
            status: SessionStatus::Preparing,
            meter_start: None,
            require_available: true,
        })?;

        info!(
            session = %session.session_code,
            station = %station_code,
            user = user_id,
            "charging session started"
        );
        Ok(session)
    }

    /// User-initiated stop: settles with the energy accumulated so far
    pub fn stop(&self, user_id: UserId, reason: StopReason) -> Result<ChargingSession> {
        let session = self
            .store
            .open_session_for_user(user_id)
            .ok_or_else(|| CoreError::NoActiveSession(format!("user {}", user_id)))?;
        self.settle_session(session, None, reason)
    }

    /// Cost/time estimate for a prospective charge
    pub fn estimate(
        &self,
        station_code: &str,
        vehicle_id: VehicleId,
        target_energy_kwh: Option<f64>,
    ) -> Result<ChargeEstimate> {
        let station = self.store.station(station_code)?;
        let vehicle = self.store.vehicle(vehicle_id)?;

        let energy = target_energy_kwh.unwrap_or(DEFAULT_TARGET_ENERGY_KWH);
        let charge_power = vehicle.max_charging_power_kw.min(station.power_rating_kw);
        let estimated_minutes = ((energy / charge_power) * 60.0).ceil() as i64;

        Ok(ChargeEstimate {
            energy_kwh: energy,
            charge_power_kw: charge_power,
            estimated_minutes,
            cost: cost_for(&station.tariff, energy),
            tariff: station.tariff,
        })
    }

    /// Wallet credit, audited
    pub fn top_up(&self, user_id: UserId, amount: f64) -> Result<LedgerEntry> {
        let entry = self.store.top_up(user_id, amount)?;
        self.store.record_event(AuditEvent::info(
            "session",
            "wallet top-up",
            serde_json::json!({ "user_id": user_id, "amount": amount }),
        ));
        Ok(entry)
    }

    /// Station reported a StartTransaction. Adopts a `preparing` session for
    /// that station when one exists (user start or accepted remote start), so
    /// duplicate remote commands never yield a second session; otherwise
    /// opens a walk-up session directly in `charging`.
    pub fn begin_from_station(
        &self,
        station_code: &str,
        meter_start: f64,
    ) -> Result<ChargingSession> {
        if let Some(mut session) = self.store.active_session_for_station(station_code) {
            if session.status == SessionStatus::Preparing {
                session.status = SessionStatus::Charging;
                session.meter_start = Some(meter_start);
                self.store.update_session(&session)?;
                info!(
                    session = %session.session_code,
                    station = %station_code,
                    "preparing session adopted by station start"
                );
                return Ok(session);
            }
            // A second StartTransaction while one is charging violates the
            // invariant; reject without touching the existing session.
            return Err(CoreError::StationUnavailable(station_code.to_string()));
        }

        self.store.start_session(NewSession {
            user_id: WALK_UP_USER,
            vehicle_id: WALK_UP_VEHICLE,
            station_code: station_code.to_string(),
            status: SessionStatus::Charging,
            meter_start: Some(meter_start),
            require_available: false,
        })
    }

    /// Station reported a StopTransaction. Returns `Ok(None)` for an unknown
    /// transaction id; the engine acknowledges those so station retries do
    /// not wedge.
    pub fn settle_from_station(
        &self,
        transaction_id: i64,
        meter_stop: f64,
        reason: StopReason,
    ) -> Result<Option<ChargingSession>> {
        let mut session = match self.store.session_by_transaction(transaction_id) {
            Some(s) => s,
            None => return Ok(None),
        };
        if session.status.is_terminal() {
            return Ok(None);
        }
        session.meter_stop = Some(meter_stop);
        self.settle_session(session, Some(meter_stop), reason)
            .map(Some)
    }

    /// Station reported a cumulative meter value for a running transaction.
    /// Updates the running delivered energy, never the status.
    pub fn update_meter(&self, transaction_id: i64, meter_value_wh: f64) -> Result<()> {
        let mut session = match self.store.session_by_transaction(transaction_id) {
            Some(s) => s,
            None => {
                return Err(CoreError::ProtocolViolation(format!(
                    "meter values for unknown transaction {}",
                    transaction_id
                )))
            }
        };
        if !session.status.is_active() {
            return Ok(());
        }
        let start = session.meter_start.unwrap_or(0.0);
        session.energy_delivered = ((meter_value_wh - start) / 1000.0).max(0.0);
        self.store.update_session(&session)
    }

    /// Pause an active charge without releasing the reservation
    pub fn suspend(&self, user_id: UserId) -> Result<ChargingSession> {
        let mut session = self
            .store
            .active_session_for_user(user_id)
            .ok_or_else(|| CoreError::NoActiveSession(format!("user {}", user_id)))?;
        self.transition(&mut session, SessionStatus::Suspended)?;
        Ok(session)
    }

    /// Resume a suspended charge
    pub fn resume(&self, user_id: UserId) -> Result<ChargingSession> {
        let mut session = self
            .store
            .open_session_for_user(user_id)
            .ok_or_else(|| CoreError::NoActiveSession(format!("user {}", user_id)))?;
        self.transition(&mut session, SessionStatus::Charging)?;
        Ok(session)
    }

    fn transition(&self, session: &mut ChargingSession, to: SessionStatus) -> Result<()> {
        if !session.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                from: session.status.to_string(),
                to: to.to_string(),
            });
        }
        session.status = to;
        self.store.update_session(session)
    }

    /// Finalize a session: compute the energy split and cost, then apply the
    /// settlement atomically and release the station. A storage failure here
    /// applies nothing; callers may retry the whole settlement.
    fn settle_session(
        &self,
        session: ChargingSession,
        meter_stop: Option<f64>,
        reason: StopReason,
    ) -> Result<ChargingSession> {
        let station = self.store.station(&session.station_code)?;

        let delivered = match (meter_stop, session.meter_start) {
            (Some(stop), Some(start)) => ((stop - start) / 1000.0).max(0.0),
            _ => session.energy_delivered,
        };
        let breakdown = cost_for(&station.tariff, delivered);

        let end_time = Utc::now();
        let settlement = Settlement {
            session_code: session.session_code.clone(),
            end_time,
            duration_minutes: (end_time - session.start_time).num_minutes(),
            meter_stop,
            energy_delivered: delivered,
            energy_from_solar: breakdown.solar_energy_kwh,
            energy_from_grid: breakdown.grid_energy_kwh,
            cost_energy: breakdown.cost_energy,
            cost_service: breakdown.cost_service,
            cost_total: breakdown.cost_total,
            stop_reason: reason,
        };

        let entry = self.store.settle(&settlement)?;
        if let Err(e) = self
            .store
            .set_station_status(&session.station_code, StationStatus::Available)
        {
            warn!(station = %session.station_code, error = %e, "station release failed");
        }

        self.store.record_event(AuditEvent::info(
            "session",
            "session settled",
            serde_json::json!({
                "session_code": session.session_code,
                "energy_delivered": delivered,
                "cost_total": breakdown.cost_total,
                "ledger_code": entry.code,
            }),
        ));

        info!(
            session = %session.session_code,
            energy = delivered,
            cost = breakdown.cost_total,
            "charging session settled"
        );
        self.store.session(&session.session_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fixture() -> (SessionService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.put_station(Station {
            code: "ST001".to_string(),
            name: "Lot A".to_string(),
            power_rating_kw: 22.0,
            connector_type: ConnectorType::Type2,
            tariff: Tariff::default(),
            firmware_version: None,
            last_heartbeat: None,
            status: StationStatus::Available,
        });
        store.put_user(UserAccount {
            id: 1,
            username: "somchai".to_string(),
            balance: 500.0,
        });
        store.put_vehicle(Vehicle {
            id: 1,
            user_id: 1,
            connector_type: ConnectorType::Type2,
            battery_capacity_kwh: 60.0,
            max_charging_power_kw: 11.0,
        });
        (SessionService::new(store.clone()), store)
    }

    #[test]
    fn test_start_creates_preparing_session() {
        let (svc, store) = fixture();
        let session = svc.start(1, "ST001", 1, None).unwrap();
        assert_eq!(session.status, SessionStatus::Preparing);
        assert_eq!(
            store.station("ST001").unwrap().status,
            StationStatus::Occupied
        );
    }

    #[test]
    fn test_start_rejects_unavailable_station() {
        let (svc, store) = fixture();
        store
            .set_station_status("ST001", StationStatus::Maintenance)
            .unwrap();
        assert!(matches!(
            svc.start(1, "ST001", 1, None),
            Err(CoreError::StationUnavailable(_))
        ));
    }

    #[test]
    fn test_start_rejects_incompatible_vehicle() {
        let (svc, store) = fixture();
        store.put_vehicle(Vehicle {
            id: 2,
            user_id: 1,
            connector_type: ConnectorType::Chademo,
            battery_capacity_kwh: 40.0,
            max_charging_power_kw: 50.0,
        });
        assert!(matches!(
            svc.start(1, "ST001", 2, None),
            Err(CoreError::VehicleIncompatible { .. })
        ));
    }

    #[test]
    fn test_start_rejects_insufficient_balance() {
        let (svc, store) = fixture();
        // Price the default 10 kWh estimate at exactly 80 against a 50 wallet
        store.put_station(Station {
            code: "ST002".to_string(),
            name: "Lot B".to_string(),
            power_rating_kw: 22.0,
            connector_type: ConnectorType::Type2,
            tariff: Tariff {
                grid_rate: 8.0,
                solar_rate: 8.0,
                service_fee: 0.0,
            },
            firmware_version: None,
            last_heartbeat: None,
            status: StationStatus::Available,
        });
        store.put_user(UserAccount {
            id: 2,
            username: "pim".to_string(),
            balance: 50.0,
        });
        store.put_vehicle(Vehicle {
            id: 3,
            user_id: 2,
            connector_type: ConnectorType::Type2,
            battery_capacity_kwh: 60.0,
            max_charging_power_kw: 11.0,
        });

        let err = svc.start(2, "ST002", 3, None).unwrap_err();
        match err {
            CoreError::InsufficientBalance {
                required,
                available,
            } => {
                assert!((required - 80.0).abs() < 1e-9);
                assert!((available - 50.0).abs() < 1e-9);
            }
            other => panic!("expected InsufficientBalance, got {other}"),
        }
        assert!(store.active_session_for_user(2).is_none());
    }

    #[test]
    fn test_stop_without_session() {
        let (svc, _) = fixture();
        assert!(matches!(
            svc.stop(1, StopReason::User),
            Err(CoreError::NoActiveSession(_))
        ));
    }

    #[test]
    fn test_meter_delta_settlement() {
        let (svc, store) = fixture();
        let session = svc.begin_from_station("ST001", 1000.0).unwrap();
        assert_eq!(session.status, SessionStatus::Charging);

        let settled = svc
            .settle_from_station(session.transaction_id, 5000.0, StopReason::Complete)
            .unwrap()
            .expect("known transaction");

        assert!((settled.energy_delivered - 4.0).abs() < 1e-9);
        assert_eq!(settled.status, SessionStatus::Completed);
        assert_eq!(settled.stop_reason, Some(StopReason::Complete));
        assert!((settled.energy_from_solar - 2.8).abs() < 1e-9);
        assert!((settled.energy_from_grid - 1.2).abs() < 1e-9);
        assert_eq!(
            store.station("ST001").unwrap().status,
            StationStatus::Available
        );
    }

    #[test]
    fn test_unknown_transaction_is_tolerated() {
        let (svc, _) = fixture();
        let outcome = svc
            .settle_from_station(999, 5000.0, StopReason::User)
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_meter_values_update_energy_only() {
        let (svc, store) = fixture();
        let session = svc.begin_from_station("ST001", 1000.0).unwrap();

        svc.update_meter(session.transaction_id, 2500.0).unwrap();
        let current = store.session(&session.session_code).unwrap();
        assert!((current.energy_delivered - 1.5).abs() < 1e-9);
        assert_eq!(current.status, SessionStatus::Charging);
    }

    #[test]
    fn test_remote_start_then_station_start_yields_one_session() {
        let (svc, store) = fixture();
        let prepared = svc.start(1, "ST001", 1, None).unwrap();

        let adopted = svc.begin_from_station("ST001", 1200.0).unwrap();
        assert_eq!(adopted.session_code, prepared.session_code);
        assert_eq!(adopted.status, SessionStatus::Charging);
        assert_eq!(adopted.meter_start, Some(1200.0));

        // A second station start while charging is rejected outright
        assert!(svc.begin_from_station("ST001", 1300.0).is_err());
        assert_eq!(
            store.active_session_for_station("ST001").unwrap().session_code,
            prepared.session_code
        );
    }

    #[test]
    fn test_user_stop_uses_accumulated_energy() {
        let (svc, store) = fixture();
        let session = svc.begin_from_station("ST001", 0.0).unwrap();
        svc.update_meter(session.transaction_id, 3000.0).unwrap();

        let settled = svc.stop(WALK_UP_USER, StopReason::User).unwrap();
        assert!((settled.energy_delivered - 3.0).abs() < 1e-9);

        let breakdown = cost_for(&Tariff::default(), 3.0);
        let user = store.user(WALK_UP_USER).unwrap();
        assert!((user.balance - (500.0 - breakdown.cost_total)).abs() < 1e-9);
        assert_eq!(store.ledger_for_user(WALK_UP_USER).len(), 1);
    }

    #[test]
    fn test_suspend_and_resume() {
        let (svc, _) = fixture();
        svc.begin_from_station("ST001", 0.0).unwrap();

        let suspended = svc.suspend(WALK_UP_USER).unwrap();
        assert_eq!(suspended.status, SessionStatus::Suspended);

        let resumed = svc.resume(WALK_UP_USER).unwrap();
        assert_eq!(resumed.status, SessionStatus::Charging);
    }

    #[test]
    fn test_estimate_uses_min_power() {
        let (svc, _) = fixture();
        let estimate = svc.estimate("ST001", 1, Some(22.0)).unwrap();
        assert!((estimate.charge_power_kw - 11.0).abs() < 1e-9);
        assert_eq!(estimate.estimated_minutes, 120);

        let expected = cost_for(&Tariff::default(), 22.0);
        assert!((estimate.cost.cost_total - expected.cost_total).abs() < 1e-9);
    }
}
