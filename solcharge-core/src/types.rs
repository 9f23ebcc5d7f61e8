//! Core domain types for the SolCharge platform

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Unique station code, also the station's identity on the wire
pub type StationId = String;

/// Unique inverter code
pub type InverterId = String;

/// Unique session code
pub type SessionCode = String;

/// User account identifier
pub type UserId = i64;

/// Vehicle identifier
pub type VehicleId = i64;

/// A station is considered online while the time since its last heartbeat
/// is strictly below this window. Exactly at the window it is offline.
pub const HEARTBEAT_WINDOW_SECS: i64 = 300;

/// Charging connector variants supported by stations and vehicles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorType {
    Type1,
    Type2,
    #[serde(rename = "CCS")]
    Ccs,
    #[serde(rename = "CHAdeMO")]
    Chademo,
}

/// Station availability as tracked by the protocol engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    Available,
    Occupied,
    Maintenance,
    Offline,
}

impl std::fmt::Display for StationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StationStatus::Available => write!(f, "available"),
            StationStatus::Occupied => write!(f, "occupied"),
            StationStatus::Maintenance => write!(f, "maintenance"),
            StationStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Per-kWh pricing attached to a station
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tariff {
    /// Grid energy rate
    pub grid_rate: f64,
    /// Solar energy rate
    pub solar_rate: f64,
    /// Service fee applied to every delivered kWh
    pub service_fee: f64,
}

impl Default for Tariff {
    fn default() -> Self {
        Self {
            grid_rate: 4.50,
            solar_rate: 3.50,
            service_fee: 0.50,
        }
    }
}

/// A physical EV charging point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub code: StationId,
    pub name: String,
    pub power_rating_kw: f64,
    pub connector_type: ConnectorType,
    pub tariff: Tariff,
    pub firmware_version: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: StationStatus,
}

impl Station {
    pub fn is_available(&self) -> bool {
        self.status == StationStatus::Available
    }

    /// Heartbeat-based liveness, independent of the status field.
    /// Closed-interval policy: elapsed == window classifies offline.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        match self.last_heartbeat {
            None => false,
            Some(last) => now - last < Duration::seconds(HEARTBEAT_WINDOW_SECS),
        }
    }
}

/// Charging session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Preparing,
    Charging,
    Suspended,
    Finishing,
    Completed,
    Faulted,
}

impl SessionStatus {
    /// Active sessions hold the one-per-station / one-per-user invariant
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Preparing | SessionStatus::Charging)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Faulted)
    }

    /// Allowed lifecycle transitions
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Preparing, Charging) => true,
            (Charging, Suspended) | (Suspended, Charging) => true,
            (Preparing, Finishing) | (Charging, Finishing) | (Suspended, Finishing) => true,
            (Finishing, Completed) => true,
            // Any non-terminal state may fault
            (s, Faulted) if !s.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Preparing => "preparing",
            SessionStatus::Charging => "charging",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Finishing => "finishing",
            SessionStatus::Completed => "completed",
            SessionStatus::Faulted => "faulted",
        };
        write!(f, "{}", s)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    User,
    Complete,
    Emergency,
    Fault,
    Timeout,
    Remote,
}

impl StopReason {
    /// Map a station-reported reason string; unknown strings fall back to User
    pub fn from_wire(s: &str) -> Self {
        match s {
            "EVDisconnected" | "Local" | "user" => StopReason::User,
            "Remote" | "remote" => StopReason::Remote,
            "EmergencyStop" | "emergency" => StopReason::Emergency,
            "PowerLoss" | "Reboot" | "fault" => StopReason::Fault,
            "complete" => StopReason::Complete,
            "timeout" => StopReason::Timeout,
            _ => StopReason::User,
        }
    }
}

/// One charge-from-start-to-settlement lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingSession {
    pub session_code: SessionCode,
    /// Integer id used on the wire for Stop/MeterValues correlation
    pub transaction_id: i64,
    pub user_id: UserId,
    pub vehicle_id: VehicleId,
    pub station_code: StationId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    /// Cumulative meter readings in Wh
    pub meter_start: Option<f64>,
    pub meter_stop: Option<f64>,
    /// Delivered energy in kWh
    pub energy_delivered: f64,
    pub energy_from_solar: f64,
    pub energy_from_grid: f64,
    pub cost_energy: f64,
    pub cost_service: f64,
    pub cost_total: f64,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
}

/// A user's registered vehicle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub user_id: UserId,
    pub connector_type: ConnectorType,
    pub battery_capacity_kwh: f64,
    pub max_charging_power_kw: f64,
}

/// Wallet-holding user account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub username: String,
    pub balance: f64,
}

/// Solar inverter availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InverterStatus {
    Online,
    Offline,
    Error,
    Maintenance,
}

impl std::fmt::Display for InverterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InverterStatus::Online => "online",
            InverterStatus::Offline => "offline",
            InverterStatus::Error => "error",
            InverterStatus::Maintenance => "maintenance",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time inverter readings. `None` means the field was not covered
/// by the register block returned by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub power_kw: Option<f64>,
    pub voltage_dc: Option<f64>,
    pub current_dc: Option<f64>,
    pub voltage_ac: Option<f64>,
    pub current_ac: Option<f64>,
    pub frequency_hz: Option<f64>,
    pub efficiency_pct: Option<f64>,
    pub temperature_c: Option<f64>,
    pub daily_energy_kwh: Option<f64>,
    pub total_energy_kwh: Option<f64>,
}

/// A solar power-conversion device polled over Modbus TCP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inverter {
    pub code: InverterId,
    pub model: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub rated_power_kw: f64,
    pub status: InverterStatus,
    pub snapshot: TelemetrySnapshot,
    pub last_update: Option<DateTime<Utc>>,
}

/// Immutable telemetry point appended on every successful poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub inverter_code: InverterId,
    pub timestamp: DateTime<Utc>,
    pub reading: TelemetrySnapshot,
}

/// Ledger entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Charge,
    Topup,
}

/// Append-only wallet transaction record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub code: String,
    pub user_id: UserId,
    pub session_code: Option<SessionCode>,
    pub kind: LedgerKind,
    pub amount: f64,
    pub balance_before: f64,
    pub balance_after: f64,
    pub created_at: DateTime<Utc>,
}

/// Structured audit event forwarded to the persistence collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub level: String,
    pub category: String,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn info(category: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            level: "info".to_string(),
            category: category.to_string(),
            message: message.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Generate a new session code: CHG + millis + random suffix
pub fn new_session_code() -> SessionCode {
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("CHG{}{:03}", Utc::now().timestamp_millis(), suffix)
}

/// Generate a new ledger code: PAY + millis + random suffix
pub fn new_ledger_code() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("PAY{}{:03}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(last_heartbeat: Option<DateTime<Utc>>) -> Station {
        Station {
            code: "ST001".to_string(),
            name: "Lot A".to_string(),
            power_rating_kw: 22.0,
            connector_type: ConnectorType::Type2,
            tariff: Tariff::default(),
            firmware_version: None,
            last_heartbeat,
            status: StationStatus::Available,
        }
    }

    #[test]
    fn test_online_window_boundaries() {
        let now = Utc::now();

        // No heartbeat at all
        assert!(!station(None).is_online(now));

        // One second inside the window
        let inside = station(Some(now - Duration::seconds(HEARTBEAT_WINDOW_SECS - 1)));
        assert!(inside.is_online(now));

        // Exactly at the window: offline (closed interval)
        let at = station(Some(now - Duration::seconds(HEARTBEAT_WINDOW_SECS)));
        assert!(!at.is_online(now));

        // One second past
        let past = station(Some(now - Duration::seconds(HEARTBEAT_WINDOW_SECS + 1)));
        assert!(!past.is_online(now));
    }

    #[test]
    fn test_session_transitions() {
        use SessionStatus::*;

        assert!(Preparing.can_transition_to(Charging));
        assert!(Charging.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Charging));
        assert!(Charging.can_transition_to(Finishing));
        assert!(Finishing.can_transition_to(Completed));
        assert!(Preparing.can_transition_to(Faulted));

        // Terminal states are immutable
        assert!(!Completed.can_transition_to(Charging));
        assert!(!Faulted.can_transition_to(Preparing));
        assert!(!Completed.can_transition_to(Faulted));

        // No skipping forward
        assert!(!Preparing.can_transition_to(Completed));
        assert!(!Suspended.can_transition_to(Completed));
    }

    #[test]
    fn test_connector_serde_names() {
        let json = serde_json::to_string(&ConnectorType::Chademo).unwrap();
        assert_eq!(json, "\"CHAdeMO\"");
        let back: ConnectorType = serde_json::from_str("\"CCS\"").unwrap();
        assert_eq!(back, ConnectorType::Ccs);
    }

    #[test]
    fn test_codes_have_expected_prefix() {
        assert!(new_session_code().starts_with("CHG"));
        assert!(new_ledger_code().starts_with("PAY"));
    }
}
