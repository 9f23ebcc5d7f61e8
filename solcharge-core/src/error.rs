//! Error taxonomy for the device-integration core

use crate::types::{StationId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Wire input that does not match any known message shape. Logged and
    /// dropped by the protocol engine, never fatal to the connection.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A control command targeted a device without a live connection
    #[error("device not connected: {0}")]
    DeviceNotConnected(String),

    /// Unmatched correlation id or stale pending request
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("station {0} is not available")]
    StationUnavailable(StationId),

    #[error("vehicle connector is not compatible with station {station}")]
    VehicleIncompatible { station: StationId },

    #[error("insufficient balance: estimated cost {required:.2}, available {available:.2}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("no active charging session for {0}")]
    NoActiveSession(String),

    /// Transient device I/O failure, triggers reconnect with backoff
    #[error("device I/O error: {0}")]
    DeviceIo(String),

    #[error("parameter not supported: {0}")]
    ParameterNotSupported(String),

    /// Persistence collaborator failure
    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown station: {0}")]
    UnknownStation(StationId),

    #[error("unknown vehicle: {0}")]
    UnknownVehicle(i64),

    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("unknown inverter: {0}")]
    UnknownInverter(String),

    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
