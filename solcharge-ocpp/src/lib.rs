//! Station-side protocol stack: OCPP-J codec, connection registry,
//! per-connection engine and the WebSocket server.

pub mod engine;
pub mod messages;
pub mod registry;
pub mod server;

pub use engine::{map_station_status, EngineConfig, StationConnection};
pub use messages::{
    Action, Call, CallError, CallResult, ErrorCode, MessageType, OcppError, OcppMessage,
    ResetKind,
};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outbound};
pub use server::{OcppServer, OcppServerConfig, OCPP_SUBPROTOCOL};
