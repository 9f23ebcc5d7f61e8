//! Inverter-side field bus: register map, link abstraction and the polling
//! engine.

pub mod link;
pub mod poller;
pub mod registers;

pub use link::{InverterEndpoint, InverterLink, LinkConnector, ModbusTcpLink, TcpLinkConnector};
pub use poller::{InverterPoller, PollerConfig, PollerHandle};
pub use registers::{
    decode_block, decode_register, writable_register, RegisterDef, TelemetryField, WritableDef,
    INPUT_BLOCK_LEN, INPUT_BLOCK_START, INPUT_REGISTERS, WRITABLE_REGISTERS,
};
