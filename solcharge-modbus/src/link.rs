//! Field-bus link abstraction.
//!
//! The poller talks to inverters through [`InverterLink`] so its
//! failure-handling can be exercised with scripted fakes. The production
//! implementation wraps a tokio-modbus TCP context; dropping a link closes
//! the underlying socket.

use async_trait::async_trait;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::slave::Slave;
use tracing::debug;

use solcharge_core::CoreError;

/// Where an inverter lives on the network
#[derive(Debug, Clone)]
pub struct InverterEndpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl std::fmt::Display for InverterEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.unit_id)
    }
}

/// One open connection to an inverter
#[async_trait]
pub trait InverterLink: Send {
    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, CoreError>;

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), CoreError>;
}

/// Opens links; the poller reconnects through this after failures
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self, endpoint: &InverterEndpoint) -> Result<Box<dyn InverterLink>, CoreError>;
}

/// Modbus TCP link
pub struct ModbusTcpLink {
    ctx: Context,
}

#[async_trait]
impl InverterLink for ModbusTcpLink {
    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, CoreError> {
        self.ctx
            .read_input_registers(address, quantity)
            .await
            .map_err(|e| CoreError::DeviceIo(e.to_string()))
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), CoreError> {
        self.ctx
            .write_single_register(address, value)
            .await
            .map_err(|e| CoreError::DeviceIo(e.to_string()))
    }
}

/// Production connector: resolves the endpoint and opens a Modbus TCP
/// context bound to the configured unit id
pub struct TcpLinkConnector;

#[async_trait]
impl LinkConnector for TcpLinkConnector {
    async fn connect(
        &self,
        endpoint: &InverterEndpoint,
    ) -> Result<Box<dyn InverterLink>, CoreError> {
        let mut addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| CoreError::DeviceIo(format!("resolve {}: {}", endpoint, e)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| CoreError::DeviceIo(format!("no address for {}", endpoint)))?;

        let ctx = tcp::connect_slave(addr, Slave(endpoint.unit_id))
            .await
            .map_err(|e| CoreError::DeviceIo(format!("connect {}: {}", endpoint, e)))?;
        debug!(endpoint = %endpoint, "modbus link open");
        Ok(Box::new(ModbusTcpLink { ctx }))
    }
}
