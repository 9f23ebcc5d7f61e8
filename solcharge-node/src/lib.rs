//! Daemon library: fleet configuration loading and the device fleet
//! supervisor consumed by the REST collaborator.

pub mod config;
pub mod supervisor;

pub use config::FleetConfig;
pub use supervisor::{FleetSupervisor, SolarProduction, StationState};
