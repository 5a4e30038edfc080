//! pvflow - solar-surplus EV charging controller.
//!
//! The site loop periodically polls grid, PV and battery meters, derives the
//! signed available surplus and distributes it across loadpoints, which run
//! independent charging state machines against their chargers. Vehicles are
//! shared between loadpoints through the coordinator.

pub mod config;
pub mod core;
pub mod device;
pub mod factory;
pub mod server;
pub mod tariff;
pub mod telemetry;
