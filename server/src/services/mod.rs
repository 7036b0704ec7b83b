//! Domain services used by the HTTP routes and the simulator.
//!
//! ARCHITECTURE
//! ============
//! Store modules (`target`, `device_model`, `simulation`) own persistence so
//! route handlers can stay focused on protocol translation. `central` wraps
//! the IoT Central REST API and `export` renders seed scripts.

pub mod central;
pub mod device_model;
pub mod export;
pub mod simulation;
pub mod target;
