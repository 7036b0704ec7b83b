//! Device simulation engine.
//!
//! ARCHITECTURE
//! ============
//! `controller` owns the running simulators and the provisioning jobs the
//! console starts. A `simulator` drives one simulation: it groups devices into
//! waves and pumps telemetry and reported properties through each
//! `device`. Devices register through `provision` (DPS) and talk to their hub
//! through a `hub` transport; payloads come from `datagen`, which reads the
//! device model parsed by `capability`.

pub mod capability;
pub mod controller;
pub mod datagen;
pub mod device;
pub mod hub;
pub mod provision;
pub mod sas;
pub mod simulator;
