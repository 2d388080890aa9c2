//! Makerspace device agent: library crate.
//!
//! Re-exports all modules so external crates (e.g. `mk-e2e-tests`) can
//! drive the enrollment client, dispatcher and service directly.

pub mod config;
pub mod credential_store;
pub mod dispatcher;
pub mod enrollment;
pub mod generator;
pub mod history;
pub mod mqtt_loop;
pub mod policy;
pub mod service;
pub mod telemetry;
