//! Supervises one remote session per user on a cluster resource manager.

pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod routes;
pub mod session;
pub mod sleeper;
pub mod spec;
pub mod state;
pub mod store;
pub mod telemetry;
