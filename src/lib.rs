//! lapsecam library crate.
//!
//! This module exposes the appliance components for the binary and for
//! integration testing.

pub mod app;
pub mod camera;
pub mod config;
pub mod coordinator;
pub mod day_period;
pub mod diagnostics;
pub mod exposure;
pub mod focus;
pub mod output;
pub mod processing;
pub mod scheduler;
