//! Common utilities, types, and configurations shared across Strata crates.
//!
//! This crate contains the base building blocks for the Strata system, including:
//! - **Configuration**: Strongly typed application configuration (`config`).
//! - **Telemetry**: Tracing subscriber setup (`telemetry`).
//! - **Resilience**: Blocking retry with exponential backoff (`retry`).
//! - **Logging**: Per-query warning collection (`warnings`).
pub mod config;
pub mod retry;
pub mod telemetry;
pub mod warnings;
