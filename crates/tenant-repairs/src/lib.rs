//! Damage report handling for rentable units: ticket lifecycle, offer negotiation with repair
//! companies, an append-only audit trail, and per-recipient notification fan-out.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
