//! Observability setup for Loomflow: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
