//! Observability setup for procflow: structured logging with optional
//! OpenTelemetry span export.

pub mod tracing_setup;
