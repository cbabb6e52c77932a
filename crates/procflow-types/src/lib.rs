//! Shared domain types for procflow.
//!
//! This crate contains the core domain types used across the workflow engine:
//! definitions, instances, node-instances, history, tenant context, engine
//! configuration, domain events, and the collaborator error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod tenant;
pub mod workflow;
