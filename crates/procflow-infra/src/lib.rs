//! Infrastructure layer for procflow.
//!
//! Contains implementations of the ports defined in `procflow-core`: the
//! SQLite workflow repository, in-process lock and directory adapters, the
//! `config.toml` loader, and single-node engine wiring.

pub mod config;
pub mod engine;
pub mod memory;
pub mod sqlite;
