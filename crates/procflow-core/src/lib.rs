//! Workflow engine logic and collaborator trait definitions for procflow.
//!
//! This crate defines the "ports" (repository, directory, lock and event
//! sink traits) that the infrastructure layer implements, plus the engine
//! itself. It depends only on `procflow-types` -- never on `procflow-infra`
//! or any database/IO crate.

pub mod event;
pub mod lock;
pub mod repository;
pub mod workflow;
