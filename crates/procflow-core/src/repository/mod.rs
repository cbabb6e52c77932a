//! Repository trait definitions (ports).
//!
//! These traits define the storage and directory interfaces that the
//! infrastructure layer (procflow-infra) implements. The core crate never
//! depends on any specific storage technology.

pub mod directory;
pub mod workflow;

pub use directory::UserDirectory;
pub use workflow::WorkflowRepository;
