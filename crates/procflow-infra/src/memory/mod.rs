//! In-process adapters.
//!
//! Single-node implementations of the core ports: a TTL lease lock, a
//! workflow repository held in memory, and a static role directory. Useful
//! for embedding the engine without external services and for tests.

pub mod directory;
pub mod lock;
pub mod repository;

pub use directory::StaticUserDirectory;
pub use lock::MemoryLockManager;
pub use repository::InMemoryWorkflowRepository;
