//! SQLite-backed repository implementations.

pub mod pool;
pub mod workflow;

pub use pool::{DatabasePool, default_database_url};
pub use workflow::SqliteWorkflowRepository;
