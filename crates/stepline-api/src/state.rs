//! Application state wiring the engine, definition store, and trigger
//! dispatcher over the SQLite repository.
//!
//! The core services are generic over the repository and intent sink traits;
//! AppState pins them to the concrete infra implementations.

use std::path::PathBuf;
use std::sync::Arc;

use stepline_core::workflow::{
    DefinitionStore, ExecutionEngine, TracingIntentSink, TriggerDispatcher,
};
use stepline_infra::sqlite::pool::DatabasePool;
use stepline_infra::sqlite::workflow::SqliteWorkflowRepository;

/// Concrete type aliases for the service generics pinned to infra implementations.
pub type ConcreteEngine = ExecutionEngine<SqliteWorkflowRepository, TracingIntentSink>;
pub type ConcreteStore = DefinitionStore<SqliteWorkflowRepository>;
pub type ConcreteDispatcher = TriggerDispatcher<SqliteWorkflowRepository, TracingIntentSink>;

/// Shared application state used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub definitions: Arc<ConcreteStore>,
    pub engine: Arc<ConcreteEngine>,
    pub triggers: Arc<ConcreteDispatcher>,
}

impl AppState {
    /// Initialize the application state: connect to the database, wire services.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        // Ensure the data directory exists before the pool opens the file.
        tokio::fs::create_dir_all(&data_dir).await?;

        let db_url = format!("sqlite://{}", data_dir.join("stepline.db").display());
        let db_pool = DatabasePool::new(&db_url).await?;
        tracing::info!(data_dir = %data_dir.display(), "database ready");

        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool.clone()));

        let definitions = Arc::new(DefinitionStore::new(Arc::clone(&repo)));
        let engine = Arc::new(ExecutionEngine::new(Arc::clone(&repo), TracingIntentSink));
        let triggers = Arc::new(TriggerDispatcher::new(Arc::clone(&engine), repo));

        Ok(Self {
            definitions,
            engine,
            triggers,
        })
    }
}

/// Resolve the data directory from `STEPLINE_DATA_DIR`, defaulting to
/// `~/.stepline`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPLINE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".stepline")
}
