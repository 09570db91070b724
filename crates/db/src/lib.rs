pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_config, connect_with_settings, ping, DbPool};
pub use repositories::{RepositoryError, SqlEventStore, SqlSessionRepository};

use std::sync::Arc;

use warden_core::EventLog;

/// Event log backed by the given pool.
pub fn sql_event_log(pool: &DbPool) -> EventLog {
    EventLog::new(
        Arc::new(SqlEventStore::new(pool.clone())),
        Arc::new(SqlSessionRepository::new(pool.clone())),
    )
}
