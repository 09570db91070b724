use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use warden_core::event_log::{EventLogError, SessionRepository};
use warden_core::{AgentId, Session, SessionId, SessionStatus};

use super::{encode_timestamp, parse_count, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn save(&self, session: &Session) -> Result<(), EventLogError> {
        sqlx::query(
            "INSERT INTO agent_session (id, agent_id, status, user_input, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(&session.id.0)
        .bind(session.agent_id.0)
        .bind(session.status.as_str())
        .bind(&session.user_input)
        .bind(encode_timestamp(&session.created_at))
        .bind(encode_timestamp(&session.updated_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn find(&self, id: &SessionId) -> Result<Option<Session>, EventLogError> {
        let row = sqlx::query(
            "SELECT id, agent_id, status, user_input, created_at, updated_at
             FROM agent_session
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(session_from_row).transpose()?)
    }

    async fn count(&self) -> Result<u64, EventLogError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM agent_session")
            .fetch_one(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        let count = row.try_get("count").map_err(RepositoryError::from)?;

        Ok(parse_count("count", count)?)
    }
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = SessionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unsupported session status `{status_raw}`"))
    })?;

    Ok(Session {
        id: SessionId(row.try_get("id")?),
        agent_id: AgentId(row.try_get("agent_id")?),
        status,
        user_input: row.try_get("user_input")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
