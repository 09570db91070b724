use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};
use warden_core::domain::event::{EventRecord, EventType, NewEvent};
use warden_core::event_log::{EventLogError, EventStore, LogFilter, Page, SortOrder};
use warden_core::{AgentId, SessionId};

use super::{encode_timestamp, parse_count, parse_timestamp, RepositoryError};
use crate::DbPool;

const EVENT_COLUMNS: &str = "id, session_id, agent_id, event_type, payload_json, timestamp";

// Each optional filter is bound twice: once for the IS NULL test, once for the comparison.
const FILTER_CLAUSE: &str = "(? IS NULL OR session_id = ?)
    AND (? IS NULL OR agent_id = ?)
    AND (? IS NULL OR event_type = ?)
    AND (? IS NULL OR timestamp >= ?)
    AND (? IS NULL OR timestamp <= ?)";

pub struct SqlEventStore {
    pool: DbPool,
}

impl SqlEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, event: &NewEvent) -> Result<EventRecord, RepositoryError> {
        let payload_json = encode_payload(event)?;
        let result = sqlx::query(
            "INSERT INTO event_log (session_id, agent_id, event_type, payload_json, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.session_id.0)
        .bind(event.agent_id.0)
        .bind(&event.event_type)
        .bind(payload_json)
        .bind(encode_timestamp(&event.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(record_from_new(result.last_insert_rowid(), event))
    }

    async fn insert_if_absent(
        &self,
        event: &NewEvent,
        guard: EventType,
    ) -> Result<Option<EventRecord>, RepositoryError> {
        let payload_json = encode_payload(event)?;
        let result = sqlx::query(
            "INSERT INTO event_log (session_id, agent_id, event_type, payload_json, timestamp)
             SELECT ?, ?, ?, ?, ?
             WHERE NOT EXISTS (
                SELECT 1 FROM event_log WHERE session_id = ? AND event_type = ?
             )",
        )
        .bind(&event.session_id.0)
        .bind(event.agent_id.0)
        .bind(&event.event_type)
        .bind(payload_json)
        .bind(encode_timestamp(&event.timestamp))
        .bind(&event.session_id.0)
        .bind(guard.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(record_from_new(result.last_insert_rowid(), event)))
    }

    async fn select_page(
        &self,
        filter: &LogFilter,
        page: Page,
    ) -> Result<(Vec<EventRecord>, u64), RepositoryError> {
        let total_sql = format!("SELECT COUNT(*) AS count FROM event_log WHERE {FILTER_CLAUSE}");
        let total_row =
            bind_filter(sqlx::query(&total_sql), filter).fetch_one(&self.pool).await?;
        let total = parse_count("count", total_row.try_get("count")?)?;

        let page_sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_log WHERE {FILTER_CLAUSE}
             ORDER BY timestamp DESC, id DESC
             LIMIT ? OFFSET ?"
        );
        let rows = bind_filter(sqlx::query(&page_sql), filter)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&self.pool)
            .await?;

        let events = rows.into_iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((events, total))
    }

    async fn select_session(
        &self,
        session_id: &SessionId,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_log
             WHERE session_id = ?
             ORDER BY timestamp {direction}, id {direction}"
        );
        let rows = sqlx::query(&sql).bind(&session_id.0).fetch_all(&self.pool).await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn select_agent(
        &self,
        agent_id: AgentId,
        from_time: Option<DateTime<Utc>>,
        to_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        let filter = LogFilter { agent_id: Some(agent_id), from_time, to_time, ..LogFilter::default() };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_log WHERE {FILTER_CLAUSE}
             ORDER BY timestamp ASC, id ASC"
        );
        let rows = bind_filter(sqlx::query(&sql), &filter).fetch_all(&self.pool).await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn select_count(
        &self,
        session_id: Option<&SessionId>,
        agent_id: Option<AgentId>,
    ) -> Result<u64, RepositoryError> {
        let filter =
            LogFilter { session_id: session_id.cloned(), agent_id, ..LogFilter::default() };
        let sql = format!("SELECT COUNT(*) AS count FROM event_log WHERE {FILTER_CLAUSE}");
        let row = bind_filter(sqlx::query(&sql), &filter).fetch_one(&self.pool).await?;

        parse_count("count", row.try_get("count")?)
    }

    async fn select_type_counts(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let session = session_id.map(|id| id.0.clone());
        let rows = sqlx::query(
            "SELECT event_type, COUNT(*) AS count FROM event_log
             WHERE (? IS NULL OR session_id = ?)
             GROUP BY event_type",
        )
        .bind(session.clone())
        .bind(session)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<(String, u64), RepositoryError> {
                let event_type: String = row.try_get("event_type")?;
                let count = parse_count("count", row.try_get("count")?)?;
                Ok((event_type, count))
            })
            .collect()
    }

    async fn select_finished(&self) -> Result<Vec<(SessionId, AgentId)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT DISTINCT session_id, agent_id FROM event_log
             WHERE event_type = ?
             ORDER BY session_id ASC, agent_id ASC",
        )
        .bind(EventType::SessionEnd.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<(SessionId, AgentId), RepositoryError> {
                Ok((SessionId(row.try_get("session_id")?), AgentId(row.try_get("agent_id")?)))
            })
            .collect()
    }

    async fn select_exists(
        &self,
        session_id: &SessionId,
        event_type: EventType,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "SELECT EXISTS(
                SELECT 1 FROM event_log WHERE session_id = ? AND event_type = ?
             ) AS present",
        )
        .bind(&session_id.0)
        .bind(event_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("present")? != 0)
    }
}

#[async_trait]
impl EventStore for SqlEventStore {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventLogError> {
        Ok(self.insert(&event).await?)
    }

    async fn append_if_absent(
        &self,
        event: NewEvent,
        guard: EventType,
    ) -> Result<Option<EventRecord>, EventLogError> {
        Ok(self.insert_if_absent(&event, guard).await?)
    }

    async fn query(
        &self,
        filter: &LogFilter,
        page: Page,
    ) -> Result<(Vec<EventRecord>, u64), EventLogError> {
        Ok(self.select_page(filter, page).await?)
    }

    async fn session_events(
        &self,
        session_id: &SessionId,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        Ok(self.select_session(session_id, order).await?)
    }

    async fn agent_events(
        &self,
        agent_id: AgentId,
        from_time: Option<DateTime<Utc>>,
        to_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        Ok(self.select_agent(agent_id, from_time, to_time).await?)
    }

    async fn count(
        &self,
        session_id: Option<&SessionId>,
        agent_id: Option<AgentId>,
    ) -> Result<u64, EventLogError> {
        Ok(self.select_count(session_id, agent_id).await?)
    }

    async fn event_type_counts(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<BTreeMap<String, u64>, EventLogError> {
        Ok(self.select_type_counts(session_id).await?)
    }

    async fn finished_sessions(&self) -> Result<Vec<(SessionId, AgentId)>, EventLogError> {
        Ok(self.select_finished().await?)
    }

    async fn has_event(
        &self,
        session_id: &SessionId,
        event_type: EventType,
    ) -> Result<bool, EventLogError> {
        Ok(self.select_exists(session_id, event_type).await?)
    }
}

fn bind_filter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filter: &LogFilter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let session = filter.session_id.as_ref().map(|id| id.0.clone());
    let agent = filter.agent_id.map(|id| id.0);
    let event_type = filter.event_type.map(|kind| kind.as_str());
    let from_time = filter.from_time.as_ref().map(encode_timestamp);
    let to_time = filter.to_time.as_ref().map(encode_timestamp);

    query
        .bind(session.clone())
        .bind(session)
        .bind(agent)
        .bind(agent)
        .bind(event_type)
        .bind(event_type)
        .bind(from_time.clone())
        .bind(from_time)
        .bind(to_time.clone())
        .bind(to_time)
}

fn encode_payload(event: &NewEvent) -> Result<String, RepositoryError> {
    serde_json::to_string(&event.payload)
        .map_err(|error| RepositoryError::Decode(format!("unencodable payload: {error}")))
}

fn record_from_new(id: i64, event: &NewEvent) -> EventRecord {
    EventRecord {
        id,
        session_id: event.session_id.clone(),
        agent_id: event.agent_id,
        event_type: event.event_type.clone(),
        payload: event.payload.clone(),
        timestamp: event.timestamp,
    }
}

fn event_from_row(row: SqliteRow) -> Result<EventRecord, RepositoryError> {
    let payload_raw = row.try_get::<String, _>("payload_json")?;
    let payload = serde_json::from_str(&payload_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid payload_json: {error}")))?;

    Ok(EventRecord {
        id: row.try_get("id")?,
        session_id: SessionId(row.try_get("session_id")?),
        agent_id: AgentId(row.try_get("agent_id")?),
        event_type: row.try_get("event_type")?,
        payload,
        timestamp: parse_timestamp("timestamp", row.try_get("timestamp")?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use warden_core::domain::event::{EventType, NewEvent};
    use warden_core::event_log::{EventStore, LogFilter, Page, SortOrder};
    use warden_core::{AgentId, EventLog, SessionId};

    use super::SqlEventStore;
    use crate::repositories::SqlSessionRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn event(session: &str, agent: i64, event_type: &str, minute: u32) -> NewEvent {
        NewEvent {
            session_id: SessionId::from(session),
            agent_id: AgentId(agent),
            event_type: event_type.to_string(),
            payload: json!({"tool": "Weather API", "params": {"city": "Oslo"}}),
            timestamp: Utc
                .with_ymd_and_hms(2026, 3, 1, 10, minute, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    #[tokio::test]
    async fn append_assigns_ids_and_reads_back_in_order() {
        let pool = setup_pool().await;
        let store = SqlEventStore::new(pool.clone());

        let first = store.append(event("s-1", 1, "session_start", 0)).await.expect("append");
        let second = store.append(event("s-1", 1, "tool_call", 0)).await.expect("append");
        let third = store.append(event("s-1", 1, "session_end", 2)).await.expect("append");
        assert!(first.id < second.id && second.id < third.id);

        let ascending =
            store.session_events(&SessionId::from("s-1"), SortOrder::Ascending).await.expect("read");
        let types: Vec<&str> = ascending.iter().map(|event| event.event_type.as_str()).collect();
        assert_eq!(types, vec!["session_start", "tool_call", "session_end"]);
        assert_eq!(ascending[1].payload["params"]["city"], "Oslo");
        assert_eq!(ascending[0].timestamp, first.timestamp);

        let descending = store
            .session_events(&SessionId::from("s-1"), SortOrder::Descending)
            .await
            .expect("read");
        assert_eq!(descending[0].id, third.id);
        assert_eq!(descending[2].id, first.id);

        pool.close().await;
    }

    #[tokio::test]
    async fn query_filters_pages_and_counts() {
        let pool = setup_pool().await;
        let store = SqlEventStore::new(pool.clone());
        for minute in 0..5 {
            store.append(event("s-1", 1, "tool_call", minute)).await.expect("append");
        }
        store.append(event("s-2", 2, "session_end", 6)).await.expect("append");

        let filter = LogFilter::default().with_event_type("tool_call").expect("known type");
        let (events, total) = store.query(&filter, Page::new(2, 1)).await.expect("query");
        assert_eq!(total, 5);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp.format("%M").to_string(), "03");

        let windowed = LogFilter {
            from_time: Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 3, 0).single().expect("valid")),
            to_time: Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 6, 0).single().expect("valid")),
            ..LogFilter::default()
        };
        let (_, windowed_total) = store.query(&windowed, Page::default()).await.expect("query");
        assert_eq!(windowed_total, 3);

        assert_eq!(store.count(Some(&SessionId::from("s-1")), None).await.expect("count"), 5);
        assert_eq!(store.count(None, Some(AgentId(2))).await.expect("count"), 1);
        assert_eq!(store.count(None, None).await.expect("count"), 6);

        let counts = store.event_type_counts(None).await.expect("counts");
        assert_eq!(counts.get("tool_call"), Some(&5));
        assert_eq!(counts.get("session_end"), Some(&1));

        pool.close().await;
    }

    #[tokio::test]
    async fn conditional_append_claims_once_per_session() {
        let pool = setup_pool().await;
        let store = SqlEventStore::new(pool.clone());
        store.append(event("abc-123", 7, "session_end", 1)).await.expect("append");

        let claimed = store
            .append_if_absent(
                event("abc-123", 7, "threat_classification", 2),
                EventType::ThreatClassification,
            )
            .await
            .expect("first claim");
        let repeated = store
            .append_if_absent(
                event("abc-123", 7, "threat_classification", 3),
                EventType::ThreatClassification,
            )
            .await
            .expect("second claim");

        assert!(claimed.is_some());
        assert!(repeated.is_none());
        assert_eq!(
            store.count(Some(&SessionId::from("abc-123")), None).await.expect("count"),
            2
        );

        pool.close().await;
    }

    #[tokio::test]
    async fn finished_sessions_and_existence_checks() {
        let pool = setup_pool().await;
        let store = SqlEventStore::new(pool.clone());
        store.append(event("done", 1, "session_start", 0)).await.expect("append");
        store.append(event("done", 1, "session_end", 1)).await.expect("append");
        store.append(event("running", 2, "session_start", 0)).await.expect("append");

        let finished = store.finished_sessions().await.expect("finished");
        assert_eq!(finished, vec![(SessionId::from("done"), AgentId(1))]);
        assert!(store
            .has_event(&SessionId::from("done"), EventType::SessionEnd)
            .await
            .expect("lookup"));
        assert!(!store
            .has_event(&SessionId::from("running"), EventType::SessionEnd)
            .await
            .expect("lookup"));

        pool.close().await;
    }

    #[tokio::test]
    async fn agent_events_respect_window() {
        let pool = setup_pool().await;
        let store = SqlEventStore::new(pool.clone());
        for minute in [0, 10, 20] {
            store.append(event("s", 4, "tool_call", minute)).await.expect("append");
        }
        store.append(event("x", 5, "tool_call", 10)).await.expect("append");

        let from = Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).single().expect("valid");
        let events =
            store.agent_events(AgentId(4), Some(from), Some(from + Duration::minutes(30))).await.expect("read");

        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp < events[1].timestamp);

        pool.close().await;
    }

    #[tokio::test]
    async fn event_log_over_sql_sanitizes_reads() {
        let pool = setup_pool().await;
        let log = EventLog::new(
            Arc::new(SqlEventStore::new(pool.clone())),
            Arc::new(SqlSessionRepository::new(pool.clone())),
        );
        let store = SqlEventStore::new(pool.clone());
        store.append(event("s-9", 1, "tool_call", 0)).await.expect("append");

        let read =
            log.get_session_logs(&SessionId::from("s-9"), SortOrder::Ascending).await.expect("read");
        assert_eq!(read[0].payload, json!({"tool": "Weather API", "params_provided": true}));

        pool.close().await;
    }
}
