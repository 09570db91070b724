use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warden_core::domain::event::NewEvent;
use warden_core::event_log::SortOrder;
use warden_core::{
    AgentId, EventLogError, EventRecord, EventStore, EventType, InMemoryEventStore,
    InMemorySessionRepository, LogFilter, Page, Session, SessionId, SessionRepository,
};

/// Accepts the first save and fails every later one.
#[derive(Default)]
pub(crate) struct FlakySessions {
    inner: InMemorySessionRepository,
    saves: AtomicUsize,
}

#[async_trait]
impl SessionRepository for FlakySessions {
    async fn save(&self, session: &Session) -> Result<(), EventLogError> {
        if self.saves.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(EventLogError::Storage("disk full".to_string()));
        }
        self.inner.save(session).await
    }

    async fn find(&self, id: &SessionId) -> Result<Option<Session>, EventLogError> {
        self.inner.find(id).await
    }

    async fn count(&self) -> Result<u64, EventLogError> {
        self.inner.count().await
    }
}

/// Rejects appends of one event type and delegates everything else.
pub(crate) struct RejectingStore {
    inner: InMemoryEventStore,
    rejected: EventType,
}

impl RejectingStore {
    pub(crate) fn new(rejected: EventType) -> Self {
        Self { inner: InMemoryEventStore::default(), rejected }
    }
}

#[async_trait]
impl EventStore for RejectingStore {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventLogError> {
        if event.event_type == self.rejected.as_str() {
            return Err(EventLogError::Storage("disk full".to_string()));
        }
        self.inner.append(event).await
    }

    async fn append_if_absent(
        &self,
        event: NewEvent,
        guard: EventType,
    ) -> Result<Option<EventRecord>, EventLogError> {
        self.inner.append_if_absent(event, guard).await
    }

    async fn query(
        &self,
        filter: &LogFilter,
        page: Page,
    ) -> Result<(Vec<EventRecord>, u64), EventLogError> {
        self.inner.query(filter, page).await
    }

    async fn session_events(
        &self,
        session_id: &SessionId,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        self.inner.session_events(session_id, order).await
    }

    async fn agent_events(
        &self,
        agent_id: AgentId,
        from_time: Option<DateTime<Utc>>,
        to_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        self.inner.agent_events(agent_id, from_time, to_time).await
    }

    async fn count(
        &self,
        session_id: Option<&SessionId>,
        agent_id: Option<AgentId>,
    ) -> Result<u64, EventLogError> {
        self.inner.count(session_id, agent_id).await
    }

    async fn event_type_counts(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<BTreeMap<String, u64>, EventLogError> {
        self.inner.event_type_counts(session_id).await
    }

    async fn finished_sessions(&self) -> Result<Vec<(SessionId, AgentId)>, EventLogError> {
        self.inner.finished_sessions().await
    }

    async fn has_event(
        &self,
        session_id: &SessionId,
        event_type: EventType,
    ) -> Result<bool, EventLogError> {
        self.inner.has_event(session_id, event_type).await
    }
}
