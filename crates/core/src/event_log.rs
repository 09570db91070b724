use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::domain::event::{EventPayload, EventRecord, EventType, NewEvent};
use crate::domain::session::{AgentId, Session, SessionId};

pub const MAX_PAGE_LIMIT: i64 = 1000;
pub const DEFAULT_PAGE_LIMIT: i64 = 10;

const PARAM_KEYS: [&str; 2] = ["params", "parameters"];
const STACK_TRACE_KEYS: [&str; 2] = ["stack_trace", "traceback"];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventLogError {
    #[error("invalid event_type filter `{0}`")]
    InvalidEventType(String),
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("event storage failure: {0}")]
    Storage(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Ascending),
            "desc" | "descending" => Some(Self::Descending),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub session_id: Option<SessionId>,
    pub agent_id: Option<AgentId>,
    pub event_type: Option<EventType>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
}

impl LogFilter {
    /// Applies an event type filter; values outside the closed enumeration are rejected.
    pub fn with_event_type(mut self, raw: &str) -> Result<Self, EventLogError> {
        let event_type =
            EventType::parse(raw).ok_or_else(|| EventLogError::InvalidEventType(raw.to_owned()))?;
        self.event_type = Some(event_type);
        Ok(self)
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        self.session_id.as_ref().map_or(true, |id| &event.session_id == id)
            && self.agent_id.map_or(true, |id| event.agent_id == id)
            && self.event_type.map_or(true, |kind| event.event_type == kind.as_str())
            && self.from_time.map_or(true, |from| event.timestamp >= from)
            && self.to_time.map_or(true, |to| event.timestamp <= to)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    /// Clamps caller input: a limit above 1000 becomes 1000, a limit below 1
    /// becomes the default, and a negative offset becomes 0.
    pub fn new(limit: i64, offset: i64) -> Self {
        let limit = if limit > MAX_PAGE_LIMIT {
            MAX_PAGE_LIMIT
        } else if limit < 1 {
            DEFAULT_PAGE_LIMIT
        } else {
            limit
        };
        let offset = offset.clamp(0, i64::from(u32::MAX));
        Self { limit: limit as u32, offset: offset as u32 }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_LIMIT, 0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogPage {
    pub events: Vec<EventRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Append-only event storage.
///
/// Implementations order a session's events by timestamp, then by id.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventLogError>;

    /// Appends only when the session has no event of `guard` type yet, as one
    /// atomic step. Returns `None` when the guard already exists.
    async fn append_if_absent(
        &self,
        event: NewEvent,
        guard: EventType,
    ) -> Result<Option<EventRecord>, EventLogError>;

    /// Newest first, with the total number of matches.
    async fn query(
        &self,
        filter: &LogFilter,
        page: Page,
    ) -> Result<(Vec<EventRecord>, u64), EventLogError>;

    async fn session_events(
        &self,
        session_id: &SessionId,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>, EventLogError>;

    /// Oldest first.
    async fn agent_events(
        &self,
        agent_id: AgentId,
        from_time: Option<DateTime<Utc>>,
        to_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, EventLogError>;

    async fn count(
        &self,
        session_id: Option<&SessionId>,
        agent_id: Option<AgentId>,
    ) -> Result<u64, EventLogError>;

    async fn event_type_counts(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<BTreeMap<String, u64>, EventLogError>;

    /// Distinct (session, agent) pairs that have a `session_end` event.
    async fn finished_sessions(&self) -> Result<Vec<(SessionId, AgentId)>, EventLogError>;

    async fn has_event(
        &self,
        session_id: &SessionId,
        event_type: EventType,
    ) -> Result<bool, EventLogError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn save(&self, session: &Session) -> Result<(), EventLogError>;
    async fn find(&self, id: &SessionId) -> Result<Option<Session>, EventLogError>;
    async fn count(&self) -> Result<u64, EventLogError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
struct InMemoryEvents {
    next_id: i64,
    events: Vec<EventRecord>,
}

impl InMemoryEvents {
    fn push(&mut self, event: NewEvent) -> EventRecord {
        self.next_id += 1;
        let record = EventRecord {
            id: self.next_id,
            session_id: event.session_id,
            agent_id: event.agent_id,
            event_type: event.event_type,
            payload: event.payload,
            timestamp: event.timestamp,
        };
        self.events.push(record.clone());
        record
    }
}

fn chronological(left: &EventRecord, right: &EventRecord) -> std::cmp::Ordering {
    left.timestamp.cmp(&right.timestamp).then(left.id.cmp(&right.id))
}

#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    state: Arc<Mutex<InMemoryEvents>>,
}

impl InMemoryEventStore {
    pub fn events(&self) -> Vec<EventRecord> {
        lock(&self.state).events.clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventLogError> {
        Ok(lock(&self.state).push(event))
    }

    async fn append_if_absent(
        &self,
        event: NewEvent,
        guard: EventType,
    ) -> Result<Option<EventRecord>, EventLogError> {
        let mut state = lock(&self.state);
        let exists = state.events.iter().any(|existing| {
            existing.session_id == event.session_id && existing.event_type == guard.as_str()
        });
        if exists {
            return Ok(None);
        }
        Ok(Some(state.push(event)))
    }

    async fn query(
        &self,
        filter: &LogFilter,
        page: Page,
    ) -> Result<(Vec<EventRecord>, u64), EventLogError> {
        let state = lock(&self.state);
        let mut matched: Vec<EventRecord> =
            state.events.iter().filter(|event| filter.matches(event)).cloned().collect();
        matched.sort_by(|left, right| chronological(right, left));

        let total = matched.len() as u64;
        let events = matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect::<Vec<_>>();
        Ok((events, total))
    }

    async fn session_events(
        &self,
        session_id: &SessionId,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let state = lock(&self.state);
        let mut events: Vec<EventRecord> =
            state.events.iter().filter(|event| &event.session_id == session_id).cloned().collect();
        events.sort_by(chronological);
        if order == SortOrder::Descending {
            events.reverse();
        }
        Ok(events)
    }

    async fn agent_events(
        &self,
        agent_id: AgentId,
        from_time: Option<DateTime<Utc>>,
        to_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let filter = LogFilter { agent_id: Some(agent_id), from_time, to_time, ..LogFilter::default() };
        let state = lock(&self.state);
        let mut events: Vec<EventRecord> =
            state.events.iter().filter(|event| filter.matches(event)).cloned().collect();
        events.sort_by(chronological);
        Ok(events)
    }

    async fn count(
        &self,
        session_id: Option<&SessionId>,
        agent_id: Option<AgentId>,
    ) -> Result<u64, EventLogError> {
        let filter =
            LogFilter { session_id: session_id.cloned(), agent_id, ..LogFilter::default() };
        let state = lock(&self.state);
        Ok(state.events.iter().filter(|event| filter.matches(event)).count() as u64)
    }

    async fn event_type_counts(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<BTreeMap<String, u64>, EventLogError> {
        let state = lock(&self.state);
        let mut counts = BTreeMap::new();
        for event in state
            .events
            .iter()
            .filter(|event| session_id.map_or(true, |id| &event.session_id == id))
        {
            *counts.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn finished_sessions(&self) -> Result<Vec<(SessionId, AgentId)>, EventLogError> {
        let state = lock(&self.state);
        let finished: BTreeSet<(SessionId, AgentId)> = state
            .events
            .iter()
            .filter(|event| event.event_type == EventType::SessionEnd.as_str())
            .map(|event| (event.session_id.clone(), event.agent_id))
            .collect();
        Ok(finished.into_iter().collect())
    }

    async fn has_event(
        &self,
        session_id: &SessionId,
        event_type: EventType,
    ) -> Result<bool, EventLogError> {
        let state = lock(&self.state);
        Ok(state
            .events
            .iter()
            .any(|event| &event.session_id == session_id && event.event_type == event_type.as_str()))
    }
}

#[derive(Clone, Default)]
pub struct InMemorySessionRepository {
    sessions: Arc<Mutex<BTreeMap<SessionId, Session>>>,
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn save(&self, session: &Session) -> Result<(), EventLogError> {
        lock(&self.sessions).insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find(&self, id: &SessionId) -> Result<Option<Session>, EventLogError> {
        Ok(lock(&self.sessions).get(id).cloned())
    }

    async fn count(&self) -> Result<u64, EventLogError> {
        Ok(lock(&self.sessions).len() as u64)
    }
}

/// Read-time projection of a stored payload.
///
/// Tool parameters are replaced with a `params_provided` flag and stack
/// traces are dropped from runtime errors. Stored data is left untouched.
pub fn sanitize_payload(event_type: &str, payload: &Value) -> Value {
    let Value::Object(fields) = payload else {
        return payload.clone();
    };
    let mut fields = fields.clone();

    match EventType::parse(event_type) {
        Some(EventType::ToolCall | EventType::ToolCallAttempt) => {
            let mut provided = false;
            for key in PARAM_KEYS {
                provided |= fields.remove(key).is_some();
            }
            fields.insert("params_provided".to_owned(), Value::Bool(provided));
        }
        Some(EventType::RuntimeError) => {
            for key in STACK_TRACE_KEYS {
                fields.remove(key);
            }
        }
        _ => {}
    }

    Value::Object(fields)
}

fn sanitize(mut event: EventRecord) -> EventRecord {
    event.payload = sanitize_payload(&event.event_type, &event.payload);
    event
}

/// Append-only audit trail and query surface over an injected store.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    sessions: Arc<dyn SessionRepository>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>, sessions: Arc<dyn SessionRepository>) -> Self {
        Self { store, sessions }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryEventStore::default()),
            Arc::new(InMemorySessionRepository::default()),
        )
    }

    pub fn event_types() -> &'static [EventType] {
        &EventType::ALL
    }

    pub async fn save_session(&self, session: &Session) -> Result<(), EventLogError> {
        self.sessions.save(session).await
    }

    pub async fn find_session(&self, id: &SessionId) -> Result<Option<Session>, EventLogError> {
        self.sessions.find(id).await
    }

    pub async fn emit(
        &self,
        session_id: &SessionId,
        agent_id: AgentId,
        payload: EventPayload,
    ) -> Result<EventRecord, EventLogError> {
        let event = prepare(session_id, agent_id, &payload)?;
        let record = self.store.append(event).await?;
        debug!(
            event_name = "event_log.appended",
            session_id = %record.session_id,
            agent_id = record.agent_id.0,
            event_type = %record.event_type,
            "event appended"
        );
        Ok(record)
    }

    /// Emits only if the session has no `guard` event yet.
    pub async fn emit_if_absent(
        &self,
        session_id: &SessionId,
        agent_id: AgentId,
        payload: EventPayload,
        guard: EventType,
    ) -> Result<Option<EventRecord>, EventLogError> {
        let event = prepare(session_id, agent_id, &payload)?;
        self.store.append_if_absent(event, guard).await
    }

    pub async fn get_logs(&self, filter: &LogFilter, page: Page) -> Result<LogPage, EventLogError> {
        let (events, total) = self.store.query(filter, page).await?;
        Ok(LogPage {
            events: events.into_iter().map(sanitize).collect(),
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    pub async fn get_session_logs(
        &self,
        session_id: &SessionId,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let events = self.session_events(session_id, order).await?;
        Ok(events.into_iter().map(sanitize).collect())
    }

    pub async fn get_agent_logs(
        &self,
        agent_id: AgentId,
        page: Page,
    ) -> Result<LogPage, EventLogError> {
        let filter = LogFilter { agent_id: Some(agent_id), ..LogFilter::default() };
        self.get_logs(&filter, page).await
    }

    pub async fn get_event_type_counts(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<BTreeMap<String, u64>, EventLogError> {
        self.store.event_type_counts(session_id).await
    }

    pub async fn get_log_count(
        &self,
        session_id: Option<&SessionId>,
        agent_id: Option<AgentId>,
    ) -> Result<u64, EventLogError> {
        self.store.count(session_id, agent_id).await
    }

    pub async fn get_session_count(&self) -> Result<u64, EventLogError> {
        self.sessions.count().await
    }

    /// Unredacted session events, for analysis only.
    pub async fn session_events(
        &self,
        session_id: &SessionId,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let events = self.store.session_events(session_id, order).await?;
        if events.is_empty() && self.sessions.find(session_id).await?.is_none() {
            return Err(EventLogError::SessionNotFound(session_id.to_string()));
        }
        Ok(events)
    }

    /// Unredacted agent events in a time range, oldest first, for analysis only.
    pub async fn agent_events(
        &self,
        agent_id: AgentId,
        from_time: Option<DateTime<Utc>>,
        to_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        self.store.agent_events(agent_id, from_time, to_time).await
    }

    pub async fn finished_sessions(&self) -> Result<Vec<(SessionId, AgentId)>, EventLogError> {
        self.store.finished_sessions().await
    }

    pub async fn has_event(
        &self,
        session_id: &SessionId,
        event_type: EventType,
    ) -> Result<bool, EventLogError> {
        self.store.has_event(session_id, event_type).await
    }
}

fn prepare(
    session_id: &SessionId,
    agent_id: AgentId,
    payload: &EventPayload,
) -> Result<NewEvent, EventLogError> {
    payload.validate().map_err(|error| EventLogError::InvalidPayload(error.to_string()))?;
    let data = payload.to_value().map_err(|error| EventLogError::InvalidPayload(error.to_string()))?;

    Ok(NewEvent {
        session_id: session_id.clone(),
        agent_id,
        event_type: payload.event_type_name().to_owned(),
        payload: data,
        timestamp: Utc::now().trunc_subsecs(6),
    })
}
