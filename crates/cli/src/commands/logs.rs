use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use serde_json::{json, Value};
use warden_core::event_log::DEFAULT_PAGE_LIMIT;
use warden_core::{
    AgentId, ApplicationError, EventLog, EventLogError, LogFilter, Page, SessionId, SortOrder,
};

use crate::commands::{
    application_failure, load_config, open_event_log, runtime, CommandResult, Failure,
    EXIT_CONFIG, EXIT_RUNTIME,
};

#[derive(Debug, Clone, Default, Args)]
pub struct LogsArgs {
    #[arg(long, help = "Only events of this session")]
    pub session: Option<String>,
    #[arg(long, help = "Only events of this agent")]
    pub agent: Option<i64>,
    #[arg(long = "event-type", help = "Only events of this type (e.g. tool_call)")]
    pub event_type: Option<String>,
    #[arg(long, help = "Inclusive lower bound, RFC 3339")]
    pub from: Option<String>,
    #[arg(long, help = "Inclusive upper bound, RFC 3339")]
    pub to: Option<String>,
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT, allow_hyphen_values = true)]
    pub limit: i64,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub offset: i64,
    #[arg(long, help = "Full event list of --session in the given order (asc|desc)")]
    pub order: Option<String>,
    #[arg(long, help = "Emit counts instead of events")]
    pub stats: bool,
}

#[derive(Debug, Serialize)]
struct LogStats {
    total_events: u64,
    session_count: u64,
    event_type_counts: BTreeMap<String, u64>,
    known_event_types: Vec<&'static str>,
}

pub fn run(args: LogsArgs) -> CommandResult {
    let result = load_config().and_then(|config| {
        let filter = build_filter(&args)?;
        runtime()?.block_on(async {
            let (pool, event_log) = open_event_log(&config).await?;
            let queried = query(&event_log, &args, &filter).await;
            pool.close().await;
            queried
        })
    });

    match result {
        Ok((message, data)) => CommandResult::success_with("logs", message, data),
        Err(failure) => CommandResult::from_failure("logs", failure),
    }
}

fn build_filter(args: &LogsArgs) -> Result<LogFilter, Failure> {
    let mut filter = LogFilter {
        session_id: args.session.as_deref().map(SessionId::from),
        agent_id: args.agent.map(AgentId),
        from_time: parse_time("--from", args.from.as_deref())?,
        to_time: parse_time("--to", args.to.as_deref())?,
        ..LogFilter::default()
    };
    if let Some(raw) = args.event_type.as_deref() {
        filter = filter.with_event_type(raw).map_err(invalid_argument)?;
    }
    Ok(filter)
}

fn parse_time(flag: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Failure> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|error| {
                ("invalid_argument", format!("{flag} `{value}` is not RFC 3339: {error}"), EXIT_CONFIG)
            })
    })
    .transpose()
}

async fn query(
    event_log: &EventLog,
    args: &LogsArgs,
    filter: &LogFilter,
) -> Result<(String, Value), Failure> {
    if args.stats {
        let stats = LogStats {
            total_events: event_log
                .get_log_count(filter.session_id.as_ref(), filter.agent_id)
                .await
                .map_err(storage_failure)?,
            session_count: event_log.get_session_count().await.map_err(storage_failure)?,
            event_type_counts: event_log
                .get_event_type_counts(filter.session_id.as_ref())
                .await
                .map_err(storage_failure)?,
            known_event_types: EventLog::event_types().iter().map(|kind| kind.as_str()).collect(),
        };
        return Ok(("event log statistics".to_string(), to_data(&stats)?));
    }

    if let Some(raw_order) = args.order.as_deref() {
        let order = SortOrder::parse(raw_order).ok_or_else(|| {
            ("invalid_argument", format!("--order `{raw_order}` must be asc or desc"), EXIT_CONFIG)
        })?;
        let session_id = filter.session_id.as_ref().ok_or_else(|| {
            ("invalid_argument", "--order requires --session".to_string(), EXIT_CONFIG)
        })?;
        let events =
            event_log.get_session_logs(session_id, order).await.map_err(storage_failure)?;
        let message = format!("{} events in session {session_id}", events.len());
        return Ok((message, json!({ "events": to_data(&events)? })));
    }

    let page = Page::new(args.limit, args.offset);
    let agent_only = LogFilter { agent_id: filter.agent_id, ..LogFilter::default() };
    let logs = match filter.agent_id {
        Some(agent_id) if *filter == agent_only => event_log.get_agent_logs(agent_id, page).await,
        _ => event_log.get_logs(filter, page).await,
    }
    .map_err(storage_failure)?;

    let message = format!("{} of {} matching events", logs.events.len(), logs.total);
    Ok((message, to_data(&logs)?))
}

fn to_data(value: &impl Serialize) -> Result<Value, Failure> {
    serde_json::to_value(value)
        .map_err(|error| ("serialization", error.to_string(), EXIT_RUNTIME))
}

fn invalid_argument(error: EventLogError) -> Failure {
    ("invalid_argument", error.to_string(), EXIT_CONFIG)
}

fn storage_failure(error: EventLogError) -> Failure {
    match error {
        EventLogError::SessionNotFound(_) => ("not_found", error.to_string(), EXIT_RUNTIME),
        other => {
            application_failure(ApplicationError::Persistence(other.to_string()), EXIT_RUNTIME)
        }
    }
}
