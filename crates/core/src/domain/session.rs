use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub i64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

/// One end-to-end run of an agent against one user input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub status: SessionStatus,
    pub user_input: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn start(id: SessionId, agent_id: AgentId, user_input: impl Into<String>) -> Self {
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id,
            agent_id,
            status: SessionStatus::Running,
            user_input: user_input.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the session to `next`. Terminal statuses are final.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<(), DomainError> {
        if self.status.is_terminal() && self.status != next {
            return Err(DomainError::InvalidSessionTransition { from: self.status, to: next });
        }

        self.status = next;
        self.updated_at = Utc::now().trunc_subsecs(6);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{AgentId, Session, SessionId, SessionStatus};
    use crate::errors::DomainError;

    #[test]
    fn session_status_parses_storage_encoding() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Terminated,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse(" Completed "), Some(SessionStatus::Completed));
        assert_eq!(SessionStatus::parse("archived"), None);
    }

    #[test]
    fn terminal_status_never_changes() {
        let mut session = Session::start(SessionId::generate(), AgentId(1), "hello");
        session.transition_to(SessionStatus::Completed).expect("running can complete");

        let error = session.transition_to(SessionStatus::Running).expect_err("terminal is final");
        assert_eq!(
            error,
            DomainError::InvalidSessionTransition {
                from: SessionStatus::Completed,
                to: SessionStatus::Running,
            }
        );
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn paused_session_is_not_terminal() {
        let mut session = Session::start(SessionId::from("s-1"), AgentId(3), "book a flight");
        session.transition_to(SessionStatus::Paused).expect("running can pause");
        session.transition_to(SessionStatus::Running).expect("paused can resume");

        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.updated_at >= session.created_at);
    }

    #[test]
    fn generated_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
