use uuid::Uuid;

/// Identity bound to a session after a successful `authenticate`.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub role_id: Uuid,
    pub role_name: String,
    pub policies: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Joined,
    Authenticated(AgentIdentity),
    Terminated,
}

impl SessionState {
    pub fn identity(&self) -> Option<&AgentIdentity> {
        match self {
            SessionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Result of a heartbeat-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Alive,
    Expired,
    /// Unauthenticated or already terminated sessions are not monitored.
    Exempt,
}
