pub mod connection;
pub mod csr;
pub mod heartbeat;
pub mod manager;
pub mod protocol;
pub mod socket;
pub mod state;

pub use connection::{drive_session, ConnectionExit, ConnectionSettings, TransportEvent};
pub use heartbeat::HeartbeatMonitor;
pub use manager::{SessionError, SessionManager};
pub use protocol::{ErrorReason, InboundFrame, OutboundFrame, ReplyPayload, LOBBY_TOPIC};
pub use state::{AgentIdentity, HeartbeatStatus, SessionState};
