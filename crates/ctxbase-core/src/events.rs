use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SESSION_MESSAGE_INSERT_ROUTE: &str = "session.message.insert";

/// Published once a message row is committed, so background extraction can
/// pick up the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageInserted {
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub message_id: Uuid,
}

impl MessageInserted {
    pub fn routing_key(&self) -> &'static str {
        SESSION_MESSAGE_INSERT_ROUTE
    }
}
