//! Outbound job and queue snapshot types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One outbound message awaiting (re)delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundJob {
    /// `out_` followed by 10 hex characters
    pub id: String,
    pub channel: String,
    pub channel_id: String,
    pub text: String,
    pub thread_id: Option<String>,
    /// Failed attempts so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Status string returned by the last failed attempt
    pub last_error: Option<String>,
}

impl OutboundJob {
    pub fn new(
        channel: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
        thread_id: Option<String>,
        max_attempts: u32,
    ) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("out_{}", &uuid[..10]),
            channel: channel.into(),
            channel_id: channel_id.into(),
            text: text.into(),
            thread_id,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        }
    }

    /// Whether the retry budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Point-in-time view of the queue for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSnapshot {
    pub queued: usize,
    pub dead_lettered: usize,
    pub dead_letters: Vec<OutboundJob>,
}
