use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cooldown::Cooldown;
use crate::queue::TraversalQueue;

/// Everything the engine owns between cycles. Only the control task mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineState {
    pub queue: TraversalQueue,
    pub watermark: Option<DateTime<Utc>>,
    pub cooldown: Cooldown,
    pub last_run: Option<DateTime<Utc>>,
}

impl EngineState {
    pub fn queue_head_identity(&self) -> Option<String> {
        self.queue.peek().map(|post| post.id.clone())
    }
}

/// Operator-facing view of the engine, derived from the last persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub cooldown: bool,
    pub watermark: Option<DateTime<Utc>>,
    pub queue_head_identity: Option<String>,
    pub queue_len: usize,
    pub last_run: Option<DateTime<Utc>>,
    pub saved_at: Option<DateTime<Utc>>,
    pub scheduled: bool,
}
