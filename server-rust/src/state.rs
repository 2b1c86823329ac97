use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::coordinator::Coordinator;

pub struct AppState {
    pub coordinator: Coordinator,
    /// Bearer token for `/control/*`; open when unset
    pub control_token: Option<String>,
    /// Bearer token the verification bot presents on the webhook
    pub webhook_token: Option<String>,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(coordinator: Coordinator, control_token: Option<String>, webhook_token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            control_token,
            webhook_token,
            start_time: Utc::now(),
        })
    }
}
