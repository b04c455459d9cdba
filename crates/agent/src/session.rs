use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-assistant conversational bookkeeping. Pure data; no I/O.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub turn_count: u64,
    pub message_count: u64,
    pub token_count: u64,
    pub context_window_size: u64,
    pub session_start: DateTime<Utc>,
    pub last_interaction: Option<DateTime<Utc>>,
    model_name: Option<String>,
}

/// Serializable view of a [`SessionState`] at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub turn_count: u64,
    pub message_count: u64,
    pub token_count: u64,
    pub context_window_tokens: u64,
    pub context_used_percent: f64,
    pub session_start: String,
    pub last_interaction: Option<String>,
    pub model_name: Option<String>,
}

impl SessionState {
    pub fn new(context_window_size: u64) -> Self {
        Self {
            turn_count: 0,
            message_count: 0,
            token_count: 0,
            context_window_size,
            session_start: Utc::now(),
            last_interaction: None,
            model_name: None,
        }
    }

    pub fn context_usage_percent(&self) -> f64 {
        if self.context_window_size == 0 {
            return 0.0;
        }
        self.token_count as f64 / self.context_window_size as f64 * 100.0
    }

    /// Account for one completed prompt/response exchange.
    pub fn record_exchange(&mut self, prompt_tokens: u64, response_tokens: u64) {
        self.turn_count += 1;
        self.message_count += 2;
        self.token_count += prompt_tokens + response_tokens;
        self.last_interaction = Some(Utc::now());
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    /// First non-empty name wins for the rest of the session. Returns true if
    /// the cache was populated by this call.
    pub fn observe_model(&mut self, name: Option<&str>) -> bool {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) if self.model_name.is_none() => {
                self.model_name = Some(n.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn invalidate_model_name(&mut self) {
        self.model_name = None;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.context_window_size);
    }

    pub fn is_active(&self) -> bool {
        self.turn_count > 0
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            turn_count: self.turn_count,
            message_count: self.message_count,
            token_count: self.token_count,
            context_window_tokens: self.context_window_size,
            context_used_percent: self.context_usage_percent(),
            session_start: self.session_start.to_rfc3339(),
            last_interaction: self.last_interaction.map(|t| t.to_rfc3339()),
            model_name: self.model_name.clone(),
        }
    }
}
