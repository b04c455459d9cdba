//! Value types shared by the transport, adapter and daemon layers.
//!
//! Everything here serializes to the JSON shapes returned over HTTP, so field
//! names are snake_case and optional fields are omitted when empty.

use chrono::{SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Maximum number of characters kept in `snippet`.
pub const SNIPPET_CHARS: usize = 280;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TransportNotAttached,
    CdpDisconnected,
    SelectorMissing,
    AuthRequired,
    RateLimited,
    ResponseTimeout,
    InvalidTarget,
    ChatNotFound,
    ContextTooLarge,
    ContextGenerationFailed,
    TemplateNotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportNotAttached => "TRANSPORT_NOT_ATTACHED",
            Self::CdpDisconnected => "CDP_DISCONNECTED",
            Self::SelectorMissing => "SELECTOR_MISSING",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::RateLimited => "RATE_LIMITED",
            Self::ResponseTimeout => "RESPONSE_TIMEOUT",
            Self::InvalidTarget => "INVALID_TARGET",
            Self::ChatNotFound => "CHAT_NOT_FOUND",
            Self::ContextTooLarge => "CONTEXT_TOO_LARGE",
            Self::ContextGenerationFailed => "CONTEXT_GENERATION_FAILED",
            Self::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::TransportNotAttached => "Restart the daemon; the assistant was not wired at startup",
            Self::CdpDisconnected => {
                "Check that the browser is running with remote debugging enabled, then retry"
            }
            Self::SelectorMissing => {
                "Reload the assistant tab or update the selector configuration for this assistant"
            }
            Self::AuthRequired => "Log in to the assistant in the browser window, then retry",
            Self::RateLimited => "Wait for the provider's limit to reset before retrying",
            Self::ResponseTimeout => "Retry with a larger timeout_s or check the tab for a stalled reply",
            Self::InvalidTarget => "Use one of the assistants listed in evidence.available",
            Self::ChatNotFound => "List chats again and pick an id from the fresh listing",
            Self::ContextTooLarge => "Shrink the prompt or the context preset",
            Self::ContextGenerationFailed => "Check that the context preset files exist and are readable",
            Self::TemplateNotFound => "Check the template name against the daemon configuration",
            Self::InternalError => "Check the daemon log for details",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Error
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
}

/// Best-effort diagnostic context attached to errors and warnings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<Vec<String>>,
}

impl Evidence {
    pub fn selector(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Default::default()
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_page_url(mut self, url: Option<String>) -> Self {
        if url.is_some() {
            self.page_url = url;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.selector.is_none()
            && self.snippet.is_none()
            && self.page_url.is_none()
            && self.available.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub suggested_action: String,
    #[serde(skip_serializing_if = "Evidence::is_empty")]
    pub evidence: Evidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<String>,
    pub stage_log: StageLog,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: code.severity(),
            suggested_action: code.suggested_action().to_string(),
            evidence: Evidence::default(),
            failure_stage: None,
            stage_log: StageLog::default(),
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = evidence;
        self
    }

    /// Stamp the failing stage into both the record and a copy of the log.
    pub fn at_stage(mut self, stage: &str, log: &StageLog) -> Self {
        let mut log = log.clone();
        log.fail(stage);
        self.failure_stage = Some(stage.to_string());
        self.stage_log = log;
        self
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    SuspiciousPageState,
    EmptyResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub code: WarningCode,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
}

impl Warning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: Severity::Warn,
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

// ---------------------------------------------------------------------------
// Stage log
// ---------------------------------------------------------------------------

/// Ordered stage timestamps for one interaction, in epoch milliseconds.
///
/// Serializes as a JSON object in insertion order, with `failure_stage`
/// appended last when the interaction failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageLog {
    entries: Vec<(String, f64)>,
    failure_stage: Option<String>,
}

impl StageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, stage: &str) -> f64 {
        let ts = now_ms();
        self.entries.push((stage.to_string(), ts));
        ts
    }

    pub fn fail(&mut self, stage: &str) {
        self.failure_stage = Some(stage.to_string());
    }

    pub fn get(&self, stage: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, ts)| *ts)
    }

    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn failure_stage(&self) -> Option<&str> {
        self.failure_stage.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.failure_stage.is_none()
    }
}

impl Serialize for StageLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(self.failure_stage.is_some());
        let mut map = serializer.serialize_map(Some(self.entries.len() + extra))?;
        for (name, ts) in &self.entries {
            map.serialize_entry(name, ts)?;
        }
        if let Some(stage) = &self.failure_stage {
            map.serialize_entry("failure_stage", stage)?;
        }
        map.end()
    }
}

pub fn now_ms() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1000.0
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// One prompt interaction as handed from the daemon to an adapter.
#[derive(Debug, Clone)]
pub struct InteractionRequest {
    pub request_id: String,
    pub target: String,
    pub prompt: String,
    pub wait_for_response: bool,
    pub timeout_s: u64,
}

impl InteractionRequest {
    pub fn new(
        target: impl Into<String>,
        prompt: impl Into<String>,
        wait_for_response: bool,
        timeout_s: u64,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            prompt: prompt.into(),
            wait_for_response,
            timeout_s,
        }
    }
}

/// Keys owned by [`ResponseMetadata`]'s typed fields. Extra entries can never
/// shadow them.
pub const RESERVED_METADATA_KEYS: &[&str] = &[
    "request_id",
    "target",
    "timestamp",
    "stage_log",
    "warnings",
    "model_name",
    "elapsed_ms",
    "timeout_s",
    "page_url",
    "waited",
    "error",
];

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub target: String,
    pub timestamp: String,
    pub stage_log: StageLog,
    pub warnings: Vec<Warning>,
    pub model_name: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub timeout_s: u64,
    pub page_url: Option<String>,
    pub waited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseMetadata {
    pub fn for_request(request: &InteractionRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            target: request.target.clone(),
            timestamp: now_iso(),
            stage_log: StageLog::new(),
            warnings: Vec::new(),
            model_name: None,
            elapsed_ms: None,
            timeout_s: request.timeout_s,
            page_url: None,
            waited: false,
            error: None,
            extra: Map::new(),
        }
    }

    /// Insert `key` only if neither a typed field nor an earlier extra entry
    /// already owns it. Returns whether the value was stored.
    pub fn merge_missing(&mut self, key: &str, value: Value) -> bool {
        if RESERVED_METADATA_KEYS.contains(&key) || self.extra.contains_key(key) {
            return false;
        }
        self.extra.insert(key.to_string(), value);
        true
    }
}

/// Result of one send, as returned by transports, adapters and `POST /send`.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub success: bool,
    pub snippet: Option<String>,
    pub markdown: Option<String>,
    pub metadata: ResponseMetadata,
    /// Model name read from the page during this interaction. The adapter
    /// folds it into the session cache; it is not part of the wire shape.
    #[serde(skip)]
    pub observed_model: Option<String>,
}

impl SendOutcome {
    pub fn failure(mut metadata: ResponseMetadata, error: ErrorRecord) -> Self {
        if metadata.stage_log.is_empty() {
            metadata.stage_log = error.stage_log.clone();
        }
        metadata.error = Some(error);
        Self {
            success: false,
            snippet: None,
            markdown: None,
            metadata,
            observed_model: None,
        }
    }

    /// Shorthand for failures raised before any transport work started.
    pub fn rejected(request: &InteractionRequest, error: ErrorRecord) -> Self {
        Self::failure(ResponseMetadata::for_request(request), error)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.metadata.error.as_ref().map(|e| e.code)
    }

    pub fn text(&self) -> &str {
        self.markdown.as_deref().unwrap_or("")
    }
}

/// First [`SNIPPET_CHARS`] characters of `text`, trimmed, with an ellipsis
/// when truncated.
pub fn make_snippet(text: &str) -> String {
    let trimmed = text.trim();
    let mut out: String = trimmed.chars().take(SNIPPET_CHARS).collect();
    if trimmed.chars().count() > SNIPPET_CHARS {
        out.push('…');
    }
    out
}

// ---------------------------------------------------------------------------
// Chats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    /// `None` for a freshly opened chat that has no server-side id yet.
    pub chat_id: Option<String>,
    pub title: String,
    pub url: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatExport {
    pub chat: ChatInfo,
    pub markdown: String,
    pub message_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let v = serde_json::to_value(ErrorCode::CdpDisconnected).unwrap();
        assert_eq!(v, "CDP_DISCONNECTED");
        assert_eq!(
            serde_json::to_value(ErrorCode::TransportNotAttached).unwrap(),
            ErrorCode::TransportNotAttached.as_str()
        );
        assert_eq!(
            serde_json::to_value(WarningCode::SuspiciousPageState).unwrap(),
            "SUSPICIOUS_PAGE_STATE"
        );
    }

    #[test]
    fn test_stage_log_preserves_order() {
        let mut log = StageLog::new();
        log.mark("send_start");
        log.mark("send_complete");
        log.mark("wait_start");
        log.fail("wait");

        let v = serde_json::to_value(&log).unwrap();
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        // serde_json's default Map is ordered by key, so check the iterator instead
        let stages: Vec<&str> = log.stages().collect();
        assert_eq!(stages, vec!["send_start", "send_complete", "wait_start"]);
        assert_eq!(keys.len(), 4);
        assert_eq!(v["failure_stage"], "wait");
        assert!(log.get("send_start").unwrap() <= log.get("wait_start").unwrap());
    }

    #[test]
    fn test_error_record_defaults() {
        let mut log = StageLog::new();
        log.mark("send_start");
        let rec = ErrorRecord::new(ErrorCode::RateLimited, "limited").at_stage("send", &log);
        assert_eq!(rec.severity, Severity::Error);
        assert_eq!(rec.failure_stage.as_deref(), Some("send"));
        assert_eq!(rec.stage_log.failure_stage(), Some("send"));
        assert!(!rec.suggested_action.is_empty());

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["code"], "RATE_LIMITED");
        assert!(v.get("evidence").is_none());
    }

    #[test]
    fn test_merge_missing_never_overwrites() {
        let req = InteractionRequest::new("claude", "hi", true, 30);
        let mut meta = ResponseMetadata::for_request(&req);
        assert!(!meta.merge_missing("request_id", Value::from("other")));
        assert!(meta.merge_missing("turn_count", Value::from(1)));
        assert!(!meta.merge_missing("turn_count", Value::from(2)));
        assert_eq!(meta.extra["turn_count"], 1);

        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["request_id"], req.request_id.as_str());
        assert_eq!(v["turn_count"], 1);
        assert!(v["elapsed_ms"].is_null());
        assert!(v["warnings"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = InteractionRequest::new("claude", "x", true, 1);
        let b = InteractionRequest::new("claude", "x", true, 1);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_make_snippet_truncates() {
        let long = "a".repeat(SNIPPET_CHARS + 10);
        let s = make_snippet(&long);
        assert_eq!(s.chars().count(), SNIPPET_CHARS + 1);
        assert!(s.ends_with('…'));
        assert_eq!(make_snippet("  short  "), "short");
    }

    #[test]
    fn test_failure_outcome_shape() {
        let req = InteractionRequest::new("gemini", "x", true, 5);
        let out = SendOutcome::rejected(&req, ErrorRecord::new(ErrorCode::InvalidTarget, "nope"));
        assert!(!out.success);
        assert_eq!(out.error_code(), Some(ErrorCode::InvalidTarget));
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["metadata"]["error"]["code"], "INVALID_TARGET");
        assert!(v["snippet"].is_null());
        assert!(v.get("observed_model").is_none());
    }
}
