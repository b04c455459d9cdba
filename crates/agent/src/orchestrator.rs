//! Daemon orchestrator: wires pool, health monitor, adapters and locks, and
//! exposes the operations the HTTP layer calls.

use async_trait::async_trait;
use chatcell_browser::{ConnectionPool, HealthMonitor};
use chatcell_core::{
    ChatExport, ChatInfo, Config, ErrorCode, ErrorRecord, Evidence, InteractionRequest, Paths,
    Result, SendOutcome,
};
use chatcell_transport::PageSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::adapter::AssistantAdapter;
use crate::locks::InteractionLocks;
use crate::prepare::{PromptInput, PromptPreparer};
use crate::registry;
use crate::tokens::{counter_for, TokenCounter};

/// Browser-ownership surface the orchestrator needs beyond page access.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn is_active(&self) -> bool;
    async fn has_live_page(&self, base_url: &str) -> bool;
    async fn release(&self);
}

#[async_trait]
impl BrowserBackend for ConnectionPool {
    async fn is_active(&self) -> bool {
        ConnectionPool::is_active(self)
    }

    async fn has_live_page(&self, base_url: &str) -> bool {
        ConnectionPool::has_live_page(self, base_url).await
    }

    async fn release(&self) {
        ConnectionPool::release(self).await
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    #[serde(alias = "ai")]
    pub target: String,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub wait_for_response: bool,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub template_vars: Option<HashMap<String, String>>,
    #[serde(default)]
    pub context_preset: Option<String>,
}

impl SendRequest {
    pub fn new(target: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            prompt: prompt.into(),
            wait_for_response: true,
            timeout_s: None,
            template: None,
            template_vars: None,
            context_preset: None,
        }
    }
}

/// Per-assistant status. The `ctaw_*` and `connected` fields mirror their
/// canonical counterparts for older clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantStatus {
    pub context_window_tokens: u64,
    pub context_used_percent: f64,
    pub cdp_connected: bool,
    pub session_active: bool,
    pub ctaw_size: u64,
    pub ctaw_usage_percent: f64,
    pub connected: bool,
    pub turn_count: u64,
    pub message_count: u64,
    pub token_count: u64,
    pub model_name: Option<String>,
    pub transport: Option<&'static str>,
    pub busy: bool,
    pub session_start: String,
    pub last_interaction: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub available_ais: Vec<String>,
    pub cdp_healthy: bool,
    pub browser_pool_active: bool,
    pub uptime_s: u64,
    pub ais: BTreeMap<String, AssistantStatus>,
}

pub struct Orchestrator {
    config: Config,
    adapters: BTreeMap<String, Arc<AssistantAdapter>>,
    locks: InteractionLocks,
    preparer: PromptPreparer,
    backend: Arc<dyn BrowserBackend>,
    health: Arc<HealthMonitor>,
    started: Instant,
    shutdown_tx: broadcast::Sender<()>,
    closing: AtomicBool,
}

impl Orchestrator {
    /// Full startup: pool, health monitor, one adapter and transport per
    /// configured assistant, locks.
    pub async fn start(config: Config, paths: &Paths) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(
            config.cdp.clone(),
            config.user_data_dir(paths),
        ));
        let health = Arc::new(HealthMonitor::new(
            pool.clone(),
            Duration::from_secs(config.health.interval_secs.max(1)),
            Duration::from_millis(config.health.probe_timeout_ms),
        ));
        let tokens = counter_for(&config.tokenizer);
        info!(tokenizer = tokens.name(), "Token counter ready");

        let adapters = build_adapters(&config, pool.clone(), tokens)?;
        let orchestrator = Arc::new(Self::from_parts(
            config,
            adapters,
            pool,
            health.clone(),
            paths.context_dir(),
        ));
        tokio::spawn(health.run_loop(orchestrator.shutdown_tx.subscribe()));
        Ok(orchestrator)
    }

    /// Assemble from already-attached adapters.
    pub fn from_parts(
        config: Config,
        adapters: Vec<Arc<AssistantAdapter>>,
        backend: Arc<dyn BrowserBackend>,
        health: Arc<HealthMonitor>,
        context_dir: PathBuf,
    ) -> Self {
        let adapters: BTreeMap<String, Arc<AssistantAdapter>> = adapters
            .into_iter()
            .map(|a| (a.id().to_string(), a))
            .collect();
        let locks = InteractionLocks::new(adapters.keys().cloned());
        let preparer = PromptPreparer::from_config(&config, context_dir);
        let (shutdown_tx, _) = broadcast::channel(1);
        info!(assistants = ?adapters.keys().collect::<Vec<_>>(), "Orchestrator ready");
        Self {
            config,
            adapters,
            locks,
            preparer,
            backend,
            health,
            started: Instant::now(),
            shutdown_tx,
            closing: AtomicBool::new(false),
        }
    }

    pub fn assistant_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn invalid_target(&self, target: &str) -> ErrorRecord {
        let evidence = Evidence {
            available: Some(self.assistant_ids()),
            ..Default::default()
        };
        ErrorRecord::new(ErrorCode::InvalidTarget, format!("Unknown assistant '{}'", target))
            .with_evidence(evidence)
    }

    fn closing_error(&self) -> Option<ErrorRecord> {
        self.closing
            .load(Ordering::SeqCst)
            .then(|| ErrorRecord::new(ErrorCode::InternalError, "Daemon is shutting down"))
    }

    fn adapter(&self, target: &str) -> std::result::Result<Arc<AssistantAdapter>, ErrorRecord> {
        self.adapters
            .get(target)
            .cloned()
            .ok_or_else(|| self.invalid_target(target))
    }

    fn default_timeout(&self, target: &str) -> u64 {
        self.config
            .assistant(target)
            .map(|a| a.default_timeout_secs)
            .unwrap_or(120)
    }

    pub async fn send(&self, params: SendRequest) -> SendOutcome {
        let timeout_s = params
            .timeout_s
            .unwrap_or_else(|| self.default_timeout(&params.target));
        let mut request = InteractionRequest::new(
            params.target.clone(),
            params.prompt.clone(),
            params.wait_for_response,
            timeout_s,
        );

        let adapter = match self.adapter(&params.target) {
            Ok(a) => a,
            Err(e) => {
                warn!(request_id = %request.request_id, target = %params.target, "Unknown assistant");
                return SendOutcome::rejected(&request, e);
            }
        };

        request.prompt = match self.preparer.prepare(&PromptInput {
            prompt: &params.prompt,
            template: params.template.as_deref(),
            template_vars: params.template_vars.as_ref(),
            context_preset: params.context_preset.as_deref(),
        }).await {
            Ok(p) => p,
            Err(e) => {
                warn!(request_id = %request.request_id, code = %e.code, "Prompt preparation failed");
                return SendOutcome::rejected(&request, e);
            }
        };

        info!(
            request_id = %request.request_id,
            assistant = %request.target,
            wait = request.wait_for_response,
            timeout_s,
            "Interaction started"
        );

        let Some(guard) = self.locks.acquire(&request.target).await else {
            return SendOutcome::rejected(&request, self.invalid_target(&request.target));
        };
        if let Some(err) = self.closing_error() {
            return SendOutcome::rejected(&request, err);
        }

        // The guard travels with the task, so an abandoned HTTP request
        // cannot release the lock while the tab is still in use.
        let task_request = request.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            adapter.send_prompt(&task_request).await
        });

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    request_id = %request.request_id,
                    assistant = %request.target,
                    error = %e,
                    "Interaction task failed"
                );
                SendOutcome::rejected(
                    &request,
                    ErrorRecord::new(ErrorCode::InternalError, "Internal error while processing the request"),
                )
            }
        };

        match outcome.metadata.error.as_ref() {
            None => info!(
                request_id = %request.request_id,
                assistant = %request.target,
                success = true,
                elapsed_ms = ?outcome.metadata.elapsed_ms,
                "Interaction finished"
            ),
            Some(err) => warn!(
                request_id = %request.request_id,
                assistant = %request.target,
                success = false,
                code = %err.code,
                stage = ?err.failure_stage,
                elapsed_ms = ?outcome.metadata.elapsed_ms,
                "Interaction failed"
            ),
        }
        outcome
    }

    async fn locked<T, F, Fut>(&self, target: &str, op: F) -> std::result::Result<T, ErrorRecord>
    where
        F: FnOnce(Arc<AssistantAdapter>) -> Fut,
        Fut: Future<Output = std::result::Result<T, ErrorRecord>>,
    {
        let adapter = self.adapter(target)?;
        let run = async move {
            match self.closing_error() {
                Some(err) => Err(err),
                None => op(adapter).await,
            }
        };
        match self.locks.with_lock(target, run).await {
            Some(result) => result,
            None => Err(self.invalid_target(target)),
        }
    }

    pub async fn list_chats(&self, target: &str) -> std::result::Result<Vec<ChatInfo>, ErrorRecord> {
        self.locked(target, |a| async move { a.list_chats().await })
            .await
    }

    pub async fn current_chat(&self, target: &str) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
        self.locked(target, |a| async move { a.current_chat().await })
            .await
    }

    pub async fn switch_chat(
        &self,
        target: &str,
        chat_id: &str,
    ) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
        let chat_id = chat_id.to_string();
        self.locked(target, |a| async move { a.switch_chat(&chat_id).await })
            .await
    }

    pub async fn new_chat(&self, target: &str) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
        self.locked(target, |a| async move { a.new_chat().await })
            .await
    }

    /// Export the current chat, optionally also writing the markdown to
    /// `output_path`.
    pub async fn export_chat(
        &self,
        target: &str,
        output_path: Option<&Path>,
    ) -> std::result::Result<Option<ChatExport>, ErrorRecord> {
        let export = self
            .locked(target, |a| async move { a.export_chat().await })
            .await?;
        if let (Some(export), Some(path)) = (&export, output_path) {
            write_export(path, &export.markdown).await.map_err(|e| {
                ErrorRecord::new(
                    ErrorCode::InternalError,
                    format!("Cannot write export to {}: {}", path.display(), e),
                )
            })?;
            info!(assistant = target, path = %path.display(), "Chat exported");
        }
        Ok(export)
    }

    pub async fn new_session(&self, target: &str) -> std::result::Result<(), ErrorRecord> {
        self.locked(target, |a| async move {
            a.new_session().await;
            Ok(())
        })
        .await
    }

    pub async fn invalidate_model(&self, target: &str) -> std::result::Result<(), ErrorRecord> {
        self.locked(target, |a| async move {
            a.invalidate_model().await;
            Ok(())
        })
        .await
    }

    pub async fn status(&self) -> StatusReport {
        let mut ais = BTreeMap::new();
        for (id, adapter) in &self.adapters {
            let snap = adapter.snapshot().await;
            let connected = match self.config.assistant(id) {
                Some(cfg) => self.backend.has_live_page(&cfg.base_url).await,
                None => false,
            };
            let session_active = snap.turn_count > 0;
            ais.insert(
                id.clone(),
                AssistantStatus {
                    context_window_tokens: snap.context_window_tokens,
                    context_used_percent: snap.context_used_percent,
                    cdp_connected: connected,
                    session_active,
                    ctaw_size: snap.context_window_tokens,
                    ctaw_usage_percent: snap.context_used_percent,
                    connected,
                    turn_count: snap.turn_count,
                    message_count: snap.message_count,
                    token_count: snap.token_count,
                    model_name: snap.model_name,
                    transport: adapter.transport_kind(),
                    busy: self.locks.is_busy(id),
                    session_start: snap.session_start,
                    last_interaction: snap.last_interaction,
                },
            );
        }
        StatusReport {
            available_ais: self.assistant_ids(),
            cdp_healthy: self.health.is_healthy(),
            browser_pool_active: self.backend.is_active().await,
            uptime_s: self.started.elapsed().as_secs(),
            ais,
        }
    }

    /// Stop the health monitor, wait up to `grace` for in-flight
    /// interactions, then release the browser. Returns the assistants whose
    /// interaction was abandoned.
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        info!(grace_secs = grace.as_secs(), "Orchestrator shutting down");
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        let drained = self.locks.drain(grace).await;
        self.backend.release().await;
        drop(drained.guards);
        info!(abandoned = ?drained.abandoned, "Orchestrator stopped");
        drained.abandoned
    }
}

fn build_adapters(
    config: &Config,
    pages: Arc<dyn PageSource>,
    tokens: Arc<dyn TokenCounter>,
) -> Result<Vec<Arc<AssistantAdapter>>> {
    let mut adapters = Vec::new();
    for (id, assistant) in &config.assistants {
        let Some(entry) = registry::lookup(id) else {
            warn!(assistant = %id, "No registry entry for configured assistant, skipping");
            continue;
        };
        let adapter = AssistantAdapter::new(id, assistant.context_window_tokens, tokens.clone());
        adapter.attach_transport((entry.transport)(id, assistant, pages.clone()))?;
        info!(assistant = %id, name = entry.display_name, base_url = %assistant.base_url, "Assistant wired");
        adapters.push(Arc::new(adapter));
    }
    Ok(adapters)
}

async fn write_export(path: &Path, markdown: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, markdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicCounter;
    use chatcell_browser::HealthProbe;
    use chatcell_core::ResponseMetadata;
    use chatcell_transport::{ChatManager, Transport};
    use std::collections::HashSet;

    struct Slow {
        delay: Duration,
        panic_on: Option<&'static str>,
    }

    #[async_trait]
    impl Transport for Slow {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn send_prompt(&self, request: &InteractionRequest) -> SendOutcome {
            if Some(request.prompt.as_str()) == self.panic_on {
                panic!("transport defect");
            }
            let mut metadata = ResponseMetadata::for_request(request);
            metadata.stage_log.mark("send_start");
            tokio::time::sleep(self.delay).await;
            metadata.stage_log.mark("send_complete");
            metadata.stage_log.mark("wait_start");
            metadata.stage_log.mark("wait_complete");
            metadata.stage_log.mark("extract_done");
            metadata.waited = true;
            metadata.elapsed_ms = Some(self.delay.as_millis() as u64);
            SendOutcome {
                success: true,
                snippet: Some("5".into()),
                markdown: Some("5".into()),
                metadata,
                observed_model: None,
            }
        }

        fn chat_manager(&self) -> Option<&dyn ChatManager> {
            Some(self)
        }
    }

    #[async_trait]
    impl ChatManager for Slow {
        async fn list_chats(&self) -> std::result::Result<Vec<ChatInfo>, ErrorRecord> {
            Ok(Vec::new())
        }
        async fn current_chat(&self) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
            Ok(None)
        }
        async fn switch_chat(&self, id: &str) -> std::result::Result<ChatInfo, ErrorRecord> {
            Err(ErrorRecord::new(ErrorCode::ChatNotFound, id.to_string()))
        }
        async fn new_chat(&self) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
            Ok(None)
        }
        async fn export_chat(&self) -> std::result::Result<ChatExport, ErrorRecord> {
            Ok(ChatExport {
                chat: ChatInfo {
                    chat_id: Some("c1".into()),
                    title: "T".into(),
                    url: "https://claude.ai/chat/c1".into(),
                    is_current: true,
                },
                markdown: "# T\n".into(),
                message_count: 0,
            })
        }
    }

    struct Up;

    #[async_trait]
    impl HealthProbe for Up {
        async fn probe(&self, _timeout: Duration) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Backend {
        released: AtomicBool,
    }

    #[async_trait]
    impl BrowserBackend for Backend {
        async fn is_active(&self) -> bool {
            !self.released.load(Ordering::SeqCst)
        }
        async fn has_live_page(&self, base_url: &str) -> bool {
            base_url.contains("claude")
        }
        async fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    async fn orchestrator(delay_ms: u64) -> (Orchestrator, Arc<Backend>) {
        let mut config = Config::default();
        config
            .templates
            .insert("ask".to_string(), "Question: {{prompt}}".to_string());
        let adapters = config
            .assistant_ids()
            .into_iter()
            .map(|id| {
                let a = AssistantAdapter::new(&id, 1000, Arc::new(HeuristicCounter));
                a.attach_transport(Arc::new(Slow {
                    delay: Duration::from_millis(delay_ms),
                    panic_on: Some("panic please"),
                }))
                .unwrap();
                Arc::new(a)
            })
            .collect();
        let backend = Arc::new(Backend::default());
        let health = Arc::new(HealthMonitor::new(
            Arc::new(Up),
            Duration::from_secs(30),
            Duration::from_millis(10),
        ));
        health.probe_once().await;
        let o = Orchestrator::from_parts(
            config,
            adapters,
            backend.clone(),
            health,
            std::env::temp_dir(),
        );
        (o, backend)
    }

    #[tokio::test]
    async fn test_unknown_target_lists_available() {
        let (o, _) = orchestrator(0).await;
        let out = o.send(SendRequest::new("copilot", "hi")).await;
        assert_eq!(out.error_code(), Some(ErrorCode::InvalidTarget));
        let err = out.metadata.error.unwrap();
        assert_eq!(
            err.evidence.available,
            Some(vec!["chatgpt".to_string(), "claude".to_string(), "gemini".to_string()])
        );
        assert_eq!(
            o.list_chats("copilot").await.unwrap_err().code,
            ErrorCode::InvalidTarget
        );
    }

    #[tokio::test]
    async fn test_same_assistant_requests_do_not_overlap() {
        let (o, _) = orchestrator(80).await;
        let (a, b) = tokio::join!(
            o.send(SendRequest::new("claude", "first")),
            o.send(SendRequest::new("claude", "second")),
        );
        assert!(a.success && b.success);
        let (first, second) = if a.metadata.stage_log.get("send_start") <= b.metadata.stage_log.get("send_start") {
            (a, b)
        } else {
            (b, a)
        };
        assert!(
            second.metadata.stage_log.get("send_start").unwrap()
                >= first.metadata.stage_log.get("extract_done").unwrap()
        );
        assert_ne!(first.metadata.request_id, second.metadata.request_id);
    }

    #[tokio::test]
    async fn test_different_assistants_run_concurrently() {
        let (o, _) = orchestrator(300).await;
        let start = Instant::now();
        let (a, b, c) = tokio::join!(
            o.send(SendRequest::new("claude", "x")),
            o.send(SendRequest::new("chatgpt", "x")),
            o.send(SendRequest::new("gemini", "x")),
        );
        assert!(start.elapsed() < Duration::from_millis(800));
        let ids: HashSet<_> = [&a, &b, &c]
            .iter()
            .map(|o| o.metadata.request_id.clone())
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(a.success && b.success && c.success);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error_and_releases_lock() {
        let (o, _) = orchestrator(0).await;
        let out = o.send(SendRequest::new("claude", "panic please")).await;
        assert!(!out.success);
        assert_eq!(out.error_code(), Some(ErrorCode::InternalError));
        let msg = &out.metadata.error.as_ref().unwrap().message;
        assert!(!msg.contains("transport defect"));

        let next = o.send(SendRequest::new("claude", "ok")).await;
        assert!(next.success);
    }

    #[tokio::test]
    async fn test_preparation_failure_never_reaches_transport() {
        let (o, _) = orchestrator(0).await;
        let mut req = SendRequest::new("claude", "hi");
        req.template = Some("missing".to_string());
        let out = o.send(req).await;
        let err = out.metadata.error.unwrap();
        assert_eq!(err.code, ErrorCode::TemplateNotFound);
        assert_eq!(err.failure_stage.as_deref(), Some("prepare"));
        assert_eq!(o.status().await.ais["claude"].turn_count, 0);
    }

    #[tokio::test]
    async fn test_status_mirrors_and_counters() {
        let (o, _) = orchestrator(0).await;
        let mut req = SendRequest::new("claude", "What is 2+3?");
        req.template = Some("ask".to_string());
        assert!(o.send(req).await.success);

        let status = o.status().await;
        assert!(status.cdp_healthy);
        assert!(status.browser_pool_active);
        assert_eq!(status.available_ais.len(), 3);
        let claude = &status.ais["claude"];
        assert_eq!(claude.ctaw_size, claude.context_window_tokens);
        assert_eq!(claude.ctaw_usage_percent, claude.context_used_percent);
        assert_eq!(claude.connected, claude.cdp_connected);
        assert!(claude.cdp_connected);
        assert!(claude.session_active);
        assert_eq!(
            claude.context_used_percent,
            claude.token_count as f64 / 1000.0 * 100.0
        );
        assert!(!status.ais["gemini"].connected);

        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["ais"]["claude"]["ctaw_size"], v["ais"]["claude"]["context_window_tokens"]);
    }

    #[tokio::test]
    async fn test_new_session_resets_counters() {
        let (o, _) = orchestrator(0).await;
        o.send(SendRequest::new("gemini", "hello")).await;
        assert_eq!(o.status().await.ais["gemini"].turn_count, 1);
        o.new_session("gemini").await.unwrap();
        assert_eq!(o.status().await.ais["gemini"].turn_count, 0);
        assert!(o.invalidate_model("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_export_writes_file() {
        let (o, _) = orchestrator(0).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("chat.md");
        let export = o.export_chat("claude", Some(&path)).await.unwrap().unwrap();
        assert_eq!(export.chat.chat_id.as_deref(), Some("c1"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# T\n");
    }

    #[tokio::test]
    async fn test_shutdown_waits_then_releases() {
        let (o, backend) = orchestrator(150).await;
        let o = Arc::new(o);
        let inflight = {
            let o = o.clone();
            tokio::spawn(async move { o.send(SendRequest::new("claude", "x")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let abandoned = o.shutdown(Duration::from_secs(5)).await;
        assert!(abandoned.is_empty());
        assert!(backend.released.load(Ordering::SeqCst));
        assert!(inflight.await.unwrap().success);

        let late = o.send(SendRequest::new("claude", "y")).await;
        assert_eq!(late.error_code(), Some(ErrorCode::InternalError));
    }
}
