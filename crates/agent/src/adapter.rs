//! Binds one assistant's [`SessionState`] to its attached [`Transport`].

use chatcell_core::{
    ChatExport, ChatInfo, Error, ErrorCode, ErrorRecord, InteractionRequest, Result, SendOutcome,
};
use chatcell_transport::Transport;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::session::{SessionSnapshot, SessionState};
use crate::tokens::TokenCounter;

pub struct AssistantAdapter {
    id: String,
    transport: OnceLock<Arc<dyn Transport>>,
    session: Mutex<SessionState>,
    tokens: Arc<dyn TokenCounter>,
}

impl AssistantAdapter {
    pub fn new(id: impl Into<String>, context_window_tokens: u64, tokens: Arc<dyn TokenCounter>) -> Self {
        Self {
            id: id.into(),
            transport: OnceLock::new(),
            session: Mutex::new(SessionState::new(context_window_tokens)),
            tokens,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bind the transport. Allowed exactly once.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let kind = transport.kind();
        self.transport.set(transport).map_err(|_| {
            Error::Validation(format!("assistant '{}' already has a transport", self.id))
        })?;
        debug!(assistant = %self.id, kind, "Transport attached");
        Ok(())
    }

    pub fn transport_kind(&self) -> Option<&'static str> {
        self.transport.get().map(|t| t.kind())
    }

    fn not_attached(&self) -> ErrorRecord {
        ErrorRecord::new(
            ErrorCode::TransportNotAttached,
            format!("No transport attached for assistant '{}'", self.id),
        )
    }

    fn attached(&self) -> std::result::Result<&Arc<dyn Transport>, ErrorRecord> {
        self.transport.get().ok_or_else(|| self.not_attached())
    }

    pub async fn send_prompt(&self, request: &InteractionRequest) -> SendOutcome {
        let transport = match self.attached() {
            Ok(t) => t,
            Err(e) => return SendOutcome::rejected(request, e),
        };

        let mut outcome = transport.send_prompt(request).await;
        if !outcome.success {
            return outcome;
        }

        let mut session = self.session.lock().await;
        if outcome.metadata.waited && session.observe_model(outcome.observed_model.as_deref()) {
            info!(assistant = %self.id, model = ?session.model_name(), "Model name cached");
        }

        let text = outcome.text().trim();
        if outcome.metadata.waited && !text.is_empty() {
            let prompt_tokens = self.tokens.count(&request.prompt);
            let response_tokens = self.tokens.count(text);
            session.record_exchange(prompt_tokens, response_tokens);
            let meta = &mut outcome.metadata;
            meta.merge_missing("prompt_tokens", json!(prompt_tokens));
            meta.merge_missing("response_tokens", json!(response_tokens));
            meta.merge_missing("token_counter", json!(self.tokens.name()));
        }

        let meta = &mut outcome.metadata;
        if meta.model_name.is_none() {
            meta.model_name = session.model_name().map(str::to_string);
        }
        meta.merge_missing("turn_count", json!(session.turn_count));
        meta.merge_missing("message_count", json!(session.message_count));
        meta.merge_missing("token_count", json!(session.token_count));
        meta.merge_missing("context_window_tokens", json!(session.context_window_size));
        meta.merge_missing("context_used_percent", json!(session.context_usage_percent()));
        outcome
    }

    pub async fn list_chats(&self) -> std::result::Result<Vec<ChatInfo>, ErrorRecord> {
        match self.attached()?.chat_manager() {
            Some(chats) => chats.list_chats().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn current_chat(&self) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
        match self.attached()?.chat_manager() {
            Some(chats) => chats.current_chat().await,
            None => Ok(None),
        }
    }

    pub async fn switch_chat(&self, chat_id: &str) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
        match self.attached()?.chat_manager() {
            Some(chats) => {
                let chat = chats.switch_chat(chat_id).await?;
                // A different chat is a different context window.
                self.session.lock().await.reset();
                Ok(Some(chat))
            }
            None => Ok(None),
        }
    }

    pub async fn new_chat(&self) -> std::result::Result<Option<ChatInfo>, ErrorRecord> {
        match self.attached()?.chat_manager() {
            Some(chats) => {
                let chat = chats.new_chat().await?;
                self.session.lock().await.reset();
                Ok(chat)
            }
            None => Ok(None),
        }
    }

    pub async fn export_chat(&self) -> std::result::Result<Option<ChatExport>, ErrorRecord> {
        match self.attached()?.chat_manager() {
            Some(chats) => chats.export_chat().await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn new_session(&self) {
        self.session.lock().await.reset();
        info!(assistant = %self.id, "Session reset");
    }

    pub async fn invalidate_model(&self) {
        self.session.lock().await.invalidate_model_name();
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().await.snapshot()
    }
}
