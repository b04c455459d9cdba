use async_trait::async_trait;
use chatcell_core::{ChatExport, ChatInfo, ErrorRecord, InteractionRequest, SendOutcome};

/// Performs the send/wait/extract workflow for one assistant.
///
/// Expected failures are returned as data inside the outcome's
/// `metadata.error`; implementations never panic or return a Rust error for
/// them.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn send_prompt(&self, request: &InteractionRequest) -> SendOutcome;

    /// Chat management, when the transport supports it.
    fn chat_manager(&self) -> Option<&dyn ChatManager> {
        None
    }
}

#[async_trait]
pub trait ChatManager: Send + Sync {
    async fn list_chats(&self) -> Result<Vec<ChatInfo>, ErrorRecord>;

    async fn current_chat(&self) -> Result<Option<ChatInfo>, ErrorRecord>;

    /// Switch to `chat_id` (an id or a full chat URL). Fails with
    /// `CHAT_NOT_FOUND` when the page does not end up on that chat.
    async fn switch_chat(&self, chat_id: &str) -> Result<ChatInfo, ErrorRecord>;

    /// Start a fresh chat and return the resulting current chat.
    async fn new_chat(&self) -> Result<Option<ChatInfo>, ErrorRecord>;

    async fn export_chat(&self) -> Result<ChatExport, ErrorRecord>;
}
