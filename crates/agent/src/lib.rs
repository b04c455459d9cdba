pub mod adapter;
pub mod locks;
pub mod orchestrator;
pub mod prepare;
pub mod registry;
pub mod session;
pub mod tokens;

pub use adapter::AssistantAdapter;
pub use locks::InteractionLocks;
pub use orchestrator::{AssistantStatus, BrowserBackend, Orchestrator, SendRequest, StatusReport};
pub use prepare::{render_template, PromptInput, PromptPreparer};
pub use session::{SessionSnapshot, SessionState};
pub use tokens::{counter_for, HeuristicCounter, TiktokenCounter, TokenCounter};
