//! Static table of supported assistants and how to build their transports.
//!
//! Adding an assistant means adding an entry here plus its default
//! [`AssistantConfig`]; nothing registers itself at runtime.

use chatcell_core::AssistantConfig;
use chatcell_transport::{BrowserTransport, PageSource, Transport};
use std::sync::Arc;

pub type TransportFactory = fn(&str, &AssistantConfig, Arc<dyn PageSource>) -> Arc<dyn Transport>;

pub struct AssistantEntry {
    pub id: &'static str,
    pub display_name: &'static str,
    pub transport: TransportFactory,
}

fn browser_transport(id: &str, config: &AssistantConfig, pages: Arc<dyn PageSource>) -> Arc<dyn Transport> {
    Arc::new(BrowserTransport::new(id, config.clone(), pages))
}

pub const ASSISTANTS: &[AssistantEntry] = &[
    AssistantEntry {
        id: "claude",
        display_name: "Claude",
        transport: browser_transport,
    },
    AssistantEntry {
        id: "chatgpt",
        display_name: "ChatGPT",
        transport: browser_transport,
    },
    AssistantEntry {
        id: "gemini",
        display_name: "Gemini",
        transport: browser_transport,
    },
];

pub fn lookup(id: &str) -> Option<&'static AssistantEntry> {
    ASSISTANTS.iter().find(|e| e.id == id)
}
