//! The seam between the interaction protocol and a live browser tab.
//!
//! [`PageOps`] is everything the protocol needs from one tab; [`PageSource`]
//! hands out tabs by base URL. The CDP-backed implementations live in
//! `cdp_page`; tests drive the protocol against scripted fakes.

use async_trait::async_trait;
use chatcell_core::SelectorConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use chatcell_browser::{CdpError, PoolError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PageError {
    #[error("page connection lost: {0}")]
    Disconnected(String),

    #[error("page script failed: {0}")]
    Script(String),

    #[error("page operation timed out: {0}")]
    Timeout(String),
}

impl PageError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Timeout(_))
    }
}

impl From<CdpError> for PageError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::Disconnected(m) | CdpError::Discovery(m) => Self::Disconnected(m),
            CdpError::Timeout(m) => Self::Timeout(m),
            CdpError::Protocol(m) => Self::Script(m),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquireError {
    /// The browser itself is unreachable.
    #[error("{0}")]
    Connection(String),

    /// The browser answered but no usable tab could be produced.
    #[error("{0}")]
    Page(String),
}

impl From<PoolError> for AcquireError {
    fn from(e: PoolError) -> Self {
        if e.is_connection() {
            Self::Connection(e.to_string())
        } else {
            Self::Page(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Banner {
    pub selector: String,
    pub text: String,
}

/// One snapshot of the page-state indicators used by the ready check.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageProbe {
    pub input_present: bool,
    pub input_enabled: bool,
    /// First visible auth indicator selector, if any.
    pub auth_indicator: Option<String>,
    /// First visible rate-limit selector, if any.
    pub rate_limit_indicator: Option<String>,
    /// Visible status/alert elements with their text.
    pub banners: Vec<Banner>,
    pub url: String,
}

/// Polled during the completion wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseStats {
    pub count: usize,
    /// Serialized size of the last response block.
    pub last_size: usize,
    pub generating: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PageLink {
    pub href: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageMessage {
    pub role: Role,
    pub html: String,
}

#[async_trait]
pub trait PageOps: Send + Sync {
    async fn url(&self) -> Result<String, PageError>;

    async fn title(&self) -> Result<String, PageError>;

    async fn probe(&self, selectors: &SelectorConfig) -> Result<PageProbe, PageError>;

    async fn response_stats(&self, selectors: &SelectorConfig) -> Result<ResponseStats, PageError>;

    /// Focus `selector`, clear it, and enter `text` one character at a time
    /// with `delay` between characters. A zero delay inserts the text at once.
    async fn type_text(&self, selector: &str, text: &str, delay: Duration) -> Result<(), PageError>;

    async fn submit(&self, selectors: &SelectorConfig) -> Result<(), PageError>;

    /// Outer HTML of the `index`-th element matching `selector`.
    async fn response_html(&self, selector: &str, index: usize) -> Result<Option<String>, PageError>;

    async fn model_name(&self, selector: &str) -> Result<Option<String>, PageError>;

    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// Click the first element matching `selector`. Returns false if none.
    async fn click(&self, selector: &str) -> Result<bool, PageError>;

    async fn links(&self, selector: &str) -> Result<Vec<PageLink>, PageError>;

    /// User and assistant messages in document order.
    async fn messages(&self, selectors: &SelectorConfig) -> Result<Vec<PageMessage>, PageError>;
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn acquire(&self, base_url: &str) -> Result<Arc<dyn PageOps>, AcquireError>;
}
