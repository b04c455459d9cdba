//! [`PageOps`] over a live CDP page connection.

use async_trait::async_trait;
use chatcell_browser::{ConnectionPool, PageHandle};
use chatcell_core::SelectorConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::page::{
    AcquireError, PageError, PageLink, PageMessage, PageOps, PageProbe, PageSource, ResponseStats,
};
use crate::scripts;

pub struct CdpPage {
    handle: PageHandle,
}

impl CdpPage {
    pub fn new(handle: PageHandle) -> Self {
        Self { handle }
    }

    async fn eval(&self, js: &str) -> Result<Value, PageError> {
        if !self.handle.is_alive() {
            return Err(PageError::Disconnected(format!(
                "page {} is no longer attached",
                self.handle.target_id()
            )));
        }
        Ok(self.handle.client().evaluate_value(js).await?)
    }

    async fn eval_as<T: DeserializeOwned>(&self, js: &str) -> Result<T, PageError> {
        let v = self.eval(js).await?;
        serde_json::from_value(v).map_err(|e| PageError::Script(format!("unexpected script result: {}", e)))
    }

    async fn eval_opt_string(&self, js: &str) -> Result<Option<String>, PageError> {
        Ok(match self.eval(js).await? {
            Value::String(s) => Some(s),
            _ => None,
        })
    }
}

#[async_trait]
impl PageOps for CdpPage {
    async fn url(&self) -> Result<String, PageError> {
        Ok(self.eval_opt_string(scripts::LOCATION_HREF).await?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String, PageError> {
        Ok(self.eval_opt_string(scripts::DOCUMENT_TITLE).await?.unwrap_or_default())
    }

    async fn probe(&self, selectors: &SelectorConfig) -> Result<PageProbe, PageError> {
        self.eval_as(&scripts::probe(selectors)).await
    }

    async fn response_stats(&self, selectors: &SelectorConfig) -> Result<ResponseStats, PageError> {
        self.eval_as(&scripts::response_stats(selectors)).await
    }

    async fn type_text(&self, selector: &str, text: &str, delay: Duration) -> Result<(), PageError> {
        let focused = self.eval(&scripts::focus_and_clear(selector)).await?;
        if focused != Value::Bool(true) {
            return Err(PageError::Script(format!("input not found: {}", selector)));
        }

        let client = self.handle.client();
        if delay.is_zero() {
            client.insert_text(text).await?;
        } else {
            let mut buf = [0u8; 4];
            for ch in text.chars() {
                client.insert_text(ch.encode_utf8(&mut buf)).await?;
                tokio::time::sleep(delay).await;
            }
        }

        self.eval(&scripts::dispatch_input(selector)).await?;
        Ok(())
    }

    async fn submit(&self, selectors: &SelectorConfig) -> Result<(), PageError> {
        if let Some(button) = selectors.send_button.as_deref() {
            if self.click(button).await? {
                return Ok(());
            }
            debug!(selector = button, "Send button unavailable, pressing Enter");
        }
        let client = self.handle.client();
        client
            .dispatch_key_event("keyDown", "Enter", "Enter", Some("\r"))
            .await?;
        client.dispatch_key_event("keyUp", "Enter", "Enter", None).await?;
        Ok(())
    }

    async fn response_html(&self, selector: &str, index: usize) -> Result<Option<String>, PageError> {
        self.eval_opt_string(&scripts::outer_html_at(selector, index)).await
    }

    async fn model_name(&self, selector: &str) -> Result<Option<String>, PageError> {
        self.eval_opt_string(&scripts::inner_text(selector)).await
    }

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.handle.client().navigate(url).await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<bool, PageError> {
        Ok(self.eval(&scripts::click(selector)).await? == Value::Bool(true))
    }

    async fn links(&self, selector: &str) -> Result<Vec<PageLink>, PageError> {
        self.eval_as(&scripts::links(selector)).await
    }

    async fn messages(&self, selectors: &SelectorConfig) -> Result<Vec<PageMessage>, PageError> {
        self.eval_as(&scripts::messages(selectors)).await
    }
}

#[async_trait]
impl PageSource for ConnectionPool {
    async fn acquire(&self, base_url: &str) -> Result<Arc<dyn PageOps>, AcquireError> {
        let handle = self.get_page(base_url).await?;
        Ok(Arc::new(CdpPage::new(handle)))
    }
}
