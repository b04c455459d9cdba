//! Chat management over the assistant's sidebar and URL scheme.

use async_trait::async_trait;
use chatcell_core::{ChatExport, ChatInfo, ErrorCode, ErrorRecord, Evidence};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::browser::BrowserTransport;
use crate::extract::transcript_markdown;
use crate::page::PageOps;
use crate::transport::ChatManager;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_POLL: Duration = Duration::from_millis(250);

impl BrowserTransport {
    pub fn chat_id_from_url(&self, url: &str) -> Option<String> {
        let re = self.chat_id_re.as_ref()?;
        re.captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn absolute(&self, href: &str) -> String {
        url::Url::parse(&self.config.base_url)
            .and_then(|base| base.join(href))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string())
    }

    async fn current_on(&self, page: &dyn PageOps) -> Result<ChatInfo, ErrorRecord> {
        let url = page
            .url()
            .await
            .map_err(|e| self.page_error(e, None, None))?;
        let title = page.title().await.unwrap_or_default();
        Ok(ChatInfo {
            chat_id: self.chat_id_from_url(&url),
            title,
            url,
            is_current: true,
        })
    }

    async fn list_on(&self, page: &dyn PageOps) -> Result<Vec<ChatInfo>, ErrorRecord> {
        let current = self.current_on(page).await?;
        let Some(selector) = self.config.selectors.chat_links.as_deref() else {
            return Ok(vec![current]);
        };
        let links = page
            .links(selector)
            .await
            .map_err(|e| self.page_error(e, Some(selector), Some(current.url.clone())))?;

        let mut seen = HashSet::new();
        let mut chats = Vec::new();
        for link in links {
            let url = self.absolute(&link.href);
            let Some(chat_id) = self.chat_id_from_url(&url) else {
                continue;
            };
            if !seen.insert(chat_id.clone()) {
                continue;
            }
            let title = link.text.lines().next().unwrap_or_default().trim().to_string();
            chats.push(ChatInfo {
                is_current: current.chat_id.as_deref() == Some(chat_id.as_str()),
                chat_id: Some(chat_id),
                title: if title.is_empty() { "Untitled".to_string() } else { title },
                url,
            });
        }
        Ok(chats)
    }

    /// Poll the page URL until `done` accepts it or the settle timeout ends.
    async fn settle<F>(&self, page: &dyn PageOps, done: F) -> Option<String>
    where
        F: Fn(&str) -> bool + Send,
    {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            if let Ok(url) = page.url().await {
                if done(&url) {
                    return Some(url);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }
}

#[async_trait]
impl ChatManager for BrowserTransport {
    async fn list_chats(&self) -> Result<Vec<ChatInfo>, ErrorRecord> {
        let page = self.acquire().await?;
        self.list_on(page.as_ref()).await
    }

    async fn current_chat(&self) -> Result<Option<ChatInfo>, ErrorRecord> {
        let page = self.acquire().await?;
        self.current_on(page.as_ref()).await.map(Some)
    }

    async fn switch_chat(&self, chat_id: &str) -> Result<ChatInfo, ErrorRecord> {
        let page = self.acquire().await?;
        let wanted = self
            .chat_id_from_url(chat_id)
            .unwrap_or_else(|| chat_id.to_string());

        let listed = self.list_on(page.as_ref()).await?;
        if let Some(chat) = listed.iter().find(|c| c.chat_id.as_deref() == Some(wanted.as_str())) {
            if chat.is_current {
                return Ok(chat.clone());
            }
        }
        let target_url = listed
            .iter()
            .find(|c| c.chat_id.as_deref() == Some(wanted.as_str()))
            .map(|c| c.url.clone())
            .or_else(|| self.config.chat_url(chat_id));

        let not_found = |page_url: Option<String>| {
            let mut evidence = Evidence::default().with_page_url(page_url);
            evidence.available = Some(listed.iter().filter_map(|c| c.chat_id.clone()).collect());
            ErrorRecord::new(ErrorCode::ChatNotFound, format!("Chat '{}' not found", chat_id))
                .with_evidence(evidence)
        };

        let Some(target_url) = target_url else {
            return Err(not_found(None));
        };
        info!(assistant = %self.assistant_id, chat = %wanted, "Switching chat");
        page.navigate(&target_url)
            .await
            .map_err(|e| self.page_error(e, None, Some(target_url.clone())))?;

        let landed = self
            .settle(page.as_ref(), |url| {
                self.chat_id_from_url(url).as_deref() == Some(wanted.as_str())
            })
            .await;
        match landed {
            Some(_) => self.current_on(page.as_ref()).await,
            None => {
                let url = page.url().await.ok();
                debug!(assistant = %self.assistant_id, landed = ?url, "Chat switch did not land");
                Err(not_found(url))
            }
        }
    }

    async fn new_chat(&self) -> Result<Option<ChatInfo>, ErrorRecord> {
        let page = self.acquire().await?;
        let before = self.current_on(page.as_ref()).await?;

        let clicked = match self.config.selectors.new_chat_button.as_deref() {
            Some(sel) => page
                .click(sel)
                .await
                .map_err(|e| self.page_error(e, Some(sel), Some(before.url.clone())))?,
            None => false,
        };
        if !clicked {
            let url = self
                .config
                .new_chat_url
                .clone()
                .unwrap_or_else(|| self.config.base_url.clone());
            page.navigate(&url)
                .await
                .map_err(|e| self.page_error(e, None, Some(url.clone())))?;
        }
        info!(assistant = %self.assistant_id, clicked, "Started new chat");

        let previous = before.chat_id.clone();
        let _ = self
            .settle(page.as_ref(), |url| {
                previous.is_none() || self.chat_id_from_url(url) != previous
            })
            .await;
        self.current_on(page.as_ref()).await.map(Some)
    }

    async fn export_chat(&self) -> Result<ChatExport, ErrorRecord> {
        let page = self.acquire().await?;
        let chat = self.current_on(page.as_ref()).await?;
        let messages = page.messages(&self.config.selectors).await.map_err(|e| {
            self.page_error(
                e,
                Some(&self.config.selectors.response_block),
                Some(chat.url.clone()),
            )
        })?;
        let title = if chat.title.trim().is_empty() {
            chat.chat_id.clone().unwrap_or_else(|| "Chat".to_string())
        } else {
            chat.title.clone()
        };
        Ok(ChatExport {
            markdown: transcript_markdown(&title, &messages),
            message_count: messages.len(),
            chat,
        })
    }
}
