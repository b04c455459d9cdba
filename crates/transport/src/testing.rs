//! Scripted in-memory page used by the transport tests.

use async_trait::async_trait;
use chatcell_core::SelectorConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::page::{
    AcquireError, Banner, PageError, PageLink, PageMessage, PageOps, PageProbe, PageSource, ResponseStats,
};

#[derive(Default)]
struct State {
    url: String,
    title: String,
    probe: PageProbe,
    script: VecDeque<ResponseStats>,
    hold: Option<ResponseStats>,
    last: ResponseStats,
    exhausted_error: Option<PageError>,
    blocks: Vec<String>,
    html_error: Option<PageError>,
    banner_after_submit: Option<Banner>,
    model: Option<String>,
    typed: String,
    submissions: usize,
    links: Vec<PageLink>,
    messages: Vec<PageMessage>,
    navigations: Vec<String>,
    redirects: HashMap<String, String>,
    clicks: HashMap<String, String>,
}

pub struct FakePage {
    state: Mutex<State>,
}

impl FakePage {
    /// A page with a usable input and no banners.
    pub fn ready(url: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                url: url.to_string(),
                title: "Assistant".to_string(),
                probe: PageProbe {
                    input_present: true,
                    input_enabled: true,
                    ..Default::default()
                },
                ..Default::default()
            }),
        })
    }

    /// Stats returned by successive `response_stats` calls. The first entry
    /// is the pre-send baseline.
    pub fn script_stats(&self, stats: Vec<ResponseStats>) {
        self.state.lock().unwrap().script = stats.into();
    }

    /// Returned once the script runs out. Defaults to the last scripted value.
    pub fn hold_stats(&self, stats: ResponseStats) {
        self.state.lock().unwrap().hold = Some(stats);
    }

    pub fn fail_stats_after_script(&self, err: PageError) {
        self.state.lock().unwrap().exhausted_error = Some(err);
    }

    pub fn update_probe(&self, f: impl FnOnce(&mut PageProbe)) {
        f(&mut self.state.lock().unwrap().probe);
    }

    /// Shown on the page once the prompt has been submitted.
    pub fn banner_after_submit(&self, banner: Banner) {
        self.state.lock().unwrap().banner_after_submit = Some(banner);
    }

    pub fn fail_html(&self, err: PageError) {
        self.state.lock().unwrap().html_error = Some(err);
    }

    pub fn set_blocks(&self, blocks: Vec<&str>) {
        self.state.lock().unwrap().blocks = blocks.into_iter().map(str::to_string).collect();
    }

    pub fn set_model(&self, model: Option<&str>) {
        self.state.lock().unwrap().model = model.map(str::to_string);
    }

    pub fn set_title(&self, title: &str) {
        self.state.lock().unwrap().title = title.to_string();
    }

    pub fn set_links(&self, links: Vec<PageLink>) {
        self.state.lock().unwrap().links = links;
    }

    pub fn set_messages(&self, messages: Vec<PageMessage>) {
        self.state.lock().unwrap().messages = messages;
    }

    pub fn redirect(&self, from: &str, to: &str) {
        self.state
            .lock()
            .unwrap()
            .redirects
            .insert(from.to_string(), to.to_string());
    }

    /// Clicking `selector` moves the page to `url`.
    pub fn on_click(&self, selector: &str, url: &str) {
        self.state
            .lock()
            .unwrap()
            .clicks
            .insert(selector.to_string(), url.to_string());
    }

    pub fn typed(&self) -> String {
        self.state.lock().unwrap().typed.clone()
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submissions
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }
}

#[async_trait]
impl PageOps for FakePage {
    async fn url(&self) -> Result<String, PageError> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn title(&self) -> Result<String, PageError> {
        Ok(self.state.lock().unwrap().title.clone())
    }

    async fn probe(&self, _selectors: &SelectorConfig) -> Result<PageProbe, PageError> {
        let s = self.state.lock().unwrap();
        let mut probe = s.probe.clone();
        probe.url = s.url.clone();
        Ok(probe)
    }

    async fn response_stats(&self, _selectors: &SelectorConfig) -> Result<ResponseStats, PageError> {
        let mut s = self.state.lock().unwrap();
        if let Some(next) = s.script.pop_front() {
            s.last = next;
            return Ok(next);
        }
        if let Some(err) = &s.exhausted_error {
            return Err(err.clone());
        }
        Ok(s.hold.unwrap_or(s.last))
    }

    async fn type_text(&self, _selector: &str, text: &str, _delay: Duration) -> Result<(), PageError> {
        self.state.lock().unwrap().typed = text.to_string();
        Ok(())
    }

    async fn submit(&self, _selectors: &SelectorConfig) -> Result<(), PageError> {
        let mut s = self.state.lock().unwrap();
        s.submissions += 1;
        if let Some(banner) = s.banner_after_submit.take() {
            s.probe.banners.push(banner);
        }
        Ok(())
    }

    async fn response_html(&self, _selector: &str, index: usize) -> Result<Option<String>, PageError> {
        let s = self.state.lock().unwrap();
        if let Some(err) = &s.html_error {
            return Err(err.clone());
        }
        Ok(s.blocks.get(index).cloned())
    }

    async fn model_name(&self, _selector: &str) -> Result<Option<String>, PageError> {
        Ok(self.state.lock().unwrap().model.clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        let mut s = self.state.lock().unwrap();
        s.navigations.push(url.to_string());
        let next = s.redirects.get(url).cloned().unwrap_or_else(|| url.to_string());
        s.url = next;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<bool, PageError> {
        let mut s = self.state.lock().unwrap();
        match s.clicks.get(selector).cloned() {
            Some(url) => {
                s.url = url;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn links(&self, _selector: &str) -> Result<Vec<PageLink>, PageError> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn messages(&self, _selectors: &SelectorConfig) -> Result<Vec<PageMessage>, PageError> {
        Ok(self.state.lock().unwrap().messages.clone())
    }
}

pub struct FakeSource {
    page: Option<Arc<FakePage>>,
    error: Option<AcquireError>,
}

impl FakeSource {
    pub fn with_page(page: Arc<FakePage>) -> Self {
        Self {
            page: Some(page),
            error: None,
        }
    }

    pub fn failing(error: AcquireError) -> Self {
        Self {
            page: None,
            error: Some(error),
        }
    }
}

#[async_trait]
impl PageSource for FakeSource {
    async fn acquire(&self, _base_url: &str) -> Result<Arc<dyn PageOps>, AcquireError> {
        match (&self.page, &self.error) {
            (Some(page), _) => Ok(page.clone() as Arc<dyn PageOps>),
            (None, Some(err)) => Err(err.clone()),
            (None, None) => Err(AcquireError::Page("no page".to_string())),
        }
    }
}
