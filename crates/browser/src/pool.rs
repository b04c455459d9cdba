//! Connection Pool: owns the single browser-level CDP connection and hands out
//! page handles scoped by origin.
//!
//! Connection errors are surfaced to the caller as-is; the pool never retries
//! on its own. A dropped browser connection bumps the pool generation, which
//! invalidates every previously issued [`PageHandle`].

use chatcell_core::CdpConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cdp::{CdpClient, CdpError};
use crate::launcher::{find_browser_binary, wait_for_cdp_ready, BrowserProcess};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Connection(#[from] CdpError),

    #[error("invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("page did not load: {0}")]
    PageLoad(String),
}

impl PoolError {
    /// True when the failure is at the browser-connection level rather than
    /// about a specific tab.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_disconnect() || matches!(e, CdpError::Timeout(_)),
            _ => false,
        }
    }
}

/// Result of `/json/version`, cached after the first successful discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDescriptor {
    pub browser_ws_url: String,
    pub browser: String,
    pub protocol_version: String,
}

impl EndpointDescriptor {
    pub fn from_version_json(body: &Value) -> Result<Self, CdpError> {
        let ws = body
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CdpError::Discovery("no webSocketDebuggerUrl in /json/version".to_string()))?;
        Ok(Self {
            browser_ws_url: ws.to_string(),
            browser: body
                .get("Browser")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            protocol_version: body
                .get("Protocol-Version")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
    pub target_id: String,
    pub target_type: String,
    pub url: String,
    pub title: String,
}

impl TargetInfo {
    pub fn from_json(v: &Value) -> Option<Self> {
        Some(Self {
            target_id: v.get("targetId")?.as_str()?.to_string(),
            target_type: v.get("type")?.as_str()?.to_string(),
            url: v.get("url").and_then(|u| u.as_str()).unwrap_or_default().to_string(),
            title: v.get("title").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
        })
    }
}

pub fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

pub fn same_origin(a: &str, b: &str) -> bool {
    match (origin_of(a), origin_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// First open page tab on the same origin as `base_url`.
pub fn select_target<'a>(targets: &'a [TargetInfo], base_url: &str) -> Option<&'a TargetInfo> {
    targets
        .iter()
        .find(|t| t.target_type == "page" && same_origin(&t.url, base_url))
}

struct PageInner {
    target_id: String,
    base_url: String,
    client: Arc<CdpClient>,
    generation: u64,
    pool_generation: Arc<AtomicU64>,
}

/// Capability for one open tab. Cheap to clone; lent to a transport for one
/// interaction at a time.
#[derive(Clone)]
pub struct PageHandle {
    inner: Arc<PageInner>,
}

impl PageHandle {
    pub fn target_id(&self) -> &str {
        &self.inner.target_id
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn client(&self) -> &CdpClient {
        &self.inner.client
    }

    pub fn is_alive(&self) -> bool {
        self.inner.client.is_alive()
            && self.inner.generation == self.inner.pool_generation.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("target_id", &self.inner.target_id)
            .field("base_url", &self.inner.base_url)
            .field("alive", &self.is_alive())
            .finish()
    }
}

pub struct ConnectionPool {
    config: CdpConfig,
    profile_dir: PathBuf,
    http: reqwest::Client,
    endpoint: RwLock<Option<EndpointDescriptor>>,
    connection: Mutex<Option<Arc<CdpClient>>>,
    /// Copy of the current connection for status readers. Never held across
    /// an await, so it stays readable while `connection` is being established.
    live: std::sync::RwLock<Option<Arc<CdpClient>>>,
    /// origin -> page handle
    pages: Mutex<HashMap<String, PageHandle>>,
    generation: Arc<AtomicU64>,
    browser: Mutex<Option<BrowserProcess>>,
}

impl ConnectionPool {
    pub fn new(config: CdpConfig, profile_dir: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            profile_dir,
            http,
            endpoint: RwLock::new(None),
            connection: Mutex::new(None),
            live: std::sync::RwLock::new(None),
            pages: Mutex::new(HashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            browser: Mutex::new(None),
        }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs.max(1))
    }

    fn publish(&self, client: Option<Arc<CdpClient>>) {
        if let Ok(mut live) = self.live.write() {
            *live = client;
        }
    }

    fn live_client(&self) -> Option<Arc<CdpClient>> {
        self.live
            .read()
            .ok()
            .and_then(|c| c.clone())
            .filter(|c| c.is_alive())
    }

    pub async fn cached_endpoint(&self) -> Option<EndpointDescriptor> {
        self.endpoint.read().await.clone()
    }

    /// Return the live browser connection, establishing one if needed.
    pub async fn acquire_connection(&self) -> Result<Arc<CdpClient>, PoolError> {
        let mut conn = self.connection.lock().await;
        if let Some(existing) = conn.as_ref() {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            warn!("Browser connection lost, invalidating page handles");
            *conn = None;
            self.publish(None);
            self.invalidate_pages().await;
        }

        let endpoint = self.endpoint().await?;
        match CdpClient::connect(&endpoint.browser_ws_url, self.command_timeout()).await {
            Ok(client) => {
                info!(browser = %endpoint.browser, "Browser connection established");
                let client = Arc::new(client);
                *conn = Some(client.clone());
                self.publish(Some(client.clone()));
                Ok(client)
            }
            Err(e) => {
                // The browser may have restarted under a new WebSocket URL.
                *self.endpoint.write().await = None;
                Err(e.into())
            }
        }
    }

    async fn invalidate_pages(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.pages.lock().await.clear();
    }

    async fn endpoint(&self) -> Result<EndpointDescriptor, PoolError> {
        if let Some(ep) = self.endpoint.read().await.clone() {
            return Ok(ep);
        }

        let ep = match self.discover().await {
            Ok(ep) => ep,
            Err(e) if self.config.launch_browser => {
                debug!(error = %e, "No browser answered, launching one");
                self.launch().await?
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            browser = %ep.browser,
            protocol = %ep.protocol_version,
            "Discovered CDP endpoint"
        );
        *self.endpoint.write().await = Some(ep.clone());
        Ok(ep)
    }

    async fn discover(&self) -> Result<EndpointDescriptor, CdpError> {
        let url = format!("{}/json/version", self.config.http_base());
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CdpError::Discovery(format!("{}: {}", url, e)))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CdpError::Discovery(format!("{}: {}", url, e)))?;
        EndpointDescriptor::from_version_json(&body)
    }

    async fn launch(&self) -> Result<EndpointDescriptor, CdpError> {
        let binary = self
            .config
            .browser_path
            .clone()
            .or_else(find_browser_binary)
            .ok_or_else(|| CdpError::Discovery("no Chrome/Chromium binary found".to_string()))?;
        let process =
            BrowserProcess::launch(&binary, self.config.port, &self.profile_dir, self.config.headed)
                .await?;
        *self.browser.lock().await = Some(process);
        let body =
            wait_for_cdp_ready(&self.http, &self.config.http_base(), Duration::from_secs(15)).await?;
        EndpointDescriptor::from_version_json(&body)
    }

    /// Find or open a tab on `base_url`'s origin.
    pub async fn get_page(&self, base_url: &str) -> Result<PageHandle, PoolError> {
        let origin = origin_of(base_url).ok_or_else(|| PoolError::InvalidUrl(base_url.to_string()))?;

        let cached = self.pages.lock().await.get(&origin).cloned();
        if let Some(handle) = cached {
            if handle.is_alive() && self.still_on_origin(&handle, base_url).await {
                return Ok(handle);
            }
            self.pages.lock().await.remove(&origin);
        }

        let browser = self.acquire_connection().await?;
        let generation = self.generation.load(Ordering::SeqCst);
        let targets: Vec<TargetInfo> = browser
            .get_targets()
            .await?
            .iter()
            .filter_map(TargetInfo::from_json)
            .collect();

        let (target_id, created) = match select_target(&targets, base_url) {
            Some(t) => {
                debug!(target = %t.target_id, url = %t.url, "Reusing open tab");
                (t.target_id.clone(), false)
            }
            None => {
                info!(url = base_url, "Opening new tab");
                (browser.create_target(base_url).await?, true)
            }
        };

        let ws_url = self.page_ws_url(&target_id).await;
        let client = Arc::new(CdpClient::connect(&ws_url, self.command_timeout()).await?);
        client.enable_domain("Page").await?;
        client.enable_domain("Runtime").await?;
        if created {
            self.wait_for_load(&client).await?;
        }

        let handle = PageHandle {
            inner: Arc::new(PageInner {
                target_id,
                base_url: base_url.to_string(),
                client,
                generation,
                pool_generation: self.generation.clone(),
            }),
        };
        self.pages.lock().await.insert(origin, handle.clone());
        Ok(handle)
    }

    async fn still_on_origin(&self, handle: &PageHandle, base_url: &str) -> bool {
        match handle.client().evaluate_value("window.location.href").await {
            Ok(Value::String(href)) => same_origin(&href, base_url),
            _ => false,
        }
    }

    /// Resolve a target's WebSocket URL via `/json/list`, falling back to the
    /// standard `/devtools/page/<id>` path.
    async fn page_ws_url(&self, target_id: &str) -> String {
        let fallback = format!(
            "ws://{}:{}/devtools/page/{}",
            self.config.host, self.config.port, target_id
        );
        let url = format!("{}/json/list", self.config.http_base());

        for attempt in 0..5 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let Ok(resp) = self.http.get(&url).send().await else {
                continue;
            };
            let Ok(targets) = resp.json::<Vec<Value>>().await else {
                continue;
            };
            let found = targets.iter().find_map(|t| {
                (t.get("id").and_then(|v| v.as_str()) == Some(target_id))
                    .then(|| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
                    .flatten()
                    .map(str::to_string)
            });
            if let Some(ws) = found {
                return ws;
            }
        }
        fallback
    }

    async fn wait_for_load(&self, client: &CdpClient) -> Result<(), PoolError> {
        let timeout = Duration::from_secs(self.config.page_load_timeout_secs.max(1));
        let start = Instant::now();
        loop {
            match client.evaluate_value("document.readyState").await {
                Ok(Value::String(state)) if state == "complete" => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_disconnect() => return Err(e.into()),
                Err(e) => debug!(error = %e, "readyState probe failed"),
            }
            if start.elapsed() >= timeout {
                return Err(PoolError::PageLoad(format!(
                    "no load signal within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Cheap liveness probe. Never touches tab state and never waits on a
    /// connection attempt in progress.
    pub async fn is_healthy(&self, timeout: Duration) -> bool {
        if let Some(client) = self.live_client() {
            return client
                .send_command_with_timeout("Browser.getVersion", json!({}), timeout)
                .await
                .is_ok();
        }
        let url = format!("{}/json/version", self.config.http_base());
        matches!(
            tokio::time::timeout(timeout, self.http.get(&url).send()).await,
            Ok(Ok(resp)) if resp.status().is_success()
        )
    }

    /// Whether a live browser connection is currently held.
    pub fn is_active(&self) -> bool {
        self.live_client().is_some()
    }

    pub async fn has_live_page(&self, base_url: &str) -> bool {
        let Some(origin) = origin_of(base_url) else {
            return false;
        };
        self.pages
            .lock()
            .await
            .get(&origin)
            .map(|h| h.is_alive())
            .unwrap_or(false)
    }

    /// Drop all connections and stop the browser if this pool launched it.
    pub async fn release(&self) {
        let pages: Vec<PageHandle> = self.pages.lock().await.drain().map(|(_, h)| h).collect();
        for page in pages {
            page.client().close().await;
        }
        self.publish(None);
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close().await;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut browser) = self.browser.lock().await.take() {
            info!(binary = %browser.binary, "Stopping launched browser");
            browser.kill().await;
        }
    }
}
