//! Optional browser launch for when nothing listens on the configured
//! remote-debugging port.

use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::cdp::CdpError;

/// A browser process started by the daemon. Killed on drop; browsers the
/// daemon merely attached to are never represented here.
pub struct BrowserProcess {
    child: Child,
    pub binary: String,
}

impl BrowserProcess {
    pub async fn launch(
        binary: &str,
        debug_port: u16,
        user_data_dir: &Path,
        headed: bool,
    ) -> Result<Self, CdpError> {
        std::fs::create_dir_all(user_data_dir).map_err(|e| {
            CdpError::Discovery(format!("failed to create user data dir: {}", e))
        })?;

        let args = build_browser_args(debug_port, user_data_dir, headed);
        info!(
            binary = binary,
            port = debug_port,
            headed = headed,
            "Launching browser for remote debugging"
        );

        let child = Command::new(binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CdpError::Discovery(format!("failed to launch {}: {}", binary, e)))?;

        Ok(Self {
            child,
            binary: binary.to_string(),
        })
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Browser process kill failed (may already be gone): {}", e);
        }
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Chrome command line for a persistent, human-loggable profile.
pub fn build_browser_args(debug_port: u16, user_data_dir: &Path, headed: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--password-store=basic".to_string(),
    ];
    if !headed {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,900".to_string());
    args.push("about:blank".to_string());
    args
}

/// Find a Chrome/Chromium binary on the system.
pub fn find_browser_binary() -> Option<String> {
    let candidates: Vec<&str> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok()
        {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Poll `/json/version` until it answers with a browser WebSocket URL.
pub async fn wait_for_cdp_ready(
    http: &reqwest::Client,
    http_base: &str,
    timeout: Duration,
) -> Result<Value, CdpError> {
    let start = Instant::now();
    let url = format!("{}/json/version", http_base);

    loop {
        if start.elapsed() > timeout {
            return Err(CdpError::Discovery(format!(
                "browser not ready after {}s at {}",
                timeout.as_secs(),
                http_base
            )));
        }

        if let Ok(resp) = http.get(&url).send().await {
            if let Ok(body) = resp.json::<Value>().await {
                if body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()).is_some() {
                    return Ok(body);
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
