use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    /// Upper bound on how long shutdown waits for in-flight interactions.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Optional bearer token. When set, every route except `/status` requires it.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    8765
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            shutdown_grace_secs: default_shutdown_grace(),
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpConfig {
    #[serde(default = "default_cdp_host")]
    pub host: String,
    #[serde(default = "default_cdp_port")]
    pub port: u16,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_page_load_timeout")]
    pub page_load_timeout_secs: u64,
    /// Launch a browser when none answers on `host:port`. When false the pool
    /// fails fast and expects an externally started browser.
    #[serde(default)]
    pub launch_browser: bool,
    #[serde(default)]
    pub browser_path: Option<String>,
    #[serde(default)]
    pub user_data_dir: Option<String>,
    #[serde(default = "default_headed")]
    pub headed: bool,
}

fn default_cdp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cdp_port() -> u16 {
    9222
}

fn default_command_timeout() -> u64 {
    30
}

fn default_page_load_timeout() -> u64 {
    20
}

fn default_headed() -> bool {
    true
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            host: default_cdp_host(),
            port: default_cdp_port(),
            command_timeout_secs: default_command_timeout(),
            page_load_timeout_secs: default_page_load_timeout(),
            launch_browser: false,
            browser_path: None,
            user_data_dir: None,
            headed: default_headed(),
        }
    }
}

impl CdpConfig {
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    3000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

/// Page-structure knowledge for one assistant. Pure data: a layout change on
/// the assistant's site should only ever need edits here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SelectorConfig {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub send_button: Option<String>,
    #[serde(default)]
    pub response_block: String,
    #[serde(default)]
    pub user_message: Option<String>,
    /// Element visible while a reply is being generated.
    #[serde(default)]
    pub generating: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default = "default_auth_indicators")]
    pub auth_indicators: Vec<String>,
    /// Lower-case text fragments that mark a banner as an auth wall.
    #[serde(default = "default_auth_patterns")]
    pub auth_patterns: Vec<String>,
    #[serde(default)]
    pub rate_limit_selectors: Vec<String>,
    /// Lower-case text fragments that mark a banner as a rate limit or ban.
    #[serde(default = "default_rate_limit_patterns")]
    pub rate_limit_patterns: Vec<String>,
    /// Generic status/alert elements inspected for banners.
    #[serde(default = "default_status_banners")]
    pub status_banners: Vec<String>,
    #[serde(default)]
    pub chat_links: Option<String>,
    #[serde(default)]
    pub new_chat_button: Option<String>,
}

fn default_auth_indicators() -> Vec<String> {
    vec![
        "input[type='password']".to_string(),
        "form[action*='login']".to_string(),
        "[data-testid='login-button']".to_string(),
    ]
}

fn default_auth_patterns() -> Vec<String> {
    vec![
        "log in to continue".to_string(),
        "sign in to continue".to_string(),
        "session has expired".to_string(),
        "please log in".to_string(),
    ]
}

fn default_rate_limit_patterns() -> Vec<String> {
    vec![
        "rate limit".to_string(),
        "too many requests".to_string(),
        "usage limit".to_string(),
        "you've reached".to_string(),
        "you have reached".to_string(),
        "try again later".to_string(),
        "unusual activity".to_string(),
    ]
}

fn default_status_banners() -> Vec<String> {
    vec![
        "[role='alert']".to_string(),
        "[role='status']".to_string(),
        "[data-testid*='banner']".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantConfig {
    pub base_url: String,
    #[serde(default = "default_context_window")]
    pub context_window_tokens: u64,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stability")]
    pub stability_ms: u64,
    /// Delay between typed characters; 0 inserts the whole prompt at once.
    #[serde(default = "default_type_delay")]
    pub type_delay_ms: u64,
    #[serde(default)]
    pub new_chat_url: Option<String>,
    /// Regex with one capture group extracting the chat id from a chat URL.
    #[serde(default)]
    pub chat_id_pattern: Option<String>,
    /// URL for a chat id, with `{id}` as placeholder.
    #[serde(default)]
    pub chat_url_template: Option<String>,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

fn default_context_window() -> u64 {
    128_000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    400
}

fn default_stability() -> u64 {
    2000
}

fn default_type_delay() -> u64 {
    8
}

impl AssistantConfig {
    fn with_defaults(base_url: &str, context_window_tokens: u64, selectors: SelectorConfig) -> Self {
        Self {
            base_url: base_url.to_string(),
            context_window_tokens,
            default_timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval(),
            stability_ms: default_stability(),
            type_delay_ms: default_type_delay(),
            new_chat_url: None,
            chat_id_pattern: None,
            chat_url_template: None,
            selectors,
        }
    }

    pub fn claude() -> Self {
        let mut cfg = Self::with_defaults(
            "https://claude.ai",
            200_000,
            SelectorConfig {
                input: "div[contenteditable='true'].ProseMirror".to_string(),
                send_button: Some("button[aria-label='Send message']".to_string()),
                response_block: "div.font-claude-response".to_string(),
                user_message: Some("[data-testid='user-message']".to_string()),
                generating: Some("[data-is-streaming='true']".to_string()),
                model_name: Some("[data-testid='model-selector-dropdown']".to_string()),
                chat_links: Some("a[href^='/chat/']".to_string()),
                new_chat_button: Some("a[href='/new']".to_string()),
                ..SelectorConfig::standard()
            },
        );
        cfg.new_chat_url = Some("https://claude.ai/new".to_string());
        cfg.chat_id_pattern = Some(r"/chat/([0-9a-fA-F-]+)".to_string());
        cfg.chat_url_template = Some("https://claude.ai/chat/{id}".to_string());
        cfg
    }

    pub fn chatgpt() -> Self {
        let mut cfg = Self::with_defaults(
            "https://chatgpt.com",
            128_000,
            SelectorConfig {
                input: "#prompt-textarea".to_string(),
                send_button: Some("button[data-testid='send-button']".to_string()),
                response_block: "div[data-message-author-role='assistant']".to_string(),
                user_message: Some("div[data-message-author-role='user']".to_string()),
                generating: Some("button[data-testid='stop-button']".to_string()),
                model_name: Some("button[data-testid='model-switcher-dropdown-button']".to_string()),
                chat_links: Some("nav a[href^='/c/']".to_string()),
                new_chat_button: Some("a[data-testid='create-new-chat-button']".to_string()),
                ..SelectorConfig::standard()
            },
        );
        cfg.new_chat_url = Some("https://chatgpt.com/".to_string());
        cfg.chat_id_pattern = Some(r"/c/([0-9a-fA-F-]+)".to_string());
        cfg.chat_url_template = Some("https://chatgpt.com/c/{id}".to_string());
        cfg
    }

    pub fn gemini() -> Self {
        let mut cfg = Self::with_defaults(
            "https://gemini.google.com/app",
            1_000_000,
            SelectorConfig {
                input: "rich-textarea div[contenteditable='true']".to_string(),
                send_button: Some("button.send-button".to_string()),
                response_block: "message-content".to_string(),
                user_message: Some("user-query".to_string()),
                generating: Some("button.stop, .loading-indicator".to_string()),
                model_name: Some("[data-test-id='bard-mode-menu-button']".to_string()),
                chat_links: Some("a[href^='/app/']".to_string()),
                new_chat_button: Some("[data-test-id='new-chat-button'] a".to_string()),
                ..SelectorConfig::standard()
            },
        );
        cfg.new_chat_url = Some("https://gemini.google.com/app".to_string());
        cfg.chat_id_pattern = Some(r"/app/([0-9a-fA-F]+)".to_string());
        cfg.chat_url_template = Some("https://gemini.google.com/app/{id}".to_string());
        cfg
    }

    /// Resolve a chat id (or an absolute chat URL) to the URL to navigate to.
    pub fn chat_url(&self, chat_id: &str) -> Option<String> {
        if chat_id.starts_with("http://") || chat_id.starts_with("https://") {
            return Some(chat_id.to_string());
        }
        self.chat_url_template
            .as_ref()
            .map(|t| t.replace("{id}", chat_id))
    }
}

impl SelectorConfig {
    /// Auth, rate-limit and banner defaults shared by all built-in assistants.
    pub fn standard() -> Self {
        Self {
            auth_indicators: default_auth_indicators(),
            auth_patterns: default_auth_patterns(),
            rate_limit_patterns: default_rate_limit_patterns(),
            status_banners: default_status_banners(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContextPreset {
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

fn default_assistants() -> BTreeMap<String, AssistantConfig> {
    let mut map = BTreeMap::new();
    map.insert("claude".to_string(), AssistantConfig::claude());
    map.insert("chatgpt".to_string(), AssistantConfig::chatgpt());
    map.insert("gemini".to_string(), AssistantConfig::gemini());
    map
}

fn default_max_context_chars() -> usize {
    200_000
}

fn default_tokenizer() -> String {
    "tiktoken".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub cdp: CdpConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default = "default_assistants")]
    pub assistants: BTreeMap<String, AssistantConfig>,
    #[serde(default)]
    pub templates: HashMap<String, String>,
    #[serde(default)]
    pub context_presets: HashMap<String, ContextPreset>,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// `"tiktoken"` or `"heuristic"`.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            cdp: CdpConfig::default(),
            health: HealthConfig::default(),
            assistants: default_assistants(),
            templates: HashMap::new(),
            context_presets: HashMap::new(),
            max_context_chars: default_max_context_chars(),
            tokenizer: default_tokenizer(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Missing file means defaults; an unreadable or malformed one is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn assistant(&self, id: &str) -> Option<&AssistantConfig> {
        self.assistants.get(id)
    }

    pub fn assistant_ids(&self) -> Vec<String> {
        self.assistants.keys().cloned().collect()
    }

    pub fn user_data_dir(&self, paths: &Paths) -> PathBuf {
        self.cdp
            .user_data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.browser_profile_dir())
    }

    pub fn validate(&self) -> Result<()> {
        if self.assistants.is_empty() {
            return Err(Error::Config("no assistants configured".to_string()));
        }
        for (id, a) in &self.assistants {
            let parsed = url::Url::parse(&a.base_url)
                .map_err(|e| Error::Config(format!("assistant '{}': invalid baseUrl: {}", id, e)))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(Error::Config(format!(
                    "assistant '{}': baseUrl must be http(s), got '{}'",
                    id,
                    parsed.scheme()
                )));
            }
            if a.context_window_tokens == 0 {
                return Err(Error::Config(format!(
                    "assistant '{}': contextWindowTokens must be > 0",
                    id
                )));
            }
            if a.selectors.input.trim().is_empty() || a.selectors.response_block.trim().is_empty() {
                return Err(Error::Config(format!(
                    "assistant '{}': selectors.input and selectors.responseBlock are required",
                    id
                )));
            }
            if a.stability_ms >= a.default_timeout_secs.saturating_mul(1000) {
                return Err(Error::Config(format!(
                    "assistant '{}': stabilityMs must be shorter than defaultTimeoutSecs",
                    id
                )));
            }
            if let Some(pattern) = &a.chat_id_pattern {
                let re = regex::Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("assistant '{}': invalid chatIdPattern: {}", id, e))
                })?;
                if re.captures_len() < 2 {
                    return Err(Error::Config(format!(
                        "assistant '{}': chatIdPattern needs a capture group",
                        id
                    )));
                }
            }
        }
        match self.tokenizer.as_str() {
            "tiktoken" | "heuristic" => {}
            other => {
                return Err(Error::Config(format!("unknown tokenizer '{}'", other)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.assistant_ids(), vec!["chatgpt", "claude", "gemini"]);
        assert_eq!(cfg.daemon.port, 8765);
        assert_eq!(cfg.health.interval_secs, 30);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let raw = r#"{
  "daemon": { "port": 9000 },
  "assistants": {
    "claude": {
      "baseUrl": "https://claude.ai",
      "contextWindowTokens": 1000,
      "selectors": { "input": "textarea", "responseBlock": ".reply" }
    }
  }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.daemon.port, 9000);
        assert_eq!(cfg.daemon.host, "127.0.0.1");
        let claude = cfg.assistant("claude").unwrap();
        assert_eq!(claude.stability_ms, 2000);
        assert!(!claude.selectors.rate_limit_patterns.is_empty());
        assert_eq!(cfg.assistants.len(), 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_urls_and_patterns() {
        let mut cfg = Config::default();
        cfg.assistants.get_mut("claude").unwrap().base_url = "not a url".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.assistants.get_mut("chatgpt").unwrap().chat_id_pattern = Some("/c/".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tokenizer = "bpe".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_chat_url_resolution() {
        let claude = AssistantConfig::claude();
        assert_eq!(
            claude.chat_url("abc-123").as_deref(),
            Some("https://claude.ai/chat/abc-123")
        );
        assert_eq!(
            claude.chat_url("https://claude.ai/chat/x").as_deref(),
            Some("https://claude.ai/chat/x")
        );
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.templates
            .insert("review".to_string(), "Review {{file}}".to_string());
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.templates["review"], "Review {{file}}");
        assert_eq!(loaded.assistants.len(), 3);
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = Config::load_or_default(&path).unwrap();
        assert_eq!(cfg.daemon.port, Config::default().daemon.port);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Config::load_or_default(&path), Err(Error::Json(_))));
    }
}
