//! Thin HTTP client the CLI subcommands use to talk to a running daemon.

use anyhow::Context;
use chatcell_core::{Config, Paths};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

pub struct DaemonClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

/// Wildcard bind addresses are not connectable; talk to loopback instead.
fn connect_host(bind_host: &str) -> &str {
    match bind_host {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    }
}

impl DaemonClient {
    pub fn from_config(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = config_path.unwrap_or_else(|| Paths::new().config_file());
        let config = Config::load_or_default(&path)
            .with_context(|| format!("loading {}", path.display()))?;
        Ok(Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()?,
            base: format!(
                "http://{}:{}",
                connect_host(&config.daemon.host),
                config.daemon.port
            ),
            token: config.daemon.api_token.filter(|t| !t.is_empty()),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<Value> {
        let req = self.http.get(format!("{}{}", self.base, path)).query(query);
        self.finish(self.authorize(req)).await
    }

    /// POST `body`. `timeout` bounds the whole request when given.
    pub async fn post(&self, path: &str, body: &Value, timeout: Option<Duration>) -> anyhow::Result<Value> {
        let mut req = self.http.post(format!("{}{}", self.base, path)).json(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        self.finish(self.authorize(req)).await
    }

    async fn finish(&self, req: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("cannot reach chatcell daemon at {}", self.base))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("daemon returned {}: {}", status, text);
        }
        Ok(resp.json().await?)
    }
}

/// Pretty-print a response body. Returns whether it reported success.
pub fn print_json(body: &Value) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(body)?);
    Ok(body.get("success").and_then(Value::as_bool).unwrap_or(true))
}

/// Exit non-zero when the daemon reported a domain failure.
pub fn exit_on_failure(ok: bool) {
    if !ok {
        std::process::exit(1);
    }
}
