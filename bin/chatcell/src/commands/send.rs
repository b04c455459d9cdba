use super::client::{exit_on_failure, print_json, DaemonClient};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;

pub struct SendArgs {
    pub target: String,
    pub prompt: String,
    pub wait: bool,
    pub timeout: Option<u64>,
    pub template: Option<String>,
    pub vars: Vec<String>,
    pub context: Option<String>,
}

/// Parse repeated `key=value` flags.
fn parse_vars(vars: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut out = Map::new();
    for pair in vars {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--var expects key=value, got '{}'", pair))?;
        out.insert(k.trim().to_string(), Value::String(v.to_string()));
    }
    Ok(out)
}

fn request_body(args: &SendArgs) -> anyhow::Result<Value> {
    let mut body = json!({
        "target": args.target,
        "prompt": args.prompt,
        "wait_for_response": args.wait,
    });
    if let Some(t) = args.timeout {
        body["timeout_s"] = json!(t);
    }
    if let Some(name) = &args.template {
        body["template"] = json!(name);
    }
    if !args.vars.is_empty() {
        body["template_vars"] = Value::Object(parse_vars(&args.vars)?);
    }
    if let Some(preset) = &args.context {
        body["context_preset"] = json!(preset);
    }
    Ok(body)
}

pub async fn run(config_path: Option<PathBuf>, args: SendArgs) -> anyhow::Result<()> {
    let client = DaemonClient::from_config(config_path)?;
    let body = request_body(&args)?;
    // Leave headroom over the daemon-side wait; without --timeout the
    // daemon's default applies and the client waits indefinitely.
    let http_timeout = args.timeout.map(|t| Duration::from_secs(t + 30));
    let resp = client.post("/send", &body, http_timeout).await?;
    exit_on_failure(print_json(&resp)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SendArgs {
        SendArgs {
            target: "claude".to_string(),
            prompt: "What is 2+3?".to_string(),
            wait: true,
            timeout: None,
            template: None,
            vars: Vec::new(),
            context: None,
        }
    }

    #[test]
    fn test_minimal_body() {
        let body = request_body(&args()).unwrap();
        assert_eq!(body["target"], "claude");
        assert_eq!(body["wait_for_response"], true);
        assert!(body.get("timeout_s").is_none());
    }

    #[test]
    fn test_vars_and_options() {
        let mut a = args();
        a.wait = false;
        a.timeout = Some(90);
        a.template = Some("review".to_string());
        a.vars = vec!["lang=Rust".to_string(), "style = terse".to_string()];
        let body = request_body(&a).unwrap();
        assert_eq!(body["timeout_s"], 90);
        assert_eq!(body["template_vars"]["lang"], "Rust");
        assert_eq!(body["template_vars"]["style"], " terse");
    }

    #[test]
    fn test_bad_var_is_rejected() {
        let mut a = args();
        a.vars = vec!["novalue".to_string()];
        assert!(request_body(&a).is_err());
    }
}
