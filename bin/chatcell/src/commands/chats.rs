use super::client::{exit_on_failure, print_json, DaemonClient};
use serde_json::json;
use std::path::PathBuf;

pub async fn list(config_path: Option<PathBuf>, target: &str) -> anyhow::Result<()> {
    let client = DaemonClient::from_config(config_path)?;
    let body = client.get("/chats/list", &[("ai", target)]).await?;
    exit_on_failure(print_json(&body)?);
    Ok(())
}

pub async fn new_chat(config_path: Option<PathBuf>, target: &str) -> anyhow::Result<()> {
    let client = DaemonClient::from_config(config_path)?;
    let body = client
        .post("/chats/new", &json!({ "target": target }), None)
        .await?;
    exit_on_failure(print_json(&body)?);
    Ok(())
}

pub async fn switch(config_path: Option<PathBuf>, target: &str, chat_id: &str) -> anyhow::Result<()> {
    let client = DaemonClient::from_config(config_path)?;
    let body = client
        .post(
            "/chats/switch",
            &json!({ "target": target, "chat_id": chat_id }),
            None,
        )
        .await?;
    exit_on_failure(print_json(&body)?);
    Ok(())
}

pub async fn export(config_path: Option<PathBuf>, target: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
    let client = DaemonClient::from_config(config_path)?;
    let mut req = json!({ "target": target });
    if let Some(path) = output {
        req["output_path"] = json!(path);
    }
    let body = client.post("/chats/export", &req, None).await?;
    exit_on_failure(print_json(&body)?);
    Ok(())
}
