use super::client::{print_json, DaemonClient};
use std::path::PathBuf;

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let client = DaemonClient::from_config(config_path)?;
    let body = client.get("/status", &[]).await?;
    print_json(&body)?;
    Ok(())
}
