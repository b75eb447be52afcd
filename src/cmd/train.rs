//! Training control CLI — `parley train start|stop|status|log`.
//!
//! Thin HTTP client over the bridge's control API; the bridge port comes
//! from the service registry when the supervisor allocated it, falling back
//! to the configured port.

use anyhow::{Context, Result, bail};
use parley::config::ParleyConfig;
use parley::registry::ServiceRegistry;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

fn bridge_base_url(config: &ParleyConfig) -> String {
    let port = std::env::current_dir()
        .ok()
        .map(|dir| ServiceRegistry::default_path(&dir))
        .and_then(|path| ServiceRegistry::load(&path).ok())
        .and_then(|registry| registry.port_of("bridge"))
        .unwrap_or(config.bridge.port);
    format!("http://127.0.0.1:{port}")
}

pub async fn cmd_train_start(
    config_path: &Path,
    exchanges: u64,
    delay: f64,
    topic_interval: u64,
    watch: bool,
) -> Result<()> {
    let config = ParleyConfig::load(config_path)?;
    let base = bridge_base_url(&config);
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/training/start"))
        .timeout(CONTROL_TIMEOUT)
        .json(&serde_json::json!({
            "max_exchanges": exchanges,
            "delay": delay,
            "topic_switch_interval": topic_interval,
        }))
        .send()
        .await
        .with_context(|| format!("Cannot reach bridge at {base} — is it running?"))?;

    match response.status() {
        reqwest::StatusCode::ACCEPTED => {
            let body: Value = response.json().await.context("Invalid start response")?;
            println!("{} Training started", console::style("✓").green());
            println!("  Session:        {}", body["session_id"]);
            println!("  Max exchanges:  {exchanges}");
            println!("  Delay:          {delay}s");
            println!("  Topic switch:   every {topic_interval} exchanges");
        }
        reqwest::StatusCode::CONFLICT => {
            bail!("Training already running — stop it first: parley train stop");
        }
        status => {
            let text = response.text().await.unwrap_or_default();
            bail!("Start failed ({status}): {text}");
        }
    }

    if watch {
        println!("\nMonitoring progress (Ctrl+C detaches, training continues)...");
        watch_progress(&client, &base).await?;
    }
    Ok(())
}

async fn watch_progress(client: &reqwest::Client, base: &str) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nDetached. To stop training: parley train stop");
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let status: Value = client
                    .get(format!("{base}/api/training/status"))
                    .timeout(STATUS_TIMEOUT)
                    .send()
                    .await?
                    .json()
                    .await?;

                let state = status["state"].as_str().unwrap_or("?");
                if state == "running" || state == "stopping" {
                    println!(
                        "  {}/{} exchanges | topic: {}",
                        status["exchanges_completed"],
                        status["max_exchanges"],
                        status["current_topic"].as_str().unwrap_or("-"),
                    );
                } else {
                    println!(
                        "\n{} Training finished: {} ({} exchanges)",
                        console::style("✓").green(),
                        state,
                        status["exchanges_completed"],
                    );
                    return Ok(());
                }
            }
        }
    }
}

pub async fn cmd_train_stop(config_path: &Path) -> Result<()> {
    let config = ParleyConfig::load(config_path)?;
    let base = bridge_base_url(&config);

    let response = reqwest::Client::new()
        .post(format!("{base}/api/training/stop"))
        .timeout(CONTROL_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("Cannot reach bridge at {base} — is it running?"))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail!("Stop failed ({status}): {text}");
    }

    let body: Value = response.json().await.context("Invalid stop response")?;
    if body["was_running"].as_bool().unwrap_or(false) {
        println!(
            "{} Training stopped ({} exchanges completed)",
            console::style("✓").green(),
            body["exchanges_completed"]
        );
    } else {
        println!(
            "{} Training was not running ({} exchanges in last session)",
            console::style("·").dim(),
            body["exchanges_completed"]
        );
    }
    Ok(())
}

pub async fn cmd_train_status(config_path: &Path) -> Result<()> {
    let config = ParleyConfig::load(config_path)?;
    let base = bridge_base_url(&config);

    let status: Value = reqwest::Client::new()
        .get(format!("{base}/api/status"))
        .timeout(STATUS_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("Cannot reach bridge at {base} — is it running?"))?
        .json()
        .await
        .context("Invalid status response")?;

    println!("{}", console::style("Training status").bold().cyan());
    println!("  State:               {}", status["state"].as_str().unwrap_or("?"));
    println!("  Exchanges completed: {}", status["exchanges_completed"]);
    if let Some(topic) = status["current_topic"].as_str() {
        println!("  Current topic:       {topic}");
    }
    if let Some(started) = status["started_at"].as_str() {
        println!("  Started at:          {started}");
    }
    if let Some(reason) = status["failure_reason"].as_str() {
        println!(
            "  Failure reason:      {}",
            console::style(reason).red()
        );
    }
    println!(
        "  Generator:           {}",
        connected_label(status["generator_connected"].as_bool())
    );
    println!(
        "  Target:              {}",
        connected_label(status["target_connected"].as_bool())
    );
    Ok(())
}

fn connected_label(connected: Option<bool>) -> console::StyledObject<&'static str> {
    match connected {
        Some(true) => console::style("connected").green(),
        Some(false) => console::style("unreachable").red(),
        None => console::style("unknown").dim(),
    }
}

pub async fn cmd_train_log(config_path: &Path, limit: usize) -> Result<()> {
    let config = ParleyConfig::load(config_path)?;
    let base = bridge_base_url(&config);

    let body: Value = reqwest::Client::new()
        .get(format!("{base}/api/training/log"))
        .query(&[("limit", limit)])
        .timeout(STATUS_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("Cannot reach bridge at {base} — is it running?"))?
        .json()
        .await
        .context("Invalid log response")?;

    println!(
        "{} (showing {}/{})",
        console::style("Conversation log").bold().cyan(),
        body["showing"],
        body["total_exchanges"]
    );

    for exchange in body["exchanges"].as_array().unwrap_or(&Vec::new()) {
        println!(
            "\n[{}] {}",
            exchange["seq"],
            exchange["timestamp"].as_str().unwrap_or("")
        );
        println!("  → {}", exchange["generator_message"].as_str().unwrap_or(""));
        println!("  ← {}", exchange["target_response"].as_str().unwrap_or(""));
        if let Some(metadata) = exchange.get("metadata")
            && !metadata.is_null()
        {
            println!("  {} {}", console::style("meta:").dim(), metadata);
        }
    }
    Ok(())
}
