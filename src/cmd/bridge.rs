//! The bridge service — `parley bridge`.
//!
//! Hosts the training control API. Usually spawned by the supervisor, which
//! exports the allocated port as `PORT`; running it by hand works too.

use anyhow::{Context, Result, bail};
use parley::config::ParleyConfig;
use parley::registry::ServiceRegistry;
use parley::training::api::BridgeServer;
use parley::training::manager::SessionManager;
use parley::training::upstream::{HttpGenerator, HttpTarget};
use parley::training::worker::LoopSettings;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub async fn cmd_bridge(config_path: &Path, port_flag: Option<u16>) -> Result<()> {
    let config = ParleyConfig::load(config_path)?;
    let base_dir = std::env::current_dir().context("Failed to get current directory")?;

    // Port precedence: CLI flag, supervisor-provided PORT, config.
    let port = match port_flag {
        Some(port) => port,
        None => match std::env::var("PORT") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("Invalid PORT environment value '{value}'"))?,
            Err(_) => config.bridge.port,
        },
    };

    let generator_url = resolve_generator_url(&config, &base_dir).await?;
    tracing::info!(%generator_url, target_url = %config.target.url, "bridge upstreams resolved");

    let generator = Arc::new(HttpGenerator::new(
        &generator_url,
        &config.generator.chat_path,
        Duration::from_secs(config.generator.request_timeout_secs),
        Duration::from_secs(config.generator.probe_timeout_secs),
    ));
    let target = Arc::new(HttpTarget::new(
        &config.target.url,
        &config.target.chat_path,
        Duration::from_secs(config.target.request_timeout_secs),
        Duration::from_secs(config.target.probe_timeout_secs),
    ));

    let settings = LoopSettings {
        history_window: config.training.history_window,
        failure_threshold: config.training.failure_threshold,
        flush_every: config.training.flush_every,
        log_dir: base_dir.join(&config.training.log_dir),
    };
    let manager = Arc::new(SessionManager::new(generator, target, settings));

    let mut server = BridgeServer::new(manager.clone(), config.training.topics.clone());
    let addr = server
        .start(
            port,
            Duration::from_secs(config.training.monitor_interval_secs),
        )
        .await?;

    println!(
        "{} http://{}",
        console::style("Bridge listening on").bold(),
        addr
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    println!("\nShutting down bridge...");

    // Ask any running session to wind down, then wait for its worker so the
    // final log flush happens before the process exits.
    let outcome = manager.stop().await;
    if outcome.was_running {
        manager.wait_until_stopped().await;
    }
    server.stop().await;
    Ok(())
}

/// Explicit URL wins; otherwise wait briefly for the supervisor to publish
/// the generator's allocated port in the registry.
async fn resolve_generator_url(config: &ParleyConfig, base_dir: &Path) -> Result<String> {
    if !config.generator.url.is_empty() {
        return Ok(config.generator.url.clone());
    }

    let path = ServiceRegistry::default_path(base_dir);
    let service = &config.generator.service;
    let deadline = Instant::now() + Duration::from_secs(30);

    loop {
        if let Ok(registry) = ServiceRegistry::load(&path)
            && let Some(port) = registry.port_of(service)
        {
            return Ok(format!("http://127.0.0.1:{port}"));
        }
        if Instant::now() >= deadline {
            bail!(
                "Generator service '{service}' not found in registry {} — \
                 set generator.url or start it under 'parley up'",
                path.display()
            );
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
