//! Full-system bring-up and supervision — `parley up`.

use anyhow::{Context, Result, bail};
use parley::config::ParleyConfig;
use parley::supervisor::health::HealthChecker;
use parley::supervisor::process::OsLauncher;
use parley::supervisor::{MonitorEvent, ProcessSupervisor, SupervisorOptions};
use std::path::Path;
use std::sync::Arc;

pub async fn cmd_up(config_path: &Path) -> Result<()> {
    let config = ParleyConfig::load(config_path)?;
    if config.services.is_empty() {
        bail!(
            "No services defined in {} — add [[service]] entries first",
            config_path.display()
        );
    }

    let base_dir = std::env::current_dir().context("Failed to get current directory")?;
    let options = SupervisorOptions {
        base_dir,
        ..Default::default()
    };

    let mut supervisor = ProcessSupervisor::new(
        config.services.clone(),
        options,
        Arc::new(OsLauncher),
        Arc::new(HealthChecker::new()),
    )?;

    println!(
        "{}",
        console::style("Starting services...").bold().cyan()
    );
    let report = supervisor.start_all().await?;

    for name in &report.started {
        println!("  {} {}", console::style("✓").green(), name);
    }
    for (name, reason) in &report.skipped {
        println!(
            "  {} {} ({})",
            console::style("-").yellow(),
            name,
            console::style(reason).dim()
        );
    }
    if report.started.is_empty() {
        bail!("No services started");
    }

    print_endpoints(&supervisor);
    println!(
        "\n{}",
        console::style("All services up. Press Ctrl+C to stop.").bold()
    );

    // Single monitor worker: OS-liveness polls until Ctrl+C or a fatal
    // crash.
    let interval = supervisor.monitor_interval();
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutdown requested...");
                break Ok(());
            }
            _ = tokio::time::sleep(interval) => {
                let events = supervisor.monitor_once().await?;
                for event in &events {
                    match event {
                        MonitorEvent::Restarted { service } => {
                            println!(
                                "  {} {} restarted",
                                console::style("↻").yellow(),
                                service
                            );
                        }
                        MonitorEvent::Crashed { service, required } => {
                            println!(
                                "  {} {} crashed{}",
                                console::style("✗").red(),
                                service,
                                if *required { " (required)" } else { "" }
                            );
                        }
                    }
                }
                if supervisor.has_fatal_crash() {
                    break Err(anyhow::anyhow!(
                        "A required service crashed and could not be restarted"
                    ));
                }
            }
        }
    };

    supervisor.shutdown_all().await;
    println!("{}", console::style("All services stopped.").green());
    outcome
}

fn print_endpoints(supervisor: &ProcessSupervisor) {
    println!("\nService endpoints:");
    for (name, entry) in supervisor.registry().iter() {
        println!(
            "  {:<16} http://127.0.0.1:{}{}",
            name, entry.port, entry.health_path
        );
    }
}
