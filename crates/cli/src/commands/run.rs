//! `run` command implementation.

use anyhow::{Context, Result};
use contracts::{BridgeConfig, SinkKind};
use std::time::Duration;
use tracing::{info, warn};

use super::load_config;
use crate::cli::RunArgs;
use crate::pipeline::{Pipeline, PipelineConfig};

/// Execute the `run` command
pub async fn run_pipeline(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    let mut config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    apply_overrides(&mut config, args);
    config_loader::ConfigLoader::validate(&config)
        .context("Configuration invalid after applying command-line overrides")?;

    info!(
        sink = ?config.sink_kind(),
        host = %config.broker.host,
        port = config.broker.port,
        tls = config.broker.uses_tls(),
        root = %config.local_store.root.display(),
        "Configuration loaded"
    );

    // Dry run - just validate and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&config);
        return Ok(());
    }

    if args.publish_raw && config.broker.raw_topic.is_none() {
        warn!("--publish-raw given but broker.raw_topic is not configured");
    }

    let pipeline = Pipeline::new(PipelineConfig {
        bridge: config,
        input: args.input.clone(),
        publish_raw: args.publish_raw,
        max_frames: if args.max_frames == 0 {
            None
        } else {
            Some(args.max_frames)
        },
        buffer_size: args.buffer_size.max(1),
        metrics_port: if args.metrics_port == 0 {
            None
        } else {
            Some(args.metrics_port)
        },
    });

    let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));

    info!("Starting pipeline...");
    let stats = pipeline
        .run(stop_signal(timeout))
        .await
        .context("Pipeline execution failed")?;

    info!(
        frames_delivered = stats.frames_delivered,
        frames_dropped = stats.frames_dropped,
        duration_secs = stats.duration.as_secs_f64(),
        fps = format!("{:.2}", stats.fps()),
        "Pipeline completed"
    );
    stats.print_summary();

    info!("Textile bridge finished");
    Ok(())
}

/// Apply command-line overrides on top of the loaded configuration
fn apply_overrides(config: &mut BridgeConfig, args: &RunArgs) {
    if let Some(ref host) = args.host {
        info!(host = %host, "Overriding broker host from CLI");
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        info!(port = %port, "Overriding broker port from CLI");
        config.broker.port = port;
    }
    if args.local {
        info!("Forcing local mode from CLI");
        config.local_mode = true;
    }
    if let Some(ref root) = args.root {
        info!(root = %root.display(), "Overriding local log root from CLI");
        config.local_store.root = root.clone();
    }
}

/// Resolves on Ctrl+C, SIGTERM, or when the optional timeout elapses
async fn stop_signal(timeout: Option<Duration>) {
    let deadline = async {
        match timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                info!(timeout_secs = limit.as_secs(), "Timeout reached");
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = setup_shutdown_signal() => {
            warn!("Received shutdown signal, stopping pipeline...");
        }
        _ = deadline => {}
    }
}

/// Setup Ctrl+C and SIGTERM signal handlers
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print configuration summary for dry-run mode
fn print_config_summary(config: &BridgeConfig) {
    println!("\n=== Configuration Summary ===\n");
    println!("Queue capacity: {}", config.queue_capacity);
    match config.sink_kind() {
        SinkKind::Network => {
            let broker = &config.broker;
            println!("Sink: broker");
            println!("  Address: {}:{}", broker.host, broker.port);
            println!("  Client id: {}", broker.client_id);
            println!("  Topic: {}", broker.topic);
            if let Some(ref raw) = broker.raw_topic {
                println!("  Raw topic: {}", raw);
            }
            println!("  QoS: {}", broker.qos);
            println!("  TLS: {}", if broker.uses_tls() { "yes" } else { "no" });
        }
        SinkKind::Local => {
            let store = &config.local_store;
            println!("Sink: local log");
            println!("  Root: {}", store.root.display());
            println!("  Flush every: {} rows", store.flush_every_rows);
            println!("  Inactivity timeout: {}s", store.inactivity_timeout_secs);
            println!("  UTC offset: {} min", store.utc_offset_minutes);
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["run"];
        argv.extend_from_slice(extra);
        RunArgs::parse_from(argv)
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = BridgeConfig::default();
        let args = run_args(&[
            "--host", "broker.local", "--port", "8883", "--local", "--root", "/data/logs",
        ]);

        apply_overrides(&mut config, &args);

        assert_eq!(config.broker.host, "broker.local");
        assert!(config.broker.uses_tls());
        assert!(config.local_mode);
        assert_eq!(config.local_store.root, std::path::PathBuf::from("/data/logs"));
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let mut config = BridgeConfig::default();
        apply_overrides(&mut config, &run_args(&[]));

        assert!(!config.local_mode);
        assert_eq!(config.broker.port, 1883);
    }

    #[tokio::test]
    async fn test_stop_signal_honours_timeout() {
        let stopped = tokio::time::timeout(
            Duration::from_secs(2),
            stop_signal(Some(Duration::from_millis(10))),
        )
        .await;
        assert!(stopped.is_ok());
    }
}
