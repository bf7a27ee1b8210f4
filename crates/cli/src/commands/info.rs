//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{BridgeConfig, SinkKind};
use dispatcher::sinks::network::trust_plan;
use serde::Serialize;
use tracing::info;

use super::load_config;
use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    sink: SinkKind,
    queue_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    broker: Option<BrokerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_store: Option<LocalStoreInfo>,
}

#[derive(Serialize)]
struct BrokerInfo {
    host: String,
    port: u16,
    client_id: String,
    topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_topic: Option<String>,
    qos: i32,
    tls: bool,
    trust_plan: Vec<String>,
}

#[derive(Serialize)]
struct LocalStoreInfo {
    root: String,
    path_pattern: String,
    flush_every_rows: usize,
    inactivity_timeout_secs: u64,
    utc_offset_minutes: i32,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let info = build_config_info(&config);
    if args.json {
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&info);
    }

    Ok(())
}

fn build_config_info(config: &BridgeConfig) -> ConfigInfo {
    let (broker, local_store) = match config.sink_kind() {
        SinkKind::Network => {
            let broker = &config.broker;
            let info = BrokerInfo {
                host: broker.host.clone(),
                port: broker.port,
                client_id: broker.client_id.clone(),
                topic: broker.topic.clone(),
                raw_topic: broker.raw_topic.clone(),
                qos: broker.qos,
                tls: broker.uses_tls(),
                trust_plan: trust_plan(broker)
                    .iter()
                    .map(|mode| mode.as_str().to_string())
                    .collect(),
            };
            (Some(info), None)
        }
        SinkKind::Local => {
            let store = &config.local_store;
            let pattern = store
                .root
                .join("<device>")
                .join("<YYYYMMDD>")
                .join("<HHmmss>.csv");
            let info = LocalStoreInfo {
                root: store.root.display().to_string(),
                path_pattern: pattern.display().to_string(),
                flush_every_rows: store.flush_every_rows,
                inactivity_timeout_secs: store.inactivity_timeout_secs,
                utc_offset_minutes: store.utc_offset_minutes,
            };
            (None, Some(info))
        }
    };

    ConfigInfo {
        sink: config.sink_kind(),
        queue_capacity: config.queue_capacity,
        broker,
        local_store,
    }
}

fn print_config_info(info: &ConfigInfo) {
    println!("\n=== Bridge Configuration ===\n");
    println!("Sink: {:?}", info.sink);
    println!("Queue capacity: {}", info.queue_capacity);

    if let Some(ref broker) = info.broker {
        println!("\nBroker:");
        println!("  Address: {}:{}", broker.host, broker.port);
        println!("  Client id: {}", broker.client_id);
        println!("  Topic: {} (QoS {})", broker.topic, broker.qos);
        if let Some(ref raw) = broker.raw_topic {
            println!("  Raw topic: {}", raw);
        }
        println!("  TLS: {}", broker.tls);
        println!("  Trust plan: {}", broker.trust_plan.join(" -> "));
    }

    if let Some(ref store) = info.local_store {
        println!("\nLocal log:");
        println!("  Files: {}", store.path_pattern);
        println!("  Flush every: {} rows", store.flush_every_rows);
        println!("  New file after: {}s idle", store.inactivity_timeout_secs);
        println!("  UTC offset: {} min", store.utc_offset_minutes);
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_info_lists_trust_plan() {
        let mut config = BridgeConfig::default();
        config.broker.port = config.broker.trust.secure_port;

        let info = build_config_info(&config);
        let broker = info.broker.unwrap();
        assert!(broker.tls);
        assert_eq!(broker.trust_plan, vec!["pinned", "system_default"]);
        assert!(info.local_store.is_none());
    }

    #[test]
    fn test_local_info_shows_path_pattern() {
        let mut config = BridgeConfig::default();
        config.local_mode = true;
        config.local_store.root = "/data/store".into();

        let info = build_config_info(&config);
        let store = info.local_store.unwrap();
        assert!(store.path_pattern.starts_with("/data/store"));
        assert!(store.path_pattern.ends_with("<HHmmss>.csv"));
        assert!(info.broker.is_none());
    }
}
