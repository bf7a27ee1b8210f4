//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{BridgeConfig, SinkKind};
use serde::Serialize;
use tracing::info;

use super::load_config;
use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    sink: SinkKind,
    broker: String,
    tls: bool,
    local_root: String,
    queue_capacity: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    match load_config(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    sink: config.sink_kind(),
                    broker: format!("{}:{}", config.broker.host, config.broker.port),
                    tls: config.broker.uses_tls(),
                    local_root: config.local_store.root.display().to_string(),
                    queue_capacity: config.queue_capacity,
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &BridgeConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let broker = &config.broker;
    let trust = &broker.trust;

    if config.local_mode {
        if broker.raw_topic.is_some() {
            warnings.push("broker.raw_topic is ignored in local mode".to_string());
        }
        return warnings;
    }

    if !(0..=2).contains(&broker.qos) {
        warnings.push(format!(
            "broker.qos = {} is not 0, 1 or 2 - at-most-once will be used",
            broker.qos
        ));
    }

    if broker.uses_tls() {
        if trust.pinned_authority_path.is_none()
            && trust.pinned_leaf_path.is_none()
            && trust.custom_ca_path.is_none()
        {
            warnings.push(
                "TLS port without pinned certificates - the system trust store will be tried after the pinned attempt fails"
                    .to_string(),
            );
        }
        if trust.allow_insecure_fallback {
            warnings.push(
                "broker.trust.allow_insecure_fallback is enabled - the link may be established without certificate verification"
                    .to_string(),
            );
        }
    } else if trust.allow_insecure_fallback || trust.pinned_authority_path.is_some() {
        warnings.push(format!(
            "trust settings have no effect: port {} is not the secure port {}",
            broker.port, trust.secure_port
        ));
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Sink: {:?}", summary.sink);
            println!("  Broker: {} (TLS: {})", summary.broker, summary.tls);
            println!("  Local root: {}", summary.local_root);
            println!("  Queue capacity: {}", summary.queue_capacity);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
