//! 配置校验模块
//!
//! 校验规则：
//! - 字段级规则 (derive `Validate`): client_id/topic 非空, port >= 1, flush_every_rows >= 1 ...
//! - 非本地模式时 broker.host 非空
//! - 本地模式时 local_store.root 非空
//! - raw_topic 不能与 topic 相同

use contracts::{BridgeConfig, ContractError};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// 校验 BridgeConfig 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(config: &BridgeConfig) -> Result<(), ContractError> {
    validate_fields(config)?;
    validate_broker_host(config)?;
    validate_local_root(config)?;
    validate_topics(config)?;
    Ok(())
}

/// 字段级规则
fn validate_fields(config: &BridgeConfig) -> Result<(), ContractError> {
    config.validate().map_err(|errors| {
        let (field, message) = first_violation(&errors, "")
            .unwrap_or_else(|| ("config".to_string(), errors.to_string()));
        ContractError::config_validation(field, message)
    })
}

/// 按字段路径排序后取第一个违规项，保证错误信息稳定
fn first_violation(errors: &ValidationErrors, prefix: &str) -> Option<(String, String)> {
    let mut entries: Vec<_> = errors.errors().iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (name, kind) in entries {
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        };
        match kind {
            ValidationErrorsKind::Field(violations) => {
                if let Some(violation) = violations.first() {
                    let message = match &violation.message {
                        Some(message) => message.to_string(),
                        None => format!("violates '{}' rule {:?}", violation.code, violation.params),
                    };
                    return Some((path, message));
                }
            }
            ValidationErrorsKind::Struct(nested) => {
                if let Some(found) = first_violation(nested, &path) {
                    return Some(found);
                }
            }
            ValidationErrorsKind::List(items) => {
                for (idx, nested) in items {
                    if let Some(found) = first_violation(nested, &format!("{path}[{idx}]")) {
                        return Some(found);
                    }
                }
            }
        }
    }
    None
}

/// 网络模式必须有 broker host
fn validate_broker_host(config: &BridgeConfig) -> Result<(), ContractError> {
    if !config.local_mode && config.broker.host.trim().is_empty() {
        return Err(ContractError::config_validation(
            "broker.host",
            "broker host cannot be empty unless local_mode is set",
        ));
    }
    Ok(())
}

/// 本地模式必须有存储根目录
fn validate_local_root(config: &BridgeConfig) -> Result<(), ContractError> {
    if config.local_mode && config.local_store.root.as_os_str().is_empty() {
        return Err(ContractError::config_validation(
            "local_store.root",
            "local store root cannot be empty in local_mode",
        ));
    }
    Ok(())
}

/// 校验 topic 配置
fn validate_topics(config: &BridgeConfig) -> Result<(), ContractError> {
    if let Some(raw) = &config.broker.raw_topic {
        if raw.is_empty() {
            return Err(ContractError::config_validation(
                "broker.raw_topic",
                "raw_topic cannot be empty when set",
            ));
        }
        if *raw == config.broker.topic {
            return Err(ContractError::config_validation(
                "broker.raw_topic",
                format!("raw_topic must differ from topic '{}'", config.broker.topic),
            ));
        }
    }
    Ok(())
}
