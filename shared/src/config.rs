use anyhow::Result;
use config::{Config, Environment, File};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

use crate::mqtt::MqttConfig;
use crate::types::TimeFormat;

// 代理总配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub telemetry: TelemetryConfig,
    pub tls: TlsConfig,
}

// 遥测发布配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub topic: String,
    // 两条消息之间的间隔（秒）
    pub message_delay_secs: u64,
    pub time_format: TimeFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            topic: "iot/v1/mqtt".to_string(),
            message_delay_secs: 10,
            time_format: TimeFormat::Epoch,
        }
    }
}

// TLS / 认证材料配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_file: Option<String>,
    // 证书认证（mTLS）需同时提供证书与私钥
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

pub fn load_config() -> Result<AppConfig> {
    // 加载 .env 文件
    dotenv().ok();

    let settings = Config::builder()
        // 添加默认配置文件
        .add_source(File::with_name("config/default").required(false))
        // 添加环境特定配置文件
        .add_source(
            File::with_name(&format!(
                "config/{}",
                env::var("ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        // 添加环境变量，使用 TERRA_ 前缀
        .add_source(Environment::with_prefix("TERRA").separator("_"))
        .build()?;

    // 构建配置
    let config: AppConfig = settings.try_deserialize()?;

    // 验证必要配置
    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.mqtt.client_id.is_empty() {
        return Err(anyhow::anyhow!(
            "MQTT client_id cannot be empty (persistent sessions require it)"
        ));
    }

    if config.mqtt.broker_host.is_empty() {
        return Err(anyhow::anyhow!("MQTT broker host cannot be empty"));
    }

    if config.telemetry.topic.is_empty() {
        return Err(anyhow::anyhow!("Telemetry topic cannot be empty"));
    }

    if config.telemetry.message_delay_secs == 0 {
        return Err(anyhow::anyhow!("Telemetry message delay must be non-zero"));
    }

    if config.tls.enabled && config.tls.ca_file.is_none() {
        return Err(anyhow::anyhow!("TLS is enabled but no CA file is set"));
    }

    if config.tls.client_cert.is_some() != config.tls.client_key.is_some() {
        return Err(anyhow::anyhow!(
            "Certificate authentication requires both client_cert and client_key"
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::QoS;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert!(!config.mqtt.clean_session);
        assert_eq!(config.mqtt.qos, QoS::AtLeastOnce);
        assert_eq!(config.telemetry.topic, "iot/v1/mqtt");
        assert_eq!(config.telemetry.message_delay_secs, 10);
        assert_eq!(config.telemetry.time_format, TimeFormat::Epoch);
        assert!(!config.tls.enabled);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_client_id() {
        let mut config = AppConfig::default();
        config.mqtt.client_id.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_delay() {
        let mut config = AppConfig::default();
        config.telemetry.message_delay_secs = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_tls_without_ca() {
        let mut config = AppConfig::default();
        config.tls.enabled = true;
        assert!(validate_config(&config).is_err());

        config.tls.ca_file = Some("/path/to/ca.crt".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_rejects_cert_without_key() {
        let mut config = AppConfig::default();
        config.tls.client_cert = Some("/path/to/client.pem".to_string());
        assert!(validate_config(&config).is_err());

        config.tls.client_key = Some("/path/to/client.key".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_time_format_deserialization() {
        let config: TelemetryConfig = serde_json::from_str(
            r#"{"topic":"iot/v1/mqtt","message_delay_secs":1,"time_format":"iso"}"#,
        )
        .unwrap();
        assert_eq!(config.time_format, TimeFormat::Iso);
    }
}
