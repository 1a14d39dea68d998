use serde::{Deserialize, Serialize};

pub mod qos_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::QoS;

    pub fn serialize<S>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<QoS, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(serde::de::Error::custom(format!(
                "Invalid QoS value: {}",
                value
            ))),
        }
    }
}

// MQTT 消息质量等级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

// 命令/响应主题后缀
pub const COMMAND_SUFFIX: &str = "/cmd";
pub const RESPONSE_SUFFIX: &str = "/rsp";

/// 判断主题是否为命令主题
pub fn is_command_topic(topic: &str) -> bool {
    topic.ends_with(COMMAND_SUFFIX)
}

/// 派生响应主题：去掉 /cmd 后缀，追加 /rsp
pub fn response_topic(topic: &str) -> Option<String> {
    topic
        .strip_suffix(COMMAND_SUFFIX)
        .map(|scope| format!("{}{}", scope, RESPONSE_SUFFIX))
}

// MQTT 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u64,
    // 持久会话：离线期间错过的命令在重连后由 broker 重投
    pub clean_session: bool,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    pub publish_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            // 生产环境应固定 client_id，持久会话依赖它
            client_id: format!("terra-{}", uuid::Uuid::new_v4()),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: false,
            qos: QoS::AtLeastOnce,
            max_reconnect_attempts: 10,
            reconnect_interval_ms: 5000,
            publish_timeout_ms: 10000,
        }
    }
}

// MQTT 错误类型
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Delivery confirmation timed out")]
    ConfirmationTimeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Max reconnect attempts reached")]
    MaxReconnectAttemptsReached,
}

// 主题过滤器
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pub topic_pattern: String,
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new(topic_pattern: String, qos: QoS) -> Self {
        Self { topic_pattern, qos }
    }

    // 订阅所有主题，命令后缀在进程内过滤
    pub fn all(qos: QoS) -> Self {
        Self::new("#".to_string(), qos)
    }
}
