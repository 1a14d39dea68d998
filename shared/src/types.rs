use serde::{Deserialize, Serialize};

use crate::mqtt::{response_topic, MqttError};
use crate::utils::epoch_micros;

// 遥测时间字段格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    None,
    Epoch,
    Iso,
}

// 遥测时间字段值：整数微秒或 ISO-8601 字符串
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TimeValue {
    Epoch(u64),
    Iso(String),
}

// 环境传感器遥测读数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryReading {
    pub sht_temperature: f64,
    pub qmp_temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeValue>,
}

// 命令确认状态标记
pub const ACK_STATUS: &str = "acknowledged";

// 命令确认负载
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckPayload {
    pub status: String,
    pub time: u64,
}

impl AckPayload {
    /// 以当前时间构建确认负载
    pub fn acknowledged() -> Self {
        Self {
            status: ACK_STATUS.to_string(),
            time: epoch_micros(),
        }
    }
}

// 入站命令消息
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl CommandRequest {
    pub fn new(topic: String, payload: Vec<u8>) -> Self {
        Self { topic, payload }
    }

    /// 由命令主题派生对应的响应主题
    pub fn response_topic(&self) -> Result<String, MqttError> {
        response_topic(&self.topic).ok_or_else(|| MqttError::InvalidTopic(self.topic.clone()))
    }
}
