pub mod config;
pub mod mqtt;
pub mod types;
pub mod utils;

pub use config::{load_config, AppConfig, TelemetryConfig, TlsConfig};
pub use mqtt::{
    is_command_topic, response_topic, MqttConfig, MqttError, QoS, TopicFilter, COMMAND_SUFFIX,
    RESPONSE_SUFFIX,
};
pub use types::{AckPayload, CommandRequest, TelemetryReading, TimeFormat, TimeValue, ACK_STATUS};
pub use utils::{epoch_micros, is_truthy, iso_utc, now_utc};
