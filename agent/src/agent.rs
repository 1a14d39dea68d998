use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use terra_shared::{QoS, TelemetryConfig};

use crate::mqtt_client::MessagePublisher;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::EnvironmentalSensor;

/// 遥测主循环
///
/// 发布一条读数、等待其投递确认、再休眠一个周期。先确认后休眠，
/// 未确认的发布不会堆积，发布节奏天然成为背压点。
pub struct Agent {
    publisher: Arc<dyn MessagePublisher>,
    sensor: EnvironmentalSensor,
    shutdown: ShutdownSignal,
    topic: String,
    interval: Duration,
    qos: QoS,
    publish_timeout: Duration,
}

impl Agent {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        sensor: EnvironmentalSensor,
        shutdown: ShutdownSignal,
        config: &TelemetryConfig,
        qos: QoS,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            publisher,
            sensor,
            shutdown,
            topic: config.topic.clone(),
            interval: Duration::from_secs(config.message_delay_secs),
            qos,
            publish_timeout,
        }
    }

    /// 运行遥测循环直至关停信号置位
    pub async fn run(&mut self) -> Result<()> {
        info!("Telemetry loop -- Press Ctrl-C to stop.");

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            let reading = self.sensor.next_reading();
            info!("Sending message #{}", reading.count);

            // 瞬态发布/确认错误：放弃本轮，循环不中断
            match serde_json::to_vec(&reading) {
                Ok(payload) => match self.publisher.publish(&self.topic, payload, self.qos).await {
                    Ok(handle) => {
                        if let Err(e) = handle.wait(self.publish_timeout).await {
                            warn!("Telemetry delivery not confirmed: {}", e);
                        } else {
                            debug!("Telemetry message #{} confirmed", reading.count);
                        }
                    }
                    Err(e) => warn!("Failed to publish telemetry: {}", e),
                },
                Err(e) => warn!("Failed to serialize telemetry: {}", e),
            }

            // 休眠与关停信号竞争，收到关停后最多一个周期内退出
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("Telemetry loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use terra_shared::{MqttError, TelemetryReading, TimeFormat};

    use crate::mqtt_client::DeliveryHandle;

    #[derive(Default)]
    struct RecordingPublisher {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingPublisher {
        fn readings(&self) -> Vec<TelemetryReading> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .map(|payload| serde_json::from_slice(payload).unwrap())
                .collect()
        }

        fn len(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish(
            &self,
            _topic: &str,
            payload: Vec<u8>,
            _qos: QoS,
        ) -> Result<DeliveryHandle, MqttError> {
            self.payloads.lock().unwrap().push(payload);
            Ok(DeliveryHandle::immediate())
        }
    }

    fn test_agent(publisher: Arc<RecordingPublisher>, shutdown: ShutdownSignal) -> Agent {
        let config = TelemetryConfig {
            topic: "iot/v1/mqtt".to_string(),
            message_delay_secs: 1,
            time_format: TimeFormat::None,
        };
        let mut agent = Agent::new(
            publisher,
            EnvironmentalSensor::new(TimeFormat::None),
            shutdown,
            &config,
            QoS::AtLeastOnce,
            Duration::from_millis(100),
        );
        // 测试用短周期
        agent.interval = Duration::from_millis(20);
        agent
    }

    #[tokio::test]
    async fn test_publishes_sequentially_numbered_readings() {
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = ShutdownSignal::new();
        let mut agent = test_agent(publisher.clone(), shutdown.clone());

        let task = tokio::spawn(async move { agent.run().await });

        // 留出几个周期后触发关停
        tokio::time::sleep(Duration::from_millis(90)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("agent loop should stop within one interval")
            .unwrap()
            .unwrap();

        let readings = publisher.readings();
        assert!(!readings.is_empty());
        for (index, reading) in readings.iter().enumerate() {
            assert_eq!(reading.count, index as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_no_telemetry_after_shutdown() {
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = ShutdownSignal::new();
        let mut agent = test_agent(publisher.clone(), shutdown.clone());

        let task = tokio::spawn(async move { agent.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("agent loop should stop")
            .unwrap()
            .unwrap();

        let published = publisher.len();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(publisher.len(), published);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let mut agent = test_agent(publisher.clone(), shutdown);
        agent.run().await.unwrap();

        assert_eq!(publisher.len(), 0);
    }

    #[tokio::test]
    async fn test_publish_errors_do_not_stop_the_loop() {
        // 每次发布都失败的发布器
        struct FailingPublisher;

        #[async_trait]
        impl MessagePublisher for FailingPublisher {
            async fn publish(
                &self,
                _topic: &str,
                _payload: Vec<u8>,
                _qos: QoS,
            ) -> Result<DeliveryHandle, MqttError> {
                Err(MqttError::Publish("request channel closed".to_string()))
            }
        }

        let shutdown = ShutdownSignal::new();
        let config = TelemetryConfig {
            topic: "iot/v1/mqtt".to_string(),
            message_delay_secs: 1,
            time_format: TimeFormat::None,
        };
        let mut agent = Agent::new(
            Arc::new(FailingPublisher),
            EnvironmentalSensor::new(TimeFormat::None),
            shutdown.clone(),
            &config,
            QoS::AtLeastOnce,
            Duration::from_millis(100),
        );
        agent.interval = Duration::from_millis(10);

        let task = tokio::spawn(async move { agent.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 循环仍在运行，关停后正常退出
        assert!(!task.is_finished());
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("agent loop should stop")
            .unwrap()
            .unwrap();
    }
}
