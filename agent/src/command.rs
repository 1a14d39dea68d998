use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use terra_shared::{is_truthy, AckPayload, CommandRequest, QoS};

use crate::mqtt_client::MessagePublisher;
use crate::shutdown::ShutdownSignal;

// 命令队列容量：队列满时显式拒绝，不阻塞接收路径
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

// 命令负载中触发关停的字段
const SHUTDOWN_KEY: &str = "shutdown";

/// 命令处理工作器
///
/// 串行消费命令队列：解析负载、必要时触发关停、向派生的响应主题
/// 发布确认并等待其投递确认，完成后才取下一条。确认顺序因此与命令
/// 到达顺序一致。队列关闭后把已入列的命令处理完再退出。
pub struct CommandWorker {
    queue: mpsc::Receiver<CommandRequest>,
    publisher: Arc<dyn MessagePublisher>,
    shutdown: ShutdownSignal,
    qos: QoS,
    ack_timeout: Duration,
}

impl CommandWorker {
    pub fn new(
        queue: mpsc::Receiver<CommandRequest>,
        publisher: Arc<dyn MessagePublisher>,
        shutdown: ShutdownSignal,
        qos: QoS,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            publisher,
            shutdown,
            qos,
            ack_timeout,
        }
    }

    /// 运行直至队列关闭并排空
    pub async fn run(mut self) {
        info!("Command worker started");

        while let Some(request) = self.queue.recv().await {
            self.handle(request).await;
        }

        info!("Command worker drained and stopped");
    }

    async fn handle(&self, request: CommandRequest) {
        info!(
            "Received command on {}: {}",
            request.topic,
            String::from_utf8_lossy(&request.payload)
        );

        // 负载解析失败不致命，命令仍会被确认
        let command: Option<Value> = match serde_json::from_slice(&request.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Failed to parse command payload on {}: {}",
                    request.topic, e
                );
                None
            }
        };

        if let Some(command) = &command {
            if command.get(SHUTDOWN_KEY).map(is_truthy).unwrap_or(false) {
                info!("Shutdown command received. Preparing to exit...");
                self.shutdown.trigger();
            }
        }

        let rsp_topic = match request.response_topic() {
            Ok(topic) => topic,
            Err(e) => {
                warn!("Cannot derive response topic: {}", e);
                return;
            }
        };

        let ack_bytes = match serde_json::to_vec(&AckPayload::acknowledged()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize acknowledgment: {}", e);
                return;
            }
        };

        // 投递确认失败或超时：记录后继续处理下一条命令
        match self.publisher.publish(&rsp_topic, ack_bytes, self.qos).await {
            Ok(handle) => match handle.wait(self.ack_timeout).await {
                Ok(()) => debug!("Acknowledgment delivered to {}", rsp_topic),
                Err(e) => warn!(
                    "Acknowledgment delivery to {} not confirmed: {}",
                    rsp_topic, e
                ),
            },
            Err(e) => warn!("Failed to publish acknowledgment to {}: {}", rsp_topic, e),
        }

        info!("Finished command handling for: {}", request.topic);
    }
}
