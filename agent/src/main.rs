mod agent;
mod command;
mod mqtt_client;
mod shutdown;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use terra_shared::load_config;

use crate::agent::Agent;
use crate::command::{CommandWorker, COMMAND_QUEUE_CAPACITY};
use crate::mqtt_client::AgentMqttClient;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::EnvironmentalSensor;

// 等待首个 CONNACK 的时限
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Terra device agent...");

    // 加载配置
    let config = load_config().context("Failed to load configuration")?;
    info!(
        "Broker: {}:{}, client_id: {}, telemetry topic: {}, interval: {}s",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.mqtt.client_id,
        config.telemetry.topic,
        config.telemetry.message_delay_secs
    );

    let shutdown = ShutdownSignal::new();

    // 创建 MQTT 会话
    let (session, event_loop) =
        AgentMqttClient::new(&config).context("Failed to create MQTT client")?;
    let session = Arc::new(session);

    // 命令队列：会话接收路径 -> 命令工作器
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

    // 启动会话事件循环
    let session_task = {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { session.run(event_loop, command_tx, shutdown).await })
    };

    // 初始连接失败是致命错误，进程以非零状态退出
    session
        .wait_until_connected(CONNECT_TIMEOUT)
        .await
        .context("Unable to connect to MQTT broker")?;

    // 启动命令工作器
    let worker = CommandWorker::new(
        command_rx,
        session.clone(),
        shutdown.clone(),
        config.mqtt.qos,
        Duration::from_millis(config.mqtt.publish_timeout_ms),
    );
    let worker_task = tokio::spawn(worker.run());

    // 操作员中断触发关停
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted by user. Exiting...");
                shutdown.trigger();
            }
        });
    }

    // 遥测主循环，运行至关停信号置位
    let sensor = EnvironmentalSensor::new(config.telemetry.time_format);
    let mut agent = Agent::new(
        session.clone(),
        sensor,
        shutdown.clone(),
        &config.telemetry,
        config.mqtt.qos,
        Duration::from_millis(config.mqtt.publish_timeout_ms),
    );
    agent.run().await?;

    // 排空命令队列：已入列的命令处理并确认完毕后工作器退出
    info!("Waiting for commands to be processed...");
    if let Err(e) = worker_task.await {
        error!("Command worker task failed: {}", e);
    }

    // 断开连接并等待事件循环退出
    if let Err(e) = session.disconnect().await {
        warn!("MQTT disconnect failed: {}", e);
    }
    if let Err(e) = session_task.await {
        error!("MQTT session task failed: {}", e);
    }

    info!("Terminated");
    Ok(())
}
