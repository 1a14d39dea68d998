use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS as RumqttQoS,
    TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use terra_shared::{
    is_command_topic, AppConfig, CommandRequest, MqttConfig, MqttError, QoS, TopicFilter,
};

use crate::shutdown::ShutdownSignal;

// 会话连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Failed,
}

/// 单次发布的投递确认句柄
///
/// QoS 1 在收到 PUBACK、QoS 2 在收到 PUBCOMP 时完成；QoS 0 无 broker
/// 确认，入列即完成。
pub struct DeliveryHandle {
    rx: Option<oneshot::Receiver<()>>,
}

impl DeliveryHandle {
    pub(crate) fn immediate() -> Self {
        Self { rx: None }
    }

    pub(crate) fn pending() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx: Some(rx) })
    }

    /// 等待投递确认；超时或连接重置均按瞬态错误上报
    pub async fn wait(self, timeout: Duration) -> Result<(), MqttError> {
        let Some(rx) = self.rx else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttError::ConnectionLost),
            Err(_) => Err(MqttError::ConfirmationTimeout),
        }
    }
}

// 待确认发布登记表
//
// rumqttc 不提供按发布的确认通知，只在事件循环中暴露
// Outgoing::Publish(pkid) 与 PubAck/PubComp。发布请求按序进入 FIFO，
// 事件循环按出站顺序为其分配 pkid，确认到达时完成对应条目。
// 所有发布都经 publish_lock 串行化，出站顺序因此与登记顺序一致。
#[derive(Default)]
struct AckTracker {
    unassigned: VecDeque<oneshot::Sender<()>>,
    assigned: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn enqueue(&mut self, confirm: oneshot::Sender<()>) {
        self.unassigned.push_back(confirm);
    }

    // 发布请求未入列时撤销最近一次登记
    fn abort_newest(&mut self) {
        self.unassigned.pop_back();
    }

    fn assign_pkid(&mut self, pkid: u16) {
        // pkid 0 为 QoS 0 发布，未登记
        if pkid == 0 {
            return;
        }
        // 重连后重传的发布会再次出现已登记的 pkid，不得消费新条目
        if self.assigned.contains_key(&pkid) {
            return;
        }
        if let Some(confirm) = self.unassigned.pop_front() {
            self.assigned.insert(pkid, confirm);
        }
    }

    fn complete(&mut self, pkid: u16) {
        if let Some(confirm) = self.assigned.remove(&pkid) {
            let _ = confirm.send(());
        }
    }

    // 丢弃全部待确认条目，等待方将观察到连接丢失
    fn fail_all(&mut self) {
        self.unassigned.clear();
        self.assigned.clear();
    }
}

/// 消息发布接口，命令工作器与遥测循环共用
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<DeliveryHandle, MqttError>;
}

/// 设备代理 MQTT 会话
///
/// 持有连接、通配订阅与待确认登记表。入站消息在事件循环任务中分发：
/// 命令主题路由到命令队列，确认报文完成对应的投递句柄。
pub struct AgentMqttClient {
    client: AsyncClient,
    config: MqttConfig,
    tracker: Arc<Mutex<AckTracker>>,
    // 串行化发布调用，保证登记顺序与请求顺序一致
    publish_lock: Mutex<()>,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl AgentMqttClient {
    pub fn new(config: &AppConfig) -> Result<(Self, EventLoop)> {
        let mqtt = &config.mqtt;
        let mut mqtt_options =
            MqttOptions::new(mqtt.client_id.clone(), &mqtt.broker_host, mqtt.broker_port);

        // 设置认证信息
        if let (Some(username), Some(password)) = (&mqtt.username, &mqtt.password) {
            mqtt_options.set_credentials(username, password);
        }

        // 设置保持连接与持久会话
        mqtt_options.set_keep_alive(Duration::from_secs(mqtt.keep_alive));
        mqtt_options.set_clean_session(mqtt.clean_session);

        // TLS 与证书认证材料
        if config.tls.enabled {
            let ca_file = config
                .tls
                .ca_file
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("TLS is enabled but no CA file is set"))?;
            let ca = std::fs::read(ca_file)
                .with_context(|| format!("Failed to read CA file: {}", ca_file))?;

            let client_auth = match (&config.tls.client_cert, &config.tls.client_key) {
                (Some(cert_file), Some(key_file)) => {
                    let cert = std::fs::read(cert_file)
                        .with_context(|| format!("Failed to read client cert: {}", cert_file))?;
                    let key = std::fs::read(key_file)
                        .with_context(|| format!("Failed to read client key: {}", key_file))?;
                    Some((cert, key))
                }
                _ => None,
            };

            mqtt_options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        let (state_tx, _state_rx) = watch::channel(SessionState::Connecting);

        Ok((
            Self {
                client,
                config: mqtt.clone(),
                tracker: Arc::new(Mutex::new(AckTracker::default())),
                publish_lock: Mutex::new(()),
                state_tx: Arc::new(state_tx),
            },
            event_loop,
        ))
    }

    /// 等待首个 CONNACK；初始连接失败是致命错误
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut rx = self.state_tx.subscribe();

        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed => {
                        return Err(MqttError::Connection(
                            "initial connection failed".to_string(),
                        ))
                    }
                    SessionState::Connecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionLost);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::Connection(
                "timed out waiting for CONNACK".to_string(),
            )),
        }
    }

    /// 订阅通配过滤器，命令后缀在事件循环内过滤
    async fn subscribe_commands(&self) -> Result<(), MqttError> {
        let filter = TopicFilter::all(self.config.qos);
        self.client
            .subscribe(filter.topic_pattern.clone(), to_rumqtt_qos(filter.qos))
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))?;

        info!("Subscribed to MQTT topic filter: {}", filter.topic_pattern);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| MqttError::Connection(e.to_string()))
    }

    /// 运行会话事件循环直至关停完成或连接放弃
    ///
    /// 命令队列发送端由本任务持有；关停信号置位后丢弃发送端，
    /// 队列关闭即触发命令工作器排空。
    pub async fn run(
        &self,
        mut event_loop: EventLoop,
        command_tx: mpsc::Sender<CommandRequest>,
        shutdown: ShutdownSignal,
    ) {
        info!("Starting MQTT event loop");

        let mut command_tx = Some(command_tx);
        let mut ever_connected = false;
        let mut reconnect_attempts: u32 = 0;

        loop {
            tokio::select! {
                // 关停后不再接收新命令
                _ = shutdown.cancelled(), if command_tx.is_some() => {
                    command_tx = None;
                    debug!("Command queue closed, worker will drain");
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                        info!("MQTT connection established: {:?}", connack);
                        ever_connected = true;
                        reconnect_attempts = 0;
                        self.state_tx.send_replace(SessionState::Connected);

                        // 每次连接（含重连）后重新订阅
                        if let Err(e) = self.subscribe_commands().await {
                            error!("Failed to subscribe command filter: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        debug!("Received MQTT message on topic: {}", publish.topic);
                        if is_command_topic(&publish.topic) {
                            let request =
                                CommandRequest::new(publish.topic.clone(), publish.payload.to_vec());
                            match &command_tx {
                                Some(tx) => match tx.try_send(request) {
                                    Ok(()) => {}
                                    Err(mpsc::error::TrySendError::Full(_)) => {
                                        warn!(
                                            "Command queue full, dropping command on {}",
                                            publish.topic
                                        );
                                    }
                                    Err(mpsc::error::TrySendError::Closed(_)) => {
                                        warn!(
                                            "Command worker stopped, dropping command on {}",
                                            publish.topic
                                        );
                                    }
                                },
                                None => {
                                    warn!(
                                        "Shutting down, rejecting command on {}",
                                        publish.topic
                                    );
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::PubAck(puback))) => {
                        self.tracker.lock().await.complete(puback.pkid);
                    }
                    Ok(Event::Incoming(Incoming::PubComp(pubcomp))) => {
                        self.tracker.lock().await.complete(pubcomp.pkid);
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        warn!("MQTT broker initiated disconnect");
                    }
                    Ok(Event::Incoming(_)) => {}
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        self.tracker.lock().await.assign_pkid(pkid);
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if shutdown.is_shutdown() {
                            debug!("MQTT event loop stopped: {}", e);
                            break;
                        }

                        // 初始连接失败是致命错误，交由 wait_until_connected 上报
                        if !ever_connected {
                            error!("MQTT connection failed: {}", e);
                            self.state_tx.send_replace(SessionState::Failed);
                            break;
                        }

                        reconnect_attempts += 1;
                        if reconnect_attempts > self.config.max_reconnect_attempts {
                            error!(
                                "MQTT connection error: {} (giving up after {} attempts)",
                                e, self.config.max_reconnect_attempts
                            );
                            self.state_tx.send_replace(SessionState::Failed);
                            // 传输已放弃，走正常关停路径退出
                            shutdown.trigger();
                            break;
                        }

                        warn!(
                            "MQTT connection error: {} (reconnect attempt {}/{})",
                            e, reconnect_attempts, self.config.max_reconnect_attempts
                        );
                        self.state_tx.send_replace(SessionState::Connecting);
                        tokio::time::sleep(Duration::from_millis(self.config.reconnect_interval_ms))
                            .await;
                    }
                }
            }
        }

        self.tracker.lock().await.fail_all();
        info!("MQTT event loop stopped");
    }
}

#[async_trait]
impl MessagePublisher for AgentMqttClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<DeliveryHandle, MqttError> {
        // 串行化：登记与请求入列之间不允许其他发布穿插
        let _guard = self.publish_lock.lock().await;

        let handle = if qos == QoS::AtMostOnce {
            DeliveryHandle::immediate()
        } else {
            let (confirm, handle) = DeliveryHandle::pending();
            self.tracker.lock().await.enqueue(confirm);
            handle
        };

        if let Err(e) = self
            .client
            .publish(topic.to_string(), to_rumqtt_qos(qos), false, payload)
            .await
        {
            if qos != QoS::AtMostOnce {
                self.tracker.lock().await.abort_newest();
            }
            return Err(MqttError::Publish(e.to_string()));
        }

        debug!("Published MQTT message to topic: {}", topic);
        Ok(handle)
    }
}

fn to_rumqtt_qos(qos: QoS) -> RumqttQoS {
    match qos {
        QoS::AtMostOnce => RumqttQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttQoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracker_completes_in_arrival_order() {
        let mut tracker = AckTracker::default();

        let (confirm_a, handle_a) = DeliveryHandle::pending();
        let (confirm_b, handle_b) = DeliveryHandle::pending();
        tracker.enqueue(confirm_a);
        tracker.enqueue(confirm_b);

        tracker.assign_pkid(1);
        tracker.assign_pkid(2);
        tracker.complete(1);
        tracker.complete(2);

        handle_a.wait(Duration::from_millis(100)).await.unwrap();
        handle_b.wait(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_tracker_ignores_qos0_pkid() {
        let mut tracker = AckTracker::default();

        let (confirm, handle) = DeliveryHandle::pending();
        tracker.enqueue(confirm);

        // QoS 0 出站事件不得消费登记条目
        tracker.assign_pkid(0);
        tracker.assign_pkid(7);
        tracker.complete(7);

        handle.wait(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_tracker_ignores_retransmitted_pkid() {
        let mut tracker = AckTracker::default();

        let (confirm_a, handle_a) = DeliveryHandle::pending();
        tracker.enqueue(confirm_a);
        tracker.assign_pkid(5);

        // 重连后 pkid 5 重传，随后的新发布拿到 pkid 6
        let (confirm_b, handle_b) = DeliveryHandle::pending();
        tracker.enqueue(confirm_b);
        tracker.assign_pkid(5);
        tracker.assign_pkid(6);

        tracker.complete(5);
        tracker.complete(6);

        handle_a.wait(Duration::from_millis(100)).await.unwrap();
        handle_b.wait(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_tracker_fail_all_drops_pending() {
        let mut tracker = AckTracker::default();

        let (confirm_a, handle_a) = DeliveryHandle::pending();
        let (confirm_b, handle_b) = DeliveryHandle::pending();
        tracker.enqueue(confirm_a);
        tracker.enqueue(confirm_b);
        tracker.assign_pkid(3);

        tracker.fail_all();

        assert!(matches!(
            handle_a.wait(Duration::from_millis(100)).await,
            Err(MqttError::ConnectionLost)
        ));
        assert!(matches!(
            handle_b.wait(Duration::from_millis(100)).await,
            Err(MqttError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_delivery_handle_immediate() {
        let handle = DeliveryHandle::immediate();
        handle.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_handle_timeout() {
        let (_confirm, handle) = DeliveryHandle::pending();
        assert!(matches!(
            handle.wait(Duration::from_millis(10)).await,
            Err(MqttError::ConfirmationTimeout)
        ));
    }
}
