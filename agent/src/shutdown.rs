use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// 关停信号：单次置位，多处并发观察
///
/// Running -> ShuttingDown 的状态迁移只发生一次，由操作员中断或
/// 关停命令触发。置位后不可复位。
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// 置位关停信号，重复调用无效果
    pub fn trigger(&self) {
        let was_set = self.tx.send_replace(true);
        if !was_set {
            info!("Shutdown signal set");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// 等待信号置位；已置位时立即返回
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
