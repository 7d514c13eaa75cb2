// Event Bus
// 授权 / 扣款 / 提现生命周期事件的异步发布订阅

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

// ============ 事件类型定义 ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    AuthorizationCreated {
        auth_no: String,
        chain: String,
        merchant_wallet: String,
        authorized_usdt: Decimal,
    },
    AuthorizationActivated {
        auth_no: String,
        customer_wallet: String,
        manual: bool,
    },
    AuthorizationClosed {
        auth_no: String,
        status: String,
    },
    DeductionSucceeded {
        deduct_no: String,
        auth_no: String,
        amount_usdt: Decimal,
        tx_hash: String,
        depleted: bool,
    },
    DeductionFailed {
        deduct_no: String,
        auth_no: String,
        reason: String,
    },
    WithdrawalCompleted {
        withdraw_no: String,
        tx_hash: String,
    },
    WithdrawalRejected {
        withdraw_no: String,
        reason: String,
    },
}

impl GatewayEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            GatewayEvent::AuthorizationCreated { .. } => "AuthorizationCreated",
            GatewayEvent::AuthorizationActivated { .. } => "AuthorizationActivated",
            GatewayEvent::AuthorizationClosed { .. } => "AuthorizationClosed",
            GatewayEvent::DeductionSucceeded { .. } => "DeductionSucceeded",
            GatewayEvent::DeductionFailed { .. } => "DeductionFailed",
            GatewayEvent::WithdrawalCompleted { .. } => "WithdrawalCompleted",
            GatewayEvent::WithdrawalRejected { .. } => "WithdrawalRejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event: GatewayEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

// ============ Event Handler Trait ============

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &GatewayEvent) -> Result<()>;
    fn event_types(&self) -> Vec<&'static str>;
}

// ============ Event Bus 接口 ============

#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布事件
    async fn publish(&self, event: GatewayEvent) -> Result<()>;

    /// 订阅事件
    async fn subscribe(&self, handler: Arc<dyn EventHandler>);

    /// 最近事件（新到旧）
    async fn recent_events(&self, limit: usize) -> Vec<EventEnvelope>;
}

// ============ 内存 Event Bus 实现 ============

const HISTORY_CAPACITY: usize = 1024;

pub struct InMemoryEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    history: Arc<RwLock<Vec<EventEnvelope>>>,
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

impl InMemoryEventBus {
    /// 需在 tokio 运行时内调用
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<EventEnvelope>();
        let handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>> = Arc::new(RwLock::new(Vec::new()));

        let handlers_clone = handlers.clone();

        // 后台任务：处理事件分发
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let handlers_read = handlers_clone.read().await;
                let event_type = envelope.event.event_type();

                for handler in handlers_read.iter() {
                    if handler.event_types().contains(&event_type) {
                        if let Err(e) = handler.handle(&envelope.event).await {
                            tracing::error!(
                                event_id = %envelope.event_id,
                                event_type = event_type,
                                "Event handler error: {:?}",
                                e
                            );
                        }
                    }
                }
            }
        });

        Self {
            handlers,
            history: Arc::new(RwLock::new(Vec::new())),
            sender,
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: GatewayEvent) -> Result<()> {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            event,
            published_at: chrono::Utc::now(),
        };

        {
            let mut history = self.history.write().await;
            if history.len() >= HISTORY_CAPACITY {
                history.remove(0);
            }
            history.push(envelope.clone());
        }

        self.sender
            .send(envelope)
            .map_err(|e| anyhow::anyhow!("Failed to send event: {}", e))?;

        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    async fn recent_events(&self, limit: usize) -> Vec<EventEnvelope> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }
}

// ============ 内置 Handler ============

/// 将生命周期事件写入结构化日志
pub struct TracingEventHandler;

#[async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle(&self, event: &GatewayEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(event_type = event.event_type(), payload = %payload, "gateway event");
        Ok(())
    }

    fn event_types(&self) -> Vec<&'static str> {
        vec![
            "AuthorizationCreated",
            "AuthorizationActivated",
            "AuthorizationClosed",
            "DeductionSucceeded",
            "DeductionFailed",
            "WithdrawalCompleted",
            "WithdrawalRejected",
        ]
    }
}

/// 发布失败只记录日志，不影响主流程
pub async fn publish_best_effort(bus: &dyn EventBus, event: GatewayEvent) {
    let event_type = event.event_type();
    if let Err(e) = bus.publish(event).await {
        tracing::warn!(event_type = event_type, error = %e, "failed to publish event");
    }
}
