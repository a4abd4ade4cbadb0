//! 领域事件与事件总线
//!
//! 出站事件（`DomainEvent`）经 `EventBus::emit` 发布，传输方式由外部协作方决定；
//! 入站事件（`InboundEvent`）经 mpsc 通道送进协调器的事件循环。

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::robot::models::Signal;

/// 历史导入的类型，本服务只发起近期导入
pub const IMPORT_TYPE_RECENT: &str = "recent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    RobotStarted {
        robot_id: String,
    },
    RobotStopped {
        robot_id: String,
    },
    RobotError {
        robot_id: String,
        error: String,
    },
    SignalAlert(Signal),
    SignalTrade(Signal),
    /// 请求统计服务重算机器人的交易统计
    StatsRecalc {
        robot_id: String,
    },
    ImporterStart {
        id: String,
        exchange: String,
        asset: String,
        currency: String,
        import_type: String,
    },
    ExwatcherError {
        exchange: String,
        asset: String,
        currency: String,
        error: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::RobotStarted { .. } => "robot_started",
            DomainEvent::RobotStopped { .. } => "robot_stopped",
            DomainEvent::RobotError { .. } => "robot_error",
            DomainEvent::SignalAlert(_) => "signal_alert",
            DomainEvent::SignalTrade(_) => "signal_trade",
            DomainEvent::StatsRecalc { .. } => "stats_recalc",
            DomainEvent::ImporterStart { .. } => "importer_start",
            DomainEvent::ExwatcherError { .. } => "exwatcher_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotCommand {
    Starting,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImporterStatus {
    Finished,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    RobotStatus {
        robot_id: String,
        status: RobotCommand,
    },
    SubscriptionCheck,
    MarketSubscribe {
        exchange: String,
        asset: String,
        currency: String,
    },
    MarketUnsubscribe {
        exchange: String,
        asset: String,
        currency: String,
    },
    /// 导入服务回报，按关联ID对应到订阅
    ImporterStatus {
        id: String,
        #[serde(flatten)]
        status: ImporterStatus,
    },
}

pub trait EventBus: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// 进程内广播实现，出站事件可被任意多个订阅者接收
pub struct BroadcastEventBus {
    outbound: broadcast::Sender<DomainEvent>,
    inbound: mpsc::Sender<InboundEvent>,
}

impl BroadcastEventBus {
    /// 返回总线与入站事件的接收端，接收端交给协调器
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (outbound, _) = broadcast::channel(capacity);
        let (inbound, inbound_rx) = mpsc::channel(capacity);
        (Self { outbound, inbound }, inbound_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.outbound.subscribe()
    }

    /// 入站事件的发送端，外部协作方（或回环导入器）用它回报
    pub fn inbound(&self) -> mpsc::Sender<InboundEvent> {
        self.inbound.clone()
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: DomainEvent) {
        let name = event.name();
        // 没有订阅者时事件直接丢弃
        match self.outbound.send(event) {
            Ok(receivers) => trace!(target: "应用生命周期", event = name, receivers, "事件已发布"),
            Err(_) => trace!(target: "应用生命周期", event = name, "事件无订阅者"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let (bus, _inbound_rx) = BroadcastEventBus::new(16);
        bus.emit(DomainEvent::RobotStarted { robot_id: "lost".into() });

        let mut rx = bus.subscribe();
        bus.emit(DomainEvent::StatsRecalc { robot_id: "r1".into() });
        assert_eq!(
            rx.recv().await.unwrap(),
            DomainEvent::StatsRecalc { robot_id: "r1".into() }
        );
    }

    #[test]
    fn test_inbound_wire_format() {
        let raw = r#"{"type":"importer_status","data":{"id":"abc","status":"failed","error":"no data"}}"#;
        let event: InboundEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            InboundEvent::ImporterStatus {
                id: "abc".into(),
                status: ImporterStatus::Failed { error: "no data".into() },
            }
        );

        let raw = r#"{"type":"robot_status","data":{"robot_id":"r1","status":"starting"}}"#;
        let event: InboundEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, InboundEvent::RobotStatus { status: RobotCommand::Starting, .. }));
    }
}
