//! Outbound engine events
//!
//! Notifications, leaderboards and achievements subscribe here. Publishing is
//! fire-and-forget: a lagging or absent subscriber never affects a settled
//! trade.

use crate::oms::{OrderBookSnapshot, OrderId, OrderStatus, Trade};
use crate::{SessionId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeExecuted(Trade),
    OrderStatusChanged {
        order_id: OrderId,
        user: UserId,
        session: SessionId,
        status: OrderStatus,
    },
    OrderBookChanged {
        session: SessionId,
        book: OrderBookSnapshot,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TradeExecuted(_) => "trade_executed",
            EngineEvent::OrderStatusChanged { .. } => "order_status_changed",
            EngineEvent::OrderBookChanged { .. } => "order_book_changed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            debug!("No subscribers for {} event", name);
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}
