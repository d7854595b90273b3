//! In-process event bus.
//!
//! Engines publish after their database transaction commits, so subscribers
//! observe events in causal order per participant. The bus keeps one logging
//! subscriber alive so events are always observable even with no external
//! consumer attached.

use creditnet_rs::events::HubEvent;
use tokio::sync::broadcast;
use tracing::info;

const EVENT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: HubEvent) {
        // A send error only means no receiver is currently subscribed.
        let _ = self.sender.send(event);
    }

    /// Spawn the always-on subscriber that logs every event.
    pub fn spawn_logger(&self) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let pids: Vec<&str> =
                            event.affected_pids().iter().map(|p| p.as_str()).collect();
                        info!(
                            kind = event.kind(),
                            participants = ?pids,
                            "event emitted"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "event logger lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use creditnet_rs::types::{EquivalentCode, Pid};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(HubEvent::PaymentCommitted {
            tx_id: Uuid::nil(),
            from: Pid::from_public_key(&[1; 32]),
            to: Pid::from_public_key(&[2; 32]),
            equivalent: EquivalentCode::parse("USD").unwrap(),
            amount: "50".into(),
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "payment.committed");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(HubEvent::PaymentAborted {
            tx_id: Uuid::nil(),
            from: Pid::from_public_key(&[1; 32]),
            to: Pid::from_public_key(&[2; 32]),
            equivalent: EquivalentCode::parse("USD").unwrap(),
            amount: "50".into(),
            reason: "InsufficientCapacity".into(),
            at: Utc::now(),
        });
    }
}
