//! Typed Event Topics
//!
//! One-way broadcast bus connecting the stores to downstream consumers.
//! Components publish facts about what just happened; subscribers react
//! without holding references into each other. Back-references are always
//! lookups by key, never object pointers.

use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum BusEvent {
    InsightUpserted {
        key: String,
        category: String,
    },
    StepSealed {
        session_id: String,
        step_id: String,
        outcome: String,
    },
    DistillationCreated {
        distillation_id: i64,
        kind: String,
    },
    AdviceEmitted {
        session_id: String,
        tool: String,
        advice_ids: Vec<String>,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish, dropping silently when nobody is subscribed.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
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

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::InsightUpserted {
            key: "k1".into(),
            category: "wisdom".into(),
        });
        match rx.recv().await.unwrap() {
            BusEvent::InsightUpserted { key, .. } => assert_eq!(key, "k1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(BusEvent::AdviceEmitted {
            session_id: "s1".into(),
            tool: "Read".into(),
            advice_ids: vec!["a1".into()],
        });
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_event() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(BusEvent::StepSealed {
            session_id: "s1".into(),
            step_id: "st1".into(),
            outcome: "success".into(),
        });
        assert!(matches!(
            rx1.recv().await.unwrap(),
            BusEvent::StepSealed { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            BusEvent::StepSealed { .. }
        ));
    }
}
