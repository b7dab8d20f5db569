use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

use crate::command::CommandTag;
use crate::repair::RepairStrategy;

/// Events emitted while commands are pulled out of a reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CommandDetected {
        tag: CommandTag,
        user_id: String,
    },
    PayloadRepaired {
        tag: CommandTag,
        strategy: RepairStrategy,
    },
    FallbackUsed {
        tag: CommandTag,
        defaulted: Vec<String>,
    },
    CommandCompleted {
        tag: CommandTag,
    },
    CommandFailed {
        tag: CommandTag,
        error: String,
    },

    // Conversation context events
    ContextUpdated {
        user_id: String,
        suggestions: usize,
    },
    ContextEvicted {
        user_id: String,
    },
}

/// Event bus for component communication
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    metrics: Arc<RwLock<Metrics>>,
}

/// Accumulated metrics from events
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub commands_detected: usize,
    pub payloads_repaired: usize,
    pub fallbacks_used: usize,
    pub commands_completed: usize,
    pub commands_failed: usize,
    pub contexts_evicted: usize,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            metrics: Arc::new(RwLock::new(Metrics::default())),
        }
    }

    /// Subscribe to events
    #[allow(dead_code)]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    pub async fn emit(&self, event: Event) -> Result<()> {
        self.update_metrics(&event).await;

        // No receivers is fine
        let _ = self.sender.send(event);
        Ok(())
    }

    /// Get current metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.read().await.clone()
    }

    async fn update_metrics(&self, event: &Event) {
        let mut metrics = self.metrics.write().await;

        match event {
            Event::CommandDetected { .. } => metrics.commands_detected += 1,
            Event::PayloadRepaired { .. } => metrics.payloads_repaired += 1,
            Event::FallbackUsed { .. } => metrics.fallbacks_used += 1,
            Event::CommandCompleted { .. } => metrics.commands_completed += 1,
            Event::CommandFailed { .. } => metrics.commands_failed += 1,
            Event::ContextEvicted { .. } => metrics.contexts_evicted += 1,
            Event::ContextUpdated { .. } => {}
        }
    }
}

/// Trait for components that can emit events
#[async_trait::async_trait]
pub trait EventEmitter {
    fn set_event_bus(&mut self, bus: Arc<EventBus>);

    async fn emit_event(&self, event: Event) -> Result<()>;
}

/// Helper macro to implement EventEmitter for a type with an
/// `event_bus: Option<Arc<EventBus>>` field
#[macro_export]
macro_rules! impl_event_emitter {
    ($type:ty) => {
        #[async_trait::async_trait]
        impl $crate::event_bus::EventEmitter for $type {
            fn set_event_bus(&mut self, bus: std::sync::Arc<$crate::event_bus::EventBus>) {
                self.event_bus = Some(bus);
            }

            async fn emit_event(&self, event: $crate::event_bus::Event) -> anyhow::Result<()> {
                if let Some(bus) = &self.event_bus {
                    bus.emit(event).await
                } else {
                    Ok(())
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_emission() {
        let bus = EventBus::new(100);
        let mut receiver = bus.subscribe();

        let event = Event::CommandDetected {
            tag: CommandTag::GoalModify,
            user_id: "user-1".to_string(),
        };

        bus.emit(event.clone()).await.unwrap();

        let received = receiver.recv().await.unwrap();
        match received {
            Event::CommandDetected { tag, user_id } => {
                assert_eq!(tag, CommandTag::GoalModify);
                assert_eq!(user_id, "user-1");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[tokio::test]
    async fn test_metrics_update() {
        let bus = EventBus::new(100);

        bus.emit(Event::PayloadRepaired {
            tag: CommandTag::MealSuggestion,
            strategy: RepairStrategy::BalanceDelimiters,
        })
        .await
        .unwrap();
        bus.emit(Event::CommandFailed {
            tag: CommandTag::FoodLog,
            error: "db down".to_string(),
        })
        .await
        .unwrap();

        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.payloads_repaired, 1);
        assert_eq!(metrics.commands_failed, 1);
        assert_eq!(metrics.commands_completed, 0);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new(0);
        assert!(bus.emit(Event::ContextEvicted { user_id: "u".to_string() }).await.is_ok());
        assert_eq!(bus.get_metrics().await.contexts_evicted, 1);
    }
}
