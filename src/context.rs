use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::ContextConfig;
use crate::event_bus::{Event, EventBus, EventEmitter};
use crate::impl_event_emitter;
use crate::services::Suggestion;

/// Ingredients tracked so the same staples are not suggested over and over.
const INGREDIENT_KEYWORDS: &[&str] = &[
    "chicken", "turkey", "beef", "steak", "pork", "salmon", "tuna", "shrimp", "cod",
    "tofu", "tempeh", "egg", "lentil", "bean", "chickpea", "quinoa", "rice", "pasta",
    "oat", "yogurt", "cheese", "avocado", "spinach", "broccoli", "sweet potato",
    "mushroom",
];

/// What the assistant has already suggested to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: String,
    pub recent_suggestions: VecDeque<Suggestion>,
    pub ingredients: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            recent_suggestions: VecDeque::new(),
            ingredients: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn recent_meal_names(&self) -> Vec<String> {
        self.recent_suggestions.iter().map(|s| s.name.clone()).collect()
    }
}

struct Slot {
    context: Arc<Mutex<ConversationContext>>,
    touched: DateTime<Utc>,
    // access order, for picking the least recently used slot
    seq: u64,
}

/// Per-user conversation contexts with idle expiry and a size bound.
///
/// Each user's context sits behind its own lock, so concurrent turns for the
/// same user apply their updates one after the other.
pub struct ConversationStore {
    config: ContextConfig,
    contexts: RwLock<HashMap<String, Slot>>,
    access_seq: AtomicU64,
    event_bus: Option<Arc<EventBus>>,
}

impl ConversationStore {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            contexts: RwLock::new(HashMap::new()),
            access_seq: AtomicU64::new(0),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Copy of a user's context, if one is live.
    pub async fn snapshot(&self, user_id: &str) -> Option<ConversationContext> {
        let slot = {
            let contexts = self.contexts.read().await;
            let slot = contexts.get(user_id)?;
            if self.is_expired(slot.touched, Utc::now()) {
                None
            } else {
                Some(slot.context.clone())
            }
        };

        match slot {
            Some(context) => Some(context.lock().await.clone()),
            None => {
                self.evict_expired().await;
                None
            }
        }
    }

    /// Remember suggestions shown to a user, keeping the most recent ones.
    pub async fn record_suggestions(&self, user_id: &str, suggestions: &[Suggestion]) {
        if suggestions.is_empty() {
            return;
        }

        let mut context = self.lock(user_id).await;
        self.remember(&mut context, suggestions).await;
    }

    /// Exclusive access to a user's context, created if missing.
    ///
    /// Holding the guard across a read, a generator call and `remember` keeps
    /// concurrent turns for the same user from seeing the same history.
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<ConversationContext> {
        self.entry(user_id).await.lock_owned().await
    }

    /// Append suggestions to a locked context, trimming to `history_size`.
    pub async fn remember(&self, context: &mut ConversationContext, suggestions: &[Suggestion]) {
        for suggestion in suggestions {
            context.recent_suggestions.push_back(suggestion.clone());
            for keyword in ingredient_keywords(suggestion) {
                context.ingredients.insert(keyword);
            }
        }
        while context.recent_suggestions.len() > self.config.history_size {
            context.recent_suggestions.pop_front();
        }
        context.updated_at = Utc::now();

        debug!(
            "Context for {} holds {} suggestions, {} ingredients",
            context.user_id,
            context.recent_suggestions.len(),
            context.ingredients.len()
        );

        let _ = self
            .emit_event(Event::ContextUpdated {
                user_id: context.user_id.clone(),
                suggestions: context.recent_suggestions.len(),
            })
            .await;
    }

    /// Drop a user's context. Returns whether there was one.
    #[allow(dead_code)]
    pub async fn clear(&self, user_id: &str) -> bool {
        self.contexts.write().await.remove(user_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    /// Fetch or lazily create the slot for `user_id`, evicting stale entries.
    async fn entry(&self, user_id: &str) -> Arc<Mutex<ConversationContext>> {
        let now = Utc::now();
        let mut evicted = Vec::new();

        let context = {
            let mut contexts = self.contexts.write().await;

            let expired: Vec<String> = contexts
                .iter()
                .filter(|(_, slot)| self.is_expired(slot.touched, now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                contexts.remove(&id);
                evicted.push(id);
            }

            if !contexts.contains_key(user_id) {
                while contexts.len() >= self.config.max_users.max(1) {
                    let oldest = contexts
                        .iter()
                        .min_by_key(|(_, slot)| slot.seq)
                        .map(|(id, _)| id.clone());
                    match oldest {
                        Some(id) => {
                            contexts.remove(&id);
                            evicted.push(id);
                        }
                        None => break,
                    }
                }
            }

            let seq = self.access_seq.fetch_add(1, Ordering::Relaxed);
            let slot = contexts.entry(user_id.to_string()).or_insert_with(|| Slot {
                context: Arc::new(Mutex::new(ConversationContext::new(user_id))),
                touched: now,
                seq,
            });
            slot.touched = now;
            slot.seq = seq;
            slot.context.clone()
        };

        self.announce_evictions(evicted).await;
        context
    }

    async fn evict_expired(&self) {
        let now = Utc::now();
        let evicted: Vec<String> = {
            let mut contexts = self.contexts.write().await;
            let expired: Vec<String> = contexts
                .iter()
                .filter(|(_, slot)| self.is_expired(slot.touched, now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                contexts.remove(id);
            }
            expired
        };
        self.announce_evictions(evicted).await;
    }

    async fn announce_evictions(&self, evicted: Vec<String>) {
        for user_id in evicted {
            debug!("Evicted conversation context for {}", user_id);
            let _ = self.emit_event(Event::ContextEvicted { user_id }).await;
        }
    }

    fn is_expired(&self, touched: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.config.ttl_secs == 0 {
            return false;
        }
        let idle = (now - touched).num_seconds();
        idle > 0 && idle as u64 > self.config.ttl_secs
    }
}

impl_event_emitter!(ConversationStore);

fn ingredient_keywords(suggestion: &Suggestion) -> Vec<String> {
    let text = format!("{} {}", suggestion.name, suggestion.description).to_lowercase();
    INGREDIENT_KEYWORDS
        .iter()
        .filter(|keyword| text.contains(*keyword))
        .map(|keyword| keyword.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Macros;
    use chrono::Duration;

    fn suggestion(name: &str, description: &str) -> Suggestion {
        Suggestion {
            name: name.to_string(),
            serving_info: "1 plate".to_string(),
            macros: Macros::default(),
            description: description.to_string(),
        }
    }

    fn config(history_size: usize, ttl_secs: u64, max_users: usize) -> ContextConfig {
        ContextConfig { history_size, ttl_secs, max_users }
    }

    #[tokio::test]
    async fn test_context_created_lazily() {
        let store = ConversationStore::new(ContextConfig::default());
        assert!(store.snapshot("u1").await.is_none());
        assert_eq!(store.len().await, 0);

        store.record_suggestions("u1", &[suggestion("Salmon Bowl", "salmon over rice")]).await;
        let context = store.snapshot("u1").await.unwrap();
        assert_eq!(context.recent_meal_names(), vec!["Salmon Bowl"]);
        assert!(context.ingredients.contains("salmon"));
        assert!(context.ingredients.contains("rice"));
    }

    #[tokio::test]
    async fn test_history_keeps_last_three() {
        let store = ConversationStore::new(ContextConfig::default());
        let batch: Vec<Suggestion> = (1..=5)
            .map(|i| suggestion(&format!("Meal {}", i), "tofu"))
            .collect();
        store.record_suggestions("u1", &batch).await;

        let context = store.snapshot("u1").await.unwrap();
        assert_eq!(context.recent_meal_names(), vec!["Meal 3", "Meal 4", "Meal 5"]);
        assert_eq!(context.ingredients.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_creates_nothing() {
        let store = ConversationStore::new(ContextConfig::default());
        store.record_suggestions("u1", &[]).await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let bus = Arc::new(EventBus::new(10));
        let store = ConversationStore::new(config(3, 0, 2)).with_event_bus(bus.clone());
        store.record_suggestions("u1", &[suggestion("A", "")]).await;
        store.record_suggestions("u2", &[suggestion("B", "")]).await;
        store.record_suggestions("u3", &[suggestion("C", "")]).await;

        assert_eq!(store.len().await, 2);
        assert!(store.snapshot("u1").await.is_none());
        assert!(store.snapshot("u3").await.is_some());
        assert_eq!(bus.get_metrics().await.contexts_evicted, 1);
    }

    #[tokio::test]
    async fn test_expired_context_is_dropped() {
        let store = ConversationStore::new(config(3, 1, 10));
        store.record_suggestions("u1", &[suggestion("A", "")]).await;
        {
            let mut contexts = store.contexts.write().await;
            let slot = contexts.get_mut("u1").unwrap();
            slot.touched = Utc::now() - Duration::seconds(5);
        }
        assert!(store.snapshot("u1").await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_for_one_user() {
        let store = Arc::new(ConversationStore::new(config(100, 0, 10)));
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_suggestions("u1", &[suggestion(&format!("Meal {}", i), "")]).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.snapshot("u1").await.unwrap().recent_suggestions.len(), 20);
    }

    #[tokio::test]
    async fn test_lock_serializes_read_and_record() {
        let store = Arc::new(ConversationStore::new(ContextConfig::default()));
        let mut handles = Vec::new();
        for i in 0..2 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut context = store.lock("u1").await;
                let seen = context.recent_suggestions.len();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                store.remember(&mut context, &[suggestion(&format!("Meal {}", i), "")]).await;
                seen
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_updates_reach_event_bus() {
        let bus = Arc::new(EventBus::new(10));
        let mut receiver = bus.subscribe();
        let store = ConversationStore::new(ContextConfig::default()).with_event_bus(bus);
        store.record_suggestions("u1", &[suggestion("A", "")]).await;
        match receiver.recv().await.unwrap() {
            Event::ContextUpdated { user_id, suggestions } => {
                assert_eq!(user_id, "u1");
                assert_eq!(suggestions, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear() {
        let store = ConversationStore::new(ContextConfig::default());
        store.record_suggestions("u1", &[suggestion("A", "")]).await;
        assert!(store.clear("u1").await);
        assert!(!store.clear("u1").await);
    }
}
