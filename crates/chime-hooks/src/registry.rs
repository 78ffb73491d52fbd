//! Hook registry: manages hook subscriptions and dispatches events.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::HookEvent;

/// Async hook handler function type.
pub type HookHandler =
    Arc<dyn Fn(HookEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Manages hook subscriptions and dispatches events.
///
/// Handlers run on their own tasks, so a slow hook never holds up the
/// scheduler that emitted the event.
pub struct HookRegistry {
    /// Map from event type name to handlers.
    handlers: RwLock<HashMap<String, Vec<HookHandler>>>,
}

impl HookRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a specific event type (`"*"` matches all).
    pub async fn on(&self, event_type: &str, handler: HookHandler) {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Register a handler for multiple event types.
    pub async fn on_many(&self, event_types: &[&str], handler: HookHandler) {
        for event_type in event_types {
            self.on(event_type, handler.clone()).await;
        }
    }

    /// Dispatch an event to all registered handlers.
    pub async fn emit(&self, event: HookEvent) {
        let event_type = event.type_name();
        let handlers = self.handlers.read().await;

        let matching = handlers
            .get(event_type)
            .into_iter()
            .chain(handlers.get("*"))
            .flatten();

        for handler in matching {
            let event_clone = event.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                handler(event_clone).await;
            });
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_handler(counter: Arc<AtomicU32>) -> HookHandler {
        Arc::new(move |_event| {
            let c = counter.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_emit_event() {
        let registry = HookRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));

        registry
            .on("cron_job_added", counting_handler(counter.clone()))
            .await;

        registry
            .emit(HookEvent::CronJobAdded {
                job_id: "job-1".into(),
                name: "wake".into(),
            })
            .await;
        registry
            .emit(HookEvent::CronJobRemoved {
                job_id: "job-1".into(),
            })
            .await;
        // Give the spawned task time to run
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_handler() {
        let registry = HookRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));

        registry.on("*", counting_handler(counter.clone())).await;

        registry
            .emit(HookEvent::SchedulerStarted {
                store_path: "/tmp/jobs.json".into(),
            })
            .await;
        registry
            .emit(HookEvent::SchedulerStopped {
                store_path: "/tmp/jobs.json".into(),
            })
            .await;
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_many() {
        let registry = HookRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));

        registry
            .on_many(
                &["cron_job_started", "cron_job_updated"],
                counting_handler(counter.clone()),
            )
            .await;

        registry
            .emit(HookEvent::CronJobStarted {
                job_id: "job-1".into(),
                forced: true,
            })
            .await;
        registry
            .emit(HookEvent::CronJobUpdated {
                job_id: "job-1".into(),
            })
            .await;
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
