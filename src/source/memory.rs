//! In-memory configuration source

use crate::error::{SourceError, SourceResult};
use crate::source::{ChangeListener, ConfigSource, SubscriptionHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

struct Registration {
    file_id: String,
    group: String,
    listener: ChangeListener,
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<(String, String), String>,
    listeners: HashMap<u64, Registration>,
}

/// Process-local store that pushes changes on the publishing thread
#[derive(Default)]
pub struct MemoryConfigSource {
    state: Mutex<MemoryState>,
    next_handle: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("memory config source lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn check_available(&self, file_id: &str, group: &str) -> SourceResult<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(SourceError::Unavailable {
                file_id: file_id.to_string(),
                group: group.to_string(),
                reason: "source is offline".to_string(),
            });
        }
        Ok(())
    }

    /// Simulate the store going offline (or coming back)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Store a payload and notify its listeners
    ///
    /// Listeners run on the caller's thread after the internal lock is
    /// released, so a listener may call back into the source.
    pub fn publish(&self, file_id: &str, group: &str, content: impl Into<String>) {
        let content = content.into();
        let listeners = {
            let mut state = self.lock();
            state
                .values
                .insert((file_id.to_string(), group.to_string()), content.clone());
            Self::listeners_for(&state, file_id, group)
        };

        debug!(file_id, group, listeners = listeners.len(), "publishing config");
        for listener in listeners {
            listener(Some(content.clone()));
        }
    }

    /// Delete a payload and notify its listeners with `None`
    pub fn remove(&self, file_id: &str, group: &str) {
        let listeners = {
            let mut state = self.lock();
            state
                .values
                .remove(&(file_id.to_string(), group.to_string()));
            Self::listeners_for(&state, file_id, group)
        };

        for listener in listeners {
            listener(None);
        }
    }

    fn listeners_for(state: &MemoryState, file_id: &str, group: &str) -> Vec<ChangeListener> {
        state
            .listeners
            .values()
            .filter(|r| r.file_id == file_id && r.group == group)
            .map(|r| r.listener.clone())
            .collect()
    }

    /// Number of live registrations for `(file_id, group)`
    pub fn listener_count(&self, file_id: &str, group: &str) -> usize {
        self.lock()
            .listeners
            .values()
            .filter(|r| r.file_id == file_id && r.group == group)
            .count()
    }

    /// Current payload without going through the trait
    pub fn get(&self, file_id: &str, group: &str) -> Option<String> {
        self.lock()
            .values
            .get(&(file_id.to_string(), group.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn fetch(
        &self,
        file_id: &str,
        group: &str,
        _timeout: Duration,
    ) -> SourceResult<Option<String>> {
        self.check_available(file_id, group)?;
        Ok(self.get(file_id, group))
    }

    async fn subscribe(
        &self,
        file_id: &str,
        group: &str,
        listener: ChangeListener,
    ) -> SourceResult<SubscriptionHandle> {
        self.check_available(file_id, group)?;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.lock().listeners.insert(
            id,
            Registration {
                file_id: file_id.to_string(),
                group: group.to_string(),
                listener,
            },
        );
        Ok(SubscriptionHandle::new(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> SourceResult<()> {
        self.lock()
            .listeners
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(SourceError::UnknownHandle(handle.id()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_fetch_missing_is_none() {
        let source = MemoryConfigSource::new();
        assert_eq!(source.fetch("f", "g", TIMEOUT).await.unwrap(), None);

        source.publish("f", "g", "[]");
        assert_eq!(
            source.fetch("f", "g", TIMEOUT).await.unwrap().as_deref(),
            Some("[]")
        );
    }

    #[tokio::test]
    async fn test_publish_notifies_matching_listeners_only() {
        let source = MemoryConfigSource::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        source
            .subscribe(
                "f",
                "g",
                Arc::new(move |payload| sink.lock().unwrap().push(payload)),
            )
            .await
            .unwrap();

        source.publish("f", "g", "a");
        source.publish("other", "g", "b");
        source.remove("f", "g");

        assert_eq!(*seen.lock().unwrap(), vec![Some("a".to_string()), None]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let source = MemoryConfigSource::new();
        let handle = source
            .subscribe("f", "g", Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(source.listener_count("f", "g"), 1);

        source.unsubscribe(handle).await.unwrap();
        assert_eq!(source.listener_count("f", "g"), 0);
        assert!(matches!(
            source.unsubscribe(handle).await,
            Err(SourceError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_source() {
        let source = MemoryConfigSource::new();
        source.set_available(false);
        assert!(matches!(
            source.fetch("f", "g", TIMEOUT).await,
            Err(SourceError::Unavailable { .. })
        ));
        assert!(source.subscribe("f", "g", Arc::new(|_| {})).await.is_err());

        source.set_available(true);
        assert!(source.fetch("f", "g", TIMEOUT).await.is_ok());
    }
}
