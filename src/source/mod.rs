//! Remote configuration sources
//!
//! A source stores rule payloads addressed by `(file_id, group)` and can
//! notify subscribers when a payload changes. Two implementations ship:
//!
//! - [`MemoryConfigSource`]: in-process store, pushes synchronously on
//!   [`publish`](MemoryConfigSource::publish). Used by tests and embedders
//!   that feed rules from elsewhere.
//! - [`NacosConfigSource`]: Nacos open API over HTTP with a polling watcher.

pub mod memory;
pub mod nacos;

pub use memory::MemoryConfigSource;
pub use nacos::NacosConfigSource;

use crate::error::SourceResult;
// async_trait required for dyn-compatibility with Arc<dyn ConfigSource>
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with the new payload; `None` means the file was removed
pub type ChangeListener = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Opaque reference to an active listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Push-capable remote configuration store
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Read the current payload, waiting at most `timeout`
    ///
    /// `Ok(None)` means the file does not exist, which callers treat as an
    /// empty rule list.
    async fn fetch(
        &self,
        file_id: &str,
        group: &str,
        timeout: Duration,
    ) -> SourceResult<Option<String>>;

    /// Register `listener` for changes to `(file_id, group)`
    async fn subscribe(
        &self,
        file_id: &str,
        group: &str,
        listener: ChangeListener,
    ) -> SourceResult<SubscriptionHandle>;

    /// Stop delivering changes for a registration
    ///
    /// A callback that is already running may still complete.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> SourceResult<()>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

/// Shared source type alias
pub type SharedConfigSource = Arc<dyn ConfigSource>;
