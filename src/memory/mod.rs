//! Long-term memory: trigger detection and the memory service

mod client;
pub mod trigger;

use async_trait::async_trait;

pub use client::ManagerMemoryClient;
pub use trigger::{MemoryTrigger, TriggerClassifier};

use crate::Result;

/// Per-device long-term memory service
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist `content` for `device_id`
    ///
    /// # Errors
    ///
    /// Returns error if the service rejects or fails the write
    async fn save(&self, device_id: &str, content: &str) -> Result<()>;

    /// Look up memory relevant to `query`, `None` when nothing is stored
    ///
    /// # Errors
    ///
    /// Returns error if the service fails the read
    async fn recall(&self, device_id: &str, query: &str) -> Result<Option<String>>;
}
