//! Schema migration of stored events.
//!
//! Events are written with the schema version their type had at the time.
//! On replay, payloads older than the current version are walked through a
//! chain of pure transforms (`v1 -> v2 -> ... -> vN`) before being
//! deserialized and applied. A missing link fails the whole replay.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while migrating an event payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpcastError {
    /// No transform is registered for one link of the chain.
    #[error("no upcaster for {event_type} from schema version {from} (target {target})")]
    NoPath {
        event_type: String,
        from: u32,
        target: u32,
    },

    /// The stored event is newer than the code replaying it.
    #[error("{event_type} has schema version {found}, newer than supported version {supported}")]
    FutureVersion {
        event_type: String,
        found: u32,
        supported: u32,
    },

    /// A transform rejected the payload.
    #[error("upcasting {event_type} from schema version {from} failed: {reason}")]
    Transformation {
        event_type: String,
        from: u32,
        reason: String,
    },
}

/// One link of an upcast chain: migrates a single event type by one schema version.
pub trait Upcaster: Send + Sync {
    /// The event type this upcaster migrates.
    fn event_type(&self) -> &str;

    /// Schema version this upcaster expects as input.
    fn from_version(&self) -> u32;

    /// Transforms the payload from `from_version` to `from_version + 1`.
    ///
    /// Must be pure: the same input always yields the same output.
    fn upcast(&self, payload: serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Registry of upcasters, keyed by event type and input version.
#[derive(Clone, Default)]
pub struct Upcasters {
    links: HashMap<(String, u32), Arc<dyn Upcaster>>,
}

impl Upcasters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a link, replacing any previous one for the same type and version.
    pub fn register<U: Upcaster + 'static>(&mut self, upcaster: U) {
        let key = (upcaster.event_type().to_string(), upcaster.from_version());
        self.links.insert(key, Arc::new(upcaster));
    }

    /// Builder-style [`Upcasters::register`].
    pub fn with<U: Upcaster + 'static>(mut self, upcaster: U) -> Self {
        self.register(upcaster);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Migrates `payload` of `event_type` from schema version `from` to `target`.
    pub fn upcast(
        &self,
        event_type: &str,
        from: u32,
        target: u32,
        mut payload: serde_json::Value,
    ) -> Result<serde_json::Value, UpcastError> {
        if from > target {
            return Err(UpcastError::FutureVersion {
                event_type: event_type.to_string(),
                found: from,
                supported: target,
            });
        }

        let mut version = from;
        while version < target {
            let link = self
                .links
                .get(&(event_type.to_string(), version))
                .ok_or_else(|| UpcastError::NoPath {
                    event_type: event_type.to_string(),
                    from: version,
                    target,
                })?;
            payload = link
                .upcast(payload)
                .map_err(|reason| UpcastError::Transformation {
                    event_type: event_type.to_string(),
                    from: version,
                    reason,
                })?;
            version += 1;
        }

        Ok(payload)
    }
}

impl std::fmt::Debug for Upcasters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.links.keys().collect();
        keys.sort();
        f.debug_struct("Upcasters").field("links", &keys).finish()
    }
}
