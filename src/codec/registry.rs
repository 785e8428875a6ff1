//! Schema Registry Client
//!
//! Registers schema descriptors under subject names and answers
//! compatibility checks. Descriptors are canonical comma-separated field
//! lists; compatibility levels are opaque strings configured out of band
//! and interpreted here as field-set containment rules.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Unavailable(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "schema registry unavailable: {msg}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register a descriptor under a subject, returning its id. Must be
    /// idempotent for an identical descriptor.
    async fn register(&self, subject: &str, descriptor: &str) -> Result<u32, RegistryError>;

    /// Fetch a descriptor by id.
    async fn fetch(&self, id: u32) -> Result<Option<String>, RegistryError>;

    /// Latest (id, descriptor) registered for a subject.
    async fn latest(&self, subject: &str) -> Result<Option<(u32, String)>, RegistryError>;

    /// Whether `descriptor` is compatible with the subject's latest
    /// version under the subject's configured level.
    async fn check_compatibility(
        &self,
        subject: &str,
        descriptor: &str,
    ) -> Result<bool, RegistryError>;

    async fn set_compatibility(&self, subject: &str, level: &str) -> Result<(), RegistryError>;
}

// =============================================================================
// IN-MEMORY REGISTRY
// =============================================================================

#[derive(Default)]
struct RegistryState {
    next_id: u32,
    by_id: HashMap<u32, String>,
    /// Subject -> version ids, oldest first.
    subjects: HashMap<String, Vec<u32>>,
    levels: HashMap<String, String>,
    default_level: String,
}

pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new(default_level: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 0,
                default_level: default_level.into(),
                ..Default::default()
            }),
        }
    }

    fn fields(descriptor: &str) -> Vec<&str> {
        descriptor
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .collect()
    }

    fn compatible(level: &str, latest: &str, proposed: &str) -> bool {
        let old = Self::fields(latest);
        let new = Self::fields(proposed);
        let contains = |outer: &[&str], inner: &[&str]| inner.iter().all(|f| outer.contains(f));
        match level {
            "NONE" => true,
            // Readers of the new schema can consume old records: every
            // old field survives.
            "BACKWARD" | "BACKWARD_TRANSITIVE" => contains(&new, &old),
            "FORWARD" | "FORWARD_TRANSITIVE" => contains(&old, &new),
            "FULL" | "FULL_TRANSITIVE" => old == new,
            _ => contains(&new, &old),
        }
    }
}

#[async_trait]
impl SchemaRegistry for MemoryRegistry {
    async fn register(&self, subject: &str, descriptor: &str) -> Result<u32, RegistryError> {
        let mut s = self.state.lock();
        if let Some(ids) = s.subjects.get(subject) {
            if let Some(&id) = ids
                .iter()
                .find(|&&id| s.by_id.get(&id).map(String::as_str) == Some(descriptor))
            {
                return Ok(id);
            }
        }
        s.next_id += 1;
        let id = s.next_id;
        s.by_id.insert(id, descriptor.to_string());
        s.subjects.entry(subject.to_string()).or_default().push(id);
        Ok(id)
    }

    async fn fetch(&self, id: u32) -> Result<Option<String>, RegistryError> {
        Ok(self.state.lock().by_id.get(&id).cloned())
    }

    async fn latest(&self, subject: &str) -> Result<Option<(u32, String)>, RegistryError> {
        let s = self.state.lock();
        Ok(s.subjects.get(subject).and_then(|ids| {
            ids.last()
                .and_then(|&id| s.by_id.get(&id).map(|d| (id, d.clone())))
        }))
    }

    async fn check_compatibility(
        &self,
        subject: &str,
        descriptor: &str,
    ) -> Result<bool, RegistryError> {
        let s = self.state.lock();
        let latest = s.subjects.get(subject).and_then(|ids| {
            ids.last().and_then(|&id| s.by_id.get(&id).cloned())
        });
        let Some(latest) = latest else {
            // Nothing registered yet; anything goes.
            return Ok(true);
        };
        let level = s
            .levels
            .get(subject)
            .unwrap_or(&s.default_level)
            .clone();
        Ok(Self::compatible(&level, &latest, descriptor))
    }

    async fn set_compatibility(&self, subject: &str, level: &str) -> Result<(), RegistryError> {
        self.state
            .lock()
            .levels
            .insert(subject.to_string(), level.to_string());
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent_per_descriptor() {
        let r = MemoryRegistry::new("BACKWARD");
        let a = r.register("trades.raw-value", "x,y").await.unwrap();
        let b = r.register("trades.raw-value", "x,y").await.unwrap();
        assert_eq!(a, b);
        let c = r.register("trades.raw-value", "x,y,z").await.unwrap();
        assert_ne!(a, c);
        assert_eq!(
            r.latest("trades.raw-value").await.unwrap(),
            Some((c, "x,y,z".to_string()))
        );
    }

    #[tokio::test]
    async fn fetch_by_id() {
        let r = MemoryRegistry::new("BACKWARD");
        let id = r.register("s", "a,b").await.unwrap();
        assert_eq!(r.fetch(id).await.unwrap(), Some("a,b".to_string()));
        assert_eq!(r.fetch(id + 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn backward_compatibility_requires_old_fields() {
        let r = MemoryRegistry::new("BACKWARD");
        r.register("s", "a,b").await.unwrap();
        assert!(r.check_compatibility("s", "a,b,c").await.unwrap());
        assert!(!r.check_compatibility("s", "a,c").await.unwrap());
    }

    #[tokio::test]
    async fn none_level_accepts_anything() {
        let r = MemoryRegistry::new("BACKWARD");
        r.register("s", "a,b").await.unwrap();
        r.set_compatibility("s", "NONE").await.unwrap();
        assert!(r.check_compatibility("s", "q").await.unwrap());
    }

    #[tokio::test]
    async fn full_level_requires_equality() {
        let r = MemoryRegistry::new("FULL");
        r.register("s", "a,b").await.unwrap();
        assert!(r.check_compatibility("s", "a,b").await.unwrap());
        assert!(!r.check_compatibility("s", "a,b,c").await.unwrap());
    }

    #[tokio::test]
    async fn empty_subject_is_compatible() {
        let r = MemoryRegistry::new("FULL");
        assert!(r.check_compatibility("fresh", "anything").await.unwrap());
    }
}
