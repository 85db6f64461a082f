//! AgentRegistry - named agents that can be awaited before they exist
//!
//! Coordinators often need to hand out references to agents that are still
//! being spawned. `get` subscribes to the named slot and resolves as soon as
//! `add` fills it, so lookup order does not matter.
//!
//! ```ignore
//! let registry = AgentRegistry::with_names(["writer"]);
//! let waiter = tokio::spawn({ let r = registry.clone(); async move { r.get("writer").await } });
//! registry.add("writer", Arc::new(writer));
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

/// Errors from registry lookups
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
  #[error("Registry entry '{0}' was removed before it was filled")]
  Removed(String),
}

type Slot<T> = watch::Sender<Option<T>>;

/// Concurrent name → agent map with awaitable lookups
///
/// Cheap to clone; clones share the same slots. `T` is usually `Arc<Agent<M>>`.
pub struct AgentRegistry<T> {
  slots: Arc<DashMap<String, Slot<T>>>,
}

impl<T> Clone for AgentRegistry<T> {
  fn clone(&self) -> Self {
    Self {
      slots: Arc::clone(&self.slots),
    }
  }
}

impl<T: Clone + Send + Sync> Default for AgentRegistry<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send + Sync> AgentRegistry<T> {
  pub fn new() -> Self {
    Self {
      slots: Arc::new(DashMap::new()),
    }
  }

  /// Pre-create empty slots for names that will be filled later
  pub fn with_names<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let registry = Self::new();
    for name in names {
      registry.slots.entry(name.into()).or_insert_with(empty_slot);
    }
    registry
  }

  /// Fill (or replace) a slot, waking everyone waiting on it
  ///
  /// Returns the previous occupant, if any.
  pub fn add(&self, name: impl Into<String>, agent: T) -> Option<T> {
    let name = name.into();
    debug!(name = %name, "Registering agent");
    self.slots.entry(name).or_insert_with(empty_slot).send_replace(Some(agent))
  }

  /// Wait until the named slot is filled
  pub async fn get(&self, name: &str) -> Result<T, RegistryError> {
    // The map guard must not be held across the await
    let mut rx = self.slots.entry(name.to_string()).or_insert_with(empty_slot).subscribe();

    let filled = rx
      .wait_for(Option::is_some)
      .await
      .map_err(|_| RegistryError::Removed(name.to_string()))?;

    filled.as_ref().cloned().ok_or_else(|| RegistryError::Removed(name.to_string()))
  }

  /// The named agent, if it has already been added
  pub fn try_get(&self, name: &str) -> Option<T> {
    self.slots.get(name).and_then(|slot| slot.borrow().clone())
  }

  /// Drop a slot; pending `get` calls fail with `Removed`
  pub fn remove(&self, name: &str) -> bool {
    self.slots.remove(name).is_some()
  }

  pub fn clear(&self) {
    self.slots.clear();
  }

  /// Every known name, filled or not, sorted
  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<_> = self.slots.iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }
}

fn empty_slot<T>() -> Slot<T> {
  watch::channel(None).0
}

impl<T> std::fmt::Debug for AgentRegistry<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AgentRegistry").field("slots", &self.slots.len()).finish()
  }
}
