//! Fire-once lifecycle notifications

use parking_lot::Mutex;

/// Lifecycle transitions an observer can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
  Starting,
  Stopping,
  Stopped,
}

type Hook = Box<dyn FnOnce(LifecycleEvent) + Send>;

/// Registered hooks, each run at most once and removed when fired
#[derive(Default)]
pub(crate) struct LifecycleHooks {
  hooks: Mutex<Vec<(LifecycleEvent, Hook)>>,
}

impl LifecycleHooks {
  pub fn register(&self, event: LifecycleEvent, hook: Hook) {
    self.hooks.lock().push((event, hook));
  }

  /// Run and unregister every hook for `event`. Returns how many ran.
  pub fn fire(&self, event: LifecycleEvent) -> usize {
    let due = self.take(event);
    let count = due.len();
    // Run outside the lock so hooks may register further hooks
    for hook in due {
      hook(event);
    }
    count
  }

  /// Unregister every hook for `event` without running it
  pub fn clear(&self, event: LifecycleEvent) {
    self.take(event);
  }

  fn take(&self, event: LifecycleEvent) -> Vec<Hook> {
    let mut hooks = self.hooks.lock();
    let (due, keep): (Vec<_>, Vec<_>) = hooks.drain(..).partition(|(e, _)| *e == event);
    *hooks = keep;
    due.into_iter().map(|(_, hook)| hook).collect()
  }
}

impl std::fmt::Debug for LifecycleHooks {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LifecycleHooks")
      .field("registered", &self.hooks.lock().len())
      .finish()
  }
}
