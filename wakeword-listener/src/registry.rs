/// Callback registry: wake-word id -> user action
///
/// Owned by a detector instance (never process-global) and shared with its
/// detection thread through a cheap clone.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Action invoked on the detection thread with the wake-word id and its score.
///
/// A returned error is logged by the detection loop and otherwise ignored.
pub type WakeAction = Arc<dyn Fn(&str, f32) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CallbackRegistry {
    actions: Arc<RwLock<HashMap<String, WakeAction>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` for `wake_word`, replacing any previous registration.
    ///
    /// Returns true if an earlier action was replaced.
    pub fn register<F>(&self, wake_word: impl Into<String>, action: F) -> bool
    where
        F: Fn(&str, f32) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let wake_word = wake_word.into();
        let replaced = self
            .actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(wake_word.clone(), Arc::new(action))
            .is_some();

        info!(wake_word = %wake_word, replaced, "Callback registered");
        replaced
    }

    /// Remove the action for `wake_word`, returning whether one existed
    pub fn unregister(&self, wake_word: &str) -> bool {
        self.actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(wake_word)
            .is_some()
    }

    /// Look up the action for `wake_word`.
    ///
    /// The action is cloned out so the registry lock is not held while it runs.
    pub fn lookup(&self, wake_word: &str) -> Option<WakeAction> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(wake_word)
            .cloned()
    }

    pub fn contains(&self, wake_word: &str) -> bool {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(wake_word)
    }

    pub fn len(&self) -> usize {
        self.actions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered wake-word ids, sorted
    pub fn wake_words(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("wake_words", &self.wake_words())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let registry = CallbackRegistry::new();
        assert!(registry.is_empty());

        let replaced = registry.register("alexa", |_, _| Ok(()));
        assert!(!replaced);
        assert!(registry.contains("alexa"));
        assert!(registry.lookup("alexa").is_some());
        assert!(registry.lookup("hey_jarvis").is_none());
    }

    #[test]
    fn test_register_overwrites() {
        let registry = CallbackRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        registry.register("alexa", move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let s = Arc::clone(&second);
        let replaced = registry.register("alexa", move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(replaced);
        assert_eq!(registry.len(), 1);

        let action = registry.lookup("alexa").unwrap();
        action("alexa", 0.9).unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = CallbackRegistry::new();
        registry.register("alexa", |_, _| Ok(()));

        assert!(registry.unregister("alexa"));
        assert!(!registry.unregister("alexa"));
        assert!(registry.lookup("alexa").is_none());
    }

    #[test]
    fn test_clones_share_registrations() {
        let registry = CallbackRegistry::new();
        let handle = registry.clone();

        registry.register("hey_companion", |_, _| Ok(()));
        registry.register("alexa", |_, _| Ok(()));

        assert_eq!(handle.wake_words(), vec!["alexa", "hey_companion"]);
    }

    #[test]
    fn test_separate_registries_do_not_interfere() {
        let a = CallbackRegistry::new();
        let b = CallbackRegistry::new();

        a.register("alexa", |_, _| Ok(()));
        assert!(b.lookup("alexa").is_none());
    }
}
