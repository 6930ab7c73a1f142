//! Persistence seam and the cycle driver on top of it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Result;

use crate::{
    error::Error,
    expr::Gate,
    reconcile::{compute_transition, CycleInput, Mode, ReconciliationState, Transition},
};

/// Where [`ReconciliationState`]s live between cycles, keyed by resource name.
pub trait StateStore {
    fn load(&self, name: &str) -> Result<Option<ReconciliationState>>;
    fn store(&self, name: &str, state: &ReconciliationState) -> Result<()>;
}

impl<S: StateStore + ?Sized> StateStore for &S {
    fn load(&self, name: &str) -> Result<Option<ReconciliationState>> {
        (**self).load(name)
    }
    fn store(&self, name: &str, state: &ReconciliationState) -> Result<()> {
        (**self).store(name, state)
    }
}

/// Keeps states in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<BTreeMap<String, ReconciliationState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.states).keys().cloned().collect()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<ReconciliationState>> {
        Ok(lock(&self.states).get(name).cloned())
    }

    fn store(&self, name: &str, state: &ReconciliationState) -> Result<()> {
        lock(&self.states).insert(name.to_string(), state.clone());
        Ok(())
    }
}

/// Runs cycles against a [`StateStore`].
///
/// Cycles for the same resource name are serialized, so that each one sees
/// the state the previous one stored. Cycles for different names run
/// independently.
pub struct Reconciler<S> {
    store: S,
    gate: Gate,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: StateStore> Reconciler<S> {
    pub fn new(store: S, gate: Gate) -> Self {
        Reconciler {
            store,
            gate,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Run a cycle and persist its result.
    ///
    /// On error nothing is written.
    pub fn apply(&self, name: &str, input: &CycleInput) -> Result<Transition, Error> {
        self.exclusively(name, || {
            let previous = self.load(name)?;
            let transition =
                compute_transition(previous.as_ref(), input, &self.gate, Mode::Apply)?;
            self.store
                .store(name, &transition.state)
                .map_err(|source| Error::Store {
                    name: name.to_string(),
                    source,
                })?;
            tracing::debug!(name, committed = transition.state.is_committed, "stored state");
            Ok(transition)
        })
    }

    /// Run a cycle without persisting anything.
    pub fn preview(&self, name: &str, input: &CycleInput) -> Result<Transition, Error> {
        self.exclusively(name, || {
            let previous = self.load(name)?;
            Ok(compute_transition(
                previous.as_ref(),
                input,
                &self.gate,
                Mode::Preview,
            )?)
        })
    }

    /// The currently stored state, if any cycle has been applied.
    pub fn state(&self, name: &str) -> Result<Option<ReconciliationState>, Error> {
        self.load(name)
    }

    fn load(&self, name: &str) -> Result<Option<ReconciliationState>, Error> {
        self.store.load(name).map_err(|source| Error::Load {
            name: name.to_string(),
            source,
        })
    }

    /// Run `f` while holding the lock for `name`.
    ///
    /// A lock is only kept in the map while some cycle holds or waits for it.
    fn exclusively<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let resource_lock = lock(&self.locks)
            .entry(name.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock(&resource_lock);
            f()
        };
        // Clones are only taken under the map lock, so the count is stable
        // here. Two references are the map's and ours.
        let mut locks = lock(&self.locks);
        if Arc::strong_count(&resource_lock) == 2 {
            locks.remove(name);
        }
        result
    }
}

// A panic while holding one of these locks cannot leave the guarded data
// half-written, so poisoning is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    struct FailingStore;

    impl StateStore for FailingStore {
        fn load(&self, _name: &str) -> Result<Option<ReconciliationState>> {
            Ok(None)
        }
        fn store(&self, _name: &str, _state: &ReconciliationState) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn input(entries: &[(&str, &str)]) -> CycleInput {
        CycleInput::new(entries.iter().copied().collect::<Snapshot>())
    }

    #[test]
    fn test_preview_does_not_store() {
        let reconciler = Reconciler::new(MemoryStore::new(), Gate::default());
        let t = reconciler.preview("a", &input(&[("k", "v")])).unwrap();
        assert!(t.state.is_committed);
        assert_eq!(reconciler.state("a").unwrap(), None);
    }

    #[test]
    fn test_preview_syntax_error_does_not_store() {
        let reconciler = Reconciler::new(MemoryStore::new(), Gate::default());
        let first = reconciler.apply("a", &input(&[("k", "v")])).unwrap();
        let err = reconciler
            .preview("a", &input(&[("k", "w")]).with_commit_expression("(("))
            .unwrap_err();
        assert_eq!(err.tag(), "SyntaxError");
        assert_eq!(reconciler.state("a").unwrap(), Some(first.state));

        let err = reconciler
            .preview("b", &input(&[]).with_commit_expression("(("))
            .unwrap_err();
        assert_eq!(err.tag(), "SyntaxError");
        assert_eq!(reconciler.store().names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_locks_are_released() {
        let reconciler = Reconciler::new(MemoryStore::new(), Gate::default());
        for name in ["a", "b", "c"] {
            reconciler.apply(name, &input(&[("k", "v")])).unwrap();
            reconciler.preview(name, &input(&[])).unwrap();
        }
        reconciler
            .apply("d", &input(&[]).with_commit_expression("(("))
            .unwrap_err();
        assert!(lock(&reconciler.locks).is_empty());
    }

    #[test]
    fn test_apply_stores() {
        let reconciler = Reconciler::new(MemoryStore::new(), Gate::default());
        let t = reconciler.apply("a", &input(&[("k", "v")])).unwrap();
        assert_eq!(reconciler.state("a").unwrap(), Some(t.state));
        assert_eq!(reconciler.store().names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_gate_error_leaves_state() {
        let reconciler = Reconciler::new(MemoryStore::new(), Gate::default());
        let first = reconciler.apply("a", &input(&[("k", "v")])).unwrap();
        let err = reconciler
            .apply(
                "a",
                &input(&[("k", "w")]).with_commit_expression("values.k.nope.deeper"),
            )
            .unwrap_err();
        assert_eq!(err.tag(), "RuntimeError");
        assert_eq!(reconciler.state("a").unwrap(), Some(first.state));
    }

    #[test]
    fn test_store_error() {
        let reconciler = Reconciler::new(FailingStore, Gate::default());
        let err = reconciler.apply("a", &input(&[])).unwrap_err();
        assert_eq!(err.tag(), "StoreError");
        assert_eq!(err.to_string(), "could not store the state of resource `a`");
    }
}
