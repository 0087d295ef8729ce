use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::engine::PersistenceIterator;
use crate::error::{IteratorError, Result};
use crate::handler::Handler;
use crate::store::WorkClaimStore;
use crate::types::IteratorSpec;

/// Named set of iterators sharing one claim store.
///
/// Iterators are registered before start-up; names are unique.
pub struct IteratorRegistry {
    store: Arc<WorkClaimStore>,
    iterators: BTreeMap<String, Arc<PersistenceIterator>>,
}

impl IteratorRegistry {
    pub fn new(store: Arc<WorkClaimStore>) -> Self {
        Self {
            store,
            iterators: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<WorkClaimStore> {
        &self.store
    }

    pub fn register_iterator(
        &mut self,
        spec: IteratorSpec,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<PersistenceIterator>> {
        spec.validate()?;
        if self.iterators.contains_key(&spec.name) {
            return Err(IteratorError::DuplicateIterator { name: spec.name });
        }
        let name = spec.name.clone();
        let iterator = Arc::new(PersistenceIterator::new(
            spec,
            Arc::clone(&self.store),
            handler,
        ));
        self.iterators.insert(name.clone(), Arc::clone(&iterator));
        info!(iterator = %name, "iterator registered");
        Ok(iterator)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PersistenceIterator>> {
        self.iterators.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.iterators.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.iterators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterators.is_empty()
    }

    /// Spawn every registered iterator's run loop.
    pub fn start_all(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.iterators
            .values()
            .map(|it| tokio::spawn(Arc::clone(it).run(shutdown.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::types::IterationTarget;
    use relay_core::SchedulingPolicy;
    use rusqlite::Connection;

    fn registry() -> IteratorRegistry {
        let conn = Connection::open_in_memory().unwrap();
        IteratorRegistry::new(Arc::new(WorkClaimStore::new(conn)))
    }

    fn spec(name: &str) -> IteratorSpec {
        let target = IterationTarget::new("jobs", "next_run", "id").unwrap();
        IteratorSpec::new(name, target, SchedulingPolicy::Regular)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = registry();
        let noop = handler_fn(|_| async { Ok(()) });
        reg.register_iterator(spec("billing"), Arc::clone(&noop)).unwrap();
        let err = reg.register_iterator(spec("billing"), noop).unwrap_err();
        assert!(matches!(err, IteratorError::DuplicateIterator { .. }));
        assert_eq!(reg.names(), vec!["billing"]);
    }

    #[test]
    fn invalid_spec_is_not_registered() {
        let mut reg = registry();
        let mut bad = spec("bad");
        bad.concurrency = 0;
        assert!(reg
            .register_iterator(bad, handler_fn(|_| async { Ok(()) }))
            .is_err());
        assert!(reg.is_empty());
    }
}
