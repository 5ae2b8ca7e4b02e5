use std::any::{Any, TypeId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{QueryError, Result};

/// Per-data-source storage for add-on state, one lazily built instance per type.
///
/// Constructors run outside any map lock. When two callers race on first
/// access both may construct, but only the first published instance is kept
/// and every caller receives that one.
#[derive(Default)]
pub struct ExtensionRegistry {
    slots: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the instance for `T`, if one was already created
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.slots.get(&TypeId::of::<T>())?.value().clone();
        slot.downcast::<T>().ok()
    }

    /// Get the instance for `T`, building it with `T::default()` on first access
    pub fn get_or_create<T>(&self) -> Result<Arc<T>>
    where
        T: Default + Any + Send + Sync,
    {
        self.get_or_try_create(|| Ok::<T, std::convert::Infallible>(T::default()))
    }

    /// Get the instance for `T`, building it with `init` on first access
    pub fn get_or_try_create<T, E, F>(&self, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        E: std::fmt::Display,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        if let Some(existing) = self.get::<T>() {
            return Ok(existing);
        }

        let type_name = std::any::type_name::<T>();
        let candidate = match catch_unwind(AssertUnwindSafe(init)) {
            Ok(Ok(value)) => Arc::new(value) as Arc<dyn Any + Send + Sync>,
            Ok(Err(err)) => {
                return Err(QueryError::ExtensionConstruction {
                    type_name,
                    message: err.to_string(),
                })
            }
            Err(panic) => {
                return Err(QueryError::ExtensionConstruction {
                    type_name,
                    message: panic_message(panic.as_ref()),
                })
            }
        };

        let winner = self
            .slots
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                debug!("Created extension slot for {}", type_name);
                candidate
            })
            .value()
            .clone();

        winner.downcast::<T>().map_err(|_| {
            QueryError::Internal(format!("extension slot for {} holds another type", type_name))
        })
    }

    /// Number of populated slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "constructor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StatementCounter {
        count: AtomicUsize,
    }

    #[derive(Debug, Default)]
    struct Labels(Mutex<Vec<String>>);

    #[derive(Debug)]
    struct Exploding;

    impl Default for Exploding {
        fn default() -> Self {
            panic!("no configuration available")
        }
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = ExtensionRegistry::new();
        let first = registry.get_or_create::<StatementCounter>().unwrap();
        first.count.fetch_add(1, Ordering::SeqCst);

        let second = registry.get_or_create::<StatementCounter>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_slots_are_per_type() {
        let registry = ExtensionRegistry::new();
        registry.get_or_create::<StatementCounter>().unwrap();
        registry.get_or_create::<Labels>().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get::<Labels>().is_some());
    }

    #[test]
    fn test_panicking_default_is_construction_failure() {
        let registry = ExtensionRegistry::new();
        let err = registry.get_or_create::<Exploding>().unwrap_err();
        match err {
            QueryError::ExtensionConstruction { type_name, message } => {
                assert!(type_name.ends_with("Exploding"));
                assert_eq!(message, "no configuration available");
            }
            other => panic!("expected construction failure, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fallible_constructor_error() {
        let registry = ExtensionRegistry::new();
        let err = registry
            .get_or_try_create::<Labels, _, _>(|| Err("missing dictionary"))
            .unwrap_err();
        assert!(matches!(err, QueryError::ExtensionConstruction { .. }));
    }

    #[test]
    fn test_concurrent_first_access_publishes_one_instance() {
        let registry = ExtensionRegistry::new();
        let instances: Vec<Arc<StatementCounter>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| registry.get_or_create::<StatementCounter>().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for instance in &instances {
            assert!(Arc::ptr_eq(instance, &instances[0]));
        }
        assert_eq!(registry.len(), 1);
    }
}
