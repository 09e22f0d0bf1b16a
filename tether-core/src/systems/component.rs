//! Type-keyed capability slots attached to an owner.
//!
//! At most one component per concrete type. Components use interior
//! mutability so they can be shared as `Arc<T>` across tasks.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::TetherError;

/// A capability that can be attached to a connection, server or client.
pub trait Component: Any + Send + Sync {
    /// Called once after the component is attached.
    fn attached(&self) {}

    /// Called once after the component is removed.
    fn detached(&self) {}
}

struct Slot {
    name: &'static str,
    any: Arc<dyn Any + Send + Sync>,
    component: Arc<dyn Component>,
}

#[derive(Default)]
pub struct ComponentSystem {
    slots: RwLock<HashMap<TypeId, Slot>>,
}

impl ComponentSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a default-constructed `T`.
    pub fn add<T: Component + Default>(&self) -> Result<Arc<T>, TetherError> {
        self.add_instance(T::default())
    }

    /// Attach `component`; fails if a `T` is already attached.
    pub fn add_instance<T: Component>(&self, component: T) -> Result<Arc<T>, TetherError> {
        let component = Arc::new(component);
        {
            let mut slots = self.slots.write();
            if slots.contains_key(&TypeId::of::<T>()) {
                return Err(TetherError::ComponentExists(type_name::<T>()));
            }
            slots.insert(
                TypeId::of::<T>(),
                Slot {
                    name: type_name::<T>(),
                    any: component.clone(),
                    component: component.clone(),
                },
            );
        }
        component.attached();
        Ok(component)
    }

    /// The attached `T`, attaching a default one first if missing.
    pub fn get_or_add<T: Component + Default>(&self) -> Arc<T> {
        if let Some(existing) = self.get::<T>() {
            return existing;
        }
        match self.add::<T>() {
            Ok(added) => added,
            // Lost a race with another `get_or_add`.
            Err(_) => self.get::<T>().unwrap_or_else(|| Arc::new(T::default())),
        }
    }

    pub fn get<T: Component>(&self) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.get(&TypeId::of::<T>())?;
        Arc::clone(&slot.any).downcast::<T>().ok()
    }

    pub fn has<T: Component>(&self) -> bool {
        self.slots.read().contains_key(&TypeId::of::<T>())
    }

    /// Detach the `T`, if any, and return it.
    pub fn remove<T: Component>(&self) -> Option<Arc<T>> {
        let slot = self.slots.write().remove(&TypeId::of::<T>())?;
        slot.component.detached();
        slot.any.downcast::<T>().ok()
    }

    /// Detach every component. Returns how many were removed.
    pub fn remove_all(&self) -> usize {
        let drained: Vec<Slot> = self.slots.write().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.component.detached();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Type names of the attached components.
    pub fn names(&self) -> Vec<&'static str> {
        self.slots.read().values().map(|slot| slot.name).collect()
    }
}

impl std::fmt::Debug for ComponentSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSystem")
            .field("components", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    impl Component for Counter {}

    struct Hooked {
        attached: Arc<AtomicUsize>,
        detached: Arc<AtomicUsize>,
    }

    impl Component for Hooked {
        fn attached(&self) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }

        fn detached(&self) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_component_per_type() {
        let system = ComponentSystem::new();
        let first = system.add::<Counter>().unwrap();
        first.hits.fetch_add(1, Ordering::SeqCst);

        assert!(matches!(
            system.add::<Counter>(),
            Err(TetherError::ComponentExists(_))
        ));
        let fetched = system.get::<Counter>().unwrap();
        assert_eq!(fetched.hits.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &fetched));
    }

    #[test]
    fn remove_detaches() {
        let attached = Arc::new(AtomicUsize::new(0));
        let detached = Arc::new(AtomicUsize::new(0));
        let system = ComponentSystem::new();
        system
            .add_instance(Hooked {
                attached: attached.clone(),
                detached: detached.clone(),
            })
            .unwrap();
        system.add::<Counter>().unwrap();
        assert_eq!(attached.load(Ordering::SeqCst), 1);

        assert!(system.remove::<Hooked>().is_some());
        assert!(system.remove::<Hooked>().is_none());
        assert_eq!(detached.load(Ordering::SeqCst), 1);
        assert!(!system.has::<Hooked>());
        assert!(system.has::<Counter>());
    }

    #[test]
    fn remove_all_clears() {
        let system = ComponentSystem::new();
        system.add::<Counter>().unwrap();
        assert_eq!(system.remove_all(), 1);
        assert!(system.is_empty());
        assert!(system.get::<Counter>().is_none());
    }

    #[test]
    fn get_or_add_reuses() {
        let system = ComponentSystem::new();
        let a = system.get_or_add::<Counter>();
        let b = system.get_or_add::<Counter>();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(system.len(), 1);
    }
}
