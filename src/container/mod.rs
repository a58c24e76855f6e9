//! Lazily built, invalidatable service registry.
//!
//! Each service type is registered once with a factory and built on first
//! [`ServiceContainer::get`]. Instances are shared as `Arc<T>` and cached
//! until [`ServiceContainer::invalidate_all`]; callers holding an `Arc`
//! keep the instance they were given.
//!
//! Trait objects are valid keys:
//!
//! ```ignore
//! container.register::<dyn TaskRepository, _>(|ctx| {
//!     let db = ctx.get::<Database>()?;
//!     Ok(Arc::new(SqliteTasks::new(db)) as Arc<dyn TaskRepository>)
//! });
//! let repo: Arc<dyn TaskRepository> = container.get::<dyn TaskRepository>()?;
//! ```

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::thread::{self, ThreadId};

use tracing::{debug, info};

use crate::config::{Settings, SettingsProvider};
use crate::{Error, Result};

type Factory<T> = Arc<dyn Fn(&ServiceContext<'_>) -> Result<Arc<T>> + Send + Sync>;

/// One type's cache entry. Holds `Arc<T>` once built.
type Slot = Arc<Mutex<Option<Box<dyn Any + Send + Sync>>>>;

struct Registration {
    name: &'static str,
    /// `Factory<T>` for the registered type
    factory: Box<dyn Any + Send + Sync>,
}

thread_local! {
    /// Types currently being constructed on this thread, outermost first.
    static BUILDING: RefCell<Vec<TypeId>> = const { RefCell::new(Vec::new()) };
}

/// Which thread builds each type and which type each blocked thread waits
/// for. Used to spot cycles that span threads.
#[derive(Default)]
struct BuildGraph {
    builders: HashMap<TypeId, ThreadId>,
    waiting: HashMap<ThreadId, TypeId>,
}

impl BuildGraph {
    /// Whether `me` waiting for `key` would close a wait cycle.
    fn would_deadlock(&self, me: ThreadId, key: TypeId) -> bool {
        let mut next = key;
        for _ in 0..=self.waiting.len() {
            let Some(builder) = self.builders.get(&next) else {
                return false;
            };
            if *builder == me {
                return true;
            }
            match self.waiting.get(builder) {
                Some(key) => next = *key,
                None => return false,
            }
        }
        false
    }
}

/// Marks a type as under construction for the guard's lifetime.
struct BuildGuard<'a> {
    graph: &'a Mutex<BuildGraph>,
    key: TypeId,
}

impl<'a> BuildGuard<'a> {
    fn enter(graph: &'a Mutex<BuildGraph>, key: TypeId) -> Self {
        BUILDING.with(|stack| stack.borrow_mut().push(key));
        lock(graph).builders.insert(key, thread::current().id());
        BuildGuard { graph, key }
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        BUILDING.with(|stack| {
            stack.borrow_mut().pop();
        });
        lock(self.graph).builders.remove(&self.key);
    }
}

fn is_building(key: TypeId) -> bool {
    BUILDING.with(|stack| stack.borrow().contains(&key))
}

/// Handed to factories while they build a service.
pub struct ServiceContext<'a> {
    container: &'a ServiceContainer,
}

impl ServiceContext<'_> {
    /// Current settings façade.
    pub fn settings(&self) -> Result<Arc<Settings>> {
        self.container.settings.instance()
    }

    /// Another service, built on demand.
    pub fn get<U: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<U>> {
        self.container.get::<U>()
    }

    /// Cache generation the service is being built for.
    pub fn generation(&self) -> u64 {
        self.container.generation()
    }
}

/// Registry of shared services keyed by type.
pub struct ServiceContainer {
    settings: Arc<SettingsProvider>,
    registrations: RwLock<HashMap<TypeId, Registration>>,
    cache: Mutex<HashMap<TypeId, Slot>>,
    builds: Mutex<BuildGraph>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let names: Vec<&str> = registrations.values().map(|r| r.name).collect();
        f.debug_struct("ServiceContainer")
            .field("services", &names)
            .field("generation", &self.generation())
            .finish()
    }
}

impl ServiceContainer {
    pub fn new(settings: Arc<SettingsProvider>) -> Self {
        Self {
            settings,
            registrations: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            builds: Mutex::new(BuildGraph::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &Arc<SettingsProvider> {
        &self.settings
    }

    /// Register (or replace) the factory for `T`.
    ///
    /// Replacing a factory drops the cached instance of `T`.
    pub fn register<T, F>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceContext<'_>) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let key = TypeId::of::<T>();
        let factory: Factory<T> = Arc::new(factory);
        let replaced = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                Registration {
                    name: type_name::<T>(),
                    factory: Box::new(factory),
                },
            )
            .is_some();

        if replaced {
            lock(&self.cache).remove(&key);
        }
        debug!(event = "container.service.registered", service = type_name::<T>(), replaced);
    }

    pub fn is_registered<T: ?Sized + 'static>(&self) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    /// Shared instance of `T`, building it on first request.
    ///
    /// Concurrent first requests for the same type build it once; requests
    /// for different types do not wait on each other. A factory error is
    /// returned as is and nothing is cached, so the next call retries.
    ///
    /// A factory that needs its own type, directly or through other
    /// services, gets [`Error::ServiceCycle`]. This holds when the cycle
    /// spans threads that started building at the same time.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = TypeId::of::<T>();
        let name = type_name::<T>();

        // This thread already holds T's slot further up the stack.
        if is_building(key) {
            return Err(Error::ServiceCycle(name));
        }

        let factory = self.factory::<T>()?;
        let slot = Arc::clone(lock(&self.cache).entry(key).or_default());

        let mut cached = self.lock_slot(&slot, key, name)?;
        if let Some(instance) = cached.as_ref().and_then(|b| b.downcast_ref::<Arc<T>>()) {
            return Ok(Arc::clone(instance));
        }

        let instance = {
            let _building = BuildGuard::enter(&self.builds, key);
            factory(&ServiceContext { container: self })?
        };
        *cached = Some(Box::new(Arc::clone(&instance)));
        debug!(
            event = "container.service.built",
            service = name,
            generation = self.generation(),
        );
        Ok(instance)
    }

    /// Whether `T` currently has a cached instance.
    ///
    /// Returns `false` while `T` is being built on another thread.
    pub fn is_cached<T: ?Sized + 'static>(&self) -> bool {
        let Some(slot) = lock(&self.cache).get(&TypeId::of::<T>()).cloned() else {
            return false;
        };
        let cached = match slot.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
            Err(TryLockError::WouldBlock) => false,
        };
        cached
    }

    /// Drop every cached instance.
    ///
    /// Instances already handed out are untouched. Builds in progress finish
    /// into the discarded cache and are not seen by later requests.
    pub fn invalidate_all(&self) {
        let dropped = {
            let mut cache = lock(&self.cache);
            let count = cache.len();
            cache.clear();
            count
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(event = "container.cache.invalidated", dropped, generation);
    }

    /// Number of invalidations so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Lock a type's slot, refusing to wait when the holder is itself
    /// waiting on this thread.
    fn lock_slot<'s>(
        &self,
        slot: &'s Mutex<Option<Box<dyn Any + Send + Sync>>>,
        key: TypeId,
        name: &'static str,
    ) -> Result<MutexGuard<'s, Option<Box<dyn Any + Send + Sync>>>> {
        match slot.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {}
        }

        let me = thread::current().id();
        {
            let mut graph = lock(&self.builds);
            if graph.would_deadlock(me, key) {
                return Err(Error::ServiceCycle(name));
            }
            graph.waiting.insert(me, key);
        }
        let guard = lock(slot);
        lock(&self.builds).waiting.remove(&me);
        Ok(guard)
    }

    fn factory<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Factory<T>> {
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        registrations
            .get(&TypeId::of::<T>())
            .and_then(|r| r.factory.downcast_ref::<Factory<T>>())
            .cloned()
            .ok_or(Error::ServiceNotRegistered(type_name::<T>()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
