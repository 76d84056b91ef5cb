use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::error;

use super::roster::Roster;
use super::state::StateChange;

/// Callback invoked with the full roster after every change.
pub type RosterListener = dyn Fn(&Roster) + Send + Sync;
/// Callback invoked on every channel state transition.
pub type StateListener = dyn Fn(StateChange) + Send + Sync;

/// Ordered set of listeners. Once sealed it accepts nothing and holds nothing.
struct Listeners<L: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<L>)>,
    sealed: bool,
}

/// Thread-safe listener registry shared between a channel handle and its driver task.
pub(crate) struct Registry<L: ?Sized> {
    inner: Mutex<Listeners<L>>,
}

impl<L: ?Sized + Send + Sync + 'static> Registry<L> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Listeners {
                next_id: 1,
                entries: Vec::new(),
                sealed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Listeners<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener. On a sealed registry the returned subscription is inert.
    pub fn subscribe(self: &Arc<Self>, listener: Arc<L>) -> Subscription {
        let mut inner = self.lock();
        if inner.sealed {
            return Subscription::inert();
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, listener));
        drop(inner);

        let weak = Arc::downgrade(self);
        let registry: Weak<dyn Detach> = weak;
        Subscription {
            id,
            registry: Some(registry),
        }
    }

    /// Invoke every listener in registration order. The lock is not held while
    /// listeners run, so they may subscribe, unsubscribe or close the channel.
    pub fn emit(&self, call: impl Fn(&L)) {
        let listeners: Vec<Arc<L>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in &listeners {
            call_guarded(listener.as_ref(), &call);
        }
    }

    /// Drop every listener and refuse new ones.
    pub fn seal(&self) {
        let mut inner = self.lock();
        inner.sealed = true;
        inner.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Run one listener, containing any panic so the remaining listeners still run.
pub(crate) fn call_guarded<L: ?Sized>(listener: &L, call: impl Fn(&L)) {
    if panic::catch_unwind(AssertUnwindSafe(|| call(listener))).is_err() {
        error!("channel listener panicked; continuing with remaining listeners");
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<L: ?Sized + Send + Sync + 'static> Detach for Registry<L> {
    fn detach(&self, id: u64) {
        self.lock().entries.retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Handle returned by `subscribe` / `on_state_change`.
///
/// Dropping it leaves the listener registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    id: u64,
    registry: Option<Weak<dyn Detach>>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            id: 0,
            registry: None,
        }
    }

    /// False for subscriptions taken after the channel was closed.
    pub fn is_active(&self) -> bool {
        self.registry
            .as_ref()
            .is_some_and(|registry| registry.strong_count() > 0)
    }

    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.detach(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Probe = dyn Fn(u32) + Send + Sync;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<Probe> {
        let log = log.clone();
        Arc::new(move |v: u32| log.lock().unwrap().push(format!("{name}:{v}")))
    }

    #[test]
    fn test_emit_in_registration_order() {
        let registry: Arc<Registry<Probe>> = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = registry.subscribe(recorder(&log, "a"));
        let _b = registry.subscribe(recorder(&log, "b"));
        let _c = registry.subscribe(recorder(&log, "c"));

        registry.emit(|l| l(1));
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_listener() {
        let registry: Arc<Registry<Probe>> = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.subscribe(recorder(&log, "a"));
        let _b = registry.subscribe(recorder(&log, "b"));

        a.unsubscribe();
        registry.emit(|l| l(2));
        assert_eq!(*log.lock().unwrap(), vec!["b:2"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dropping_subscription_keeps_listener() {
        let registry: Arc<Registry<Probe>> = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        drop(registry.subscribe(recorder(&log, "a")));

        registry.emit(|l| l(3));
        assert_eq!(*log.lock().unwrap(), vec!["a:3"]);
    }

    #[test]
    fn test_sealed_registry_is_inert() {
        let registry: Arc<Registry<Probe>> = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let before = registry.subscribe(recorder(&log, "before"));
        registry.seal();
        let after = registry.subscribe(recorder(&log, "after"));

        assert!(!after.is_active());
        assert!(before.is_active());
        registry.emit(|l| l(4));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(registry.len(), 0);
    }

    fn exploding(_: u32) {
        panic!("listener bug");
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let registry: Arc<Registry<Probe>> = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _boom = registry.subscribe(Arc::new(exploding));
        let counter = hits.clone();
        let _ok = registry.subscribe(Arc::new(move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(|l| l(5));
        registry.emit(|l| l(6));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let registry: Arc<Registry<Probe>> = Registry::new();
        let inner = registry.clone();
        let _a = registry.subscribe(Arc::new(move |_: u32| {
            drop(inner.subscribe(Arc::new(|_: u32| {})));
        }));

        registry.emit(|l| l(7));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let registry: Arc<Registry<Probe>> = Registry::new();
        let sub = registry.subscribe(Arc::new(|_: u32| {}));
        drop(registry);
        assert!(!sub.is_active());
        sub.unsubscribe();
    }
}
