//! # Observable property records
//!
//! Every configuration module keeps its state in an [`Observed`] record: the
//! state itself behind one mutex, plus a table of subscribers keyed by
//! property name. Setters mutate under the lock and then notify the
//! subscribers of each changed property; the bus plumbing that turns these
//! notifications into `PropertiesChanged` signals subscribes here.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A subscriber; receives the name of the property that changed.
pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Which properties a subscriber is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    Named(String),
    All,
}

/// A table of change subscribers keyed by property name.
#[derive(Default)]
pub struct Properties {
    subscribers: Mutex<Vec<(Filter, Callback)>>,
}

impl Debug for Properties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = lock(&self.subscribers).len();
        f.debug_struct("Properties").field("subscribers", &n).finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Properties {
    /// Subscribe to changes of a single property.
    pub fn connect(&self, name: &str, cb: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.subscribers).push((Filter::Named(name.to_owned()), Arc::new(cb)));
    }

    /// Subscribe to changes of every property.
    pub fn connect_all(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.subscribers).push((Filter::All, Arc::new(cb)));
    }

    /// Invoke the subscribers of `name`, in subscription order.
    ///
    /// The subscriber table is not locked while the callbacks run, so a
    /// callback may subscribe further or read the owning module.
    pub fn emit(&self, name: &str) {
        let targets = lock(&self.subscribers)
            .iter()
            .filter(|(filter, _)| match filter {
                Filter::Named(n) => n == name,
                Filter::All => true,
            })
            .map(|(_, cb)| Arc::clone(cb))
            .collect::<Vec<_>>();
        for cb in targets {
            cb(name);
        }
    }
}

/// Module state guarded by a single lock, with change notification.
#[derive(Debug, Default)]
pub struct Observed<T> {
    state: Mutex<T>,
    properties: Properties,
}

impl<T> Observed<T> {
    /// Wrap an initial state.
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            properties: Properties::default(),
        }
    }

    /// Read from the state.
    pub fn get<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.state))
    }

    /// Mutate the state, then emit a change for each of `changed`.
    pub fn update<R>(&self, changed: &[&str], f: impl FnOnce(&mut T) -> R) -> R {
        let r = f(&mut lock(&self.state));
        for name in changed {
            self.properties.emit(name);
        }
        r
    }

    /// The subscriber table.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}
