//! # Observer of a systemd unit backed bus service
//!
//! The subscription service is not running by default in the installation
//! environment. A [`ServiceObserver`] starts its unit on first use and
//! then lets any number of callers wait, bounded by a timeout, until the
//! service shows up on the bus.
//!
//! The state lock only guards transitions. Callers wait on the timer, never
//! on the lock, so that [`ServiceObserver::service_available`] (called from
//! the bus plumbing's own thread) can take the lock, cancel the timer and
//! store the proxy while others are waiting.

use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::bus::{object_path_for, ProxyFactory, UnitManager};

/// How long to wait for a systemd unit backed bus service to become
/// available. Matches the default timeout systemd applies to manual unit
/// activation.
pub const SERVICE_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(90);

/// Errors from [`ServiceObserver::get_handle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    /// The service did not appear on the bus before the timeout.
    #[error("Bus service {service} with unit {unit} failed to start")]
    ServiceUnavailable {
        /// The bus name of the service.
        service: String,
        /// The systemd unit backing it.
        unit: String,
    },
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Running,
    Cancelled,
    Expired,
}

/// A one-shot timer that can be cancelled and waited on.
#[derive(Debug)]
struct Timer {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl Timer {
    fn new() -> Self {
        Self {
            state: Mutex::new(TimerState::Running),
            cond: Condvar::new(),
        }
    }

    /// Block until the timer finished, however it finished.
    fn wait(&self) {
        let guard = lock(&self.state);
        let _guard = self
            .cond
            .wait_while(guard, |s| *s == TimerState::Running)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Block for at most `timeout`; returns true if the timer is still running.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.state);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| *s == TimerState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == TimerState::Running
    }

    /// Finish the timer and wake every waiter. Returns false if it had
    /// already finished.
    fn finish(&self, outcome: TimerState) -> bool {
        let mut s = lock(&self.state);
        if *s != TimerState::Running {
            return false;
        }
        *s = outcome;
        self.cond.notify_all();
        true
    }
}

enum State<P> {
    Idle,
    Starting(Arc<Timer>),
    Ready(P),
    Failed,
}

impl<P> Debug for State<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Idle => "Idle",
            State::Starting(_) => "Starting",
            State::Ready(_) => "Ready",
            State::Failed => "Failed",
        };
        f.write_str(s)
    }
}

struct Inner<P> {
    service_name: String,
    unit_name: String,
    object_path: String,
    timeout: Duration,
    factory: Arc<dyn ProxyFactory<P>>,
    units: Arc<dyn UnitManager>,
    state: Mutex<State<P>>,
}

impl<P> Inner<P> {
    fn unavailable(&self) -> ObserverError {
        ObserverError::ServiceUnavailable {
            service: self.service_name.clone(),
            unit: self.unit_name.clone(),
        }
    }

    fn timed_out(&self, timer: &Timer) {
        let mut state = lock(&self.state);
        // The service might have shown up between the deadline and us
        // getting the lock.
        if timer.finish(TimerState::Expired) {
            tracing::error!(
                "Bus service startup {} with unit {} timed out.",
                self.service_name,
                self.unit_name
            );
            *state = State::Failed;
        }
    }
}

/// Observer of a systemd unit backed bus service.
///
/// Cheap to clone; clones share the same state.
pub struct ServiceObserver<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for ServiceObserver<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> Debug for ServiceObserver<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ServiceObserver({},{},{})",
            self.inner.service_name, self.inner.object_path, self.inner.unit_name
        )
    }
}

impl<P: Clone + Send + 'static> ServiceObserver<P> {
    /// Create an observer for `service_name`, backed by `unit_name`,
    /// with the default activation timeout.
    pub fn new(
        factory: Arc<dyn ProxyFactory<P>>,
        units: Arc<dyn UnitManager>,
        service_name: &str,
        unit_name: &str,
    ) -> Self {
        Self::with_timeout(
            factory,
            units,
            service_name,
            unit_name,
            SERVICE_ACTIVATION_TIMEOUT,
        )
    }

    /// Create an observer with a custom activation timeout.
    pub fn with_timeout(
        factory: Arc<dyn ProxyFactory<P>>,
        units: Arc<dyn UnitManager>,
        service_name: &str,
        unit_name: &str,
        timeout: Duration,
    ) -> Self {
        let inner = Inner {
            service_name: service_name.to_owned(),
            unit_name: unit_name.to_owned(),
            object_path: object_path_for(service_name),
            timeout,
            factory,
            units,
            state: Mutex::new(State::Idle),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The bus name of the observed service.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Whether a proxy has been obtained.
    pub fn is_service_available(&self) -> bool {
        matches!(*lock(&self.inner.state), State::Ready(_))
    }

    /// Start the unit and the timeout timer. Called with the state lock held.
    fn start(&self) -> Option<Arc<Timer>> {
        let inner = &self.inner;
        tracing::debug!("Starting {} for {}", inner.unit_name, inner.service_name);
        if let Err(e) = inner.units.start_unit(&inner.unit_name) {
            // The unit might still get activated some other way, so keep waiting.
            tracing::warn!("{e:#}");
        }
        let timer = Arc::new(Timer::new());
        let watched = Arc::clone(&timer);
        let observed = Arc::clone(inner);
        let spawned = std::thread::Builder::new()
            .name("service-observer".into())
            .spawn(move || {
                if watched.wait_timeout(observed.timeout) {
                    observed.timed_out(&watched);
                }
            });
        match spawned {
            Ok(_) => Some(timer),
            Err(e) => {
                tracing::error!("Failed to start activation timer: {e}");
                None
            }
        }
    }

    /// Return a handle to the remote service, starting it if needed.
    ///
    /// The first call starts the backing unit; all concurrent callers then
    /// wait until the service appears or the timeout passes. Once that is
    /// decided every later call returns immediately.
    pub fn get_handle(&self) -> Result<P, ObserverError> {
        let timer = {
            let mut state = lock(&self.inner.state);
            match &*state {
                State::Ready(proxy) => return Ok(proxy.clone()),
                State::Failed => return Err(self.inner.unavailable()),
                State::Starting(timer) => Arc::clone(timer),
                State::Idle => match self.start() {
                    Some(timer) => {
                        *state = State::Starting(Arc::clone(&timer));
                        timer
                    }
                    None => {
                        *state = State::Failed;
                        return Err(self.inner.unavailable());
                    }
                },
            }
        };

        timer.wait();

        match &*lock(&self.inner.state) {
            State::Ready(proxy) => Ok(proxy.clone()),
            _ => Err(self.inner.unavailable()),
        }
    }

    /// Notify the observer that the service became reachable on the bus.
    ///
    /// Only has an effect while a start is in progress.
    pub fn service_available(&self) {
        let inner = &self.inner;
        let mut state = lock(&inner.state);
        let State::Starting(timer) = &*state else {
            tracing::debug!(
                "Ignoring availability of {} in state {:?}",
                inner.service_name,
                *state
            );
            return;
        };
        if !timer.finish(TimerState::Cancelled) {
            return;
        }
        let proxy = inner
            .factory
            .get_proxy(&inner.service_name, &inner.object_path);
        *state = State::Ready(proxy);
        tracing::debug!("Bus service {} is available", inner.service_name);
    }
}
