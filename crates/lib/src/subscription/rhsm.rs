//! Handles to the RHSM (subscription-manager) bus service.
//!
//! The service itself, and the protocol it speaks to the subscription
//! server, are out of our hands; these traits describe the calls we make.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Deserialize;

use crate::bus::RemoteError;
use crate::task::TaskError;

/// The bus name of RHSM.
pub const RHSM_SERVICE_NAME: &str = "com.redhat.RHSM1";
/// The systemd unit backing RHSM.
pub const RHSM_UNIT: &str = "rhsm.service";
/// The `Register` object, as exported on the private bus.
pub const RHSM_REGISTER_PATH: &str = "/com/redhat/RHSM1/Register";

/// Message used when RHSM does not say why a registration failed.
const GENERIC_REGISTRATION_FAILURE: &str = "Registration failed.";

/// The RHSM configuration store, keyed by dotted `rhsm.conf` names.
pub trait RhsmConfig: Send + Sync + Debug {
    /// All configuration values.
    fn get_all(&self) -> Result<BTreeMap<String, String>, RemoteError>;
    /// Set a single value.
    fn set(&self, key: &str, value: &str) -> Result<(), RemoteError>;
    /// Set many values at once.
    fn set_all(&self, values: &BTreeMap<String, String>) -> Result<(), RemoteError>;
}

/// Starts and stops the private bus used to pass credentials.
pub trait RegisterServer: Send + Sync + Debug {
    /// Start the private bus, returning its address.
    fn start(&self, locale: &str) -> Result<String, RemoteError>;
    /// Stop the private bus.
    fn stop(&self, locale: &str) -> Result<(), RemoteError>;
}

/// The registration calls, only reachable over the private bus.
pub trait Register: Send + Sync + Debug {
    /// Register with a Red Hat account.
    fn register(
        &self,
        organization: &str,
        username: &str,
        password: &str,
        locale: &str,
    ) -> Result<(), RemoteError>;

    /// Register with an organization and activation keys.
    fn register_with_activation_keys(
        &self,
        organization: &str,
        activation_keys: &[String],
        locale: &str,
    ) -> Result<(), RemoteError>;
}

/// Subscription attachment.
pub trait Attach: Send + Sync + Debug {
    /// Attach the best matching subscription, optionally for a service level.
    /// Returns the raw JSON answer.
    fn auto_attach(&self, service_level: &str, locale: &str) -> Result<String, RemoteError>;
}

/// Opens connections to a private bus.
pub trait PrivateBusConnector: Send + Sync + Debug {
    /// Connect to the bus at `address` and return its `Register` object.
    fn connect(&self, address: &str) -> Result<Arc<dyn Register>, RemoteError>;
}

/// The RHSM objects we use on the system bus.
#[derive(Debug, Clone)]
pub struct RhsmHandles {
    /// The `Config` object.
    pub config: Arc<dyn RhsmConfig>,
    /// The `RegisterServer` object.
    pub register_server: Arc<dyn RegisterServer>,
    /// The `Attach` object.
    pub attach: Arc<dyn Attach>,
}

/// The locale RHSM should answer in.
pub(crate) fn current_locale() -> String {
    std::env::var("LANG").unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RhsmErrorPayload {
    exception: Option<String>,
    message: Option<String>,
}

/// RHSM can not use rich bus errors, so it packs the details into the
/// error message as JSON. Returns the exception type and the message.
fn unpack_error(message: String) -> (Option<String>, String) {
    match serde_json::from_str::<RhsmErrorPayload>(&message) {
        Ok(payload) => (
            payload.exception,
            payload
                .message
                .unwrap_or_else(|| GENERIC_REGISTRATION_FAILURE.to_owned()),
        ),
        Err(_) => (None, message),
    }
}

/// Turn a failed registration call into a registration error.
pub(crate) fn registration_error(e: RemoteError) -> TaskError {
    let (exception, message) = unpack_error(e.message);
    TaskError::Registration {
        name: e.name,
        exception,
        message,
    }
}

/// Turn any other failed RHSM call into a remote error carrying the
/// unpacked message.
pub(crate) fn rhsm_error(e: RemoteError) -> TaskError {
    let (_, message) = unpack_error(e.message);
    TaskError::Remote(RemoteError::new(e.name, message))
}

/// A running private bus session; stopped when dropped.
pub(crate) struct PrivateBus<'a> {
    server: &'a dyn RegisterServer,
    locale: &'a str,
    address: String,
}

impl Debug for PrivateBus<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateBus")
            .field("locale", &self.locale)
            .finish_non_exhaustive()
    }
}

impl<'a> PrivateBus<'a> {
    pub(crate) fn start(server: &'a dyn RegisterServer, locale: &'a str) -> Result<Self, RemoteError> {
        tracing::debug!("Starting RHSM private bus session");
        let address = server.start(locale)?;
        tracing::debug!("RHSM private bus session has been started");
        Ok(Self {
            server,
            locale,
            address,
        })
    }

    pub(crate) fn connect(&self, connector: &dyn PrivateBusConnector) -> Result<Arc<dyn Register>, RemoteError> {
        // The address is sensitive, so it is not logged.
        tracing::info!("Connecting to the RHSM private bus session");
        connector.connect(&self.address)
    }
}

impl Drop for PrivateBus<'_> {
    fn drop(&mut self) {
        tracing::debug!("Shutting down the RHSM private bus session");
        if let Err(e) = self.server.stop(self.locale) {
            tracing::warn!("Failed to stop the RHSM private bus session: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// A recording stand-in for every RHSM object.
    #[derive(Debug, Default)]
    pub(crate) struct FakeRhsm {
        pub(crate) config: Mutex<BTreeMap<String, String>>,
        pub(crate) calls: Mutex<Vec<String>>,
        /// Error message returned by registration calls.
        pub(crate) register_error: Option<String>,
        pub(crate) attach_error: Option<String>,
    }

    impl FakeRhsm {
        fn record(&self, s: impl Into<String>) {
            self.calls.lock().unwrap().push(s.into());
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn handles(self: &Arc<Self>) -> RhsmHandles {
            RhsmHandles {
                config: Arc::clone(self) as Arc<dyn RhsmConfig>,
                register_server: Arc::clone(self) as Arc<dyn RegisterServer>,
                attach: Arc::clone(self) as Arc<dyn Attach>,
            }
        }

        fn fail(&self, msg: &Option<String>) -> Result<(), RemoteError> {
            match msg {
                Some(m) => Err(RemoteError::new("com.redhat.RHSM1.Error", m.clone())),
                None => Ok(()),
            }
        }
    }

    impl RhsmConfig for FakeRhsm {
        fn get_all(&self) -> Result<BTreeMap<String, String>, RemoteError> {
            self.record("get_all");
            Ok(self.config.lock().unwrap().clone())
        }

        fn set(&self, key: &str, value: &str) -> Result<(), RemoteError> {
            self.record(format!("set {key}={value}"));
            self.config
                .lock()
                .unwrap()
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        }

        fn set_all(&self, values: &BTreeMap<String, String>) -> Result<(), RemoteError> {
            self.record("set_all");
            self.config.lock().unwrap().extend(values.clone());
            Ok(())
        }
    }

    impl RegisterServer for FakeRhsm {
        fn start(&self, _locale: &str) -> Result<String, RemoteError> {
            self.record("start");
            Ok("unix:abstract=secret".into())
        }

        fn stop(&self, _locale: &str) -> Result<(), RemoteError> {
            self.record("stop");
            Ok(())
        }
    }

    impl Register for FakeRhsm {
        fn register(
            &self,
            organization: &str,
            username: &str,
            _password: &str,
            _locale: &str,
        ) -> Result<(), RemoteError> {
            self.record(format!("register {organization:?} {username}"));
            self.fail(&self.register_error)
        }

        fn register_with_activation_keys(
            &self,
            organization: &str,
            activation_keys: &[String],
            _locale: &str,
        ) -> Result<(), RemoteError> {
            self.record(format!(
                "register_with_activation_keys {organization} {}",
                activation_keys.join(",")
            ));
            self.fail(&self.register_error)
        }
    }

    impl Attach for FakeRhsm {
        fn auto_attach(&self, service_level: &str, _locale: &str) -> Result<String, RemoteError> {
            self.record(format!("auto_attach {service_level:?}"));
            self.fail(&self.attach_error)?;
            Ok("{}".into())
        }
    }

    /// Hands out the fake as the private bus `Register` object.
    #[derive(Debug)]
    pub(crate) struct FakeConnector(pub(crate) Arc<FakeRhsm>);

    impl PrivateBusConnector for FakeConnector {
        fn connect(&self, address: &str) -> Result<Arc<dyn Register>, RemoteError> {
            self.0.record(format!("connect {address}"));
            Ok(Arc::clone(&self.0) as Arc<dyn Register>)
        }
    }

    #[test]
    fn error_payloads() {
        let e = registration_error(RemoteError::new(
            "com.redhat.RHSM1.Error",
            r#"{"exception": "UnauthorizedException", "message": "Invalid username or password."}"#,
        ));
        match e {
            TaskError::Registration {
                name,
                exception,
                message,
            } => {
                assert_eq!(name, "com.redhat.RHSM1.Error");
                assert_eq!(exception.as_deref(), Some("UnauthorizedException"));
                assert_eq!(message, "Invalid username or password.");
            }
            o => panic!("unexpected {o:?}"),
        }

        let e = registration_error(RemoteError::new("x.Error", r#"{"exception": "Foo"}"#));
        assert_eq!(e.to_string(), "Registration failed: Registration failed.");

        let e = registration_error(RemoteError::new("x.Error", "connection refused"));
        assert_eq!(e.to_string(), "Registration failed: connection refused");

        let e = rhsm_error(RemoteError::new(
            "com.redhat.RHSM1.Error",
            r#"{"exception": "RestlibException", "message": "No subscriptions found"}"#,
        ));
        assert_eq!(e.to_string(), "com.redhat.RHSM1.Error: No subscriptions found");
    }

    #[test]
    fn private_bus_always_stops() {
        let rhsm = Arc::new(FakeRhsm::default());
        {
            let bus = PrivateBus::start(&*rhsm, "en_US.UTF-8").unwrap();
            bus.connect(&FakeConnector(Arc::clone(&rhsm))).unwrap();
        }
        assert_eq!(rhsm.calls(), ["start", "connect unix:abstract=secret", "stop"]);
    }
}
