//! Tasks talking to RHSM in the installation environment.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;

use super::rhsm::{
    current_locale, registration_error, rhsm_error, Attach, PrivateBus, PrivateBusConnector,
    RegisterServer, RhsmConfig, RhsmHandles,
};
use super::{Secret, SubscriptionRequest};
use crate::service_observer::ServiceObserver;
use crate::task::{open_sysroot, Task, TaskError, TaskIoContext};

const YUM_REPOS_DIR: &str = "etc/yum.repos.d";
const LOG_LEVEL_KEY: &str = "logging.default_log_level";

const CONFIG_KEY_SERVER_HOSTNAME: &str = "server.hostname";
const CONFIG_KEY_SERVER_PROXY_HOSTNAME: &str = "server.proxy_hostname";
const CONFIG_KEY_SERVER_PROXY_PORT: &str = "server.proxy_port";
const CONFIG_KEY_SERVER_PROXY_USER: &str = "server.proxy_user";
const CONFIG_KEY_SERVER_PROXY_PASSWORD: &str = "server.proxy_password";
const CONFIG_KEY_RHSM_BASEURL: &str = "rhsm.baseurl";

/// RHSM configuration as found right after the service started.
pub type RhsmDefaults = Arc<Mutex<BTreeMap<String, String>>>;

/// Start RHSM and remember its configuration defaults.
#[derive(Debug)]
pub struct StartRHSMTask {
    pub(crate) source_root: Utf8PathBuf,
    pub(crate) observer: ServiceObserver<RhsmHandles>,
    pub(crate) defaults: RhsmDefaults,
}

impl Task for StartRHSMTask {
    fn name(&self) -> &str {
        "Start RHSM DBus service"
    }

    fn run(&self) -> Result<(), TaskError> {
        // RHSM does not write out the repo file without this directory.
        let root = open_sysroot(&self.source_root)?;
        if !root.is_dir(YUM_REPOS_DIR) {
            tracing::debug!("Creating /{YUM_REPOS_DIR}");
            root.create_dir_all(YUM_REPOS_DIR)
                .task_context(|| format!("Creating {YUM_REPOS_DIR}"))?;
        }

        let handles = self.observer.get_handle()?;
        let defaults = handles.config.get_all().map_err(rhsm_error)?;
        tracing::debug!("Fetched {} RHSM configuration defaults.", defaults.len());
        *self
            .defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = defaults;

        tracing::debug!("Enabling RHSM debug logging.");
        handles
            .config
            .set(LOG_LEVEL_KEY, "DEBUG")
            .map_err(rhsm_error)?;
        Ok(())
    }
}

/// Push the request's server settings into the RHSM configuration.
///
/// A value cleared in the request restores the default RHSM had when it
/// started, so the user can go back to the stock server by emptying a field.
#[derive(Debug)]
pub struct SetRHSMConfigurationTask {
    pub(crate) config: Arc<dyn RhsmConfig>,
    pub(crate) defaults: BTreeMap<String, String>,
    pub(crate) request: SubscriptionRequest,
}

impl SetRHSMConfigurationTask {
    fn values(&self) -> BTreeMap<String, String> {
        let r = &self.request;
        let port = r
            .server_proxy_port
            .map(|p| p.to_string())
            .unwrap_or_default();
        let requested = [
            (CONFIG_KEY_SERVER_HOSTNAME, r.server_hostname.clone()),
            (CONFIG_KEY_SERVER_PROXY_HOSTNAME, r.server_proxy_hostname.clone()),
            (CONFIG_KEY_SERVER_PROXY_PORT, port),
            (CONFIG_KEY_SERVER_PROXY_USER, r.server_proxy_user.clone()),
            (
                CONFIG_KEY_SERVER_PROXY_PASSWORD,
                r.server_proxy_password.expose().to_owned(),
            ),
            (CONFIG_KEY_RHSM_BASEURL, r.rhsm_baseurl.clone()),
        ];
        requested
            .into_iter()
            .map(|(key, value)| {
                let value = if value.is_empty() {
                    tracing::debug!("Restoring original value for RHSM config key {key}");
                    self.defaults.get(key).cloned().unwrap_or_default()
                } else {
                    value
                };
                (key.to_owned(), value)
            })
            .collect()
    }
}

impl Task for SetRHSMConfigurationTask {
    fn name(&self) -> &str {
        "Set RHSM configuration"
    }

    fn run(&self) -> Result<(), TaskError> {
        tracing::debug!("Setting RHSM config values");
        self.config.set_all(&self.values()).map_err(rhsm_error)
    }
}

/// Register with a Red Hat account.
#[derive(Debug)]
pub struct RegisterWithUsernamePasswordTask {
    pub(crate) register_server: Arc<dyn RegisterServer>,
    pub(crate) connector: Arc<dyn PrivateBusConnector>,
    pub(crate) username: String,
    pub(crate) password: Secret,
}

impl Task for RegisterWithUsernamePasswordTask {
    fn name(&self) -> &str {
        "Register with Red Hat account username and password"
    }

    fn run(&self) -> Result<(), TaskError> {
        tracing::debug!("Registering with username and password");
        let locale = current_locale();
        let bus = PrivateBus::start(self.register_server.as_ref(), &locale)?;
        let register = bus.connect(self.connector.as_ref())?;
        // Organization selection is not supported for account registration.
        register
            .register("", &self.username, self.password.expose(), &locale)
            .map_err(|e| {
                tracing::debug!("Failed to register with username and password: {e}");
                registration_error(e)
            })?;
        tracing::debug!("Registered with username and password");
        Ok(())
    }
}

/// Register with an organization and activation keys.
#[derive(Debug)]
pub struct RegisterWithOrganizationKeyTask {
    pub(crate) register_server: Arc<dyn RegisterServer>,
    pub(crate) connector: Arc<dyn PrivateBusConnector>,
    pub(crate) organization: String,
    pub(crate) activation_keys: Vec<Secret>,
}

impl Task for RegisterWithOrganizationKeyTask {
    fn name(&self) -> &str {
        "Register with organization name and activation key"
    }

    fn run(&self) -> Result<(), TaskError> {
        tracing::debug!("Registering with organization and activation key");
        let locale = current_locale();
        let keys = self
            .activation_keys
            .iter()
            .map(|k| k.expose().to_owned())
            .collect::<Vec<_>>();
        let bus = PrivateBus::start(self.register_server.as_ref(), &locale)?;
        let register = bus.connect(self.connector.as_ref())?;
        register
            .register_with_activation_keys(&self.organization, &keys, &locale)
            .map_err(|e| {
                tracing::debug!("Failed to register with organization and key: {e}");
                registration_error(e)
            })?;
        tracing::debug!("Registered with organization and activation key");
        Ok(())
    }
}

/// Auto-attach a subscription to the registered system.
#[derive(Debug)]
pub struct AttachSubscriptionTask {
    pub(crate) attach: Arc<dyn Attach>,
    pub(crate) service_level: String,
}

impl Task for AttachSubscriptionTask {
    fn name(&self) -> &str {
        "Attach a subscription"
    }

    fn run(&self) -> Result<(), TaskError> {
        tracing::debug!("Auto-attaching a subscription (SLA {:?})", self.service_level);
        self.attach
            .auto_attach(&self.service_level, &current_locale())
            .map_err(|e| {
                tracing::debug!("Auto-attach failed: {e}");
                rhsm_error(e)
            })?;
        tracing::debug!("Auto-attached a subscription");
        Ok(())
    }
}

/// Put RHSM logging back to its normal level.
#[derive(Debug)]
pub struct RestoreRHSMLogLevelTask {
    pub(crate) config: Arc<dyn RhsmConfig>,
}

impl Task for RestoreRHSMLogLevelTask {
    fn name(&self) -> &str {
        "Restoring subscription manager log level"
    }

    fn run(&self) -> Result<(), TaskError> {
        self.config
            .set(LOG_LEVEL_KEY, "INFO")
            .map_err(rhsm_error)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use camino::Utf8Path;

    use super::super::rhsm::tests::{FakeConnector, FakeRhsm};
    use super::*;
    use crate::bus::tests::FakeUnits;
    use crate::bus::ProxyFactory;

    /// Hands out the same fake for every object.
    #[derive(Debug)]
    pub(crate) struct FakeRhsmFactory(pub(crate) Arc<FakeRhsm>);

    impl ProxyFactory<RhsmHandles> for FakeRhsmFactory {
        fn get_proxy(&self, _service_name: &str, _object_path: &str) -> RhsmHandles {
            self.0.handles()
        }
    }

    /// An observer whose service shows up as soon as it is started.
    pub(crate) fn ready_observer(rhsm: &Arc<FakeRhsm>) -> (ServiceObserver<RhsmHandles>, FakeUnits) {
        let units = FakeUnits::default();
        let observer = ServiceObserver::with_timeout(
            Arc::new(FakeRhsmFactory(Arc::clone(rhsm))),
            Arc::new(units.clone()),
            "com.redhat.RHSM1",
            "rhsm.service",
            Duration::from_secs(30),
        );
        let o = observer.clone();
        std::thread::spawn(move || {
            while !o.is_service_available() {
                o.service_available();
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        (observer, units)
    }

    #[test]
    fn start_rhsm() {
        let td = tempfile::tempdir().unwrap();
        let source_root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let rhsm = Arc::new(FakeRhsm::default());
        rhsm.config
            .lock()
            .unwrap()
            .insert(CONFIG_KEY_SERVER_HOSTNAME.into(), "subscription.rhsm.redhat.com".into());
        let (observer, units) = ready_observer(&rhsm);
        let defaults = RhsmDefaults::default();
        StartRHSMTask {
            source_root: source_root.clone(),
            observer,
            defaults: Arc::clone(&defaults),
        }
        .run()
        .unwrap();

        assert!(source_root.join(YUM_REPOS_DIR).is_dir());
        assert_eq!(units.calls(), ["start rhsm.service"]);
        assert_eq!(
            defaults.lock().unwrap().get(CONFIG_KEY_SERVER_HOSTNAME).map(String::as_str),
            Some("subscription.rhsm.redhat.com")
        );
        assert_eq!(rhsm.calls(), ["get_all", "set logging.default_log_level=DEBUG"]);
    }

    #[test]
    fn set_config_restores_defaults() {
        let rhsm = Arc::new(FakeRhsm::default());
        let defaults = BTreeMap::from([
            (CONFIG_KEY_SERVER_HOSTNAME.to_owned(), "server.example.com".to_owned()),
            (CONFIG_KEY_RHSM_BASEURL.to_owned(), "cdn.example.com".to_owned()),
            (CONFIG_KEY_SERVER_PROXY_PORT.to_owned(), "3128".to_owned()),
        ]);
        let request = SubscriptionRequest {
            server_hostname: "candlepin.example.org".into(),
            server_proxy_hostname: "proxy.example.org".into(),
            server_proxy_user: "me".into(),
            server_proxy_password: Secret::new("hunter2"),
            ..Default::default()
        };
        SetRHSMConfigurationTask {
            config: rhsm.handles().config,
            defaults,
            request,
        }
        .run()
        .unwrap();

        let config = rhsm.config.lock().unwrap().clone();
        assert_eq!(
            config,
            BTreeMap::from([
                ("rhsm.baseurl".to_owned(), "cdn.example.com".to_owned()),
                ("server.hostname".to_owned(), "candlepin.example.org".to_owned()),
                ("server.proxy_hostname".to_owned(), "proxy.example.org".to_owned()),
                ("server.proxy_password".to_owned(), "hunter2".to_owned()),
                ("server.proxy_port".to_owned(), "3128".to_owned()),
                ("server.proxy_user".to_owned(), "me".to_owned()),
            ])
        );
        assert_eq!(rhsm.calls(), ["set_all"]);
    }

    #[test]
    fn register_with_password() {
        let rhsm = Arc::new(FakeRhsm::default());
        let task = RegisterWithUsernamePasswordTask {
            register_server: rhsm.handles().register_server,
            connector: Arc::new(FakeConnector(Arc::clone(&rhsm))),
            username: "jdoe".into(),
            password: Secret::new("secret"),
        };
        task.run().unwrap();
        assert_eq!(
            rhsm.calls(),
            ["start", "connect unix:abstract=secret", "register \"\" jdoe", "stop"]
        );
        assert!(!format!("{task:?}").contains("\"secret\""));
    }

    #[test]
    fn register_with_key_failure() {
        let rhsm = Arc::new(FakeRhsm {
            register_error: Some(
                r#"{"exception": "RestlibException", "message": "Invalid activation key"}"#.into(),
            ),
            ..Default::default()
        });
        let e = RegisterWithOrganizationKeyTask {
            register_server: rhsm.handles().register_server,
            connector: Arc::new(FakeConnector(Arc::clone(&rhsm))),
            organization: "123".into(),
            activation_keys: vec![Secret::new("k1"), Secret::new("k2")],
        }
        .run()
        .unwrap_err();
        assert_eq!(e.to_string(), "Registration failed: Invalid activation key");
        // The private bus is shut down even though registration failed
        assert_eq!(
            rhsm.calls(),
            [
                "start",
                "connect unix:abstract=secret",
                "register_with_activation_keys 123 k1,k2",
                "stop"
            ]
        );
    }

    #[test]
    fn attach_and_restore() {
        let rhsm = Arc::new(FakeRhsm::default());
        let handles = rhsm.handles();
        AttachSubscriptionTask {
            attach: Arc::clone(&handles.attach),
            service_level: "Premium".into(),
        }
        .run()
        .unwrap();
        RestoreRHSMLogLevelTask {
            config: handles.config,
        }
        .run()
        .unwrap();
        assert_eq!(
            rhsm.calls(),
            ["auto_attach \"Premium\"", "set logging.default_log_level=INFO"]
        );

        let rhsm = Arc::new(FakeRhsm {
            attach_error: Some(r#"{"message": "No subscriptions available"}"#.into()),
            ..Default::default()
        });
        let e = AttachSubscriptionTask {
            attach: rhsm.handles().attach,
            service_level: String::new(),
        }
        .run()
        .unwrap_err();
        assert!(matches!(e, TaskError::Remote(_)));
        assert!(e.to_string().ends_with("No subscriptions available"));
    }
}
